use axum::{
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::json;

pub const BASIC_CHALLENGE: &str = "Basic realm=\"Registry\"";

/// Registry v2 error codes surfaced by the proxy itself. Upstream error
/// envelopes are relayed verbatim and may carry codes outside this set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unsupported,
    Unauthorized,
    Denied,
    NameUnknown,
    ManifestUnknown,
    BlobUnknown,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unsupported => "UNSUPPORTED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Denied => "DENIED",
            Self::NameUnknown => "NAME_UNKNOWN",
            Self::ManifestUnknown => "MANIFEST_UNKNOWN",
            Self::BlobUnknown => "BLOB_UNKNOWN",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{message}")]
    BadRequest { message: String },
    #[error("authentication required")]
    Unauthenticated,
    #[error("access denied")]
    Denied { missing: Vec<String> },
    #[error("{message}")]
    NotFound { code: ErrorCode, message: String },
    #[error("upstream authentication failed: {message}")]
    UpstreamAuth { message: String },
    #[error("upstream unavailable: {message}")]
    UpstreamUnavailable { message: String, timeout: bool },
    #[error("internal server error")]
    Internal,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::Denied { .. } => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::UpstreamAuth { .. } => StatusCode::BAD_GATEWAY,
            Self::UpstreamUnavailable { timeout, .. } => {
                if *timeout {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> ErrorCode {
        match self {
            Self::BadRequest { .. } => ErrorCode::Unsupported,
            Self::Unauthenticated => ErrorCode::Unauthorized,
            Self::Denied { .. } => ErrorCode::Denied,
            Self::NotFound { code, .. } => *code,
            Self::UpstreamAuth { .. } => ErrorCode::Unauthorized,
            Self::UpstreamUnavailable { .. } | Self::Internal => ErrorCode::Unknown,
        }
    }
}

#[derive(Serialize)]
struct ErrorEntry<'a> {
    code: &'a str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    errors: Vec<ErrorEntry<'a>>,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = match &self {
            ProxyError::Denied { missing } if !missing.is_empty() => Some(json!(missing)),
            _ => None,
        };
        let envelope = ErrorEnvelope {
            errors: vec![ErrorEntry {
                code: self.code().as_str(),
                message: self.to_string(),
                detail,
            }],
        };
        let body = serde_json::to_vec(&envelope).unwrap_or_else(|_| {
            b"{\"errors\":[{\"code\":\"UNKNOWN\",\"message\":\"unknown error\"}]}".to_vec()
        });

        let mut builder = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json");
        if matches!(self, ProxyError::Unauthenticated) {
            builder = builder.header(header::WWW_AUTHENTICATE, BASIC_CHALLENGE);
        }
        builder
            .body(Body::from(body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        ProxyError::UpstreamUnavailable {
            message: err.to_string(),
            timeout: err.is_timeout(),
        }
    }
}

pub fn bad_request(message: impl Into<String>) -> ProxyError {
    ProxyError::BadRequest {
        message: message.into(),
    }
}

pub fn name_unknown(message: impl Into<String>) -> ProxyError {
    ProxyError::NotFound {
        code: ErrorCode::NameUnknown,
        message: message.into(),
    }
}

pub fn upstream_auth_failed(message: impl Into<String>) -> ProxyError {
    ProxyError::UpstreamAuth {
        message: message.into(),
    }
}
