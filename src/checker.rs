use crate::{
    config::AuthConfig,
    error::ProxyError,
    models::ClientIdentity,
};
use async_trait::async_trait;
use axum::http::StatusCode;
use reqwest::{Client, redirect::Policy};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, instrument};

/// Action on a platform image resource. Ordering encodes strength:
/// `manage` implies `write` implies `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    Manage,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Manage => "manage",
        }
    }

    pub fn covers(self, required: Action) -> bool {
        self >= required
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A required or granted permission on a platform resource URI such as
/// `image://<cluster>/<org?>/<project>/<repo>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    pub uri: String,
    pub action: Action,
}

impl Permission {
    pub fn new(uri: impl Into<String>, action: Action) -> Self {
        Self {
            uri: uri.into(),
            action,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.uri, self.action)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied { missing: Vec<Permission> },
}

/// Seam to the external identity service. Calls are idempotent; one
/// inbound request performs at most one `check` and at most one `list`.
#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// Validates the caller's token and checks the whole batch of
    /// required permissions in one round trip. An empty batch only
    /// validates the token.
    async fn check(
        &self,
        identity: &ClientIdentity,
        required: &[Permission],
    ) -> Result<Decision, ProxyError>;

    /// Lists every `image://<cluster>/…` permission granted to the
    /// caller, including a cluster-level `manage` grant for admins.
    async fn list_image_permissions(
        &self,
        identity: &ClientIdentity,
        cluster: &str,
    ) -> Result<Vec<Permission>, ProxyError>;
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    allowed: bool,
    #[serde(default)]
    missing: Vec<Permission>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    permissions: Vec<Permission>,
}

/// HTTP adapter for the identity service. The service account token
/// authenticates the proxy itself; the caller's platform token rides in
/// the request body and is what the service actually evaluates.
#[derive(Debug, Clone)]
pub struct HttpPermissionChecker {
    base_url: String,
    service_token: String,
    client: Client,
}

impl HttpPermissionChecker {
    pub fn new(cfg: &AuthConfig) -> Result<Self, ProxyError> {
        let base_url = cfg.url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ProxyError::Internal);
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(15))
            .redirect(Policy::limited(3))
            .build()
            .map_err(|_| ProxyError::Internal)?;
        Ok(Self {
            base_url,
            service_token: cfg.token.clone(),
            client,
        })
    }

    async fn post_json(
        &self,
        endpoint: &str,
        body: serde_json::Value,
    ) -> Result<reqwest::Response, ProxyError> {
        let url = format!("{}{endpoint}", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.service_token)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                error!(endpoint, error = %err, "identity service call failed");
                ProxyError::UpstreamUnavailable {
                    message: format!("identity service unavailable: {err}"),
                    timeout: err.is_timeout(),
                }
            })?;

        if response.status() == StatusCode::UNAUTHORIZED
            || response.status() == StatusCode::FORBIDDEN
        {
            debug!(endpoint, status = response.status().as_u16(), "identity rejected caller token");
            return Err(ProxyError::Unauthenticated);
        }
        if !response.status().is_success() {
            error!(
                endpoint,
                status = response.status().as_u16(),
                "identity service returned non-success"
            );
            return Err(ProxyError::UpstreamUnavailable {
                message: format!(
                    "identity service returned status {}",
                    response.status().as_u16()
                ),
                timeout: false,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl PermissionChecker for HttpPermissionChecker {
    #[instrument(skip(self, identity), fields(username = %identity.username, count = required.len()))]
    async fn check(
        &self,
        identity: &ClientIdentity,
        required: &[Permission],
    ) -> Result<Decision, ProxyError> {
        let response = self
            .post_json(
                "/api/v1/permissions/check",
                json!({
                    "token": identity.token,
                    "permissions": required,
                }),
            )
            .await?;
        let payload = response.json::<CheckResponse>().await.map_err(|_| {
            ProxyError::UpstreamUnavailable {
                message: "identity service returned an invalid check payload".to_string(),
                timeout: false,
            }
        })?;
        if payload.allowed {
            Ok(Decision::Allowed)
        } else {
            let missing = if payload.missing.is_empty() {
                required.to_vec()
            } else {
                payload.missing
            };
            Ok(Decision::Denied { missing })
        }
    }

    #[instrument(skip(self, identity), fields(username = %identity.username, cluster))]
    async fn list_image_permissions(
        &self,
        identity: &ClientIdentity,
        cluster: &str,
    ) -> Result<Vec<Permission>, ProxyError> {
        let response = self
            .post_json(
                "/api/v1/permissions/list",
                json!({
                    "token": identity.token,
                    "uri_prefix": format!("image://{cluster}"),
                }),
            )
            .await?;
        let payload = response.json::<ListResponse>().await.map_err(|_| {
            ProxyError::UpstreamUnavailable {
                message: "identity service returned an invalid list payload".to_string(),
                timeout: false,
            }
        })?;
        Ok(payload.permissions)
    }
}
