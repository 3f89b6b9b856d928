use crate::error::{ProxyError, bad_request};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The authenticated platform caller. Docker clients present HTTP Basic
/// where the username is the platform user and the password is the
/// platform bearer token, not an upstream credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub username: String,
    pub token: String,
}

impl ClientIdentity {
    /// Decodes the `Authorization` header. Absent or non-Basic headers
    /// yield `Unauthenticated` (401 + challenge); a Basic header that
    /// does not decode yields 400.
    pub fn from_authorization(header: Option<&str>) -> Result<Self, ProxyError> {
        let header = header.ok_or(ProxyError::Unauthenticated)?;
        let encoded = header
            .strip_prefix("Basic ")
            .or_else(|| header.strip_prefix("basic "))
            .ok_or(ProxyError::Unauthenticated)?;
        let decoded = B64
            .decode(encoded.trim())
            .map_err(|_| bad_request("invalid Basic authorization header"))?;
        let decoded =
            String::from_utf8(decoded).map_err(|_| bad_request("invalid Basic authorization header"))?;
        let (username, token) = decoded
            .split_once(':')
            .ok_or_else(|| bad_request("invalid Basic authorization header"))?;
        if username.is_empty() {
            return Err(bad_request("empty username in authorization header"));
        }
        Ok(Self {
            username: username.to_string(),
            token: token.to_string(),
        })
    }
}

/// `GET /v2/_catalog` page. Unknown upstream fields ride along verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CatalogPage {
    #[serde(default)]
    pub repositories: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `GET /v2/<name>/tags/list` body. `tags` may be `null` upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagsPage {
    pub name: String,
    pub tags: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
