use crate::{
    config::UpstreamConfig,
    error::{ProxyError, upstream_auth_failed},
    scope::{Scope, cache_key},
};
use aws_sdk_ecr::error::SdkError;
use axum::http::HeaderValue;
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

/// Cached credentials are considered stale this long before their actual
/// expiry so an in-flight request never crosses the boundary.
pub const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(10);

const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(60);
const RETRY_DELAYS_MS: [u64; 2] = [200, 800];
const ECR_CACHE_KEY: &str = "ecr";

/// An upstream credential. ECR tokens are base64 `user:password` blobs
/// presented as Basic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Basic {
        username: String,
        password: String,
    },
    Bearer {
        token: String,
        expires_at: SystemTime,
    },
    AwsEcrToken {
        token: String,
        expires_at: SystemTime,
    },
}

impl Credential {
    pub fn header_value(&self) -> Result<HeaderValue, ProxyError> {
        let raw = match self {
            Self::Basic { username, password } => {
                format!("Basic {}", B64.encode(format!("{username}:{password}")))
            }
            Self::Bearer { token, .. } => format!("Bearer {token}"),
            Self::AwsEcrToken { token, .. } => format!("Basic {token}"),
        };
        HeaderValue::from_str(&raw).map_err(|_| ProxyError::Internal)
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        match self {
            Self::Basic { .. } => None,
            Self::Bearer { expires_at, .. } | Self::AwsEcrToken { expires_at, .. } => {
                Some(*expires_at)
            }
        }
    }

    fn is_fresh(&self, now: SystemTime) -> bool {
        match self.expires_at() {
            None => true,
            Some(expires_at) => now + TOKEN_EXPIRY_SKEW < expires_at,
        }
    }
}

/// Scope-keyed credential cache. Each key owns one slot mutex, so
/// concurrent acquisitions for the same scope set coalesce: the first
/// arrival fetches while latecomers wait on the slot and then read the
/// stored entry.
#[derive(Debug, Default)]
struct TokenCache {
    slots: Mutex<HashMap<String, Arc<Mutex<Option<Credential>>>>>,
}

impl TokenCache {
    async fn slot(&self, key: &str) -> Arc<Mutex<Option<Credential>>> {
        let mut slots = self.slots.lock().await;
        slots.entry(key.to_string()).or_default().clone()
    }
}

/// Per-flavor credential broker behind one interface.
pub enum UpstreamAuth {
    Basic(BasicCredentials),
    OAuth(OAuthBroker),
    AwsEcr(EcrBroker),
}

impl UpstreamAuth {
    /// Returns a credential valid for the given scope set, from cache
    /// when fresh.
    pub async fn credentials(&self, scopes: &[Scope]) -> Result<Credential, ProxyError> {
        match self {
            Self::Basic(basic) => Ok(basic.credential()),
            Self::OAuth(broker) => broker.acquire(scopes, false).await,
            Self::AwsEcr(broker) => broker.acquire(false).await,
        }
    }

    /// Discards any cached entry for the scope set and re-acquires.
    /// Used after an upstream 401 challenge.
    pub async fn refresh(&self, scopes: &[Scope]) -> Result<Credential, ProxyError> {
        match self {
            Self::Basic(basic) => Ok(basic.credential()),
            Self::OAuth(broker) => broker.acquire(scopes, true).await,
            Self::AwsEcr(broker) => broker.acquire(true).await,
        }
    }

    pub fn ecr(&self) -> Option<&EcrBroker> {
        match self {
            Self::AwsEcr(broker) => Some(broker),
            _ => None,
        }
    }
}

pub struct BasicCredentials {
    username: String,
    password: String,
}

impl BasicCredentials {
    pub fn new(cfg: &UpstreamConfig) -> Self {
        Self {
            username: cfg.basic_username.clone(),
            password: cfg.basic_password.clone(),
        }
    }

    fn credential(&self) -> Credential {
        Credential::Basic {
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
    issued_at: Option<String>,
}

/// Distribution token-protocol broker (GCR and friends): exchanges the
/// configured token-service credentials for scoped bearer tokens.
pub struct OAuthBroker {
    client: reqwest::Client,
    token_url: String,
    service: String,
    username: String,
    password: String,
    cache: TokenCache,
}

impl OAuthBroker {
    pub fn new(client: reqwest::Client, cfg: &UpstreamConfig) -> Self {
        Self {
            client,
            token_url: cfg.token_url.clone(),
            service: cfg.token_service.clone(),
            username: cfg.token_username.clone(),
            password: cfg.token_password.clone(),
            cache: TokenCache::default(),
        }
    }

    /// The fetch runs in a spawned task holding the slot lock, so a
    /// client that disconnects mid-acquisition still leaves a populated
    /// cache behind for the next request.
    #[instrument(skip(self), fields(scope_count = scopes.len(), force))]
    async fn acquire(&self, scopes: &[Scope], force: bool) -> Result<Credential, ProxyError> {
        let key = cache_key(scopes);
        let slot = self.cache.slot(&key).await;
        let client = self.client.clone();
        let url = self.token_request_url(scopes);
        let username = self.username.clone();
        let password = self.password.clone();

        let task = tokio::spawn(async move {
            let mut entry = slot.lock().await;
            if !force
                && let Some(credential) = entry.as_ref()
                && credential.is_fresh(SystemTime::now())
            {
                return Ok(credential.clone());
            }
            *entry = None;
            let credential = fetch_oauth_token(&client, &url, &username, &password).await?;
            *entry = Some(credential.clone());
            Ok(credential)
        });
        task.await.map_err(|_| ProxyError::Internal)?
    }

    fn token_request_url(&self, scopes: &[Scope]) -> String {
        let mut url = format!(
            "{}?service={}",
            self.token_url,
            urlencoding::encode(&self.service)
        );
        for scope in scopes {
            url.push_str("&scope=");
            url.push_str(&urlencoding::encode(&scope.to_string()));
        }
        url
    }
}

async fn fetch_oauth_token(
    client: &reqwest::Client,
    url: &str,
    username: &str,
    password: &str,
) -> Result<Credential, ProxyError> {
    let mut delays = RETRY_DELAYS_MS.iter();
    loop {
        let result = client
            .get(url)
            .basic_auth(username, Some(password))
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                return parse_token_response(response).await;
            }
            Ok(response) if response.status().is_server_error() => {
                warn!(status = response.status().as_u16(), "token service returned server error");
            }
            Ok(response) => {
                return Err(upstream_auth_failed(format!(
                    "token service returned status {}",
                    response.status().as_u16()
                )));
            }
            Err(err) => {
                warn!(error = %err, "token service request failed");
            }
        }
        match delays.next() {
            Some(delay) => tokio::time::sleep(Duration::from_millis(*delay)).await,
            None => {
                return Err(ProxyError::UpstreamUnavailable {
                    message: "token service unavailable after retries".to_string(),
                    timeout: false,
                });
            }
        }
    }
}

async fn parse_token_response(response: reqwest::Response) -> Result<Credential, ProxyError> {
    let payload = response
        .json::<TokenResponse>()
        .await
        .map_err(|_| upstream_auth_failed("token service returned an invalid payload"))?;
    let token = payload
        .token
        .or(payload.access_token)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| upstream_auth_failed("token service response carried no token"))?;

    let issued_at = payload
        .issued_at
        .as_deref()
        .and_then(|raw| chrono::DateTime::parse_from_rfc3339(raw).ok())
        .map(SystemTime::from)
        .unwrap_or_else(SystemTime::now);
    let lifetime = payload
        .expires_in
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TOKEN_LIFETIME);

    debug!(lifetime_secs = lifetime.as_secs(), "acquired upstream bearer token");
    Ok(Credential::Bearer {
        token,
        expires_at: issued_at + lifetime,
    })
}

/// AWS ECR broker: one authorization token covers the whole registry, so
/// the cache holds a single entry.
pub struct EcrBroker {
    client: aws_sdk_ecr::Client,
    cache: TokenCache,
}

impl EcrBroker {
    pub fn new(client: aws_sdk_ecr::Client) -> Self {
        Self {
            client,
            cache: TokenCache::default(),
        }
    }

    #[instrument(skip(self), fields(force))]
    async fn acquire(&self, force: bool) -> Result<Credential, ProxyError> {
        let slot = self.cache.slot(ECR_CACHE_KEY).await;
        let client = self.client.clone();

        let task = tokio::spawn(async move {
            let mut entry = slot.lock().await;
            if !force
                && let Some(credential) = entry.as_ref()
                && credential.is_fresh(SystemTime::now())
            {
                return Ok(credential.clone());
            }
            *entry = None;
            let credential = fetch_ecr_token(&client).await?;
            *entry = Some(credential.clone());
            Ok(credential)
        });
        task.await.map_err(|_| ProxyError::Internal)?
    }

    /// Lists repository names for catalog virtualization. ECR has no
    /// `_catalog` endpoint; the SDK is the collaborator here.
    #[instrument(skip(self))]
    pub async fn list_repository_names(&self, max: usize) -> Result<Vec<String>, ProxyError> {
        let mut names = Vec::new();
        let mut next_token: Option<String> = None;
        while names.len() < max {
            let mut request = self.client.describe_repositories().max_results(100);
            if let Some(token) = next_token.take() {
                request = request.next_token(token);
            }
            let output = request.send().await.map_err(|err| {
                ProxyError::UpstreamUnavailable {
                    message: format!("ecr describe_repositories failed: {err}"),
                    timeout: false,
                }
            })?;
            names.extend(
                output
                    .repositories()
                    .iter()
                    .filter_map(|repo| repo.repository_name().map(ToOwned::to_owned)),
            );
            match output.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }
        names.truncate(max);
        Ok(names)
    }
}

async fn fetch_ecr_token(client: &aws_sdk_ecr::Client) -> Result<Credential, ProxyError> {
    let mut delays = RETRY_DELAYS_MS.iter();
    loop {
        match client.get_authorization_token().send().await {
            Ok(output) => return parse_ecr_token(output),
            Err(err) if is_retriable_sdk_error(&err) => {
                warn!(error = %err, "ecr authorization token request failed");
                match delays.next() {
                    Some(delay) => tokio::time::sleep(Duration::from_millis(*delay)).await,
                    None => {
                        return Err(ProxyError::UpstreamUnavailable {
                            message: "ecr token service unavailable after retries".to_string(),
                            timeout: false,
                        });
                    }
                }
            }
            Err(err) => {
                return Err(upstream_auth_failed(format!(
                    "ecr refused authorization token: {err}"
                )));
            }
        }
    }
}

fn parse_ecr_token(
    output: aws_sdk_ecr::operation::get_authorization_token::GetAuthorizationTokenOutput,
) -> Result<Credential, ProxyError> {
    let data = output
        .authorization_data()
        .first()
        .ok_or_else(|| upstream_auth_failed("ecr returned no authorization data"))?;
    let token = data
        .authorization_token()
        .ok_or_else(|| upstream_auth_failed("ecr returned no authorization token"))?
        .to_string();

    let decoded = B64
        .decode(&token)
        .map_err(|_| upstream_auth_failed("ecr authorization token is not valid base64"))?;
    if !decoded.contains(&b':') {
        return Err(upstream_auth_failed(
            "ecr authorization token is not a user:password pair",
        ));
    }

    let expires_at = data
        .expires_at()
        .and_then(|at| SystemTime::try_from(*at).ok())
        .ok_or_else(|| upstream_auth_failed("ecr authorization token carries no expiry"))?;
    if !(Credential::AwsEcrToken {
        token: token.clone(),
        expires_at,
    })
    .is_fresh(SystemTime::now())
    {
        return Err(upstream_auth_failed("ecr authorization token already expired"));
    }

    Ok(Credential::AwsEcrToken { token, expires_at })
}

fn is_retriable_sdk_error<E>(err: &SdkError<E>) -> bool {
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => true,
        SdkError::ServiceError(ctx) => ctx.raw().status().as_u16() >= 500,
        _ => false,
    }
}
