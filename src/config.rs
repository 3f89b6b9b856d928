use std::collections::HashMap;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamType {
    Basic,
    OAuth,
    AwsEcr,
}

impl UpstreamType {
    fn from_str(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "basic" => Ok(Self::Basic),
            "oauth" => Ok(Self::OAuth),
            "aws_ecr" => Ok(Self::AwsEcr),
            other => Err(format!("unknown upstream type: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub kind: UpstreamType,
    pub url: String,
    /// Upstream repository prefix (e.g. a GCR project id). Empty for
    /// basic and aws_ecr upstreams.
    pub project: String,
    pub max_catalog_entries: usize,
    pub token_url: String,
    pub token_service: String,
    pub token_username: String,
    pub token_password: String,
    pub catalog_scope: String,
    pub repository_scope_actions: Option<String>,
    pub region: String,
    pub basic_username: String,
    pub basic_password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub cluster_name: String,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub log_level: String,
}

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_CATALOG_ENTRIES: usize = 1000;
const DEFAULT_CATALOG_SCOPE: &str = "registry:catalog:*";

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_environ(&env::vars().collect())
    }

    /// Builds a config from an explicit environment map. Required keys:
    /// `REGISTRY_PROXY_CLUSTER_NAME`, `REGISTRY_PROXY_UPSTREAM_URL`,
    /// `REGISTRY_PROXY_AUTH_URL`, `REGISTRY_PROXY_AUTH_TOKEN`, plus the
    /// per-flavor upstream credentials.
    pub fn from_environ(environ: &HashMap<String, String>) -> Result<Self, String> {
        let cluster_name = require(environ, "REGISTRY_PROXY_CLUSTER_NAME")?;
        let upstream = Self::upstream_from_environ(environ)?;
        let auth = AuthConfig {
            url: require(environ, "REGISTRY_PROXY_AUTH_URL")?,
            token: require(environ, "REGISTRY_PROXY_AUTH_TOKEN")?,
        };
        let port = match environ.get("REGISTRY_PROXY_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("invalid REGISTRY_PROXY_PORT: {raw}"))?,
            None => DEFAULT_PORT,
        };
        let cors_origins = environ
            .get("REGISTRY_PROXY_CORS_ORIGINS")
            .map(|raw| parse_list(raw))
            .unwrap_or_default();
        let log_level = environ
            .get("REGISTRY_PROXY_LOG_LEVEL")
            .cloned()
            .unwrap_or_else(|| "info".to_string());

        Ok(Self {
            cluster_name,
            upstream,
            auth,
            port,
            cors_origins,
            log_level,
        })
    }

    fn upstream_from_environ(environ: &HashMap<String, String>) -> Result<UpstreamConfig, String> {
        let kind = match environ.get("REGISTRY_PROXY_UPSTREAM_TYPE") {
            Some(raw) => UpstreamType::from_str(raw)?,
            None => UpstreamType::OAuth,
        };
        let url = require(environ, "REGISTRY_PROXY_UPSTREAM_URL")?
            .trim_end_matches('/')
            .to_string();
        let project = environ
            .get("REGISTRY_PROXY_UPSTREAM_PROJECT")
            .cloned()
            .unwrap_or_default();
        let max_catalog_entries = match environ.get("REGISTRY_PROXY_UPSTREAM_MAX_CATALOG_ENTRIES") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .map_err(|_| format!("invalid REGISTRY_PROXY_UPSTREAM_MAX_CATALOG_ENTRIES: {raw}"))?,
            None => DEFAULT_MAX_CATALOG_ENTRIES,
        };

        let mut upstream = UpstreamConfig {
            kind,
            url,
            project,
            max_catalog_entries,
            token_url: String::new(),
            token_service: String::new(),
            token_username: String::new(),
            token_password: String::new(),
            catalog_scope: DEFAULT_CATALOG_SCOPE.to_string(),
            repository_scope_actions: environ
                .get("REGISTRY_PROXY_UPSTREAM_REPO_SCOPE_ACTIONS")
                .cloned(),
            region: String::new(),
            basic_username: String::new(),
            basic_password: String::new(),
        };

        match kind {
            UpstreamType::OAuth => {
                upstream.token_url = require(environ, "REGISTRY_PROXY_UPSTREAM_TOKEN_URL")?;
                upstream.token_service = require(environ, "REGISTRY_PROXY_UPSTREAM_TOKEN_SERVICE")?;
                upstream.token_username =
                    require(environ, "REGISTRY_PROXY_UPSTREAM_TOKEN_USERNAME")?;
                upstream.token_password =
                    require(environ, "REGISTRY_PROXY_UPSTREAM_TOKEN_PASSWORD")?;
                if let Some(scope) = environ.get("REGISTRY_PROXY_UPSTREAM_CATALOG_SCOPE") {
                    upstream.catalog_scope = scope.clone();
                }
            }
            UpstreamType::Basic => {
                upstream.basic_username = environ
                    .get("REGISTRY_PROXY_UPSTREAM_BASIC_USERNAME")
                    .cloned()
                    .unwrap_or_default();
                upstream.basic_password = environ
                    .get("REGISTRY_PROXY_UPSTREAM_BASIC_PASSWORD")
                    .cloned()
                    .unwrap_or_default();
            }
            UpstreamType::AwsEcr => {
                upstream.region = require(environ, "REGISTRY_PROXY_UPSTREAM_REGION")?;
            }
        }

        Ok(upstream)
    }
}

fn require(environ: &HashMap<String, String>, key: &str) -> Result<String, String> {
    environ
        .get(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| format!("missing required environment variable: {key}"))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split([',', ' '])
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}
