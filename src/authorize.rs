use crate::{
    checker::{Action, Decision, Permission, PermissionChecker},
    error::{ProxyError, bad_request},
    models::ClientIdentity,
    rewrite::{RepoName, Rewriter},
    scope::Scope,
};
use axum::http::Method;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument};

/// A parsed Registry v2 request shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// `/v2/` version probe.
    Version,
    /// `/v2/_catalog`.
    Catalog(CatalogParams),
    /// `/v2/<name>/tags/list`.
    TagsList { name: RepoName },
    /// `/v2/<name>/{manifests,blobs}/…` and upload sessions. `suffix` is
    /// the path after the repository name; `mount_from` is the source
    /// repository of a cross-repository blob mount.
    Repo {
        name: RepoName,
        suffix: String,
        mount_from: Option<RepoName>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CatalogParams {
    pub n: Option<usize>,
    pub last: Option<String>,
    pub org: Option<String>,
    pub project: Option<String>,
}

/// Permissions to enforce and upstream scopes to acquire for one request.
#[derive(Debug, Clone, Default)]
pub struct Access {
    pub permissions: Vec<Permission>,
    pub scopes: Vec<Scope>,
}

/// The caller's catalog view: admins see the upstream catalog rewritten
/// to tenant space; everyone else sees their granted repositories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogView {
    Admin,
    Tenant(Vec<String>),
}

pub fn parse_route(path: &str, query: Option<&str>) -> Result<Route, ProxyError> {
    let Some(rest) = path.strip_prefix("/v2") else {
        return Err(ProxyError::NotFound {
            code: crate::error::ErrorCode::Unknown,
            message: "not found".to_string(),
        });
    };
    if !rest.is_empty() && !rest.starts_with('/') {
        return Err(ProxyError::NotFound {
            code: crate::error::ErrorCode::Unknown,
            message: "not found".to_string(),
        });
    }
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    if rest.is_empty() {
        return Ok(Route::Version);
    }
    if rest == "_catalog" {
        return Ok(Route::Catalog(parse_catalog_params(query)?));
    }

    let trimmed = rest.strip_suffix('/').unwrap_or(rest);
    let segments: Vec<&str> = trimmed.split('/').collect();
    let split_at = find_suffix_start(&segments)
        .ok_or_else(|| bad_request(format!("unsupported registry path: {path}")))?;
    let name = RepoName::parse(&segments[..split_at].join("/"))?;
    let suffix = segments[split_at..].join("/");

    if suffix == "tags/list" {
        return Ok(Route::TagsList { name });
    }

    let mount_from = if suffix == "blobs/uploads" {
        mount_source(query)?
    } else {
        None
    };
    Ok(Route::Repo {
        name,
        suffix,
        mount_from,
    })
}

/// Locates the operation suffix working from the right, so repository
/// names that themselves contain `blobs` or `manifests` segments still
/// resolve (greedy name matching, like the reference registry router).
fn find_suffix_start(segments: &[&str]) -> Option<usize> {
    for i in (1..segments.len()).rev() {
        let tail = &segments[i..];
        let valid = match tail {
            ["tags", "list"] => true,
            ["manifests", reference] => !reference.is_empty(),
            ["blobs", "uploads"] => true,
            ["blobs", "uploads", uuid] => !uuid.is_empty(),
            ["blobs", digest] => !digest.is_empty(),
            _ => false,
        };
        if valid {
            return Some(i);
        }
    }
    None
}

fn parse_catalog_params(query: Option<&str>) -> Result<CatalogParams, ProxyError> {
    let mut params = CatalogParams::default();
    for (key, value) in query_pairs(query)? {
        match key.as_str() {
            "n" => {
                params.n = Some(
                    value
                        .parse::<usize>()
                        .map_err(|_| bad_request(format!("invalid catalog page size: {value}")))?,
                );
            }
            "last" => params.last = Some(value),
            "org" => params.org = Some(value),
            "project" => params.project = Some(value),
            other => {
                return Err(bad_request(format!("unknown catalog parameter: {other}")));
            }
        }
    }
    Ok(params)
}

fn mount_source(query: Option<&str>) -> Result<Option<RepoName>, ProxyError> {
    let mut mount = None;
    let mut from = None;
    for (key, value) in query_pairs(query)? {
        match key.as_str() {
            "mount" => mount = Some(value),
            "from" => from = Some(value),
            _ => {}
        }
    }
    match (mount, from) {
        (Some(_), Some(from)) => Ok(Some(RepoName::parse(&from)?)),
        _ => Ok(None),
    }
}

fn query_pairs(query: Option<&str>) -> Result<Vec<(String, String)>, ProxyError> {
    let Some(query) = query else {
        return Ok(Vec::new());
    };
    let mut pairs = Vec::new();
    for part in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').unwrap_or((part, ""));
        let value = urlencoding::decode(value)
            .map_err(|_| bad_request("invalid query string encoding"))?
            .into_owned();
        pairs.push((key.to_string(), value));
    }
    Ok(pairs)
}

/// Derives and enforces required permissions, and derives the matching
/// upstream scope descriptors.
pub struct Authorizer {
    checker: Arc<dyn PermissionChecker>,
    rewriter: Rewriter,
    cluster: String,
    repository_scope_actions: Option<String>,
}

impl Authorizer {
    pub fn new(
        checker: Arc<dyn PermissionChecker>,
        rewriter: Rewriter,
        cluster: impl Into<String>,
        repository_scope_actions: Option<String>,
    ) -> Self {
        Self {
            checker,
            rewriter,
            cluster: cluster.into(),
            repository_scope_actions,
        }
    }

    /// Required permissions and upstream scopes per route shape. The
    /// cross-repository mount case batches both repositories into one
    /// permission check.
    pub fn required_access(&self, route: &Route, method: &Method) -> Access {
        match route {
            Route::Version | Route::Catalog(_) => Access::default(),
            Route::TagsList { name } => Access {
                permissions: vec![Permission::new(name.permission_uri(&self.cluster), Action::Read)],
                scopes: vec![self.repository_scope(name, Action::Read)],
            },
            Route::Repo {
                name, mount_from, ..
            } => {
                let action = action_for_method(method);
                let mut access = Access {
                    permissions: vec![Permission::new(name.permission_uri(&self.cluster), action)],
                    scopes: vec![self.repository_scope(name, action)],
                };
                if let Some(source) = mount_from {
                    access
                        .permissions
                        .push(Permission::new(source.permission_uri(&self.cluster), Action::Read));
                    access.scopes.push(self.repository_scope(source, Action::Read));
                }
                access
            }
        }
    }

    /// Enforces the access set against the identity service. An empty
    /// permission list still validates the caller's token.
    #[instrument(skip(self, identity), fields(username = %identity.username))]
    pub async fn authorize(
        &self,
        identity: &ClientIdentity,
        access: &Access,
    ) -> Result<(), ProxyError> {
        debug!(permissions = ?access.permissions, "checking permissions");
        match self.checker.check(identity, &access.permissions).await? {
            Decision::Allowed => Ok(()),
            Decision::Denied { missing } => Err(ProxyError::Denied {
                missing: missing.into_iter().map(|p| p.uri).collect(),
            }),
        }
    }

    /// Resolves the caller's catalog view with a single identity call:
    /// a cluster-level `manage` grant marks an admin, anything else
    /// yields the caller's own repository names, sorted and deduplicated.
    #[instrument(skip(self, identity), fields(username = %identity.username))]
    pub async fn catalog_view(
        &self,
        identity: &ClientIdentity,
    ) -> Result<CatalogView, ProxyError> {
        let granted = self
            .checker
            .list_image_permissions(identity, &self.cluster)
            .await?;

        let cluster_uri = format!("image://{}", self.cluster);
        if granted
            .iter()
            .any(|p| p.action == Action::Manage && trim_slash(&p.uri) == cluster_uri)
        {
            return Ok(CatalogView::Admin);
        }

        let repo_prefix = format!("image://{}/", self.cluster);
        let names: BTreeSet<String> = granted
            .iter()
            .filter(|p| p.action.covers(Action::Read))
            .filter_map(|p| p.uri.strip_prefix(&repo_prefix))
            .filter(|name| RepoName::parse(name).is_ok())
            .map(ToOwned::to_owned)
            .collect();
        Ok(CatalogView::Tenant(names.into_iter().collect()))
    }

    fn repository_scope(&self, name: &RepoName, action: Action) -> Scope {
        let actions = match &self.repository_scope_actions {
            Some(actions) => actions.as_str(),
            None => match action {
                Action::Read => "pull",
                Action::Write => "pull,push",
                Action::Manage => "*",
            },
        };
        Scope::repository(self.rewriter.to_upstream(&name.as_tenant()), actions)
    }
}

fn action_for_method(method: &Method) -> Action {
    match *method {
        Method::GET | Method::HEAD => Action::Read,
        Method::DELETE => Action::Manage,
        _ => Action::Write,
    }
}

fn trim_slash(uri: &str) -> &str {
    uri.strip_suffix('/').unwrap_or(uri)
}
