use crate::{
    app::AppState,
    authorize::{Access, CatalogParams, CatalogView, Route, parse_route},
    challenge::parse_bearer_challenge,
    error::{ProxyError, bad_request, upstream_auth_failed},
    models::{CatalogPage, ClientIdentity, TagsPage},
    rewrite::{RepoName, Rewriter, next_link_target},
    scope::Scope,
};
use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderMap, Method, Request, Response, StatusCode,
        header::{self, HeaderName},
    },
};
use serde_json::Map;
use tracing::{debug, info, instrument, warn};

const REQUEST_DROP_HEADERS: [HeaderName; 8] = [
    header::AUTHORIZATION,
    header::HOST,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
];

const RESPONSE_DROP_HEADERS: [HeaderName; 5] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::TRAILER,
    header::UPGRADE,
    header::PROXY_AUTHENTICATE,
];

pub async fn ping() -> &'static str {
    "pong"
}

/// Single entry point for the whole `/v2` surface. Registry v2 names are
/// multi-segment, so routing happens here instead of in the router.
pub async fn dispatch(
    State(state): State<AppState>,
    req: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let (parts, body) = req.into_parts();
    let method = parts.method;
    let uri = parts.uri;
    let headers = parts.headers;

    let identity = ClientIdentity::from_authorization(
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok()),
    )?;
    let route = parse_route(uri.path(), uri.query())?;
    debug!(username = %identity.username, method = %method, path = uri.path(), "handling registry request");

    match route {
        Route::Version => {
            if method != Method::GET && method != Method::HEAD {
                return Err(bad_request("unsupported method for version probe"));
            }
            handle_version(&state, &identity, &method, &headers).await
        }
        Route::Catalog(params) => {
            if method != Method::GET {
                return Err(bad_request("catalog supports GET only"));
            }
            handle_catalog(&state, &identity, params).await
        }
        Route::TagsList { name } if method == Method::GET => {
            handle_tags(&state, &identity, name, uri.query(), &headers).await
        }
        Route::TagsList { name } => {
            handle_repo(
                &state,
                &identity,
                method,
                name,
                "tags/list".to_string(),
                None,
                uri.query(),
                &headers,
                body,
            )
            .await
        }
        Route::Repo {
            name,
            suffix,
            mount_from,
        } => {
            handle_repo(
                &state, &identity, method, name, suffix, mount_from, uri.query(), &headers, body,
            )
            .await
        }
    }
}

async fn handle_version(
    state: &AppState,
    identity: &ClientIdentity,
    method: &Method,
    headers: &HeaderMap,
) -> Result<Response<Body>, ProxyError> {
    state.authorizer.authorize(identity, &Access::default()).await?;
    let response = forward_upstream(state, method.clone(), "", headers, None, &[]).await?;
    relay_response(&state.rewriter, response)
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(repo = %name.as_tenant(), suffix))]
async fn handle_repo(
    state: &AppState,
    identity: &ClientIdentity,
    method: Method,
    name: RepoName,
    suffix: String,
    mount_from: Option<RepoName>,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Body,
) -> Result<Response<Body>, ProxyError> {
    let route = Route::Repo {
        name: name.clone(),
        suffix: suffix.clone(),
        mount_from: mount_from.clone(),
    };
    let access = state.authorizer.required_access(&route, &method);
    state.authorizer.authorize(identity, &access).await?;

    let mut path = format!("{}/{suffix}", state.rewriter.to_upstream(&name.as_tenant()));
    if suffix == "blobs/uploads" {
        // the upload-start endpoint is defined with a trailing slash
        path.push('/');
    }
    if let Some(query) = query {
        path.push('?');
        match &mount_from {
            Some(source) => path.push_str(&rewrite_mount_query(query, source, &state.rewriter)),
            None => path.push_str(query),
        }
    }

    let body = if request_body_is_empty(&method, headers) {
        None
    } else {
        Some(body)
    };
    let response = forward_upstream(state, method, &path, headers, body, &access.scopes).await?;
    relay_response(&state.rewriter, response)
}

/// The `from` parameter of a cross-repository mount names a tenant-space
/// repository; the upstream must see its own namespace.
fn rewrite_mount_query(query: &str, source: &RepoName, rewriter: &Rewriter) -> String {
    query
        .split('&')
        .map(|pair| {
            if pair.split_once('=').map(|(k, _)| k) == Some("from") {
                format!(
                    "from={}",
                    urlencoding::encode(&rewriter.to_upstream(&source.as_tenant()))
                )
            } else {
                pair.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn request_body_is_empty(method: &Method, headers: &HeaderMap) -> bool {
    if matches!(*method, Method::GET | Method::HEAD | Method::DELETE) {
        return true;
    }
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false)
}

#[instrument(skip_all, fields(repo = %name.as_tenant()))]
async fn handle_tags(
    state: &AppState,
    identity: &ClientIdentity,
    name: RepoName,
    query: Option<&str>,
    headers: &HeaderMap,
) -> Result<Response<Body>, ProxyError> {
    let route = Route::TagsList { name: name.clone() };
    let access = state.authorizer.required_access(&route, &Method::GET);
    state.authorizer.authorize(identity, &access).await?;

    let mut path = format!("{}/tags/list", state.rewriter.to_upstream(&name.as_tenant()));
    if let Some(query) = query {
        path.push('?');
        path.push_str(query);
    }
    let response = forward_upstream(state, Method::GET, &path, headers, None, &access.scopes).await?;
    if !response.status().is_success() {
        return relay_response(&state.rewriter, response);
    }

    let link = response
        .headers()
        .get(header::LINK)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| state.rewriter.rewrite_link(raw));
    let mut page = response.json::<TagsPage>().await.map_err(|_| {
        ProxyError::UpstreamUnavailable {
            message: "upstream returned an invalid tags payload".to_string(),
            timeout: false,
        }
    })?;
    page.name = name.as_tenant();

    json_response(StatusCode::OK, &page, link)
}

#[instrument(skip_all, fields(username = %identity.username))]
async fn handle_catalog(
    state: &AppState,
    identity: &ClientIdentity,
    params: CatalogParams,
) -> Result<Response<Body>, ProxyError> {
    let view = state.authorizer.catalog_view(identity).await?;
    let names = match view {
        CatalogView::Tenant(names) => {
            debug!(granted = names.len(), "serving tenant catalog view");
            names
                .into_iter()
                .filter(|name| matches_catalog_filters(name, &params))
                .collect()
        }
        CatalogView::Admin => {
            info!("serving admin catalog view from upstream");
            match state.upstream.ecr() {
                Some(ecr) => {
                    let mut names: Vec<String> = ecr
                        .list_repository_names(state.max_catalog_entries)
                        .await?
                        .iter()
                        .filter_map(|raw| state.rewriter.to_tenant(raw))
                        .filter(|name| matches_catalog_filters(name, &params))
                        .collect();
                    names.sort();
                    names.dedup();
                    names
                }
                None => fetch_upstream_catalog(state, &params).await?,
            }
        }
    };

    let (page, next) = paginate(&names, params.last.as_deref(), params.n);
    let link = next.map(|last| catalog_next_link(&params, &last));
    let body = CatalogPage {
        repositories: page,
        extra: Map::new(),
    };
    json_response(StatusCode::OK, &body, link)
}

/// Pages through the upstream catalog, rewriting names to tenant space
/// and dropping anything outside the configured prefix, until the
/// requested page is covered or `max_catalog_entries` upstream entries
/// have been scanned.
async fn fetch_upstream_catalog(
    state: &AppState,
    params: &CatalogParams,
) -> Result<Vec<String>, ProxyError> {
    let scopes = [state.catalog_scope.clone()];
    let empty_headers = HeaderMap::new();
    let page_size = state.max_catalog_entries.clamp(1, 1000);

    let mut path = format!("_catalog?n={page_size}");
    if let Some(last) = &params.last {
        path.push_str(&format!(
            "&last={}",
            urlencoding::encode(&state.rewriter.to_upstream(last))
        ));
    }

    let mut names: Vec<String> = Vec::new();
    let mut scanned = 0usize;
    loop {
        let response =
            forward_upstream(state, Method::GET, &path, &empty_headers, None, &scopes).await?;
        if !response.status().is_success() {
            warn!(status = response.status().as_u16(), "upstream catalog request failed");
            return Err(ProxyError::UpstreamUnavailable {
                message: format!(
                    "upstream catalog returned status {}",
                    response.status().as_u16()
                ),
                timeout: false,
            });
        }
        let next = response
            .headers()
            .get(header::LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_link_target);
        let page = response.json::<CatalogPage>().await.map_err(|_| {
            ProxyError::UpstreamUnavailable {
                message: "upstream returned an invalid catalog payload".to_string(),
                timeout: false,
            }
        })?;
        if page.repositories.is_empty() {
            break;
        }
        scanned += page.repositories.len();
        names.extend(
            page.repositories
                .iter()
                .filter_map(|raw| state.rewriter.to_tenant(raw))
                .filter(|name| matches_catalog_filters(name, params)),
        );

        let after_cursor = match &params.last {
            Some(last) => names.iter().filter(|n| n.as_str() > last.as_str()).count(),
            None => names.len(),
        };
        if params.n.is_some_and(|n| after_cursor > n) || scanned >= state.max_catalog_entries {
            break;
        }
        match next.and_then(|url| upstream_catalog_path(&url)) {
            Some(next_path) => path = next_path,
            None => break,
        }
    }
    names.sort();
    names.dedup();
    Ok(names)
}

/// Reduces an upstream `Link` target to the path-and-query after `/v2/`.
fn upstream_catalog_path(url: &str) -> Option<String> {
    let rest = if let Some(idx) = url.find("://") {
        let after = &url[idx + 3..];
        &after[after.find('/')?..]
    } else {
        url
    };
    rest.strip_prefix("/v2/").map(ToOwned::to_owned)
}

fn matches_catalog_filters(name: &str, params: &CatalogParams) -> bool {
    let Ok(parsed) = RepoName::parse(name) else {
        return false;
    };
    if let Some(org) = &params.org
        && parsed.org.as_deref() != Some(org.as_str())
    {
        return false;
    }
    if let Some(project) = &params.project
        && parsed.project != *project
    {
        return false;
    }
    true
}

/// Alphabetical cursor pagination. Returns the page and, when truncated,
/// the cursor for the next page.
fn paginate(
    names: &[String],
    last: Option<&str>,
    n: Option<usize>,
) -> (Vec<String>, Option<String>) {
    let start = names
        .iter()
        .position(|name| last.is_none_or(|l| name.as_str() > l))
        .unwrap_or(names.len());
    let rest = &names[start..];
    match n {
        None => (rest.to_vec(), None),
        Some(n) => {
            let page: Vec<String> = rest.iter().take(n).cloned().collect();
            let next = (rest.len() > n).then(|| page.last().cloned()).flatten();
            (page, next)
        }
    }
}

fn catalog_next_link(params: &CatalogParams, last: &str) -> String {
    let mut target = format!(
        "/v2/_catalog?n={}&last={}",
        params.n.unwrap_or(0),
        urlencoding::encode(last)
    );
    if let Some(org) = &params.org {
        target.push_str(&format!("&org={}", urlencoding::encode(org)));
    }
    if let Some(project) = &params.project {
        target.push_str(&format!("&project={}", urlencoding::encode(project)));
    }
    format!("<{target}>; rel=\"next\"")
}

/// Sends one request upstream with brokered credentials, re-acquiring on
/// a scoped 401 challenge at most once. Requests with a streaming body
/// cannot be replayed; a 401 there refreshes the cache for the client's
/// own retry and fails with 502.
async fn forward_upstream(
    state: &AppState,
    method: Method,
    path_and_query: &str,
    headers: &HeaderMap,
    body: Option<Body>,
    scopes: &[Scope],
) -> Result<reqwest::Response, ProxyError> {
    let url = format!("{}/v2/{path_and_query}", state.upstream_url);
    let replayable = body.is_none();
    let mut body = body;
    let mut refreshed: Option<Vec<Scope>> = None;

    loop {
        let credential = match &refreshed {
            None => state.upstream.credentials(scopes).await?,
            Some(challenge_scopes) => state.upstream.refresh(challenge_scopes).await?,
        };

        let mut request = state.http.request(method.clone(), &url);
        for (name, value) in headers {
            if !REQUEST_DROP_HEADERS.contains(name) {
                request = request.header(name, value);
            }
        }
        request = request.header(header::AUTHORIZATION, credential.header_value()?);
        if let Some(body) = body.take() {
            request = request.body(reqwest::Body::wrap_stream(body.into_data_stream()));
        }

        let response = request.send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        if refreshed.is_some() {
            warn!(url, "upstream rejected refreshed credentials");
            return Err(upstream_auth_failed("upstream rejected refreshed credentials"));
        }
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);
        let Some(challenge) = challenge else {
            // not a Bearer challenge: surface the upstream response as-is
            return Ok(response);
        };
        let challenge_scopes = if challenge.scopes.is_empty() {
            scopes.to_vec()
        } else {
            challenge.scopes
        };
        if !replayable {
            let _ = state.upstream.refresh(&challenge_scopes).await;
            return Err(upstream_auth_failed(
                "upstream rejected credentials mid-upload",
            ));
        }
        debug!(url, "re-acquiring upstream credentials after 401 challenge");
        refreshed = Some(challenge_scopes);
    }
}

/// Streams the upstream response back, rewriting `Location` and `Link`
/// into the proxy's namespace and dropping hop-by-hop headers.
fn relay_response(
    rewriter: &Rewriter,
    upstream: reqwest::Response,
) -> Result<Response<Body>, ProxyError> {
    let mut builder = Response::builder().status(upstream.status());
    for (name, value) in upstream.headers() {
        if RESPONSE_DROP_HEADERS.contains(name) {
            continue;
        }
        if name == header::LOCATION {
            if let Some(rewritten) = value
                .to_str()
                .ok()
                .and_then(|raw| rewriter.rewrite_location(raw))
            {
                builder = builder.header(header::LOCATION, rewritten);
            }
            continue;
        }
        if name == header::LINK {
            if let Some(rewritten) = value.to_str().ok().and_then(|raw| rewriter.rewrite_link(raw))
            {
                builder = builder.header(header::LINK, rewritten);
            }
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|_| ProxyError::Internal)
}

fn json_response<T: serde::Serialize>(
    status: StatusCode,
    body: &T,
    link: Option<String>,
) -> Result<Response<Body>, ProxyError> {
    let bytes = serde_json::to_vec(body).map_err(|_| ProxyError::Internal)?;
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(link) = link {
        builder = builder.header(header::LINK, link);
    }
    builder
        .body(Body::from(bytes))
        .map_err(|_| ProxyError::Internal)
}
