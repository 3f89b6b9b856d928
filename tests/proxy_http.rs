use axum::{
    body::{Body, to_bytes},
    http::{Method, Request, StatusCode, header},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use registry_proxy::{
    app::{AppState, build_router},
    authorize::Authorizer,
    checker::HttpPermissionChecker,
    config::{AuthConfig, UpstreamConfig, UpstreamType},
    rewrite::Rewriter,
    scope::Scope,
    upstream::{BasicCredentials, OAuthBroker, UpstreamAuth},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

fn upstream_config(
    kind: UpstreamType,
    url: String,
    project: &str,
    token_url: String,
) -> UpstreamConfig {
    UpstreamConfig {
        kind,
        url,
        project: project.to_string(),
        max_catalog_entries: 1000,
        token_url,
        token_service: "svc".to_string(),
        token_username: "robot".to_string(),
        token_password: "robot-secret".to_string(),
        catalog_scope: "registry:catalog:*".to_string(),
        repository_scope_actions: None,
        region: String::new(),
        basic_username: "bot".to_string(),
        basic_password: "hunter2".to_string(),
    }
}

fn build_app(upstream_auth: UpstreamAuth, cfg: &UpstreamConfig, identity_url: String) -> axum::Router {
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client");
    let checker = Arc::new(
        HttpPermissionChecker::new(&AuthConfig {
            url: identity_url,
            token: "service-token".to_string(),
        })
        .expect("checker"),
    );
    let rewriter = Rewriter::new(&cfg.project);
    let authorizer = Arc::new(Authorizer::new(
        checker,
        rewriter.clone(),
        "c1",
        cfg.repository_scope_actions.clone(),
    ));
    let state = AppState {
        http,
        upstream_url: cfg.url.clone(),
        upstream: Arc::new(upstream_auth),
        authorizer,
        rewriter,
        max_catalog_entries: cfg.max_catalog_entries,
        catalog_scope: Scope::parse(&cfg.catalog_scope).expect("catalog scope"),
    };
    build_router(state, &[])
}

fn basic_app(upstream: &MockServer, identity: &MockServer, project: &str) -> axum::Router {
    let cfg = upstream_config(
        UpstreamType::Basic,
        upstream.uri(),
        project,
        String::new(),
    );
    build_app(
        UpstreamAuth::Basic(BasicCredentials::new(&cfg)),
        &cfg,
        identity.uri(),
    )
}

fn oauth_app(
    upstream: &MockServer,
    identity: &MockServer,
    token_server: &MockServer,
    project: &str,
) -> axum::Router {
    let cfg = upstream_config(
        UpstreamType::OAuth,
        upstream.uri(),
        project,
        format!("{}/token", token_server.uri()),
    );
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("client");
    build_app(
        UpstreamAuth::OAuth(OAuthBroker::new(http, &cfg)),
        &cfg,
        identity.uri(),
    )
}

async fn mock_check_allowed(identity: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/v1/permissions/check"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"allowed": true})))
        .mount(identity)
        .await;
}

async fn mock_list_permissions(identity: &MockServer, permissions: Value) {
    Mock::given(method("POST"))
        .and(path("/api/v1/permissions/list"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "permissions": permissions })),
        )
        .mount(identity)
        .await;
}

fn authorization(user: &str) -> String {
    format!("Basic {}", B64.encode(format!("{user}:token-{user}")))
}

fn request(method: Method, uri: &str, user: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(header::AUTHORIZATION, authorization(user));
    }
    builder.body(Body::empty()).expect("request")
}

async fn body_json(response: axum::http::Response<Body>) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.expect("body");
    serde_json::from_slice(&bytes).expect("json")
}

#[tokio::test]
async fn unauthenticated_probe_gets_basic_challenge() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    let app = basic_app(&upstream, &identity, "registry");

    let response = app
        .oneshot(request(Method::GET, "/v2/", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok()),
        Some("Basic realm=\"Registry\"")
    );
    assert!(upstream.received_requests().await.expect("requests").is_empty());
}

#[tokio::test]
async fn authenticated_probe_forwards_to_upstream() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    mock_check_allowed(&identity).await;
    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&upstream)
        .await;

    let app = basic_app(&upstream, &identity, "registry");
    let response = app
        .oneshot(request(Method::GET, "/v2/", Some("alice")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({}));

    let upstream_requests = upstream.received_requests().await.expect("requests");
    assert_eq!(upstream_requests.len(), 1);
    let auth = upstream_requests[0]
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .expect("authorization");
    assert_eq!(auth, format!("Basic {}", B64.encode("bot:hunter2")));
}

#[tokio::test]
async fn catalog_for_empty_tenant_never_contacts_upstream() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    mock_list_permissions(&identity, json!([])).await;

    let app = basic_app(&upstream, &identity, "registry");
    let response = app
        .oneshot(request(Method::GET, "/v2/_catalog", Some("alice")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"repositories": []}));

    assert_eq!(identity.received_requests().await.expect("requests").len(), 1);
    assert!(upstream.received_requests().await.expect("requests").is_empty());
}

#[tokio::test]
async fn push_flow_rewrites_upload_location() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    mock_check_allowed(&identity).await;
    Mock::given(method("POST"))
        .and(path("/v2/registry/alice/alpine/blobs/uploads/"))
        .respond_with(ResponseTemplate::new(202).insert_header(
            "location",
            format!(
                "{}/registry/alice/alpine/blobs/uploads/uuid-123",
                upstream.uri()
            )
            .as_str(),
        ))
        .mount(&upstream)
        .await;

    let app = basic_app(&upstream, &identity, "registry");
    let response = app
        .oneshot(request(
            Method::POST,
            "/v2/alice/alpine/blobs/uploads/",
            Some("alice"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok()),
        Some("/v2/alice/alpine/blobs/uploads/uuid-123")
    );
}

#[tokio::test]
async fn cross_repo_mount_denial_names_missing_permission() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v1/permissions/check"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "allowed": false,
            "missing": [{"uri": "image://c1/alice/x", "action": "read"}],
        })))
        .mount(&identity)
        .await;

    let app = basic_app(&upstream, &identity, "registry");
    let response = app
        .oneshot(request(
            Method::POST,
            "/v2/bob/x/blobs/uploads/?mount=sha256:abc&from=alice%2Fx",
            Some("bob"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "DENIED");
    assert_eq!(body["errors"][0]["detail"][0], "image://c1/alice/x");
    assert!(upstream.received_requests().await.expect("requests").is_empty());
}

#[tokio::test]
async fn mount_forwards_with_rewritten_source_repository() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    mock_check_allowed(&identity).await;
    Mock::given(method("POST"))
        .and(path("/v2/registry/bob/x/blobs/uploads/"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&upstream)
        .await;

    let app = basic_app(&upstream, &identity, "registry");
    let response = app
        .oneshot(request(
            Method::POST,
            "/v2/bob/x/blobs/uploads/?mount=sha256:abc&from=alice%2Fx",
            Some("bob"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::CREATED);

    let upstream_requests = upstream.received_requests().await.expect("requests");
    assert_eq!(upstream_requests.len(), 1);
    let query = upstream_requests[0].url.query().expect("query");
    assert!(query.contains("from=registry%2Falice%2Fx"), "query was: {query}");
}

#[tokio::test]
async fn upstream_401_challenge_recovers_once() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    let token_server = MockServer::start().await;
    mock_check_allowed(&identity).await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"token": "tok", "expires_in": 300})),
        )
        .mount(&token_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/registry/alice/alpine/manifests/latest"))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "www-authenticate",
            "Bearer realm=\"https://t\",service=\"svc\",scope=\"repository:registry/alice/alpine:pull\"",
        ))
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/registry/alice/alpine/manifests/latest"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("docker-content-digest", "sha256:abc")
                .set_body_json(json!({"schemaVersion": 2})),
        )
        .mount(&upstream)
        .await;

    let app = oauth_app(&upstream, &identity, &token_server, "registry");
    let response = app
        .oneshot(request(
            Method::GET,
            "/v2/alice/alpine/manifests/latest",
            Some("alice"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok()),
        Some("sha256:abc")
    );

    // one acquisition up front, one re-acquisition after the challenge
    assert_eq!(token_server.received_requests().await.expect("requests").len(), 2);
    assert_eq!(upstream.received_requests().await.expect("requests").len(), 2);
}

#[tokio::test]
async fn second_upstream_401_surfaces_as_bad_gateway() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    let token_server = MockServer::start().await;
    mock_check_allowed(&identity).await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"token": "tok", "expires_in": 300})),
        )
        .mount(&token_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/registry/alice/alpine/manifests/latest"))
        .respond_with(ResponseTemplate::new(401).insert_header(
            "www-authenticate",
            "Bearer realm=\"https://t\",service=\"svc\",scope=\"repository:registry/alice/alpine:pull\"",
        ))
        .mount(&upstream)
        .await;

    let app = oauth_app(&upstream, &identity, &token_server, "registry");
    let response = app
        .oneshot(request(
            Method::GET,
            "/v2/alice/alpine/manifests/latest",
            Some("alice"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "UNAUTHORIZED");
    assert_eq!(upstream.received_requests().await.expect("requests").len(), 2);
}

#[tokio::test]
async fn upstream_401_without_bearer_challenge_passes_through() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    mock_check_allowed(&identity).await;
    Mock::given(method("GET"))
        .and(path("/v2/registry/alice/alpine/manifests/latest"))
        .respond_with(
            ResponseTemplate::new(401)
                .insert_header("www-authenticate", "Basic realm=\"upstream\"")
                .set_body_json(json!({"errors": [{"code": "UNAUTHORIZED", "message": "nope"}]})),
        )
        .mount(&upstream)
        .await;

    let app = basic_app(&upstream, &identity, "registry");
    let response = app
        .oneshot(request(
            Method::GET,
            "/v2/alice/alpine/manifests/latest",
            Some("alice"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(upstream.received_requests().await.expect("requests").len(), 1);
}

#[tokio::test]
async fn admin_catalog_pages_upstream_until_request_is_covered() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    mock_list_permissions(
        &identity,
        json!([{"uri": "image://c1", "action": "manage"}]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/v2/_catalog"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "link",
                    "</v2/_catalog?last=registry%2Falice%2Falpine&n=1000>; rel=\"next\"",
                )
                .set_body_json(json!({"repositories": ["other/zzz", "registry/alice/alpine"]})),
        )
        .up_to_n_times(1)
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/_catalog"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"repositories": ["registry/alice/ubuntu"]})),
        )
        .mount(&upstream)
        .await;

    let app = basic_app(&upstream, &identity, "registry");
    let response = app
        .oneshot(request(Method::GET, "/v2/_catalog?n=2", Some("root")))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"repositories": ["alice/alpine", "alice/ubuntu"]})
    );
    assert_eq!(upstream.received_requests().await.expect("requests").len(), 2);
}

#[tokio::test]
async fn tenant_catalog_filters_and_paginates() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    mock_list_permissions(
        &identity,
        json!([
            {"uri": "image://c1/alice/ubuntu", "action": "write"},
            {"uri": "image://c1/alice/alpine", "action": "read"},
            {"uri": "image://c1/bob/x", "action": "read"},
        ]),
    )
    .await;

    let app = basic_app(&upstream, &identity, "registry");
    let response = app
        .oneshot(request(
            Method::GET,
            "/v2/_catalog?project=alice&n=1",
            Some("alice"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let link = response
        .headers()
        .get(header::LINK)
        .and_then(|v| v.to_str().ok())
        .map(ToOwned::to_owned)
        .expect("link header");
    assert_eq!(
        link,
        "</v2/_catalog?n=1&last=alice%2Falpine&project=alice>; rel=\"next\""
    );
    assert_eq!(
        body_json(response).await,
        json!({"repositories": ["alice/alpine"]})
    );

    let app = basic_app(&upstream, &identity, "registry");
    let response = app
        .oneshot(request(
            Method::GET,
            "/v2/_catalog?project=alice&n=1&last=alice%2Falpine",
            Some("alice"),
        ))
        .await
        .expect("response");
    assert_eq!(
        body_json(response).await,
        json!({"repositories": ["alice/ubuntu"]})
    );
    assert!(upstream.received_requests().await.expect("requests").is_empty());
}

#[tokio::test]
async fn tags_list_rewrites_name_and_link() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    mock_check_allowed(&identity).await;
    Mock::given(method("GET"))
        .and(path("/v2/registry/alice/alpine/tags/list"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header(
                    "link",
                    "</v2/registry/alice/alpine/tags/list?last=v2&n=2>; rel=\"next\"",
                )
                .set_body_json(json!({"name": "registry/alice/alpine", "tags": ["v1", "v2"]})),
        )
        .mount(&upstream)
        .await;

    let app = basic_app(&upstream, &identity, "registry");
    let response = app
        .oneshot(request(
            Method::GET,
            "/v2/alice/alpine/tags/list?n=2",
            Some("alice"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(header::LINK)
            .and_then(|v| v.to_str().ok()),
        Some("</v2/alice/alpine/tags/list?last=v2&n=2>; rel=\"next\"")
    );
    assert_eq!(
        body_json(response).await,
        json!({"name": "alice/alpine", "tags": ["v1", "v2"]})
    );
}

#[tokio::test]
async fn blob_body_and_digest_pass_through() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    mock_check_allowed(&identity).await;
    Mock::given(method("GET"))
        .and(path("/v2/registry/alice/alpine/blobs/sha256:abc"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("docker-content-digest", "sha256:abc")
                .set_body_bytes(b"layer-data".to_vec()),
        )
        .mount(&upstream)
        .await;

    let app = basic_app(&upstream, &identity, "registry");
    let response = app
        .oneshot(request(
            Method::GET,
            "/v2/alice/alpine/blobs/sha256:abc",
            Some("alice"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("docker-content-digest")
            .and_then(|v| v.to_str().ok()),
        Some("sha256:abc")
    );
    let bytes = to_bytes(response.into_body(), 1024).await.expect("body");
    assert_eq!(&bytes[..], b"layer-data");
}

#[tokio::test]
async fn upstream_errors_relay_their_envelope() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    mock_check_allowed(&identity).await;
    Mock::given(method("GET"))
        .and(path("/v2/registry/alice/alpine/manifests/gone"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "errors": [{"code": "MANIFEST_UNKNOWN", "message": "manifest unknown"}]
        })))
        .mount(&upstream)
        .await;

    let app = basic_app(&upstream, &identity, "registry");
    let response = app
        .oneshot(request(
            Method::GET,
            "/v2/alice/alpine/manifests/gone",
            Some("alice"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["errors"][0]["code"], "MANIFEST_UNKNOWN");
}

#[tokio::test]
async fn malformed_paths_and_credentials_are_rejected() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    let app = basic_app(&upstream, &identity, "registry");

    // a name deeper than the permission scheme can express
    let response = app
        .clone()
        .oneshot(request(
            Method::GET,
            "/v2/a/b/c/d/manifests/latest",
            Some("alice"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(request(
            Method::GET,
            "/v2/Alice/alpine/manifests/latest",
            Some("alice"),
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::GET)
                .uri("/v2/")
                .header(header::AUTHORIZATION, "Basic !!!not-base64!!!")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(identity.received_requests().await.expect("requests").is_empty());
    assert!(upstream.received_requests().await.expect("requests").is_empty());
}

#[tokio::test]
async fn ping_needs_no_credentials() {
    let upstream = MockServer::start().await;
    let identity = MockServer::start().await;
    let app = basic_app(&upstream, &identity, "registry");

    let response = app
        .oneshot(request(Method::GET, "/ping", None))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), 64).await.expect("body");
    assert_eq!(&bytes[..], b"pong");
}
