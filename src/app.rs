use crate::{
    api, authorize::Authorizer, rewrite::Rewriter, scope::Scope, upstream::UpstreamAuth,
};
use axum::{
    Router,
    http::{HeaderName, HeaderValue},
    routing::{any, get},
};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    set_header::SetResponseHeaderLayer,
    trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

pub const SERVICE_VERSION: &str = concat!("registry-proxy/", env!("CARGO_PKG_VERSION"));

#[derive(Clone)]
pub struct AppState {
    pub http: reqwest::Client,
    pub upstream_url: String,
    pub upstream: Arc<UpstreamAuth>,
    pub authorizer: Arc<Authorizer>,
    pub rewriter: Rewriter,
    pub max_catalog_entries: usize,
    pub catalog_scope: Scope,
}

pub fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO))
        .on_failure(DefaultOnFailure::new().level(Level::ERROR));

    let mut router = Router::new()
        .route("/ping", get(api::ping))
        .fallback(any(api::dispatch))
        .with_state(state)
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static("x-service-version"),
            HeaderValue::from_static(SERVICE_VERSION),
        ))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(trace_layer);
    if let Some(cors) = cors_layer(cors_origins) {
        router = router.layer(cors);
    }
    router
}

fn cors_layer(origins: &[String]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    let layer = if origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(parsed))
    };
    Some(layer)
}
