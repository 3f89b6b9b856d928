use crate::{
    app::{AppState, build_router},
    authorize::Authorizer,
    checker::HttpPermissionChecker,
    config::{Config, UpstreamType},
    observability,
    rewrite::Rewriter,
    scope::Scope,
    upstream::{BasicCredentials, EcrBroker, OAuthBroker, UpstreamAuth},
};
use aws_config::{BehaviorVersion, Region};
use axum::serve::ListenerExt;
use reqwest::redirect::Policy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_TIMEOUT: Duration = Duration::from_secs(60);

#[instrument(skip(config))]
pub async fn build_state(config: &Config) -> Result<AppState, String> {
    // Redirects stay disabled so upstream Location headers surface and
    // get rewritten instead of being followed.
    let http = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .read_timeout(READ_TIMEOUT)
        .redirect(Policy::none())
        .build()
        .map_err(|err| format!("failed to build http client: {err}"))?;

    let upstream = match config.upstream.kind {
        UpstreamType::Basic => UpstreamAuth::Basic(BasicCredentials::new(&config.upstream)),
        UpstreamType::OAuth => {
            UpstreamAuth::OAuth(OAuthBroker::new(http.clone(), &config.upstream))
        }
        UpstreamType::AwsEcr => {
            let aws_config = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(config.upstream.region.clone()))
                .load()
                .await;
            UpstreamAuth::AwsEcr(EcrBroker::new(aws_sdk_ecr::Client::new(&aws_config)))
        }
    };

    let catalog_scope = Scope::parse(&config.upstream.catalog_scope)
        .ok_or_else(|| format!("invalid catalog scope: {}", config.upstream.catalog_scope))?;
    let checker = Arc::new(
        HttpPermissionChecker::new(&config.auth)
            .map_err(|_| "invalid identity service configuration".to_string())?,
    );
    let rewriter = Rewriter::new(&config.upstream.project);
    let authorizer = Arc::new(Authorizer::new(
        checker,
        rewriter.clone(),
        &config.cluster_name,
        config.upstream.repository_scope_actions.clone(),
    ));

    Ok(AppState {
        http,
        upstream_url: config.upstream.url.trim_end_matches('/').to_string(),
        upstream: Arc::new(upstream),
        authorizer,
        rewriter,
        max_catalog_entries: config.upstream.max_catalog_entries,
        catalog_scope,
    })
}

pub async fn run(config: Config) -> Result<(), String> {
    let bind: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let cluster = config.cluster_name.clone();
    let upstream_url = config.upstream.url.clone();
    let state = build_state(&config).await?;
    let app = build_router(state, &config.cors_origins);
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| format!("failed to bind {bind}: {err}"))?
        .tap_io(|tcp_stream| {
            if let Err(err) = tcp_stream.set_nodelay(true) {
                tracing::warn!(error = %err, "failed to set TCP_NODELAY on incoming connection");
            }
        });

    tracing::info!(
        bind = %bind,
        cluster,
        upstream = upstream_url,
        "registry proxy listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| format!("server error: {err}"))
}

pub async fn run_standalone(config: Config) -> Result<(), String> {
    let tracing_settings = observability::init_from_env(&config.log_level);
    tracing::debug!(
        log_filter = tracing_settings.filter,
        log_format = tracing_settings.log_format.as_str(),
        "initialized tracing subscriber"
    );
    run(config).await
}

pub async fn run_from_env() -> Result<(), String> {
    let config = Config::from_env()?;
    run_standalone(config).await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };
        let terminate = async {
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                let _ = sigterm.recv().await;
            }
        };
        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
