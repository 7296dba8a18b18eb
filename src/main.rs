use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sentry_tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::AppConfig;

mod app_state;
mod config;
mod consts;
mod error;
mod middleware;
pub mod utils;
pub mod videogen;

use app_state::AppState;

async fn main_impl(conf: AppConfig) -> Result<()> {
    let shared_state = Arc::new(AppState::new(&conf)?);

    let sentry_tower_layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::with_transaction());

    let http = videogen::build_router(shared_state)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            crate::middleware::http_logging_middleware,
        )) // HTTP logging before Sentry
        .layer(sentry_tower_layer);

    let addr = SocketAddr::from(([0, 0, 0, 0], conf.port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    log::info!("listening on {addr}");

    axum::serve(listener, http).await?;

    Ok(())
}

fn main() {
    let conf = match AppConfig::load() {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("failed to load configuration: {e:#}");
            std::process::exit(1);
        }
    };

    let _guard = conf.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: std::env::var("SENTRY_TRACES_SAMPLE_RATE")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.2),
                // Request bodies carry prompts and images; only scrubbed breadcrumbs go out
                send_default_pii: false,
                attach_stacktrace: true,
                before_send: Some(crate::middleware::sentry_scrub::create_before_send()),
                ..Default::default()
            },
        ))
    });

    // Errors become Sentry events, warnings breadcrumbs
    let sentry_layer = sentry_tracing::layer().event_filter(|metadata| match *metadata.level() {
        tracing::Level::ERROR => sentry_tracing::EventFilter::Event,
        tracing::Level::WARN => sentry_tracing::EventFilter::Breadcrumb,
        _ => sentry_tracing::EventFilter::Ignore,
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "{}=info,tower_http=warn,axum::rejection=warn,hyper=warn,reqwest=warn",
                    env!("CARGO_CRATE_NAME")
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("failed to start tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(main_impl(conf)) {
        log::error!("server exited: {e:#}");
        drop(_guard);
        std::process::exit(1);
    }
}
