use anyhow::Context as _;
use clap::Parser;
use ticketbridge_gateway::app::{self, SERVICE_NAME};
use ticketbridge_gateway::config::{Args, GatewayConfig};
use ticketbridge_gateway::stdio::run_stdio;
use ticketbridge_otel::TracingInitOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ticketbridge_otel::init_tracing(TracingInitOptions {
        service_name: SERVICE_NAME,
        service_version: env!("CARGO_PKG_VERSION"),
        default_env_filter: ticketbridge_otel::DEFAULT_ENV_FILTER,
    })?;

    let cfg = GatewayConfig::from_args(Args::parse())?;
    let state = app::build_state(&cfg)?;

    if cfg.prewarming_enabled {
        app::spawn_prewarming(&state, cfg.warm_emails.clone());
    } else {
        info!("token prewarming disabled; authenticating on first request");
        if !cfg.warm_emails.is_empty() {
            warn!("cache warm emails ignored while prewarming is disabled");
        }
    }

    let stdio_task = cfg.stdio.then(|| {
        let dispatcher = state.dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = run_stdio(dispatcher).await {
                warn!(error = %format!("{e:#}"), "stdio transport stopped");
            }
        })
    });

    let router = app::router(state.clone(), &cfg.http_path);
    let listener = tokio::net::TcpListener::bind(cfg.http_addr)
        .await
        .with_context(|| format!("bind {}", cfg.http_addr))?;
    info!(
        addr = %cfg.http_addr,
        mcp_path = %cfg.http_path,
        nsp = %cfg.nsp.base_url,
        "starting ticketbridge gateway"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    state.credentials.stop().await;
    if let Some(t) = stdio_task {
        t.abort();
    }
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
