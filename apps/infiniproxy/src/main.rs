use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use infiniproxy_core::bootstrap::{CliArgs, bootstrap, load_config};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("infiniproxy failed: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = load_config(CliArgs::parse())?;
    init_tracing(config.debug);

    let boot = bootstrap(config).await?;
    let config = &boot.config;
    info!(
        event = "config_loaded",
        host = %config.host,
        port = config.port,
        fallback_base_url = %config.fallback_base_url,
        default_model = %config.default_model,
        timeout_secs = config.timeout_secs,
        require_api_key = config.require_api_key
    );
    let backends = boot.storage.list_backend_summaries(true).await?;
    for backend in &backends {
        info!(
            event = "backend_ready",
            short_name = %backend.short_name,
            base_url = %backend.base_url,
            api_key = %backend.api_key_masked,
            default_model = ?backend.default_model,
            is_default = backend.is_default
        );
    }
    if backends.is_empty() {
        warn!(event = "registry_empty", "serving every request through the fallback backend");
    }

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(event = "listening", addr = %bind);

    axum::serve(listener, boot.core.router())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve")?;
    Ok(())
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "infiniproxy=debug,sqlx=warn"
    } else {
        "infiniproxy=info,sqlx=warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
    info!(event = "shutdown");
}
