mod bootstrap;
mod health;
mod ingress;

use anyhow::Result;
use leadflow_core::config::{AppConfig, LoadOptions};

fn init_logging(config: &AppConfig) {
    use leadflow_core::config::LogFormat::{Compact, Json, Pretty};
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Load config and initialize logging before any other operations.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    let routes = axum::Router::new()
        .merge(health::router(app.db_pool.clone()))
        .merge(ingress::router(ingress::IngressState::new(
            app.router.clone(),
            app.config.crm.webhook_secret.clone(),
        )));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;

    let scanner = app.scanner.clone();
    let scanner_task = tokio::spawn(async move { scanner.run_forever().await });

    tracing::info!(
        event_name = "system.server.started",
        bind_address = %address,
        scanner_interval_secs = app.config.orchestrator.scanner_interval_secs,
        "leadflow-server started"
    );

    axum::serve(listener, routes).with_graceful_shutdown(wait_for_shutdown()).await?;

    tracing::info!(
        event_name = "system.server.stopping",
        "leadflow-server stopping"
    );
    scanner_task.abort();

    Ok(())
}

async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
