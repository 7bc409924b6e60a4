use std::io::IsTerminal;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use health::{HealthRegistry, HealthStatus, OverallStatus};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use foo_service::backends::PostgresConnector;
use foo_service::config::Config;
use foo_service::deps::Dependencies;
use foo_service::metrics::setup_metrics_recorder;
use foo_service::router::{router, AppState};

/// JSON for log shippers, human readable output on a terminal.
fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if std::io::stderr().is_terminal() {
        subscriber.init()
    } else {
        subscriber.json().init()
    }
}

async fn log_status_changes(mut updates: watch::Receiver<HealthStatus>) {
    let mut last = OverallStatus::Ok;

    while updates.changed().await.is_ok() {
        let status = updates.borrow_and_update().status;
        if status == last {
            continue;
        }
        match status {
            OverallStatus::Ok => info!("service is healthy again"),
            _ => warn!(?status, "service health changed"),
        }
        last = status;
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown requested"),
        Err(err) => {
            error!("failed to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await
        }
    }
}

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()?;
    init_tracing(config.debug);
    info!(
        environment = %config.env_name,
        "launching {}",
        config.service_name.as_str()
    );

    let recorder_handle = setup_metrics_recorder()?;

    let health = HealthRegistry::new("liveness");
    let status_logger = tokio::spawn(log_status_changes(health.subscribe()));
    let deps = Dependencies::new(&config, &PostgresConnector, health.clone()).await?;

    let state = AppState {
        service_name: config.service_name.as_str().to_owned(),
        version: env!("CARGO_PKG_VERSION"),
        tokens: config.tokens.clone(),
        health,
        foo: deps.dals.foo.clone(),
    };
    let app = router(state, Some(recorder_handle));

    let served = listen(app, config.bind()).await;
    if let Err(ref e) = served {
        error!("failed to serve {}: {}", config.service_name.as_str(), e);
    }

    deps.shutdown().await;
    status_logger.abort();

    served
}
