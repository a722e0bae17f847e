use std::sync::Arc;

use autopg::{Reconciler, Watcher};
use autopg_core::{AdminStore, Platform, Settings};
use autopg_docker::DockerPlatform;
use autopg_postgresql::PostgresqlAdminStore;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const SERVICE_NAME: &str = "autopg";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let settings = Arc::new(Settings::from_env()?);

    init_tracing(&settings)?;

    tracing::info!(label_prefix = %settings.label_prefix, "autopg: starting");

    let platform: Arc<dyn Platform> = Arc::new(DockerPlatform::connect()?);
    let store: Arc<dyn AdminStore> = Arc::new(PostgresqlAdminStore::default());

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&settings),
        Arc::clone(&platform),
        store,
    ));
    let watcher = Watcher::new(platform, reconciler, settings.reconnect_backoff);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    watcher.run(cancel).await;

    tracing::info!("autopg: stopped");

    if settings.jaeger {
        opentelemetry::global::shutdown_tracer_provider();
    }

    Ok(())
}

fn init_tracing(settings: &Settings) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let telemetry = if settings.jaeger {
        let tracer = opentelemetry_jaeger::new_agent_pipeline()
            .with_service_name(SERVICE_NAME)
            .install_simple()?;

        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(telemetry)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("autopg: shutdown signal received");
    cancel.cancel();
}
