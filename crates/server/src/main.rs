use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use scribe_engine::HttpTranslator;
use scribe_models::HttpFetcher;
use scribe_server::runtime::ProcessRuntimeLoader;
use scribe_server::{rpc, Config, ScribeService};

/// Time granted to the in-flight job to observe shutdown as cancellation
/// and persist its terminal state.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(db = %config.db_path.display(), "starting scribe backend");

    let service = ScribeService::new(
        &config,
        Arc::new(ProcessRuntimeLoader::from_env()),
        Arc::new(HttpTranslator::new(&config.translate_url)),
        Arc::new(HttpFetcher::new()),
    )
    .await?;

    let app = rpc::router(Arc::clone(&service));
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    let shutdown_service = Arc::clone(&service);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received, draining");
            shutdown_service.begin_shutdown();
        })
        .await?;

    tokio::time::sleep(SHUTDOWN_GRACE).await;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
