use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use webrpl_server::brevo::BrevoNotifier;
use webrpl_server::db::db_connect;
use webrpl_server::env::Config;
use webrpl_server::handlers::router;
use webrpl_server::notify::{LogNotifier, Notifier};
use webrpl_server::AppState;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn,sea_orm=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = Config::from_env()?;
    if let Some(parent) = config
        .database_url
        .strip_prefix("sqlite://")
        .and_then(|rest| rest.split('?').next())
        .and_then(|path| std::path::Path::new(path).parent())
        .filter(|p| !p.as_os_str().is_empty())
    {
        std::fs::create_dir_all(parent)?;
    }
    tokio::fs::create_dir_all(&config.static_dir).await?;

    let db = db_connect(&config.database_url).await?;
    tracing::info!("database ready");

    let notifier: Arc<dyn Notifier> = match config.brevo.clone() {
        Some(brevo) => {
            tracing::info!(sender = %brevo.sender_email, "one-time codes delivered through Brevo");
            Arc::new(BrevoNotifier::new(brevo))
        }
        None => {
            tracing::warn!("BREVO_API_KEY not set, one-time codes are written to the log");
            Arc::new(LogNotifier)
        }
    };

    let bind_addr = config.bind_addr;
    let secret = config.secret_key.clone();
    let state = AppState::build(config, db, notifier)?;
    state.credentials.ensure_admin(&secret).await?;

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "webrpl-server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
