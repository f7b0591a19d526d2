use std::path::Path;
use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use webmpc::broker::{Broker, BrokerOptions};
use webmpc::config::{Config, ListenAddr};
use webmpc::upstream::mpd::MpdConnector;
use webmpc::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    tracing::info!(mpd_addr = %config.mpd_addr, auth = config.mpd_password.is_some(), "webmpc configured");

    let connector = Arc::new(MpdConnector::new(
        config.mpd_addr.clone(),
        config.mpd_password.clone(),
    ));
    let broker = Broker::start(connector, BrokerOptions::default());

    let state = AppState {
        broker: broker.handle(),
        config: Arc::new(config.clone()),
    };

    let app = Router::new()
        .merge(webmpc::routes::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let shutdown = shutdown_signal(broker);
    match &config.listen {
        ListenAddr::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr.as_str())
                .await
                .expect("failed to bind");
            tracing::info!(%addr, "webmpc listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
                .expect("server error");
        }
        ListenAddr::Unix(path) => {
            // A socket file left over from a previous run blocks the bind.
            let _ = std::fs::remove_file(path);
            let listener = tokio::net::UnixListener::bind(path).expect("failed to bind unix socket");
            tracing::info!(path = %path.display(), "webmpc listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
                .expect("server error");
        }
    }
}

/// Wait for Ctrl-C, then stop the broker. Stopping it closes every client
/// socket, which lets the server's graceful shutdown finish.
async fn shutdown_signal(broker: Broker) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
    broker.shutdown().await;
}
