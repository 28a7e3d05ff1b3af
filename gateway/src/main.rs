use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use mimalloc::MiMalloc;
use std::fmt::Display;
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::signal;
use tower_http::trace::{DefaultOnFailure, TraceLayer};
use tracing::Level;

use tokengate_internal::cache::CacheConnectionInfo;
use tokengate_internal::config::Config;
use tokengate_internal::endpoints;
use tokengate_internal::gateway_util::AppStateData;
use tokengate_internal::observability::{self, LogFormat};
use tokengate_internal::reconcile::UsageReconciler;
use tokengate_internal::session::require_session;
use tokengate_internal::store::StoreConnectionInfo;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Socket address to listen on. Defaults to 0.0.0.0:3000.
    #[arg(long)]
    bind_address: Option<SocketAddr>,

    /// Sets the log format used for all gateway logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    // Set up logs immediately, so that we can use `tracing`.
    observability::setup_observability(args.log_format).expect_pretty("Failed to set up logs");

    let config = Config::from_env().expect_pretty("Failed to load configuration");

    let app_state = AppStateData::from_config(config)
        .await
        .expect_pretty("Failed to initialize AppState");

    // Periodically fold cache usage counters into the durable store.
    UsageReconciler::new(app_state.cache.clone(), app_state.store.clone()).spawn();

    let cache_pretty = match &app_state.cache {
        CacheConnectionInfo::Mock { .. } => "mocked",
        CacheConnectionInfo::Production { .. } => "enabled",
    };
    let store_pretty = match &app_state.store {
        StoreConnectionInfo::Disabled => "disabled".to_string(),
        StoreConnectionInfo::Mock { .. } => "mocked".to_string(),
        StoreConnectionInfo::Production { url, .. } => format!("enabled ({url})"),
    };

    // Chat requires a valid session; credential exchange and the health
    // probe do not.
    let session_routes = Router::new()
        .route("/llm/chat", post(endpoints::chat::chat_handler))
        .layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            require_session,
        ));

    let public_routes = Router::new()
        .route("/llm/verify", post(endpoints::verify::verify_handler))
        .route("/health", get(endpoints::status::health_handler));

    let router = Router::new()
        .merge(session_routes)
        .merge(public_routes)
        // We log failed requests at DEBUG, since we already have our own
        // error-logging code.
        .layer(TraceLayer::new_for_http().on_failure(DefaultOnFailure::new().level(Level::DEBUG)))
        .with_state(app_state);

    let bind_address = args
        .bind_address
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

    let listener = match tokio::net::TcpListener::bind(bind_address).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == ErrorKind::AddrInUse => {
            tracing::error!(
                "Failed to bind to socket address {bind_address}: {e}. Tip: Ensure no other process is using port {} or try a different port.",
                bind_address.port()
            );
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to bind to socket address {bind_address}: {e}");
            std::process::exit(1);
        }
    };
    // This will give us the chosen port if the user specified a port of 0
    let actual_bind_address = listener
        .local_addr()
        .expect_pretty("Failed to get bind address from listener");

    tracing::info!(
        "Token Gateway is listening on {actual_bind_address} with cache {cache_pretty} and durable store {store_pretty}.",
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect_pretty("Failed to start server");
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
    };
}

/// ┌──────────────────────────────────────────────────────────────────────────┐
/// │                           MAIN.RS ESCAPE HATCH                           │
/// └──────────────────────────────────────────────────────────────────────────┘
///
/// We don't allow panic, escape, unwrap, or similar methods in the codebase,
/// except for the private `expect_pretty` method, which is to be used only in
/// main.rs during initialization. After initialization, we expect all code to
/// handle errors gracefully.
///
/// We use `expect_pretty` for better DX when handling errors in main.rs.
/// `expect_pretty` will print an error message and exit with a status code of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}
