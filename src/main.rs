//! tollgate -- multi-tenant AI request gateway.
//!
//! This is the application entry point. It wires together all modules:
//!   - Configuration loading (TOML + environment overrides)
//!   - Database initialization and key seeding
//!   - Dispatcher and store purge background tasks
//!   - HTTP server with request ids, tracing and CORS
//!   - Graceful shutdown on SIGTERM / SIGINT, draining queued requests

use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use tollgate::config::Config;
use tollgate::db::Database;
use tollgate::{AppState, build_router};

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_path: Option<PathBuf>,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    config_path = Some(PathBuf::from(path));
                } else {
                    eprintln!("Error: --config requires a path argument");
                    std::process::exit(1);
                }
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("tollgate {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                eprintln!("Run with --help for usage information.");
                std::process::exit(1);
            }
        }
    }

    CliArgs { config_path }
}

fn print_usage() {
    println!(
        "\
tollgate {version} -- multi-tenant AI request gateway

USAGE:
    tollgate [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: tollgate.toml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (e.g. RUST_LOG=debug)
    TOLLGATE_CONFIG        Alternative to --config flag
    TOLLGATE_*             Override individual settings (see config docs)
",
        version = env!("CARGO_PKG_VERSION")
    );
}

/// `--config` wins, then `TOLLGATE_CONFIG`, then `tollgate.toml`.
fn resolve_config_path(cli: CliArgs) -> PathBuf {
    cli.config_path
        .or_else(|| std::env::var("TOLLGATE_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("tollgate.toml"))
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Parse CLI arguments
    let config_path = resolve_config_path(parse_args());

    // 2. Load configuration
    let config = Config::load(&config_path)?;

    // 3. Initialize tracing/logging
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting tollgate"
    );
    for key in config.env_overrides.keys() {
        tracing::info!(
            setting = key,
            env = config.env_overrides.env_var_for(key).unwrap_or_default(),
            "Setting overridden from environment"
        );
    }
    if config.auth.admin_token.is_none() {
        tracing::warn!("No admin token configured -- /admin endpoints are disabled");
    }

    // 4. Open database
    let db = Database::open(&config.database.path)?;
    tracing::info!(path = %config.database.path.display(), "Database opened");

    // 5. Build shared state and spawn the dispatcher
    let seed_keys = config.keys.clone();
    let drain_timeout = Duration::from_secs(config.dispatch.drain_timeout_secs);
    let (state, dispatcher) = AppState::build(config, db)?;
    tracing::info!(
        concurrency = state.config.dispatch.concurrency,
        queue_capacity = state.config.dispatch.queue_capacity,
        "Dispatcher started"
    );

    // 6. Seed provider keys from configuration
    let seeded = state.rotation.seed(&seed_keys)?;
    tracing::debug!(inserted = seeded, configured = seed_keys.len(), "Key seeding finished");

    // 7. Spawn store purge loop
    let purge = state.spawn_purge_task();

    // 8. Build the application router
    let app = build_app(state.clone());

    // 9. Bind and serve
    let listen_addr = state.config.listen_addr();
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 10. Cleanup: dropping the last state clone closes the dispatch queue.
    tracing::info!("Shutting down gracefully, draining queued requests");
    drop(state);
    purge.abort();
    if tokio::time::timeout(drain_timeout, dispatcher).await.is_err() {
        tracing::warn!(
            timeout_secs = drain_timeout.as_secs(),
            "Dispatcher did not drain in time; pending requests stay PENDING"
        );
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Router assembly
// ---------------------------------------------------------------------------

/// Build the application router with all middleware layers.
fn build_app(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config);

    // -- Request ID layer (X-Request-ID) --------------------------------------
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // -- Tracing layer --------------------------------------------------------
    let trace = TraceLayer::new_for_http();

    build_router(state)
        .layer(propagate_id)
        .layer(request_id)
        .layer(trace)
        .layer(cors)
}

/// Build the CORS layer from config.
fn build_cors_layer(config: &Config) -> CorsLayer {
    if config.server.cors_origins.is_empty() {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = config
            .server
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

/// Set up the tracing subscriber based on configuration.
fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        EnvFilter::new(format!("tollgate={level},tower_http={level},warn"))
    });

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

/// Wait for a shutdown signal (SIGTERM or SIGINT / Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl+C)");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
