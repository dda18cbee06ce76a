//! Tollgate -- metered, quota-enforced proxy for generative-AI providers.
//!
//! This is the application entry point. It wires together all modules:
//!   - Configuration loading
//!   - Database initialization and quota ledger selection
//!   - Admin user bootstrapping and quota provisioning
//!   - Provider registration
//!   - Audit logger
//!   - HTTP server
//!   - Graceful shutdown on SIGTERM / SIGINT

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use tollgate::AppState;
use tollgate::api;
use tollgate::auth::users::{bootstrap_admin, list_users};
use tollgate::config::{Config, LedgerBackend};
use tollgate::db::Database;
use tollgate::providers::{GeminiText, OpenAiImages, ProviderRegistry};
use tollgate::quota::{self, MemoryLedger, QuotaLedger, SqliteLedger, spawn_audit_logger};

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

struct CliArgs {
    config_path: PathBuf,
}

fn parse_args() -> CliArgs {
    let mut args = std::env::args().skip(1);
    let mut config_path = PathBuf::from("tollgate.toml");

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    config_path = PathBuf::from(path);
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
tollgate {version} -- Metered AI provider gateway

USAGE:
    tollgate [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: tollgate.toml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (e.g. RUST_LOG=debug)
    TOLLGATE_CONFIG        Alternative to --config flag
    TOLLGATE_*             Per-setting overrides (see tollgate.example.toml)
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Parse CLI arguments
    let cli = parse_args();

    // Allow TOLLGATE_CONFIG env var as alternative to --config flag
    let config_path = std::env::var("TOLLGATE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or(cli.config_path);

    // 2. Load configuration
    let config = Config::load(&config_path)?;

    // 3. Initialize tracing/logging
    init_tracing(&config);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting tollgate"
    );
    let mut overridden: Vec<_> = config.env_overrides.all().iter().collect();
    overridden.sort();
    for (key, env_var) in overridden {
        tracing::info!(setting = %key, env = %env_var, "Setting overridden by environment");
    }

    // 4. Open database and pick the quota ledger
    let db = Database::open(&config.database.path)?;
    tracing::info!(path = %config.database.path.display(), "Database opened");

    let ledger: Arc<dyn QuotaLedger> = match config.quota.ledger {
        LedgerBackend::Sqlite => Arc::new(SqliteLedger::new(db.clone())),
        LedgerBackend::Memory => {
            tracing::warn!("Using in-memory quota ledger -- counters reset on restart");
            Arc::new(MemoryLedger::new())
        }
    };
    tracing::info!(backend = ledger.backend(), "Quota ledger ready");

    // 5. Bootstrap admin user (creates admin + prints API key on first run)
    match bootstrap_admin(&db, &config.auth.default_admin_name) {
        Ok(Some(result)) => {
            tracing::info!(admin = %result.user.name, "Admin user bootstrapped (first run)");
        }
        Ok(None) => {
            tracing::debug!("Admin bootstrap skipped (users already exist)");
        }
        Err(err) => {
            tracing::error!(error = %err, "Failed to bootstrap admin user");
            return Err(anyhow::anyhow!("admin bootstrap failed: {err}"));
        }
    }

    // 6. Make sure every user has a quota record. Existing records are kept.
    let limits = config.quota.default_limits();
    let users = list_users(&db).map_err(|e| anyhow::anyhow!("listing users failed: {e}"))?;
    for user in &users {
        quota::provision_user(ledger.as_ref(), &user.id, limits)
            .map_err(|e| anyhow::anyhow!("provisioning quota for {} failed: {e}", user.name))?;
    }

    // 7. Register providers
    let mut providers = ProviderRegistry::new();
    providers.register(Arc::new(OpenAiImages::new(&config.providers.openai_images)?));
    providers.register(Arc::new(GeminiText::new(&config.providers.gemini)?));
    if config.providers.openai_images.api_key.is_none() {
        tracing::warn!("No OpenAI API key configured; image requests go upstream unauthenticated");
    }
    if config.providers.gemini.api_key.is_none() {
        tracing::warn!("No Gemini API key configured; text requests go upstream unauthenticated");
    }

    // 8. Create audit channel + spawn background logger
    let (audit_tx, audit_rx) = tokio::sync::mpsc::unbounded_channel();
    let audit_handle = spawn_audit_logger(db.clone(), audit_rx);
    tracing::debug!("Audit logger spawned");

    // 9. Build shared application state and the router
    let listen_addr = config.listen_addr();
    let state = AppState::new(config, db, ledger, providers, audit_tx);
    let app = build_app(state);

    // 10. Bind and serve
    let listener = TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "Listening");

    println!();
    println!("  tollgate v{} is running", env!("CARGO_PKG_VERSION"));
    println!("  Images: http://{listen_addr}/proxy/image");
    println!("  Text:   http://{listen_addr}/proxy/text");
    println!("  Health: http://{listen_addr}/health");
    println!();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 11. Cleanup: the router (and with it every audit sender) is gone, so
    // the audit logger drains what is left and exits.
    tracing::info!("Shutting down gracefully");
    if let Err(e) = audit_handle.await {
        tracing::error!(error = %e, "Audit logger did not shut down cleanly");
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Router assembly
// ---------------------------------------------------------------------------

/// Wrap the API router in the global middleware stack.
fn build_app(state: AppState) -> Router {
    let cors = build_cors_layer(&state.config);

    // -- Request ID layer (X-Request-ID) --------------------------------------
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    api::build_router(state)
        .layer(propagate_id)
        .layer(TraceLayer::new_for_http())
        .layer(request_id)
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
