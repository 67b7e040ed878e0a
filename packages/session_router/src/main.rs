use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

use session_router::backend::BackendHub;
use session_router::config::{
    AuthConfig, FileConfig, RouterConfig, ServerConfig, SessionConfig, load_config,
};
use session_router::db::Database;
use session_router::metrics::ServerMetrics;
use session_router::repository::SqliteStore;
use session_router::session::SessionServices;
use session_router::workspace::{DocumentHub, LocalWorkspaceFactory};
use session_router::ws::{self, AppState};

/// How often idle backend topics are reaped.
const HUB_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "session-router")]
#[command(about = "Per-connection session multiplexer for the interactive computation service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.session-router)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server in the foreground (the default)
    Server(ServerArgs),

    /// Print the effective configuration and exit
    Config,
}

#[derive(Parser, Default)]
struct ServerArgs {
    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RouterConfig::new(cli.data_dir.clone())?;
    let file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .context("Invalid configuration")?;

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", serde_json::to_string_pretty(&file_config)?);
            Ok(())
        }
        Some(Commands::Server(args)) => run_server(args, config, file_config).await,
        None => run_server(ServerArgs::default(), config, file_config).await,
    }
}

async fn run_server(args: ServerArgs, config: RouterConfig, file_config: FileConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "session_router=debug,tower_http=debug,info"
    } else {
        "session_router=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting session router");

    let mut server_config = ServerConfig::from_file(&file_config.server);
    if let Some(port) = args.port {
        server_config.port = port;
    }
    if let Some(host) = args.host {
        server_config.host = host;
    }
    let session_config = SessionConfig::from_file(&file_config.session);
    let auth_config = Arc::new(AuthConfig::from_file(&file_config.auth));

    info!(
        "Session settings: share keys {} chars, session codes {} chars, client buffer {}",
        session_config.share_key_length,
        session_config.sess_code_length,
        session_config.client_buffer
    );
    info!("Caller identity header: {}", auth_config.user_header);

    // Initialize database
    info!("Initializing database...");
    let db = Arc::new(Database::new(&config).await?);
    let store = Arc::new(SqliteStore::new(db.pool.clone()));

    let metrics = Arc::new(ServerMetrics::new());
    let backend_hub = Arc::new(BackendHub::default());
    let documents = Arc::new(DocumentHub::new());

    let services = SessionServices {
        profiles: store.clone(),
        buckets: store,
        workspaces: Arc::new(LocalWorkspaceFactory::new(
            documents,
            session_config.sess_code_length,
        )),
        config: session_config,
        metrics: metrics.clone(),
    };

    let app_state = AppState {
        services,
        backend_hub: backend_hub.clone(),
        auth_config,
        metrics,
        db,
    };

    // Reap backend topics nobody listens to anymore
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(HUB_PRUNE_INTERVAL);
        loop {
            interval.tick().await;
            let pruned = backend_hub.prune();
            if pruned > 0 {
                info!("Pruned {} idle backend topics", pruned);
            }
        }
    });

    let app = ws::router(app_state)
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive());

    let addr = server_config.bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Session router listening on http://{}", actual_addr);
    info!("  GET /ws       - session WebSocket");
    info!("  GET /health   - health check");
    info!("  GET /metrics  - server metrics");

    // Create shutdown signal handler
    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    info!("Shutdown complete");
    Ok(())
}
