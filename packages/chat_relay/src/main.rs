use anyhow::{Context, Result};
use axum::routing::get;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod auth;
mod bus;
mod cache;
mod config;
mod db;
mod directory;
mod error;
mod handlers;
mod metrics;
mod models;
mod presence;
mod repository;
mod router;
mod ws;

#[cfg(test)]
mod test_helpers;

use crate::auth::TokenResolver;
use crate::bus::Bus;
use crate::cache::Cache;
use crate::config::{
    AuthConfig, BusConfig, CacheConfig, DatabaseConfig, FileConfig, HeartbeatConfig, RelayConfig,
    ServerConfig, chat_policy_from_file, load_config,
};
use crate::db::Database;
use crate::directory::Directory;
use crate::metrics::RelayMetrics;
use crate::presence::Presence;
use crate::repository::ChatRepository;
use crate::router::MessageRouter;
use crate::ws::{Dispatcher, Gateway, HeartbeatMonitor, Multiplexer, Poller, SessionRegistry};

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
#[command(name = "chat-relay")]
#[command(about = "Real-time chat relay over WebSockets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.chat-relay)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay in the foreground (the default)
    Serve(ServeArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Parser, Default)]
struct ServeArgs {
    /// Host to bind both listeners to
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the HTTP API
    #[arg(long)]
    http_port: Option<u16>,

    /// Port for client WebSocket sessions
    #[arg(long)]
    ws_port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub(crate) struct AppState {
    /// Listener configuration
    pub server_config: Arc<ServerConfig>,
    /// Relay metrics for observability
    pub metrics: Arc<RelayMetrics>,
    pub db: Arc<Database>,
    pub repository: Arc<ChatRepository>,
    pub directory: Arc<Directory>,
    /// Sessions owned by this instance
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<MessageRouter>,
    pub resolver: Arc<TokenResolver>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = RelayConfig::new(cli.data_dir.clone())?;
    let file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", config.config_toml_path().display()))?;

    match cli.command {
        Some(Commands::Config) => {
            println!("{}", toml::to_string_pretty(&file_config)?);
            Ok(())
        }
        Some(Commands::Serve(args)) => run_server(args, config, file_config).await,
        None => run_server(ServeArgs::default(), config, file_config).await,
    }
}

async fn run_server(args: ServeArgs, config: RelayConfig, mut file_config: FileConfig) -> Result<()> {
    // Setup logging
    let default_directive = if args.debug {
        "chat_relay=debug,tower_http=debug,info"
    } else {
        "chat_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    // Command-line flags win over config.toml and RELAY_* variables
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.http_port {
        file_config.server.http_port = port;
    }
    if let Some(port) = args.ws_port {
        file_config.server.ws_port = port;
    }

    let server_config = Arc::new(ServerConfig::from_file(&file_config.server));
    let cache_config = CacheConfig::from_file(&file_config.cache);
    let bus_config = BusConfig::from_file(&file_config.bus);
    let auth_config = AuthConfig::from_file(&file_config.auth);
    let heartbeat_config = HeartbeatConfig::from_file(&file_config.heartbeat);
    let policy = chat_policy_from_file(&file_config.chat);

    let db_config = DatabaseConfig::from_file(&file_config.database, &config);

    if server_config.instance_name_explicit {
        info!("Starting chat relay instance {}", server_config.instance_name);
    } else {
        info!(
            "Starting chat relay instance {} (generated; set server.instance_name to pin it)",
            server_config.instance_name
        );
    }

    // Initialize database
    let db = Arc::new(Database::connect(&db_config).await?);
    let repository = Arc::new(ChatRepository::new(db.pool.clone()));

    // Three missed beats mark an instance dead
    let presence = Arc::new(Presence::new(
        repository.clone(),
        server_config.instance_name.clone(),
        server_config.instance_name_explicit,
        heartbeat_config.interval * 3,
    ));
    presence.claim().await?;

    let cache = Arc::new(Cache::connect(&cache_config).await?);
    let directory = Arc::new(Directory::new(repository.clone(), cache.clone(), &cache_config));
    let bus = Arc::new(Bus::connect(&bus_config).await?);
    let metrics = Arc::new(RelayMetrics::new());
    info!(
        "Cache backend: {}, bus backend: {}",
        cache.backend_name(),
        bus.backend_name()
    );
    if matches!(*bus, Bus::Local(_)) || !db_config.is_shareable() {
        warn!("Local bus or sqlite store: this instance cannot share users with other hosts");
    }

    match ws::raise_open_file_limit() {
        Ok(limit) => info!("Open file limit: {}", limit),
        Err(e) => warn!("Failed to raise open file limit: {}", e),
    }

    let multiplexer = Arc::new(
        Multiplexer::new(server_config.poll_timeout).context("Failed to create epoll instance")?,
    );
    let registry = Arc::new(SessionRegistry::new(
        multiplexer,
        directory.clone(),
        metrics.clone(),
        server_config.instance_name.clone(),
    ));
    let router = Arc::new(MessageRouter::new(
        registry.clone(),
        directory.clone(),
        bus.clone(),
        policy,
        metrics.clone(),
    ));
    let resolver = Arc::new(TokenResolver::new(directory.clone(), auth_config.clone())?);
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        directory.clone(),
        router.clone(),
        metrics.clone(),
    ));

    match &auth_config.validation_endpoint {
        Some(endpoint) => info!("Token validation endpoint: {}", endpoint),
        None => warn!("No token validation endpoint; only known tokens are accepted"),
    }
    if auth_config.demo_users {
        info!("Demo accounts enabled");
    }

    let cancel = CancellationToken::new();

    // Cross-instance bus
    tokio::spawn(bus::run_subscriber(
        bus.clone(),
        registry.clone(),
        metrics.clone(),
        bus_config.resubscribe_delay,
        cancel.clone(),
    ));

    tokio::spawn(presence.clone().run(heartbeat_config.interval, cancel.clone()));

    // Liveness sweep
    let heartbeat = Arc::new(HeartbeatMonitor::new(
        registry.clone(),
        metrics.clone(),
        heartbeat_config,
    ));
    tokio::spawn(heartbeat.run(cancel.clone()));

    // Readiness loop
    let poller = Poller::new(registry.clone(), dispatcher, tokio::runtime::Handle::current());
    let poller_thread = poller
        .spawn(cancel.clone())
        .context("Failed to start poll loop")?;

    // Client sessions
    let ws_addr = server_config.ws_addr()?;
    let ws_listener = tokio::net::TcpListener::bind(ws_addr)
        .await
        .with_context(|| format!("Failed to bind WebSocket listener on {}", ws_addr))?;
    info!("WebSocket sessions on ws://{}", ws_listener.local_addr()?);
    let gateway = Arc::new(Gateway::new(registry.clone(), resolver.clone(), metrics.clone()));
    tokio::spawn(gateway.run(ws_listener, cancel.clone()));

    // Spawn periodic expired cache entry cleanup
    if matches!(*cache, Cache::Memory(_)) {
        let purge_cache = cache.clone();
        let purge_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    () = purge_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = purge_cache.purge_expired().await;
                        if purged > 0 {
                            tracing::debug!("Purged {} expired cache entries", purged);
                        }
                    }
                }
            }
        });
    }

    let app_state = AppState {
        server_config: server_config.clone(),
        metrics,
        db,
        repository,
        directory,
        registry: registry.clone(),
        router,
        resolver,
    };

    let app = handlers::api_routes()
        // Health endpoints
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/health/ready", get(handlers::health_ready_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr = server_config.http_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Chat relay listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /api/v1/users                 - Users the caller may chat with");
    info!("  GET    /api/v1/users/myself          - The caller");
    info!("  GET    /api/v1/chat/windows          - The caller's chat windows");
    info!("  POST   /api/v1/chat/init             - Open a chat window");
    info!("  GET    /api/v1/chat/:id              - Chat window details");
    info!("  GET    /api/v1/chat/:id/messages     - Message history");
    info!("  POST   /api/v1/chat/:id/messages     - Send from a live session");

    // Create shutdown signal handler
    let shutdown_cancel = cancel.clone();
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Received shutdown signal, cleaning up...");
        shutdown_cancel.cancel();
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");
    cancel.cancel();

    // Close every session this instance still owns
    let open = registry.sessions();
    for session in &open {
        registry.remove_session(session.id()).await;
    }
    info!("Closed {} session(s)", open.len());
    presence.release().await;

    match tokio::task::spawn_blocking(move || poller_thread.join()).await {
        Ok(Ok(())) => {}
        _ => warn!("Poll loop did not stop cleanly"),
    }

    info!("Shutdown complete");
    server_result
}
