use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tokio_tungstenite::tungstenite::{self, Message, WebSocket};

use crate::AppState;
use crate::auth::TokenResolver;
use crate::bus::Bus;
use crate::cache::Cache;
use crate::config::{
    AuthConfig, CacheBackendKind, CacheConfig, DatabaseConfig, ServerConfig, ServerFileConfig,
};
use crate::db::{Database, Dialect};
use crate::directory::Directory;
use crate::metrics::RelayMetrics;
use crate::models::User;
use crate::repository::ChatRepository;
use crate::repository::test_helpers::test_repository;
use crate::router::MessageRouter;
use crate::ws::{Multiplexer, Session, SessionRegistry};

/// A connected WebSocket pair over loopback: `(server side, client side)`.
/// The client side times out reads after five seconds so a missing frame
/// fails the test instead of hanging it.
pub fn ws_pair() -> (WebSocket<TcpStream>, WebSocket<TcpStream>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
    let addr = listener.local_addr().expect("local addr");

    let client = std::thread::spawn(move || {
        let stream = TcpStream::connect(addr).expect("connect loopback");
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .expect("read timeout");
        let (socket, _) =
            tungstenite::client(format!("ws://{addr}/"), stream).expect("client handshake");
        socket
    });

    let (stream, _) = listener.accept().expect("accept loopback");
    let server = tungstenite::accept(stream).expect("server handshake");
    let client = client.join().expect("client thread");
    (server, client)
}

/// Next text frame from the peer, skipping control frames.
pub fn read_text(client: &mut WebSocket<TcpStream>) -> String {
    loop {
        match client.read().expect("read frame") {
            Message::Text(text) => return text.as_str().to_owned(),
            _ => continue,
        }
    }
}

/// Assert nothing but control frames arrive within `wait`.
pub fn assert_no_text(client: &mut WebSocket<TcpStream>, wait: Duration) {
    client
        .get_mut()
        .set_read_timeout(Some(wait))
        .expect("read timeout");
    loop {
        match client.read() {
            Ok(Message::Text(text)) => panic!("unexpected frame: {}", text.as_str()),
            Ok(_) => continue,
            Err(tungstenite::Error::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                break;
            }
            Err(e) => panic!("unexpected read error: {e}"),
        }
    }
    client
        .get_mut()
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
}

pub fn test_cache_config() -> CacheConfig {
    CacheConfig {
        backend: CacheBackendKind::Memory,
        redis_url: String::new(),
        user_ttl: Duration::from_secs(60),
        window_ttl: Duration::from_secs(60),
    }
}

/// One relay instance wired against in-memory backends.
pub struct TestNode {
    pub repository: Arc<ChatRepository>,
    pub cache: Arc<Cache>,
    pub directory: Arc<Directory>,
    pub bus: Arc<Bus>,
    pub metrics: Arc<RelayMetrics>,
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<MessageRouter>,
}

pub async fn test_node() -> TestNode {
    let repository = Arc::new(test_repository().await);
    TestNode::assemble(repository, Arc::new(Bus::local(64)), "node-a")
}

/// Two instances deployed the way a fleet runs: each has its own store pool,
/// cache, directory and multiplexer. They share only the database file and the bus.
///
/// Callers must hold the `TempDir` for the lifetime of the test.
pub async fn test_fleet() -> (TestNode, TestNode, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let config = DatabaseConfig {
        url: format!("sqlite://{}?mode=rwc", tmp.path().join("fleet.db").display()),
        max_connections: 2,
    };
    let bus = Arc::new(Bus::local(64));

    let mut nodes = Vec::with_capacity(2);
    for instance_id in ["node-a", "node-b"] {
        let db = Database::connect(&config).await.expect("shared store");
        let repository = Arc::new(ChatRepository::new(db.pool));
        nodes.push(TestNode::assemble(repository, bus.clone(), instance_id));
    }
    let node_b = nodes.pop().expect("node b");
    let node_a = nodes.pop().expect("node a");
    (node_a, node_b, tmp)
}

impl TestNode {
    fn assemble(repository: Arc<ChatRepository>, bus: Arc<Bus>, instance_id: &str) -> Self {
        let cache = Arc::new(Cache::memory());
        let directory = Arc::new(Directory::new(
            repository.clone(),
            cache.clone(),
            &test_cache_config(),
        ));
        let metrics = Arc::new(RelayMetrics::new());
        let multiplexer =
            Arc::new(Multiplexer::new(Duration::from_millis(100)).expect("epoll instance"));
        let registry = Arc::new(SessionRegistry::new(
            multiplexer,
            directory.clone(),
            metrics.clone(),
            instance_id,
        ));
        let router = Arc::new(MessageRouter::new(
            registry.clone(),
            directory.clone(),
            bus.clone(),
            relay_protocol::ChatPolicy::default(),
            metrics.clone(),
        ));
        Self {
            repository,
            cache,
            directory,
            bus,
            metrics,
            registry,
            router,
        }
    }

    /// Open a session for a stored user and consume its `WELCOME`.
    pub async fn connect(&self, user: &User) -> (Arc<Session>, WebSocket<TcpStream>) {
        self.open(user, false).await
    }

    /// Like `connect`, for a user the store has never seen.
    pub async fn connect_new(&self, user: &User) -> (Arc<Session>, WebSocket<TcpStream>) {
        self.open(user, true).await
    }

    async fn open(&self, user: &User, is_new: bool) -> (Arc<Session>, WebSocket<TcpStream>) {
        let (server, mut client) = ws_pair();
        let session = Arc::new(Session::new(user.user_id, server).expect("session"));
        let token = format!("token-{}", user.user_id);
        self.registry
            .add_session(user, session.clone(), is_new, &token)
            .await;
        read_text(&mut client);
        (session, client)
    }
}

/// Build a fully-wired `AppState` over an in-memory database with the demo
/// accounts enabled.
///
/// Returns `(AppState, TempDir)`; callers must hold the `TempDir` for the
/// lifetime of the test.
pub async fn test_app_state() -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let node = test_node().await;

    let db = Arc::new(Database {
        pool: node.repository.pool.clone(),
        dialect: Dialect::Sqlite,
    });
    let auth_config = AuthConfig {
        validation_endpoint: None,
        success_status_code: 800200,
        request_timeout: Duration::from_secs(2),
        demo_users: true,
    };
    let resolver = Arc::new(
        TokenResolver::new(node.directory.clone(), auth_config).expect("token resolver"),
    );

    let state = AppState {
        server_config: Arc::new(ServerConfig::from_file(&ServerFileConfig::default())),
        metrics: node.metrics.clone(),
        db,
        repository: node.repository.clone(),
        directory: node.directory.clone(),
        registry: node.registry.clone(),
        router: node.router.clone(),
        resolver,
    };

    (state, tmp)
}
