//! WebSocket listener.
//!
//! The upgrade runs on a blocking thread so the authenticated socket ends up
//! as a plain blocking `WebSocket<TcpStream>` owned by a [`Session`]. The token
//! is resolved inside the handshake callback; a refused token answers the
//! upgrade request with 400/401 and the connection never becomes a session.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio_tungstenite::tungstenite::{
    self, WebSocket,
    handshake::server::{ErrorResponse, Request, Response},
    http::StatusCode,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::SessionRegistry;
use super::session::Session;
use crate::auth::{AuthError, ResolvedUser, TokenResolver, token_from_query};
use crate::metrics::RelayMetrics;

/// Upper bound on a client's upgrade request.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum HandshakeFailure {
    #[error("upgrade refused: {0}")]
    Rejected(AuthError),

    #[error("upgrade failed: {0}")]
    Transport(String),

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

struct Accepted {
    socket: WebSocket<TcpStream>,
    resolved: ResolvedUser,
    token: String,
}

pub struct Gateway {
    registry: Arc<SessionRegistry>,
    resolver: Arc<TokenResolver>,
    metrics: Arc<RelayMetrics>,
}

impl Gateway {
    pub fn new(
        registry: Arc<SessionRegistry>,
        resolver: Arc<TokenResolver>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            registry,
            resolver,
            metrics,
        }
    }

    /// Accept connections until cancelled.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        if let Ok(addr) = listener.local_addr() {
            info!("WebSocket gateway listening on ws://{}", addr);
        }
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let gateway = self.clone();
                        tokio::spawn(async move { gateway.admit(stream, peer).await });
                    }
                    Err(e) => {
                        // Usually descriptor exhaustion; back off instead of spinning
                        warn!("WebSocket accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        info!("WebSocket gateway stopped");
    }

    async fn admit(&self, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let stream = match stream.into_std().and_then(|s| {
            s.set_nonblocking(false)?;
            Ok(s)
        }) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Cannot take over connection from {}: {}", peer, e);
                return;
            }
        };

        let resolver = self.resolver.clone();
        let runtime = Handle::current();
        let outcome =
            tokio::task::spawn_blocking(move || handshake(stream, &runtime, &resolver)).await;

        let accepted = match outcome {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(HandshakeFailure::Rejected(e))) => {
                self.metrics.handshake_rejected();
                info!("Rejected upgrade from {}: {}", peer, e);
                return;
            }
            Ok(Err(e)) => {
                debug!("Upgrade from {} failed: {}", peer, e);
                return;
            }
            Err(e) => {
                warn!("Handshake task for {} failed: {}", peer, e);
                return;
            }
        };

        let Accepted {
            socket,
            resolved,
            token,
        } = accepted;
        let session = match Session::new(resolved.user.user_id, socket) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!("Cannot create session for {}: {}", peer, e);
                return;
            }
        };

        self.registry
            .add_session(&resolved.user, session.clone(), resolved.is_new, &token)
            .await;

        if let Err(e) = self.registry.multiplexer().register(&session) {
            warn!("Cannot watch session {}: {}", session.id(), e);
            self.registry.remove_session(session.id()).await;
        }
    }
}

/// Run the upgrade, resolving the token before the response is written.
fn handshake(
    stream: TcpStream,
    runtime: &Handle,
    resolver: &TokenResolver,
) -> Result<Accepted, HandshakeFailure> {
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

    let mut outcome: Option<Result<(ResolvedUser, String), AuthError>> = None;
    let callback = |request: &Request, response: Response| {
        let token = token_from_query(request.uri().query()).unwrap_or_default();
        match runtime.block_on(resolver.resolve(&token)) {
            Ok(resolved) => {
                outcome = Some(Ok((resolved, token)));
                Ok(response)
            }
            Err(e) => {
                let mut refusal = ErrorResponse::new(Some(e.to_string()));
                *refusal.status_mut() = StatusCode::from_u16(e.status_code().as_u16())
                    .unwrap_or(StatusCode::UNAUTHORIZED);
                outcome = Some(Err(e));
                Err(refusal)
            }
        }
    };

    let upgraded = tungstenite::accept_hdr(stream, callback).map_err(|e| e.to_string());

    match (upgraded, outcome) {
        (Ok(socket), Some(Ok((resolved, token)))) => {
            socket.get_ref().set_read_timeout(None)?;
            Ok(Accepted {
                socket,
                resolved,
                token,
            })
        }
        (_, Some(Err(e))) => Err(HandshakeFailure::Rejected(e)),
        (Err(e), _) => Err(HandshakeFailure::Transport(e)),
        (Ok(_), None) => Err(HandshakeFailure::Transport(
            "upgrade completed without a token check".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;
    use crate::test_helpers::{TestNode, read_text, test_node};
    use relay_protocol::{Event, OutgoingEnvelope, WelcomePayload};
    use std::sync::atomic::Ordering;

    async fn start_gateway(node: &TestNode) -> (SocketAddr, CancellationToken) {
        let resolver = TokenResolver::new(
            node.directory.clone(),
            AuthConfig {
                validation_endpoint: None,
                success_status_code: 800200,
                request_timeout: Duration::from_secs(1),
                demo_users: true,
            },
        )
        .unwrap();
        let gateway = Arc::new(Gateway::new(
            node.registry.clone(),
            Arc::new(resolver),
            node.metrics.clone(),
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(gateway.run(listener, cancel.clone()));
        (addr, cancel)
    }

    fn connect(addr: SocketAddr, query: &str) -> Result<WebSocket<TcpStream>, tungstenite::Error> {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        tungstenite::client(format!("ws://{addr}/{query}"), stream)
            .map(|(socket, _)| socket)
            .map_err(|e| match e {
                tungstenite::HandshakeError::Failure(e) => e,
                tungstenite::HandshakeError::Interrupted(_) => {
                    tungstenite::Error::Io(io::ErrorKind::WouldBlock.into())
                }
            })
    }

    fn rejected_status(result: Result<WebSocket<TcpStream>, tungstenite::Error>) -> u16 {
        match result {
            Err(tungstenite::Error::Http(response)) => response.status().as_u16(),
            Err(e) => panic!("expected an HTTP refusal, got {e}"),
            Ok(_) => panic!("expected an HTTP refusal, got an upgrade"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_valid_token_becomes_session() {
        let node = test_node().await;
        let (addr, cancel) = start_gateway(&node).await;

        let welcome = tokio::task::spawn_blocking(move || {
            let mut client = connect(addr, "?authToken=visitor1").unwrap();
            read_text(&mut client)
        })
        .await
        .unwrap();

        let envelope = OutgoingEnvelope::decode(&welcome).unwrap();
        assert_eq!(envelope.event, Event::Welcome);
        let payload: WelcomePayload = envelope.payload_as().unwrap();
        assert_eq!(payload.user_id, "1");

        // Registered for readiness once admitted
        for _ in 0..50 {
            if !node.registry.multiplexer().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(node.registry.contains(&payload.connection_id));
        assert_eq!(node.registry.multiplexer().len(), 1);

        let stored = node.repository.get_user_by_user_id(1).await.unwrap().unwrap();
        assert_eq!(stored.name, "visitor1");
        assert_eq!(stored.connections, vec![payload.connection_id]);
        cancel.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_and_invalid_tokens_are_refused() {
        let node = test_node().await;
        let (addr, cancel) = start_gateway(&node).await;

        let (missing, invalid) = tokio::task::spawn_blocking(move || {
            (
                rejected_status(connect(addr, "")),
                rejected_status(connect(addr, "?authToken=nobody")),
            )
        })
        .await
        .unwrap();

        assert_eq!(missing, 400);
        assert_eq!(invalid, 401);
        assert!(node.registry.is_empty());

        // The refusal is written before the counter is bumped
        for _ in 0..50 {
            if node.metrics.handshakes_rejected.load(Ordering::Relaxed) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(node.metrics.handshakes_rejected.load(Ordering::Relaxed), 2);
        cancel.cancel();
    }
}
