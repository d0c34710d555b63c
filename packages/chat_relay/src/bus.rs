//! Cross-instance delivery.
//!
//! Every instance publishes envelopes addressed to sessions it does not own,
//! and every instance listens on the same channel, writing through the
//! payloads whose `toConnection` it holds.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use futures::stream::BoxStream;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use relay_protocol::{OutgoingEnvelope, ProtocolError};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{BusBackendKind, BusConfig};
use crate::metrics::RelayMetrics;
use crate::ws::SessionRegistry;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] ProtocolError),

    #[error("redis bus error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// In-process channel; every subscriber sees every payload.
pub struct LocalBus {
    tx: broadcast::Sender<String>,
}

pub struct RedisBus {
    client: redis::Client,
    conn: MultiplexedConnection,
    channel: String,
}

pub enum Bus {
    Local(LocalBus),
    Redis(RedisBus),
}

impl Bus {
    pub fn local(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self::Local(LocalBus { tx })
    }

    pub async fn connect(config: &BusConfig) -> anyhow::Result<Self> {
        match config.backend {
            BusBackendKind::Local => {
                info!("Bus backend: in-process broadcast");
                Ok(Self::local(config.capacity))
            }
            BusBackendKind::Redis => {
                let client = redis::Client::open(config.redis_url.as_str())
                    .with_context(|| format!("Invalid redis URL: {}", config.redis_url))?;
                let conn = client
                    .get_multiplexed_async_connection()
                    .await
                    .with_context(|| format!("Failed to connect to redis at {}", config.redis_url))?;
                info!(
                    "Bus backend: redis channel {} at {}",
                    config.channel, config.redis_url
                );
                Ok(Self::Redis(RedisBus {
                    client,
                    conn,
                    channel: config.channel.clone(),
                }))
            }
        }
    }

    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::Redis(_) => "redis",
        }
    }

    /// Publish one envelope. Returns how many subscribers received it.
    pub async fn publish(&self, envelope: &OutgoingEnvelope) -> Result<usize, BusError> {
        let payload = envelope.to_json()?;
        match self {
            // No receivers means no instance is listening; same as a redis PUBLISH to nobody
            Self::Local(bus) => Ok(bus.tx.send(payload).unwrap_or(0)),
            Self::Redis(bus) => {
                let mut conn = bus.conn.clone();
                let receivers: i64 = conn.publish(&bus.channel, payload).await?;
                Ok(usize::try_from(receivers).unwrap_or(0))
            }
        }
    }

    /// Stream of raw payloads. Ends when the underlying subscription is lost.
    pub async fn subscribe(&self) -> Result<BoxStream<'static, String>, BusError> {
        match self {
            Self::Local(bus) => {
                let rx = bus.tx.subscribe();
                Ok(futures::stream::unfold(rx, |mut rx| async move {
                    loop {
                        match rx.recv().await {
                            Ok(payload) => return Some((payload, rx)),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!("Bus subscriber lagged, {} payloads dropped", skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => return None,
                        }
                    }
                })
                .boxed())
            }
            Self::Redis(bus) => {
                let mut pubsub = bus.client.get_async_pubsub().await?;
                pubsub.subscribe(&bus.channel).await?;
                Ok(pubsub
                    .into_on_message()
                    .filter_map(|msg| async move {
                        match msg.get_payload::<String>() {
                            Ok(payload) => Some(payload),
                            Err(e) => {
                                warn!("Dropping non-text bus payload: {}", e);
                                None
                            }
                        }
                    })
                    .boxed())
            }
        }
    }
}

/// Consume the bus until cancelled, resubscribing after `resubscribe_delay`
/// whenever the subscription drops. Each payload is handled on its own task.
pub async fn run_subscriber(
    bus: Arc<Bus>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<RelayMetrics>,
    resubscribe_delay: Duration,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        match bus.subscribe().await {
            Ok(mut payloads) => {
                info!("Subscribed to {} bus", bus.backend_name());
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        next = payloads.next() => match next {
                            Some(payload) => {
                                metrics.bus_payload_received();
                                let registry = registry.clone();
                                let metrics = metrics.clone();
                                tokio::spawn(async move {
                                    deliver_from_bus(&registry, &metrics, &payload).await;
                                });
                            }
                            None => {
                                warn!("Bus subscription ended");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => warn!("Bus subscribe failed: {}", e),
        }

        tokio::select! {
            () = tokio::time::sleep(resubscribe_delay) => {}
            () = cancel.cancelled() => break,
        }
    }
    debug!("Bus subscriber stopped");
}

/// Write a bus payload to its target if this instance owns it.
/// The payload is forwarded verbatim.
pub async fn deliver_from_bus(registry: &SessionRegistry, metrics: &RelayMetrics, payload: &str) {
    let envelope = match OutgoingEnvelope::decode(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            metrics.bus_decode_failed();
            warn!("Dropping undecodable bus payload: {}", e);
            return;
        }
    };

    let Some(target) = envelope.to_connection.as_deref() else {
        metrics.bus_payload_ignored();
        debug!("Bus payload without target ignored");
        return;
    };

    let Some(session) = registry.get(target) else {
        metrics.bus_payload_ignored();
        return;
    };

    match registry.send(&session, payload).await {
        Ok(()) => {
            metrics.bus_payload_delivered();
            debug!("Bus payload delivered to {}", target);
        }
        Err(e) => {
            metrics.delivery_failed();
            warn!("Failed to deliver bus payload to {}: {}", target, e);
        }
    }
}
