//! Relay metrics for observability
//!
//! Counters are bumped on the hot path with relaxed atomics and exposed as a
//! serializable snapshot at `/metrics`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Process-wide metrics
#[derive(Debug, Default)]
pub struct RelayMetrics {
    // Session metrics
    /// Sessions currently in the registry
    pub active_sessions: AtomicU64,
    /// Sessions registered since start
    pub total_sessions: AtomicU64,
    /// Upgrades refused for a missing or invalid token
    pub handshakes_rejected: AtomicU64,

    // Frame metrics
    /// Text frames read from clients
    pub frames_received: AtomicU64,
    /// Frames dropped because they did not decode
    pub frames_malformed: AtomicU64,

    // Delivery metrics
    /// Envelopes written directly to a local session
    pub local_deliveries: AtomicU64,
    /// Envelopes published for a session owned elsewhere
    pub remote_publishes: AtomicU64,
    /// Local writes that failed
    pub delivery_failures: AtomicU64,
    /// Bus publishes that failed
    pub publish_failures: AtomicU64,

    // Bus metrics
    /// Payloads received from the bus
    pub bus_received: AtomicU64,
    /// Bus payloads written to a session owned here
    pub bus_delivered: AtomicU64,
    /// Bus payloads addressed to a session this process does not own
    pub bus_ignored: AtomicU64,
    /// Bus payloads that did not decode
    pub bus_decode_errors: AtomicU64,

    // Heartbeat metrics
    pub pings_sent: AtomicU64,
    pub ping_failures: AtomicU64,
    /// Sessions removed after two failed pings
    pub heartbeat_evictions: AtomicU64,

    start_time: Option<Instant>,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn session_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn handshake_rejected(&self) {
        self.handshakes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_malformed(&self) {
        self.frames_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivered_locally(&self) {
        self.local_deliveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn published_remotely(&self) {
        self.remote_publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn delivery_failed(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bus_payload_received(&self) {
        self.bus_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bus_payload_delivered(&self) {
        self.bus_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bus_payload_ignored(&self) {
        self.bus_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bus_decode_failed(&self) {
        self.bus_decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ping_sent(&self) {
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ping_failed(&self) {
        self.ping_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_evicted(&self) {
        self.heartbeat_evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            sessions: SessionMetrics {
                active: self.active_sessions.load(Ordering::Relaxed),
                total: self.total_sessions.load(Ordering::Relaxed),
                rejected_handshakes: self.handshakes_rejected.load(Ordering::Relaxed),
            },
            frames: FrameMetrics {
                received: self.frames_received.load(Ordering::Relaxed),
                malformed: self.frames_malformed.load(Ordering::Relaxed),
            },
            delivery: DeliveryMetrics {
                local: self.local_deliveries.load(Ordering::Relaxed),
                remote: self.remote_publishes.load(Ordering::Relaxed),
            },
            bus: BusMetrics {
                received: self.bus_received.load(Ordering::Relaxed),
                delivered: self.bus_delivered.load(Ordering::Relaxed),
                ignored: self.bus_ignored.load(Ordering::Relaxed),
            },
            heartbeat: HeartbeatMetrics {
                pings_sent: self.pings_sent.load(Ordering::Relaxed),
                ping_failures: self.ping_failures.load(Ordering::Relaxed),
                evictions: self.heartbeat_evictions.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                delivery: self.delivery_failures.load(Ordering::Relaxed),
                publish: self.publish_failures.load(Ordering::Relaxed),
                bus_decode: self.bus_decode_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub sessions: SessionMetrics,
    pub frames: FrameMetrics,
    pub delivery: DeliveryMetrics,
    pub bus: BusMetrics,
    pub heartbeat: HeartbeatMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub active: u64,
    pub total: u64,
    pub rejected_handshakes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub received: u64,
    pub malformed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryMetrics {
    pub local: u64,
    pub remote: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusMetrics {
    pub received: u64,
    pub delivered: u64,
    pub ignored: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    pub pings_sent: u64,
    pub ping_failures: u64,
    pub evictions: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub delivery: u64,
    pub publish: u64,
    pub bus_decode: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub instance: String,
    pub sessions: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_tracking() {
        let metrics = RelayMetrics::new();

        metrics.session_opened();
        metrics.session_opened();
        assert_eq!(metrics.active_sessions.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_sessions.load(Ordering::Relaxed), 2);

        metrics.session_closed();
        assert_eq!(metrics.active_sessions.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_sessions.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_snapshot() {
        let metrics = RelayMetrics::new();
        metrics.session_opened();
        metrics.delivered_locally();
        metrics.published_remotely();
        metrics.published_remotely();
        metrics.publish_failed();
        metrics.heartbeat_evicted();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions.active, 1);
        assert_eq!(snapshot.delivery.local, 1);
        assert_eq!(snapshot.delivery.remote, 2);
        assert_eq!(snapshot.errors.publish, 1);
        assert_eq!(snapshot.heartbeat.evictions, 1);
    }
}
