//! Liveness sweep.
//!
//! Every interval the keepalive frame is written to each session. A session
//! whose write fails gets one retry after `retry_delay`; a second failure
//! evicts it.

use std::sync::Arc;

use futures::future::join_all;
use relay_protocol::KEEPALIVE_FRAME;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::SessionRegistry;
use super::session::Session;
use crate::config::HeartbeatConfig;
use crate::metrics::RelayMetrics;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pinged: usize,
    pub retried: usize,
    pub evicted: usize,
}

pub struct HeartbeatMonitor {
    registry: Arc<SessionRegistry>,
    metrics: Arc<RelayMetrics>,
    config: HeartbeatConfig,
}

impl HeartbeatMonitor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        metrics: Arc<RelayMetrics>,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            registry,
            metrics,
            config,
        }
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            "Heartbeat every {:?} (retry after {:?})",
            self.config.interval, self.config.retry_delay
        );
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let report = self.sweep().await;
                    if report.evicted > 0 {
                        info!("Heartbeat evicted {} session(s)", report.evicted);
                    }
                }
            }
        }
        debug!("Heartbeat stopped");
    }

    /// Ping every session once, retrying failures once after the retry delay.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        // Pings run concurrently
        let sessions = self.registry.sessions();
        report.pinged = sessions.len();
        let results = join_all(sessions.iter().map(|session| self.ping(session))).await;
        let failed: Vec<Arc<Session>> = sessions
            .into_iter()
            .zip(results)
            .filter_map(|(session, ok)| (!ok).then_some(session))
            .collect();
        if failed.is_empty() {
            return report;
        }

        tokio::time::sleep(self.config.retry_delay).await;

        for session in failed {
            // Removed by another path while we waited
            if !self.registry.contains(session.id()) {
                continue;
            }
            report.retried += 1;
            if self.ping(&session).await {
                continue;
            }
            warn!(
                "Session {} of user {} missed two pings, evicting",
                session.id(),
                session.user_id()
            );
            self.metrics.heartbeat_evicted();
            self.registry.remove_session(session.id()).await;
            report.evicted += 1;
        }

        report
    }

    async fn ping(&self, session: &Arc<Session>) -> bool {
        self.metrics.ping_sent();
        match self.registry.send(session, KEEPALIVE_FRAME).await {
            Ok(()) => true,
            Err(e) => {
                self.metrics.ping_failed();
                debug!("Ping to {} failed: {}", session.id(), e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_helpers::seed_user;
    use crate::test_helpers::{read_text, test_node, ws_pair};
    use std::net::Shutdown;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn config() -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(50),
            retry_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_sweep_pings_healthy_sessions() {
        let node = test_node().await;
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        let (_session, mut client) = node.connect(&ada).await;
        let monitor = HeartbeatMonitor::new(node.registry.clone(), node.metrics.clone(), config());

        let report = monitor.sweep().await;
        assert_eq!(report, SweepReport { pinged: 1, retried: 0, evicted: 0 });
        assert_eq!(read_text(&mut client), "p");
    }

    #[tokio::test]
    async fn test_dead_session_is_evicted_after_retry() {
        let node = test_node().await;
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        let bob = seed_user(&node.repository, 2, "Bob", "exhibitor").await;
        let (healthy, mut healthy_client) = node.connect(&bob).await;

        // A session whose transport can no longer be written to
        let (server, _client) = ws_pair();
        server.get_ref().shutdown(Shutdown::Write).unwrap();
        let dead = Arc::new(Session::new(1, server).unwrap());
        node.registry
            .add_session(&ada, dead.clone(), false, "tok-ada")
            .await;
        assert!(node.repository.get_connection(dead.id()).await.unwrap().is_some());

        let monitor = HeartbeatMonitor::new(node.registry.clone(), node.metrics.clone(), config());
        let report = monitor.sweep().await;

        assert_eq!(report, SweepReport { pinged: 2, retried: 1, evicted: 1 });
        assert!(!node.registry.contains(dead.id()));
        assert!(node.registry.contains(healthy.id()));
        assert!(node.repository.get_connection(dead.id()).await.unwrap().is_none());
        assert_eq!(read_text(&mut healthy_client), "p");
        assert_eq!(node.metrics.heartbeat_evictions.load(Ordering::Relaxed), 1);
        assert_eq!(node.metrics.ping_failures.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let node = test_node().await;
        let ada = seed_user(&node.repository, 1, "Ada", "visitor").await;
        let (_session, mut client) = node.connect(&ada).await;
        let monitor = Arc::new(HeartbeatMonitor::new(
            node.registry.clone(),
            node.metrics.clone(),
            config(),
        ));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor.run(cancel.clone()));

        let ping = tokio::task::spawn_blocking(move || read_text(&mut client))
            .await
            .unwrap();
        assert_eq!(ping, "p");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
