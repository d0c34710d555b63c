//! Instance liveness in the shared store.
//!
//! Each running relay keeps a row in `instances` fresh. A row not refreshed
//! within `ttl` belongs to a dead instance; any survivor drops it together
//! with the connection records that instance left behind.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::repository::ChatRepository;

pub struct Presence {
    repository: Arc<ChatRepository>,
    instance_id: String,
    /// The name came from configuration, so another live process may hold it.
    explicit: bool,
    ttl: Duration,
}

impl Presence {
    pub fn new(
        repository: Arc<ChatRepository>,
        instance_id: impl Into<String>,
        explicit: bool,
        ttl: Duration,
    ) -> Self {
        Self {
            repository,
            instance_id: instance_id.into(),
            explicit,
            ttl,
        }
    }

    /// Take the instance name. Connection records a previous run under the
    /// same name left behind are dropped.
    ///
    /// Fails when a configured name is still heartbeating elsewhere.
    pub async fn claim(&self) -> Result<()> {
        let now = Utc::now().timestamp();
        if self.explicit {
            if let Some(last_seen) = self.repository.instance_last_seen(&self.instance_id).await? {
                if now - last_seen < self.ttl_secs() {
                    bail!(
                        "Instance name {:?} is in use by a live relay (seen {}s ago)",
                        self.instance_id,
                        now - last_seen
                    );
                }
            }
        }

        let stale = self
            .repository
            .purge_instance_connections(&self.instance_id)
            .await?;
        if stale > 0 {
            info!("Dropped {} stale connection record(s)", stale);
        }
        self.repository.touch_instance(&self.instance_id, now).await
    }

    /// Refresh this instance and reap the dead ones.
    pub async fn beat(&self) -> Result<Vec<String>> {
        let now = Utc::now().timestamp();
        self.repository.touch_instance(&self.instance_id, now).await?;
        let reaped = self
            .repository
            .reap_dead_instances(now - self.ttl_secs())
            .await?;
        for instance_id in &reaped {
            info!("Instance {} stopped heartbeating; dropped its connections", instance_id);
        }
        Ok(reaped)
    }

    pub async fn run(self: Arc<Self>, every: Duration, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!("Failed to refresh instance liveness: {:#}", e);
                    }
                }
            }
        }
        debug!("Presence loop stopped");
    }

    /// Give the name up on clean shutdown.
    pub async fn release(&self) {
        if let Err(e) = self.repository.remove_instance(&self.instance_id).await {
            warn!("Failed to release instance {}: {:#}", self.instance_id, e);
        }
    }

    fn ttl_secs(&self) -> i64 {
        i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX).max(1)
    }
}
