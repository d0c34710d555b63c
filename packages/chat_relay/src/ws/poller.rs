//! The poll loop: one OS thread waiting on the multiplexer.
//!
//! Ready sessions are drained on this thread; handling the frames happens on
//! the runtime, one task per read batch. A session whose socket is held by a
//! writer is paused and drained on the blocking pool instead, so one slow peer
//! never stalls reads for the rest.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::Dispatcher;
use super::multiplexer::Multiplexer;
use super::registry::SessionRegistry;
use super::session::{Inbound, Session};

pub struct Poller {
    multiplexer: Arc<Multiplexer>,
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    runtime: Handle,
}

impl Poller {
    pub fn new(
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<Dispatcher>,
        runtime: Handle,
    ) -> Self {
        Self {
            multiplexer: registry.multiplexer().clone(),
            registry,
            dispatcher,
            runtime,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name("relay-poller".to_string())
            .spawn(move || self.run(&cancel))
    }

    fn run(&self, cancel: &CancellationToken) {
        info!("Poll loop started");
        while !cancel.is_cancelled() {
            if let Err(e) = self.poll_once() {
                error!("Readiness wait failed: {}", e);
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        info!("Poll loop stopped");
    }

    /// One wait plus drain. Returns the number of ready sessions.
    pub fn poll_once(&self) -> io::Result<usize> {
        let ready = self.multiplexer.wait()?;
        let count = ready.len();

        for session in ready {
            match session.try_read_frames() {
                Some(inbound) => self.dispatch(session, inbound),
                None => self.defer(session),
            }
        }

        Ok(count)
    }

    fn dispatch(&self, session: Arc<Session>, inbound: Inbound) {
        if inbound.closed {
            // Stop readiness reports before the async teardown runs
            self.multiplexer.unregister(&session);
            debug!("Session {} hung up", session.id());
        }
        if inbound.frames.is_empty() && !inbound.closed {
            return;
        }

        let dispatcher = self.dispatcher.clone();
        let registry = self.registry.clone();
        self.runtime.spawn(async move {
            dispatcher.handle_batch(&session, inbound.frames).await;
            if inbound.closed {
                registry.remove_session(session.id()).await;
            }
        });
    }

    /// A write holds the socket. Silence the session and read it once the
    /// writer lets go; it is watched again after its batch is handled.
    fn defer(&self, session: Arc<Session>) {
        if !self.multiplexer.pause(&session) {
            return;
        }
        debug!("Session {} is busy writing, deferring its read", session.id());

        let multiplexer = self.multiplexer.clone();
        let dispatcher = self.dispatcher.clone();
        let registry = self.registry.clone();
        self.runtime.spawn(async move {
            let reader = session.clone();
            let inbound = match tokio::task::spawn_blocking(move || reader.read_frames()).await {
                Ok(inbound) => inbound,
                Err(e) => {
                    warn!("Deferred read for session {} failed: {}", session.id(), e);
                    Inbound {
                        frames: Vec::new(),
                        closed: true,
                    }
                }
            };

            if inbound.closed {
                multiplexer.unregister(&session);
                debug!("Session {} hung up", session.id());
            }
            dispatcher.handle_batch(&session, inbound.frames).await;
            if inbound.closed {
                registry.remove_session(session.id()).await;
            } else {
                multiplexer.resume(&session);
            }
        });
    }
}
