//! Readiness multiplexing over every live session with one epoll set.
//!
//! Sessions are keyed by raw descriptor. `wait` may run on the poll thread
//! while other tasks register and unregister sessions.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use tracing::debug;

use super::session::Session;

/// Upper bound on readiness events handled per wait.
pub const MAX_EVENTS: usize = 100;

pub struct Multiplexer {
    epoll: Epoll,
    sessions: RwLock<HashMap<RawFd, Arc<Session>>>,
    poll_timeout_ms: u16,
}

impl Multiplexer {
    pub fn new(poll_timeout: Duration) -> io::Result<Self> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self {
            epoll,
            sessions: RwLock::new(HashMap::new()),
            poll_timeout_ms: u16::try_from(poll_timeout.as_millis()).unwrap_or(u16::MAX),
        })
    }

    /// Watch a session for input and hang-up. On error the session is not tracked.
    pub fn register(&self, session: &Arc<Session>) -> io::Result<()> {
        let fd = session.raw_fd();
        {
            let mut table = self.write_table();
            if table.contains_key(&fd) {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("descriptor {fd} is already registered"),
                ));
            }
            table.insert(fd, session.clone());
        }

        if let Err(e) = self.epoll.add(session.as_ref(), Self::interest(fd)) {
            self.write_table().remove(&fd);
            return Err(e.into());
        }
        Ok(())
    }

    /// Stop watching a session. Returns false if it was not registered.
    pub fn unregister(&self, session: &Session) -> bool {
        let fd = session.raw_fd();
        {
            let mut table = self.write_table();
            if !Self::is_current(&table, session) {
                return false;
            }
            table.remove(&fd);
        }

        // The descriptor may already be closed, which also removes it from the set
        if let Err(e) = self.epoll.delete(session) {
            debug!("epoll delete for session {} failed: {}", session.id(), e);
        }
        true
    }

    /// Stop readiness reports for a session while keeping it registered.
    /// Returns false if the session is not registered.
    pub fn pause(&self, session: &Session) -> bool {
        let table = self.read_table();
        if !Self::is_current(&table, session) {
            return false;
        }
        if let Err(e) = self.epoll.delete(session) {
            debug!("epoll pause for session {} failed: {}", session.id(), e);
        }
        true
    }

    /// Report readiness for a paused session again. A session unregistered
    /// in the meantime stays unwatched.
    pub fn resume(&self, session: &Session) -> bool {
        let table = self.read_table();
        if !Self::is_current(&table, session) {
            return false;
        }
        match self.epoll.add(session, Self::interest(session.raw_fd())) {
            Ok(()) | Err(Errno::EEXIST) => true,
            Err(e) => {
                debug!("epoll resume for session {} failed: {}", session.id(), e);
                false
            }
        }
    }

    fn interest(fd: RawFd) -> EpollEvent {
        EpollEvent::new(EpollFlags::EPOLLIN | EpollFlags::EPOLLRDHUP, fd as u64)
    }

    fn is_current(table: &HashMap<RawFd, Arc<Session>>, session: &Session) -> bool {
        table
            .get(&session.raw_fd())
            .is_some_and(|current| current.id() == session.id())
    }

    /// Block up to the poll timeout and return the sessions with pending input.
    /// Events for descriptors no longer in the table are dropped.
    pub fn wait(&self) -> io::Result<Vec<Arc<Session>>> {
        let mut events = [EpollEvent::empty(); MAX_EVENTS];
        let ready = match self
            .epoll
            .wait(&mut events, EpollTimeout::from(self.poll_timeout_ms))
        {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let table = self.read_table();
        Ok(events[..ready]
            .iter()
            .filter_map(|event| table.get(&(event.data() as RawFd)).cloned())
            .collect())
    }

    pub fn len(&self) -> usize {
        self.read_table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_table(&self) -> RwLockReadGuard<'_, HashMap<RawFd, Arc<Session>>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, HashMap<RawFd, Arc<Session>>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lift the soft open-file limit to the hard limit. Returns the new soft limit.
pub fn raise_open_file_limit() -> nix::Result<u64> {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE)?;
    if soft < hard {
        setrlimit(Resource::RLIMIT_NOFILE, hard, hard)?;
    }
    Ok(hard)
}
