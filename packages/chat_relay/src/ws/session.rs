//! One live client connection.
//!
//! The WebSocket runs in blocking mode so a write completes (or times out)
//! before `send_text` returns; callers on the runtime go through
//! `SessionRegistry::send`, which moves the write to the blocking pool. Reads
//! only happen when the multiplexer reports readiness; the socket is switched
//! to non-blocking for the duration of the drain so a partial frame never
//! stalls the poll thread.

use std::io;
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use tokio_tungstenite::tungstenite::{self, Message, WebSocket};
use tracing::debug;
use uuid::Uuid;

/// A peer that accepts nothing for this long fails the write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Session {
    id: String,
    user_id: u64,
    socket: Mutex<WebSocket<TcpStream>>,
    /// Second handle on the same socket, used for readiness registration and shutdown.
    descriptor: TcpStream,
}

/// Frames drained by one readiness notification.
#[derive(Debug, Default)]
pub struct Inbound {
    pub frames: Vec<String>,
    /// The peer closed the connection or the transport failed.
    pub closed: bool,
}

impl Session {
    pub fn new(user_id: u64, socket: WebSocket<TcpStream>) -> io::Result<Self> {
        socket.get_ref().set_write_timeout(Some(WRITE_TIMEOUT))?;
        let descriptor = socket.get_ref().try_clone()?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            socket: Mutex::new(socket),
            descriptor,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn user_id(&self) -> u64 {
        self.user_id
    }

    pub fn raw_fd(&self) -> RawFd {
        self.descriptor.as_raw_fd()
    }

    /// Write one text frame. The transport error is returned unchanged.
    pub fn send_text(&self, text: &str) -> Result<(), tungstenite::Error> {
        self.lock().send(Message::text(text.to_string()))
    }

    /// Drain every complete frame currently readable, waiting for a writer
    /// that holds the socket.
    pub fn read_frames(&self) -> Inbound {
        self.drain(self.lock())
    }

    /// Like `read_frames`, but returns `None` instead of waiting while a
    /// write is in progress.
    pub fn try_read_frames(&self) -> Option<Inbound> {
        match self.socket.try_lock() {
            Ok(socket) => Some(self.drain(socket)),
            Err(TryLockError::Poisoned(poisoned)) => Some(self.drain(poisoned.into_inner())),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn drain(&self, mut socket: MutexGuard<'_, WebSocket<TcpStream>>) -> Inbound {
        let mut inbound = Inbound::default();

        if let Err(e) = socket.get_mut().set_nonblocking(true) {
            debug!("Session {}: cannot switch to non-blocking: {}", self.id, e);
            inbound.closed = true;
            return inbound;
        }

        loop {
            match socket.read() {
                Ok(Message::Text(text)) => inbound.frames.push(text.as_str().to_owned()),
                Ok(Message::Close(_)) => {
                    inbound.closed = true;
                    break;
                }
                // Pings are answered by tungstenite; binary frames are not part of the protocol
                Ok(_) => {}
                Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Session {}: read failed: {}", self.id, e);
                    inbound.closed = true;
                    break;
                }
            }
        }

        if let Err(e) = socket.get_mut().set_nonblocking(false) {
            debug!("Session {}: cannot restore blocking mode: {}", self.id, e);
            inbound.closed = true;
        }

        inbound
    }

    /// Best-effort close frame, then tear the socket down.
    pub fn close(&self) {
        if let Ok(mut socket) = self.socket.try_lock() {
            let _ = socket.close(None);
            let _ = socket.flush();
        }
        let _ = self.descriptor.shutdown(Shutdown::Both);
    }

    fn lock(&self) -> MutexGuard<'_, WebSocket<TcpStream>> {
        self.socket.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hold the socket the way an in-flight write does.
    #[cfg(test)]
    pub(crate) fn hold_socket(&self) -> MutexGuard<'_, WebSocket<TcpStream>> {
        self.lock()
    }
}

impl AsFd for Session {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.descriptor.as_fd()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("fd", &self.raw_fd())
            .finish()
    }
}
