//! Client sessions over raw WebSocket connections.
//!
//! - `gateway` authenticates upgrades and admits sessions
//! - `poller` waits on the multiplexer and hands frames to `dispatch`
//! - `heartbeat` evicts sessions that stop accepting writes

pub(crate) mod dispatch;
mod gateway;
mod heartbeat;
mod multiplexer;
mod poller;
mod registry;
mod session;

pub use dispatch::Dispatcher;
pub use gateway::Gateway;
pub use heartbeat::HeartbeatMonitor;
pub use multiplexer::{Multiplexer, raise_open_file_limit};
pub use poller::Poller;
pub use registry::SessionRegistry;
pub use session::Session;
