//! Single-threaded relay runtime.
//!
//! One reactor multiplexes every socket in the process:
//! - `Listener`: accepts clients and starts backend connects
//! - `Connection`: one client plus its optional backend socket
//! - `Forwarder`: moves bytes one way through a bounded buffer
//! - `Token`: maps readiness events back to their owning socket

mod connection;
mod endpoint;
mod forwarder;
mod listener;
mod mio;
mod token;

pub use endpoint::Readiness;
pub use forwarder::{DEFAULT_BUFFER_CAPACITY, DEFAULT_STAMMER_DELAY};
pub use listener::DEFAULT_BACKLOG;
pub use self::mio::run;

#[cfg(test)]
pub(crate) use forwarder::Pacing;
#[cfg(test)]
pub(crate) use self::mio::{Reactor, RelaySettings};
