//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).

mod event_loop;

pub use event_loop::{Reactor, RelaySettings};

use crate::config::Config;
use crate::error::RelayError;

/// Run the relay until the listener or the poller fails.
pub fn run(config: &Config) -> Result<(), RelayError> {
    let mut reactor = Reactor::new(RelaySettings::from_config(config))?;
    reactor.run()
}
