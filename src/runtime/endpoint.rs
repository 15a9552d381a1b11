//! Endpoints: non-blocking byte streams with a display name.
//!
//! An `Endpoint` is owned by exactly one `Connection`. Forwarders refer to
//! endpoints by `Side` only and never close them; closing happens when the
//! reactor reaps a dead connection and drops its endpoints.

use mio::event::Event;
use mio::Token;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::Shutdown;

/// The stream operations a forwarder needs from a socket.
///
/// Implemented for `mio::net::TcpStream`; tests provide scripted streams.
pub trait ByteStream: Read + Write {
    /// Shut down the write half, leaving the read half open.
    fn shutdown_write(&self) -> io::Result<()>;

    /// Fetch and clear the pending socket error, if any.
    fn take_error(&self) -> io::Result<Option<io::Error>>;
}

impl ByteStream for mio::net::TcpStream {
    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn take_error(&self) -> io::Result<Option<io::Error>> {
        mio::net::TcpStream::take_error(self)
    }
}

/// Cached readiness of a registered socket.
///
/// The poller is edge-triggered, so a flag stays set until an operation on
/// the socket reports `WouldBlock` (or, for errors, until it is dispatched).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub errored: bool,
}

impl Readiness {
    /// Translate a poll event. Hang-ups count as readable/writable so the
    /// next operation observes EOF or the failure directly.
    pub fn from_event(event: &Event) -> Self {
        Self {
            readable: event.is_readable() || event.is_read_closed(),
            writable: event.is_writable() || event.is_write_closed(),
            errored: event.is_error(),
        }
    }

    /// Merge newly reported readiness into the cached state.
    pub fn absorb(&mut self, other: Readiness) {
        self.readable |= other.readable;
        self.writable |= other.writable;
        self.errored |= other.errored;
    }
}

/// A named, registered stream owned by a connection.
#[derive(Debug)]
pub struct Endpoint<S> {
    stream: S,
    token: Token,
    name: String,
    readiness: Readiness,
}

impl<S> Endpoint<S> {
    pub fn new(stream: S, token: Token, name: impl Into<String>) -> Self {
        Self {
            stream,
            token,
            name: name.into(),
            readiness: Readiness::default(),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    pub fn readiness_mut(&mut self) -> &mut Readiness {
        &mut self.readiness
    }
}

/// Process-wide map from live poll tokens to display names.
///
/// Entries are written once when a socket is registered and erased when it
/// is closed, so no stale name survives a close.
#[derive(Debug, Default)]
pub struct NameTable {
    names: HashMap<Token, String>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, token: Token, name: impl Into<String>) {
        let previous = self.names.insert(token, name.into());
        debug_assert!(previous.is_none(), "token {token:?} named twice");
    }

    /// Look up a live token. Asking for an unregistered token is a bug.
    pub fn lookup(&self, token: Token) -> Option<&str> {
        let name = self.names.get(&token).map(String::as_str);
        debug_assert!(name.is_some(), "token {token:?} has no name");
        name
    }

    pub fn forget(&mut self, token: Token) -> Option<String> {
        self.names.remove(&token)
    }

    /// Names for a set of tokens, for diagnostics.
    pub fn describe(&self, tokens: &[Token]) -> Vec<&str> {
        tokens
            .iter()
            .map(|t| self.names.get(t).map(String::as_str).unwrap_or("?"))
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.names.len()
    }
}
