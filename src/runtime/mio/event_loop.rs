//! mio event loop implementation.
//!
//! Readiness-based model: each iteration collects which endpoints the
//! forwarders are interested in, waits once on the poller, then dispatches
//! errors, then reads, then writes. Uses epoll on Linux, kqueue on macOS.
//!
//! ## Level semantics on an edge-triggered poller
//!
//! Every socket is registered once for both directions. The reactor keeps a
//! cached `Readiness` per socket, set by events and cleared when an
//! operation reports `WouldBlock`. Interest sets act as filters over that
//! cache, so a socket is serviced whenever it is both ready and wanted. If
//! that is already true before waiting, the wait does not block.
//!
//! ## Deadlines
//!
//! The wait is bounded by the configured ceiling, and by the nearest pending
//! stammer send deadline so a deferred send is retried on time.

use crate::config::{Config, Mode};
use crate::error::RelayError;
use crate::runtime::connection::{ConnState, Connection, ConnectionRegistry, Side};
use crate::runtime::endpoint::{Endpoint, NameTable, Readiness};
use crate::runtime::forwarder::Pacing;
use crate::runtime::listener::Listener;
use crate::runtime::token::{TokenAllocator, TokenOwner};
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Level};

const EVENTS_CAPACITY: usize = 256;

/// Everything the reactor needs from the resolved configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub listen: SocketAddr,
    pub backend: Option<SocketAddr>,
    pub backlog: i32,
    pub buffer_capacity: usize,
    pub pacing: Pacing,
    pub poll_ceiling: Duration,
    pub max_connections: usize,
}

impl RelaySettings {
    pub fn from_config(config: &Config) -> Self {
        let pacing = match config.mode {
            Mode::Stammer => Pacing::Stammer {
                delay: config.stammer_delay,
            },
            _ => Pacing::Plain,
        };
        Self {
            listen: config.listen,
            backend: config.backend(),
            backlog: config.listen_backlog,
            buffer_capacity: config.buffer_capacity,
            pacing,
            poll_ceiling: config.poll_ceiling,
            max_connections: config.max_connections,
        }
    }
}

/// Interest collected at the start of one iteration.
#[derive(Debug, Default)]
pub struct InterestSets {
    pub readable: Vec<Token>,
    pub writable: Vec<Token>,
    pub errored: Vec<Token>,
    /// Earliest pending send deadline, strictly in the future.
    pub wake_at: Option<Instant>,
    /// Some wanted socket already has cached readiness.
    pub ready_now: bool,
}

impl InterestSets {
    fn note_deadline(&mut self, at: Instant) {
        self.wake_at = Some(self.wake_at.map_or(at, |w| w.min(at)));
    }
}

/// How long the readiness wait may block.
///
/// Never longer than `ceiling`, and never past `wake_at`.
pub fn wait_timeout(now: Instant, ceiling: Duration, wake_at: Option<Instant>) -> Duration {
    match wake_at {
        Some(at) => at.saturating_duration_since(now).min(ceiling),
        None => ceiling,
    }
}

/// Single-threaded relay event loop.
///
/// Owns the poller, the listener, the live connections and the name table;
/// nothing else in the process touches them.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: Listener,
    listener_token: Token,
    listener_ready: Readiness,
    connections: ConnectionRegistry<TcpStream>,
    tokens: TokenAllocator,
    names: NameTable,
    /// Tokens of closed sockets, recycled once the current pass is done.
    retired: Vec<Token>,
    rng: StdRng,
    settings: RelaySettings,
}

impl Reactor {
    /// Bind the listener and register it with a fresh poller.
    pub fn new(settings: RelaySettings) -> Result<Self, RelayError> {
        let poll = Poll::new()?;
        let mut listener = Listener::bind(settings.listen, settings.backlog, settings.backend)
            .map_err(|e| RelayError::Bind(settings.listen, e))?;

        let mut tokens = TokenAllocator::new(settings.max_connections.min(1024) * 2 + 1);
        let listener_token = tokens.alloc(TokenOwner::Listener);
        poll.registry()
            .register(listener.socket_mut(), listener_token, Interest::READABLE)?;

        let mut names = NameTable::new();
        names.register(listener_token, "listener");

        info!(
            addr = %listener.local_addr(),
            backend = ?settings.backend,
            pacing = ?settings.pacing,
            buffer_capacity = settings.buffer_capacity,
            "Listening"
        );

        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            listener_token,
            listener_ready: Readiness::default(),
            connections: ConnectionRegistry::new(settings.max_connections),
            tokens,
            names,
            retired: Vec::new(),
            rng: StdRng::from_os_rng(),
            settings,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Number of live connections, for tests
    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run forever. Returns only if the listener or the poller fails.
    pub fn run(&mut self) -> Result<(), RelayError> {
        loop {
            self.turn()?;
        }
    }

    /// One iteration: collect interest, wait, dispatch.
    pub fn turn(&mut self) -> Result<(), RelayError> {
        let now = Instant::now();
        let interest = self.collect_interest(now);
        let timeout = if interest.ready_now {
            Duration::ZERO
        } else {
            wait_timeout(now, self.settings.poll_ceiling, interest.wake_at)
        };

        if tracing::enabled!(Level::DEBUG) {
            debug!(
                readable = ?self.names.describe(&interest.readable),
                writable = ?self.names.describe(&interest.writable),
                errored = ?self.names.describe(&interest.errored),
                timeout_ms = timeout.as_millis() as u64,
                "Waiting for readiness"
            );
        }

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(RelayError::Poll(e)),
        }

        self.absorb_events();
        let result = self.dispatch(&interest, Instant::now());
        self.release_retired();
        result
    }

    fn collect_interest(&self, now: Instant) -> InterestSets {
        let mut sets = InterestSets::default();
        sets.readable.push(self.listener_token);
        sets.errored.push(self.listener_token);
        sets.ready_now = self.listener_ready.readable || self.listener_ready.errored;

        for (_, conn) in self.connections.iter() {
            for fwd in conn.forwarders() {
                if let Some(ep) = fwd.wants_read().and_then(|side| conn.endpoint(side)) {
                    sets.readable.push(ep.token());
                    sets.ready_now |= ep.readiness().readable;
                }
                if let Some(ep) = fwd.wants_write(now).and_then(|side| conn.endpoint(side)) {
                    sets.writable.push(ep.token());
                    sets.ready_now |= ep.readiness().writable;
                }
                if let Some(at) = fwd.pending_deadline(now) {
                    sets.note_deadline(at);
                }
            }
            for ep in conn.endpoints() {
                sets.errored.push(ep.token());
                sets.ready_now |= ep.readiness().errored;
            }
        }
        sets
    }

    /// Fold the events returned by the wait into the cached readiness.
    fn absorb_events(&mut self) {
        let verbose = tracing::enabled!(Level::DEBUG);
        let mut reported = Vec::new();

        for event in self.events.iter() {
            let ready = Readiness::from_event(event);
            if verbose {
                reported.push((event.token(), ready));
            }
            match self.tokens.get(event.token()) {
                Some(TokenOwner::Listener) => self.listener_ready.absorb(ready),
                Some(TokenOwner::Endpoint { conn, side }) => {
                    let endpoint = self
                        .connections
                        .get_mut(conn)
                        .and_then(|c| c.endpoint_mut(side))
                        .filter(|ep| ep.token() == event.token());
                    if let Some(ep) = endpoint {
                        ep.readiness_mut().absorb(ready);
                    }
                }
                None => {}
            }
        }

        if verbose {
            let pick = |f: fn(&Readiness) -> bool| -> Vec<Token> {
                reported
                    .iter()
                    .filter(|(_, r)| f(r))
                    .map(|(t, _)| *t)
                    .collect()
            };
            debug!(
                readable = ?self.names.describe(&pick(|r| r.readable)),
                writable = ?self.names.describe(&pick(|r| r.writable)),
                errored = ?self.names.describe(&pick(|r| r.errored)),
                "Ready sockets"
            );
        }
    }

    /// Errors first, then reads, then writes. An endpoint that is both
    /// errored and readable is torn down before any data is handled.
    fn dispatch(&mut self, interest: &InterestSets, now: Instant) -> Result<(), RelayError> {
        for &token in &interest.errored {
            self.dispatch_error(token)?;
        }
        for &token in &interest.readable {
            self.dispatch_readable(token);
        }
        for &token in &interest.writable {
            self.dispatch_writable(token, now);
        }
        Ok(())
    }

    fn dispatch_error(&mut self, token: Token) -> Result<(), RelayError> {
        match self.tokens.get(token) {
            Some(TokenOwner::Listener) => {
                if !self.listener_ready.errored {
                    return Ok(());
                }
                self.listener_ready.errored = false;
                let err = match self.listener.take_error() {
                    Ok(Some(e)) | Err(e) => e,
                    Ok(None) => io::Error::other("listener reported an error condition"),
                };
                error!(error = %err, "Listener socket failed!");
                Err(RelayError::ListenerFailed(err))
            }
            Some(TokenOwner::Endpoint { conn: key, side }) => {
                let Some(conn) = self.connections.get_mut(key) else {
                    return Ok(());
                };
                let errored = conn
                    .endpoint(side)
                    .is_some_and(|ep| ep.token() == token && ep.readiness().errored);
                if errored && conn.on_error_event(side) == ConnState::Dead {
                    self.reap(key);
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn dispatch_readable(&mut self, token: Token) {
        match self.tokens.get(token) {
            Some(TokenOwner::Listener) => self.accept_ready(),
            Some(TokenOwner::Endpoint { conn: key, side }) => {
                let Some(conn) = self.connections.get_mut(key) else {
                    return;
                };
                let ready = conn
                    .endpoint(side)
                    .is_some_and(|ep| ep.token() == token && ep.readiness().readable);
                if ready && conn.on_readable(side) == ConnState::Dead {
                    self.reap(key);
                }
            }
            None => {}
        }
    }

    fn dispatch_writable(&mut self, token: Token, now: Instant) {
        let Some(TokenOwner::Endpoint { conn: key, side }) = self.tokens.get(token) else {
            return;
        };
        let Some(conn) = self.connections.get_mut(key) else {
            return;
        };
        let ready = conn
            .endpoint(side)
            .is_some_and(|ep| ep.token() == token && ep.readiness().writable);
        if ready && conn.on_writable(side, now, &mut self.rng) == ConnState::Dead {
            self.reap(key);
        }
    }

    /// Accept one pending client. Failures are logged and swallowed.
    fn accept_ready(&mut self) {
        if !self.listener_ready.readable {
            return;
        }
        match self.listener.accept() {
            Ok((stream, peer)) => {
                if let Err(e) = self.open_connection(stream, peer) {
                    warn!(peer = %peer, error = %e, "Failed to set up connection");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.listener_ready.readable = false;
            }
            Err(e) => {
                self.listener_ready.readable = false;
                warn!(error = %e, "Listener readable but accept failed");
            }
        }
    }

    fn open_connection(&mut self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        if self.connections.is_full() {
            warn!(
                peer = %peer,
                max_connections = self.connections.capacity(),
                "Connection limit reached, dropping client"
            );
            return Ok(());
        }

        let index = self.connections.allocate_index();
        let key = self.connections.vacant_key();

        let server = match self.listener.connect_backend() {
            None => None,
            Some(Ok(stream)) => Some(stream),
            Some(Err(e)) => return Err(e),
        };

        let client_name = if server.is_some() {
            format!("ToClnt.{index}")
        } else {
            format!("S.{index}")
        };
        let client = self.adopt(stream, key, Side::Client, client_name)?;
        let server = match server {
            Some(stream) => match self.adopt(stream, key, Side::Server, format!("ToSrvr.{index}")) {
                Ok(ep) => Some(ep),
                Err(e) => {
                    self.close_endpoint(client);
                    return Err(e);
                }
            },
            None => None,
        };

        let conn = Connection::new(
            index,
            peer,
            client,
            server,
            self.settings.buffer_capacity,
            self.settings.pacing,
        );
        let inserted = self.connections.insert(conn);
        debug_assert_eq!(inserted, Some(key));
        Ok(())
    }

    /// Register a socket for both directions and give it a name.
    fn adopt(
        &mut self,
        mut stream: TcpStream,
        key: usize,
        side: Side,
        name: String,
    ) -> io::Result<Endpoint<TcpStream>> {
        let token = self.tokens.alloc(TokenOwner::Endpoint { conn: key, side });
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            self.tokens.free(token);
            return Err(e);
        }
        self.names.register(token, name.as_str());
        Ok(Endpoint::new(stream, token, name))
    }

    /// Remove a dead connection from the live set and close its endpoints.
    fn reap(&mut self, key: usize) {
        if let Some(mut conn) = self.connections.remove(key) {
            for ep in conn.take_endpoints() {
                self.close_endpoint(ep);
            }
            debug!(
                live = self.connections.len(),
                sockets = self.tokens.len() - self.retired.len(),
                "Connection reaped"
            );
        }
    }

    /// Best-effort close: a failed deregistration is logged and ignored,
    /// and the socket is closed when the endpoint is dropped. Nothing here
    /// can fail the loop.
    fn close_endpoint(&mut self, mut ep: Endpoint<TcpStream>) {
        let name = self.names.lookup(ep.token()).unwrap_or("?");
        if let Err(e) = self.poll.registry().deregister(ep.stream_mut()) {
            debug!(endpoint = name, error = %e, "Deregister failed");
        }
        self.names.forget(ep.token());
        self.retired.push(ep.token());
    }

    fn release_retired(&mut self) {
        for token in self.retired.drain(..) {
            self.tokens.free(token);
        }
    }

    /// Number of named sockets, for tests
    #[cfg(test)]
    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    /// Number of allocated tokens, for tests
    #[cfg(test)]
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }
}
