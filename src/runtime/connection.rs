//! Connection state machine for relayed TCP sessions.
//!
//! A `Connection` owns the endpoints of one accepted client session (the
//! client socket, plus the backend socket in proxy modes) and the forwarders
//! pumping bytes between them. It is live while any forwarder is running
//! and becomes dead exactly once, either when the last forwarder completes
//! or when `die` is called.
//!
//! Socket faults degrade per forwarder: a failed output discards what it
//! could no longer deliver, a failed input is treated as EOF and keeps
//! draining. The connection dies only after every forwarder has finished.

use crate::runtime::endpoint::{ByteStream, Endpoint};
use crate::runtime::forwarder::{ErrorOutcome, Forwarder, IoStep, Pacing};
use rand::Rng;
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Which endpoint of a connection an operation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The accepted client socket.
    Client,
    /// The outbound socket to the backend (proxy modes only).
    Server,
}

impl Side {
    fn index(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 1,
        }
    }
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Live,
    /// Terminal. The owner must reap the connection's endpoints.
    Dead,
}

/// One relayed client session.
#[derive(Debug)]
pub struct Connection<S> {
    index: u64,
    peer: SocketAddr,
    /// Indexed by `Side`: `[client]` for echo, `[client, server]` otherwise.
    endpoints: Vec<Endpoint<S>>,
    failed: [bool; 2],
    forwarders: Vec<Forwarder>,
    state: ConnState,
}

impl<S: ByteStream> Connection<S> {
    /// Build a connection around already registered endpoints.
    ///
    /// Without a server endpoint the connection echoes: a single forwarder
    /// reads from the client and writes back to it.
    pub fn new(
        index: u64,
        peer: SocketAddr,
        client: Endpoint<S>,
        server: Option<Endpoint<S>>,
        capacity: usize,
        pacing: Pacing,
    ) -> Self {
        let mut endpoints = vec![client];
        let forwarders = match server {
            Some(server) => {
                endpoints.push(server);
                vec![
                    Forwarder::new(Side::Client, Side::Server, capacity, pacing),
                    Forwarder::new(Side::Server, Side::Client, capacity, pacing),
                ]
            }
            None => vec![Forwarder::new(Side::Client, Side::Client, capacity, pacing)],
        };

        info!(
            conn = index,
            peer = %peer,
            client = endpoints[0].name(),
            "New connection"
        );

        Self {
            index,
            peer,
            endpoints,
            failed: [false; 2],
            forwarders,
            state: ConnState::Live,
        }
    }

    pub fn is_live(&self) -> bool {
        self.state == ConnState::Live
    }

    pub fn forwarders(&self) -> &[Forwarder] {
        &self.forwarders
    }

    pub fn endpoints(&self) -> &[Endpoint<S>] {
        &self.endpoints
    }

    pub fn endpoint(&self, side: Side) -> Option<&Endpoint<S>> {
        self.endpoints.get(side.index())
    }

    pub fn endpoint_mut(&mut self, side: Side) -> Option<&mut Endpoint<S>> {
        self.endpoints.get_mut(side.index())
    }

    fn name(&self, side: Side) -> &str {
        self.endpoint(side).map(Endpoint::name).unwrap_or("?")
    }

    /// Dispatch readability of `side` to the forwarder reading from it.
    pub fn on_readable(&mut self, side: Side) -> ConnState {
        if !self.is_live() {
            return self.state;
        }
        let Some(pos) = self
            .forwarders
            .iter()
            .position(|f| f.wants_read() == Some(side))
        else {
            return self.state;
        };

        let step = self.forwarders[pos].on_readable(self.endpoints[side.index()].stream_mut());
        match step {
            IoStep::Progress => {}
            IoStep::WouldBlock => self.endpoints[side.index()].readiness_mut().readable = false,
            IoStep::Fault(e) => return self.on_socket_error(side, e),
        }
        self.check_done(pos)
    }

    /// Dispatch writability of `side` to the forwarder writing to it.
    pub fn on_writable<R: Rng>(&mut self, side: Side, now: Instant, rng: &mut R) -> ConnState {
        if !self.is_live() {
            return self.state;
        }
        let Some(pos) = self
            .forwarders
            .iter()
            .position(|f| f.wants_write(now) == Some(side))
        else {
            return self.state;
        };

        let step = self.forwarders[pos].on_writable(
            self.endpoints[side.index()].stream_mut(),
            now,
            rng,
        );
        match step {
            IoStep::Progress => {}
            IoStep::WouldBlock => self.endpoints[side.index()].readiness_mut().writable = false,
            IoStep::Fault(e) => return self.on_socket_error(side, e),
        }
        self.check_done(pos)
    }

    /// Dispatch an error event on `side` by fetching its pending socket error.
    ///
    /// An event with no pending error is ignored; the next read or write
    /// reports the failure if there is one.
    pub fn on_error_event(&mut self, side: Side) -> ConnState {
        if !self.is_live() {
            return self.state;
        }
        let Some(ep) = self.endpoints.get_mut(side.index()) else {
            return self.state;
        };
        ep.readiness_mut().errored = false;
        let err = match ep.stream().take_error() {
            Ok(Some(e)) | Err(e) => e,
            Ok(None) => {
                debug!(
                    conn = self.index,
                    endpoint = ep.name(),
                    "Error event without pending error"
                );
                return self.state;
            }
        };
        self.on_socket_error(side, err)
    }

    /// Handle a fault on `side`: let every forwarder degrade, then retire the
    /// ones that completed. Repeated reports for the same side are ignored.
    pub fn on_socket_error(&mut self, side: Side, err: io::Error) -> ConnState {
        if !self.is_live() || self.failed[side.index()] {
            return self.state;
        }
        self.failed[side.index()] = true;
        warn!(
            conn = self.index,
            peer = %self.peer,
            endpoint = self.name(side),
            error = %err,
            "Socket failed"
        );

        for pos in (0..self.forwarders.len()).rev() {
            let outcome = {
                let fwd = &mut self.forwarders[pos];
                fwd.on_error(side, self.endpoints[fwd.output().index()].stream())
            };
            match outcome {
                ErrorOutcome::Unaffected => {}
                ErrorOutcome::Draining { pending } => {
                    let fwd = &self.forwarders[pos];
                    debug!(
                        conn = self.index,
                        from = self.name(fwd.input()),
                        to = self.name(fwd.output()),
                        pending,
                        "Input died, still draining"
                    );
                }
                ErrorOutcome::Completed { discarded } => {
                    if discarded > 0 {
                        let fwd = &self.forwarders[pos];
                        warn!(
                            conn = self.index,
                            from = self.name(fwd.input()),
                            to = self.name(fwd.output()),
                            discarded,
                            "Output died before draining, discarding"
                        );
                    }
                    self.forwarder_completed(pos);
                }
            }
        }
        self.state
    }

    /// Transition to dead. Idempotent: later calls have no effect.
    ///
    /// Endpoints stay owned by the connection until the reactor reaps them
    /// with [`Connection::take_endpoints`].
    pub fn die(&mut self) -> ConnState {
        if self.state == ConnState::Dead {
            return self.state;
        }
        self.state = ConnState::Dead;
        self.forwarders.clear();
        info!(conn = self.index, peer = %self.peer, "Connection shutting down");
        self.state
    }

    /// Hand the endpoints of a dead connection to the caller for closing.
    pub fn take_endpoints(&mut self) -> Vec<Endpoint<S>> {
        debug_assert_eq!(self.state, ConnState::Dead, "reaping a live connection");
        std::mem::take(&mut self.endpoints)
    }

    fn check_done(&mut self, pos: usize) -> ConnState {
        let done = {
            let fwd = &mut self.forwarders[pos];
            fwd.finish_if_drained(self.endpoints[fwd.output().index()].stream())
        };
        if done {
            self.forwarder_completed(pos);
        }
        self.state
    }

    fn forwarder_completed(&mut self, pos: usize) -> ConnState {
        let fwd = self.forwarders.swap_remove(pos);
        info!(
            conn = self.index,
            from = self.name(fwd.input()),
            to = self.name(fwd.output()),
            bytes_in = fwd.bytes_in(),
            bytes_out = fwd.bytes_out(),
            "Forwarder shutting down"
        );
        if self.forwarders.is_empty() {
            self.die()
        } else {
            self.state
        }
    }
}

/// Registry of live connections using slab allocation.
///
/// Slab keys are recycled, but every connection also gets a monotonically
/// increasing index used in names and logs that is never reused.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
    next_index: u64,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
            next_index: 0,
        }
    }

    /// Assign the next connection index.
    pub fn allocate_index(&mut self) -> u64 {
        let index = self.next_index;
        self.next_index += 1;
        index
    }

    /// Key the next inserted connection will receive.
    pub fn vacant_key(&self) -> usize {
        self.connections.vacant_key()
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection<S>) -> Option<usize> {
        if self.is_full() {
            return None;
        }
        Some(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(key)
    }

    pub fn remove(&mut self, key: usize) -> Option<Connection<S>> {
        self.connections.try_remove(key)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Connection<S>)> {
        self.connections.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::endpoint::tests::{ScriptedStream, Step};
    use mio::Token;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn ep(stream: ScriptedStream, token: usize, name: &str) -> Endpoint<ScriptedStream> {
        Endpoint::new(stream, Token(token), name)
    }

    fn proxy(client: ScriptedStream, server: ScriptedStream) -> Connection<ScriptedStream> {
        Connection::new(
            3,
            peer(),
            ep(client, 1, "ToClnt.3"),
            Some(ep(server, 2, "ToSrvr.3")),
            1000,
            Pacing::Plain,
        )
    }

    fn stream(conn: &Connection<ScriptedStream>, side: Side) -> &ScriptedStream {
        conn.endpoint(side).unwrap().stream()
    }

    #[test]
    fn test_echo_dies_when_its_forwarder_completes() {
        let client = ScriptedStream::with_reads([Step::Data(vec![b'x'; 5000]), Step::Eof]);
        let mut conn = Connection::new(0, peer(), ep(client, 1, "S.0"), None, 1000, Pacing::Plain);
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(conn.forwarders().len(), 1);

        let mut echoed = 0;
        while conn.is_live() {
            assert!(echoed < 100, "echo connection never completed");
            conn.on_readable(Side::Client);
            conn.on_writable(Side::Client, Instant::now(), &mut rng);
            echoed += 1;
        }

        let client = stream(&conn, Side::Client);
        assert_eq!(client.written.len(), 5000);
        assert_eq!(client.shutdowns.get(), 1);
    }

    #[test]
    fn test_proxy_needs_both_forwarders_to_complete() {
        let client = ScriptedStream::with_reads([Step::Data(b"request".to_vec()), Step::Eof]);
        let server = ScriptedStream::default();
        let mut conn = proxy(client, server);
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();

        conn.on_readable(Side::Client);
        conn.on_readable(Side::Client);
        conn.on_writable(Side::Server, now, &mut rng);

        // Client -> server finished; server -> client is still open.
        assert_eq!(conn.forwarders().len(), 1);
        assert!(conn.is_live());
        assert_eq!(stream(&conn, Side::Server).written, b"request");
        assert_eq!(stream(&conn, Side::Server).shutdowns.get(), 1);

        conn.endpoint_mut(Side::Server)
            .unwrap()
            .stream_mut()
            .reads
            .extend([Step::Data(b"reply".to_vec()), Step::Eof]);
        conn.on_readable(Side::Server);
        conn.on_readable(Side::Server);
        assert_eq!(conn.on_writable(Side::Client, now, &mut rng), ConnState::Dead);
        assert_eq!(stream(&conn, Side::Client).written, b"reply");
        assert_eq!(stream(&conn, Side::Client).shutdowns.get(), 1);
    }

    #[test]
    fn test_die_is_idempotent() {
        let mut conn = proxy(ScriptedStream::default(), ScriptedStream::default());
        assert_eq!(conn.die(), ConnState::Dead);
        assert!(conn.forwarders().is_empty());
        assert_eq!(conn.die(), ConnState::Dead);

        // Dead connections ignore further events.
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(conn.on_readable(Side::Client), ConnState::Dead);
        assert_eq!(
            conn.on_writable(Side::Server, Instant::now(), &mut rng),
            ConnState::Dead
        );
        assert_eq!(
            conn.on_socket_error(Side::Client, io::ErrorKind::ConnectionReset.into()),
            ConnState::Dead
        );
        assert_eq!(conn.take_endpoints().len(), 2);
    }

    #[test]
    fn test_would_block_clears_cached_readiness() {
        let mut conn = proxy(ScriptedStream::default(), ScriptedStream::default());
        conn.endpoint_mut(Side::Client).unwrap().readiness_mut().readable = true;

        conn.on_readable(Side::Client);
        assert!(!conn.endpoint(Side::Client).unwrap().readiness().readable);
    }

    #[test]
    fn test_read_fault_discards_undeliverable_bytes() {
        let mut client = ScriptedStream::with_reads([Step::Fail(io::ErrorKind::ConnectionReset)]);
        client.writes.push_back(Step::WouldBlock);
        let server = ScriptedStream::with_reads([Step::Data(b"late".to_vec())]);
        let mut conn = proxy(client, server);
        let mut rng = StdRng::seed_from_u64(1);

        conn.on_readable(Side::Server);
        conn.on_writable(Side::Client, Instant::now(), &mut rng);
        assert_eq!(conn.forwarders().iter().map(|f| f.buffered()).sum::<usize>(), 4);

        assert_eq!(conn.on_readable(Side::Client), ConnState::Dead);
        assert!(stream(&conn, Side::Client).written.is_empty());
    }

    #[test]
    fn test_read_fault_still_drains_other_direction() {
        let client = ScriptedStream::with_reads([
            Step::Data(b"abc".to_vec()),
            Step::Fail(io::ErrorKind::ConnectionReset),
        ]);
        let mut server = ScriptedStream::default();
        server.writes.push_back(Step::WouldBlock);
        let mut conn = proxy(client, server);
        let mut rng = StdRng::seed_from_u64(1);
        let now = Instant::now();

        conn.on_readable(Side::Client);
        conn.on_writable(Side::Server, now, &mut rng);
        assert_eq!(conn.on_readable(Side::Client), ConnState::Live);
        assert_eq!(conn.forwarders().len(), 1);

        assert_eq!(conn.on_writable(Side::Server, now, &mut rng), ConnState::Dead);
        assert_eq!(stream(&conn, Side::Server).written, b"abc");
    }

    #[test]
    fn test_repeated_error_on_same_side_is_ignored() {
        let client = ScriptedStream::with_reads([Step::Data(b"abc".to_vec())]);
        let mut server = ScriptedStream::default();
        server.writes.push_back(Step::WouldBlock);
        let mut conn = proxy(client, server);

        conn.on_readable(Side::Client);
        let reset = || io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(conn.on_socket_error(Side::Client, reset()), ConnState::Live);
        assert_eq!(conn.on_socket_error(Side::Client, reset()), ConnState::Live);
        assert_eq!(conn.forwarders().len(), 1);
    }

    #[test]
    fn test_unreachable_backend_tears_down() {
        let client = ScriptedStream::with_reads([Step::Data(b"hello".to_vec())]);
        let server = ScriptedStream {
            pending_error: Some(io::ErrorKind::ConnectionRefused),
            ..ScriptedStream::default()
        };
        let mut conn = proxy(client, server);
        conn.on_readable(Side::Client);

        assert_eq!(conn.on_error_event(Side::Server), ConnState::Dead);
        assert_eq!(stream(&conn, Side::Client).shutdowns.get(), 1);
        assert!(stream(&conn, Side::Server).written.is_empty());
    }

    #[test]
    fn test_error_event_wins_over_queued_data() {
        let client = ScriptedStream {
            pending_error: Some(io::ErrorKind::ConnectionReset),
            ..ScriptedStream::with_reads([Step::Data(b"late".to_vec())])
        };
        let mut conn = Connection::new(0, peer(), ep(client, 1, "S.0"), None, 1000, Pacing::Plain);
        let mut rng = StdRng::seed_from_u64(1);
        {
            let ready = conn.endpoint_mut(Side::Client).unwrap().readiness_mut();
            ready.errored = true;
            ready.readable = true;
        }

        // Errors are dispatched before reads within one pass.
        assert_eq!(conn.on_error_event(Side::Client), ConnState::Dead);
        assert_eq!(conn.on_readable(Side::Client), ConnState::Dead);
        assert_eq!(conn.on_writable(Side::Client, Instant::now(), &mut rng), ConnState::Dead);

        let client = conn.endpoint(Side::Client).unwrap();
        assert!(!client.readiness().errored);
        assert_eq!(client.stream().reads.len(), 1);
        assert!(client.stream().written.is_empty());
    }

    #[test]
    fn test_error_event_without_pending_error_is_ignored() {
        let mut conn = proxy(ScriptedStream::default(), ScriptedStream::default());
        conn.endpoint_mut(Side::Server).unwrap().readiness_mut().errored = true;

        assert_eq!(conn.on_error_event(Side::Server), ConnState::Live);
        assert_eq!(conn.forwarders().len(), 2);
        assert!(!conn.endpoint(Side::Server).unwrap().readiness().errored);
    }

    #[test]
    fn test_connection_registry() {
        let mut registry = ConnectionRegistry::new(2);
        let idx0 = registry.allocate_index();
        let idx1 = registry.allocate_index();
        assert_eq!((idx0, idx1), (0, 1));

        let c1 = proxy(ScriptedStream::default(), ScriptedStream::default());
        let c2 = proxy(ScriptedStream::default(), ScriptedStream::default());
        let c3 = proxy(ScriptedStream::default(), ScriptedStream::default());

        let expected = registry.vacant_key();
        let id1 = registry.insert(c1).unwrap();
        assert_eq!(id1, expected);
        registry.insert(c2).unwrap();

        // At capacity
        assert!(registry.is_full());
        assert!(registry.insert(c3).is_none());

        assert!(registry.remove(id1).is_some());
        assert!(registry.remove(id1).is_none());
        assert!(registry.get_mut(id1).is_none());
        assert_eq!(registry.len(), 1);

        // Indices keep increasing even though slab keys are recycled.
        assert_eq!(registry.allocate_index(), 2);
    }
}
