//! Load-generating client.
//!
//! Opens a batch of connections to a relay, streams random-length chunks
//! through each one and checks that every byte comes back exactly once.

use crate::config::{ClientSettings, Config};
use crate::error::RelayError;
use crate::runtime::Readiness;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use slab::Slab;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, warn, Level};

const EVENTS_CAPACITY: usize = 256;

/// Final state of one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientReport {
    pub id: usize,
    pub sent: u64,
    pub received: u64,
    /// Why the client failed, if it did.
    pub failure: Option<String>,
}

impl ClientReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Results of a whole run.
#[derive(Debug, Default)]
pub struct Summary {
    pub reports: Vec<ClientReport>,
}

impl Summary {
    pub fn failed(&self) -> usize {
        self.reports.iter().filter(|r| !r.succeeded()).count()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.reports.iter().map(|r| r.sent).sum()
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Verdict {
    Continue,
    Success,
    Failure(String),
}

/// Receiving more than was sent fails at once; at EOF the totals must match.
fn judge(sent: u64, received: u64, eof: bool) -> Verdict {
    if received > sent {
        Verdict::Failure(format!("received {received} bytes but only sent {sent}"))
    } else if !eof {
        Verdict::Continue
    } else if received == sent {
        Verdict::Success
    } else {
        Verdict::Failure(format!("closed after {received} of {sent} bytes"))
    }
}

fn names_where(reported: &[(String, Readiness)], f: fn(&Readiness) -> bool) -> Vec<&str> {
    reported
        .iter()
        .filter(|(_, r)| f(r))
        .map(|(name, _)| name.as_str())
        .collect()
}

struct LoadClient {
    id: usize,
    stream: TcpStream,
    /// Cleared once the write side has been shut down.
    sending: bool,
    sent: u64,
    received: u64,
    ready: Readiness,
}

impl LoadClient {
    fn name(&self) -> String {
        format!("C.{}", self.id)
    }

    fn wants_service(&self) -> bool {
        self.ready.errored || self.ready.readable || (self.ready.writable && self.sending)
    }

    fn read(&mut self, buf: &mut [u8]) -> Verdict {
        match self.stream.read(buf) {
            Ok(0) => judge(self.sent, self.received, true),
            Ok(n) => {
                self.received += n as u64;
                judge(self.sent, self.received, false)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.ready.readable = false;
                Verdict::Continue
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Verdict::Continue,
            Err(e) => Verdict::Failure(format!("read failed: {e}")),
        }
    }

    /// Send a random-length prefix of `chunk`, then maybe half-close.
    fn send<R: Rng>(&mut self, chunk: &[u8], half_close_one_in: u32, rng: &mut R) -> io::Result<()> {
        let len = rng.random_range(1..chunk.len().max(2)).min(chunk.len());
        match self.stream.write(&chunk[..len]) {
            Ok(n) => {
                self.sent += n as u64;
                debug!(client = self.id, offered = len, sent = n, "Sent chunk");
                if half_close_one_in <= 1 || rng.random_ratio(1, half_close_one_in) {
                    self.stream.shutdown(Shutdown::Write)?;
                    self.sending = false;
                    debug!(client = self.id, total = self.sent, "Half-closed");
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.ready.writable = false;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// A set of clients multiplexed on one poller.
pub struct LoadGenerator<R> {
    poll: Poll,
    events: Events,
    clients: Slab<LoadClient>,
    settings: ClientSettings,
    chunk: Vec<u8>,
    read_buf: Vec<u8>,
    rng: R,
    reports: Vec<ClientReport>,
}

impl<R: Rng> LoadGenerator<R> {
    /// Start `num_clients` non-blocking connects to `target`.
    ///
    /// A connect that fails synchronously is recorded as a failed client.
    pub fn connect(target: SocketAddr, settings: ClientSettings, rng: R) -> Result<Self, RelayError> {
        let mut generator = Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            clients: Slab::with_capacity(settings.num_clients),
            chunk: vec![b'a'; settings.max_chunk.max(1)],
            read_buf: vec![0; settings.read_chunk.max(1)],
            settings,
            rng,
            reports: Vec::new(),
        };

        for id in 0..generator.settings.num_clients {
            match TcpStream::connect(target) {
                Ok(stream) => generator.add(id, stream)?,
                Err(e) => generator.record(ClientReport {
                    id,
                    sent: 0,
                    received: 0,
                    failure: Some(format!("connect failed: {e}")),
                }),
            }
        }

        info!(
            target = %target,
            clients = generator.settings.num_clients,
            "Load generator started"
        );
        Ok(generator)
    }

    fn add(&mut self, id: usize, mut stream: TcpStream) -> io::Result<()> {
        let entry = self.clients.vacant_entry();
        self.poll.registry().register(
            &mut stream,
            Token(entry.key()),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        entry.insert(LoadClient {
            id,
            stream,
            sending: true,
            sent: 0,
            received: 0,
            ready: Readiness::default(),
        });
        Ok(())
    }

    /// No clients remain live.
    pub fn is_done(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drive every client to completion.
    pub fn run(mut self, ceiling: Duration) -> Result<Summary, RelayError> {
        while !self.is_done() {
            self.turn(ceiling)?;
        }
        Ok(self.finish())
    }

    /// One wait plus a service pass over every live client.
    pub fn turn(&mut self, ceiling: Duration) -> Result<(), RelayError> {
        let ready_now = self.clients.iter().any(|(_, c)| c.wants_service());
        let timeout = if ready_now { Duration::ZERO } else { ceiling };
        let verbose = tracing::enabled!(Level::DEBUG);

        if verbose {
            let sending: Vec<String> = self
                .clients
                .iter()
                .filter(|(_, c)| c.sending)
                .map(|(_, c)| c.name())
                .collect();
            let all: Vec<String> = self.clients.iter().map(|(_, c)| c.name()).collect();
            debug!(
                readable = ?all,
                writable = ?sending,
                errored = ?all,
                timeout_ms = timeout.as_millis() as u64,
                "Waiting for readiness"
            );
        }

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(RelayError::Poll(e)),
        }

        let mut reported = Vec::new();
        for event in self.events.iter() {
            if let Some(client) = self.clients.get_mut(event.token().0) {
                let ready = Readiness::from_event(event);
                if verbose {
                    reported.push((client.name(), ready));
                }
                client.ready.absorb(ready);
            }
        }

        if verbose {
            debug!(
                readable = ?names_where(&reported, |r| r.readable),
                writable = ?names_where(&reported, |r| r.writable),
                errored = ?names_where(&reported, |r| r.errored),
                "Ready sockets"
            );
        }

        let keys: Vec<usize> = self.clients.iter().map(|(key, _)| key).collect();
        for key in keys {
            let verdict = self.service(key);
            if verdict != Verdict::Continue {
                self.retire(key, verdict);
            }
        }
        Ok(())
    }

    fn service(&mut self, key: usize) -> Verdict {
        let Some(client) = self.clients.get_mut(key) else {
            return Verdict::Continue;
        };

        if client.ready.errored {
            client.ready.errored = false;
            match client.stream.take_error() {
                Ok(Some(e)) | Err(e) => return Verdict::Failure(format!("socket error: {e}")),
                Ok(None) => {}
            }
        }

        if client.ready.readable {
            let verdict = client.read(&mut self.read_buf);
            if verdict != Verdict::Continue {
                return verdict;
            }
        }

        if client.ready.writable && client.sending {
            if let Err(e) = client.send(&self.chunk, self.settings.half_close_one_in, &mut self.rng) {
                return Verdict::Failure(format!("send failed: {e}"));
            }
        }
        Verdict::Continue
    }

    fn retire(&mut self, key: usize, verdict: Verdict) {
        let Some(mut client) = self.clients.try_remove(key) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(&mut client.stream) {
            debug!(client = client.id, error = %e, "Deregister failed");
        }
        let failure = match verdict {
            Verdict::Failure(reason) => Some(reason),
            Verdict::Success | Verdict::Continue => None,
        };
        self.record(ClientReport {
            id: client.id,
            sent: client.sent,
            received: client.received,
            failure,
        });
    }

    fn record(&mut self, report: ClientReport) {
        match &report.failure {
            None => info!(
                client = report.id,
                sent = report.sent,
                received = report.received,
                "Client succeeded"
            ),
            Some(reason) => warn!(
                client = report.id,
                sent = report.sent,
                received = report.received,
                reason = %reason,
                "Client failed"
            ),
        }
        self.reports.push(report);
    }

    /// Log the summary line and hand back the reports.
    pub fn finish(mut self) -> Summary {
        self.reports.sort_by_key(|r| r.id);
        let summary = Summary {
            reports: self.reports,
        };
        info!(
            clients = summary.reports.len(),
            bytes_sent = summary.bytes_sent(),
            "{} clients failed",
            summary.failed()
        );
        summary
    }
}

/// Run the load generator against the configured server.
pub fn run(config: &Config) -> Result<Summary, RelayError> {
    let generator =
        LoadGenerator::connect(config.server, config.client.clone(), StdRng::from_os_rng())?;
    generator.run(config.poll_ceiling)
}
