//! Unidirectional byte pump between two endpoints.
//!
//! A `Forwarder` moves bytes from its input side to its output side through
//! a bounded buffer. Interest is derived from buffer state:
//!
//! - readable interest on input iff `buffered < capacity` and input is open
//! - writable interest on output iff bytes are buffered and no send delay
//!   is pending
//!
//! Once the input has reached EOF and the buffer is empty, the forwarder
//! shuts down the write half of its output and completes, exactly once.
//!
//! ## Stammer pacing
//!
//! With `Pacing::Stammer` each send offers only a random-length prefix of the
//! buffer (uniform over `1..=buffered`). If bytes remain afterwards, the next
//! send is deferred until `now + delay`. Byte order and byte count are never
//! altered, only the segmentation and timing.

use crate::runtime::connection::Side;
use bytes::{Buf, BytesMut};
use rand::Rng;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tracing::debug;

use super::endpoint::ByteStream;

/// Per-forwarder buffer capacity used by all relay modes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1000;

/// Delay between partial sends in stammer mode.
pub const DEFAULT_STAMMER_DELAY: Duration = Duration::from_millis(100);

/// How a forwarder sizes its sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Offer the whole buffer on every send.
    Plain,
    /// Offer a random prefix and back off while bytes remain.
    Stammer { delay: Duration },
}

/// Outcome of a single read or write attempt.
#[derive(Debug)]
pub enum IoStep {
    /// The attempt completed (possibly moving zero bytes, e.g. EOF).
    Progress,
    /// The socket has nothing more for now; its cached readiness is stale.
    WouldBlock,
    /// A fatal socket fault. The owning connection decides what to tear down.
    Fault(io::Error),
}

/// What a forwarder did in response to an endpoint failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// The failed endpoint is not one of ours, or we already completed.
    Unaffected,
    /// Input is gone; `pending` buffered bytes are still headed for output.
    Draining { pending: usize },
    /// The forwarder completed. `discarded` undeliverable bytes were dropped.
    Completed { discarded: usize },
}

#[derive(Debug)]
pub struct Forwarder {
    input: Side,
    output: Side,
    buf: BytesMut,
    capacity: usize,
    input_closed: bool,
    send_delay_until: Option<Instant>,
    pacing: Pacing,
    completed: bool,
    bytes_in: u64,
    bytes_out: u64,
}

impl Forwarder {
    pub fn new(input: Side, output: Side, capacity: usize, pacing: Pacing) -> Self {
        debug_assert!(capacity > 0, "forwarder capacity must be non-zero");
        Self {
            input,
            output,
            buf: BytesMut::with_capacity(capacity),
            capacity,
            input_closed: false,
            send_delay_until: None,
            pacing,
            completed: false,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    pub fn input(&self) -> Side {
        self.input
    }

    pub fn output(&self) -> Side {
        self.output
    }

    #[cfg(test)]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[cfg(test)]
    pub fn is_input_closed(&self) -> bool {
        self.input_closed
    }

    #[cfg(test)]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Total bytes read from the input side.
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Total bytes accepted by the output side.
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// The side to watch for readability, if the forwarder can take more input.
    pub fn wants_read(&self) -> Option<Side> {
        if !self.completed && self.buf.len() < self.capacity && !self.input_closed {
            Some(self.input)
        } else {
            None
        }
    }

    /// The side to watch for writability, if buffered bytes may be sent at `now`.
    pub fn wants_write(&self, now: Instant) -> Option<Side> {
        if self.completed || self.buf.is_empty() {
            return None;
        }
        match self.send_delay_until {
            Some(until) if now < until => None,
            _ => Some(self.output),
        }
    }

    /// A send deadline strictly after `now`, if one is holding back buffered bytes.
    pub fn pending_deadline(&self, now: Instant) -> Option<Instant> {
        if self.completed || self.buf.is_empty() {
            return None;
        }
        self.send_delay_until.filter(|until| *until > now)
    }

    /// Read as much as fits into the buffer.
    ///
    /// A zero-length read marks the input closed. The caller must follow up
    /// with [`Forwarder::finish_if_drained`].
    pub fn on_readable<S: Read>(&mut self, input: &mut S) -> IoStep {
        let room = self.capacity - self.buf.len();
        if self.completed || self.input_closed || room == 0 {
            return IoStep::Progress;
        }

        let start = self.buf.len();
        self.buf.resize(start + room, 0);
        match input.read(&mut self.buf[start..]) {
            Ok(0) => {
                self.buf.truncate(start);
                self.input_closed = true;
                IoStep::Progress
            }
            Ok(n) => {
                self.buf.truncate(start + n);
                self.bytes_in += n as u64;
                IoStep::Progress
            }
            Err(e) => {
                self.buf.truncate(start);
                classify(e)
            }
        }
    }

    /// Send from the front of the buffer.
    ///
    /// The caller must follow up with [`Forwarder::finish_if_drained`].
    pub fn on_writable<S: Write, R: Rng>(
        &mut self,
        output: &mut S,
        now: Instant,
        rng: &mut R,
    ) -> IoStep {
        if self.wants_write(now).is_none() {
            return IoStep::Progress;
        }

        let attempt = match self.pacing {
            Pacing::Plain => self.buf.len(),
            Pacing::Stammer { .. } => rng.random_range(1..=self.buf.len()),
        };
        if let Pacing::Stammer { .. } = self.pacing {
            debug!(attempt, buffered = self.buf.len(), "Attempting fragment send");
        }

        match output.write(&self.buf[..attempt]) {
            Ok(0) => IoStep::Fault(io::Error::new(
                io::ErrorKind::WriteZero,
                "write returned 0",
            )),
            Ok(n) => {
                self.buf.advance(n);
                self.bytes_out += n as u64;
                if let Pacing::Stammer { delay } = self.pacing {
                    if !self.buf.is_empty() {
                        self.send_delay_until = Some(now + delay);
                    }
                }
                IoStep::Progress
            }
            Err(e) => classify(e),
        }
    }

    /// Complete if input is closed and nothing is left to send.
    ///
    /// Shuts down the write half of `output` (best effort) and returns `true`
    /// the first time the terminal condition is observed, `false` otherwise.
    pub fn finish_if_drained<S: ByteStream>(&mut self, output: &S) -> bool {
        if self.completed || !self.input_closed || !self.buf.is_empty() {
            return false;
        }
        shutdown_best_effort(output);
        self.completed = true;
        true
    }

    /// React to a failure reported on `failed`.
    ///
    /// A failed output means no peer is left to deliver to: the buffer is
    /// discarded and the forwarder completes. A failed input is treated as
    /// EOF; whatever is buffered keeps draining to the output.
    pub fn on_error<S: ByteStream>(&mut self, failed: Side, output: &S) -> ErrorOutcome {
        if self.completed {
            return ErrorOutcome::Unaffected;
        }

        if failed == self.output {
            let discarded = self.buf.len();
            self.buf.clear();
            self.send_delay_until = None;
            shutdown_best_effort(output);
            self.completed = true;
            return ErrorOutcome::Completed { discarded };
        }

        if failed == self.input {
            self.input_closed = true;
            if self.finish_if_drained(output) {
                return ErrorOutcome::Completed { discarded: 0 };
            }
            return ErrorOutcome::Draining {
                pending: self.buf.len(),
            };
        }

        ErrorOutcome::Unaffected
    }
}

fn classify(e: io::Error) -> IoStep {
    match e.kind() {
        io::ErrorKind::WouldBlock => IoStep::WouldBlock,
        io::ErrorKind::Interrupted => IoStep::Progress,
        _ => IoStep::Fault(e),
    }
}

/// Shut down a write half, ignoring failure: the peer may already be gone.
fn shutdown_best_effort<S: ByteStream>(output: &S) {
    if let Err(e) = output.shutdown_write() {
        debug!(error = %e, "write shutdown failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::endpoint::tests::{ScriptedStream, Step};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(0x5eed)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_interest_follows_buffer_state() {
        let now = Instant::now();
        let mut fwd = Forwarder::new(Side::Client, Side::Server, 8, Pacing::Plain);
        assert_eq!(fwd.wants_read(), Some(Side::Client));
        assert_eq!(fwd.wants_write(now), None);

        let mut input = ScriptedStream::with_reads([Step::Data(vec![1; 20])]);
        assert!(matches!(fwd.on_readable(&mut input), IoStep::Progress));

        // Buffer is full: no more reads, but a write is wanted.
        assert_eq!(fwd.buffered(), 8);
        assert_eq!(fwd.wants_read(), None);
        assert_eq!(fwd.wants_write(now), Some(Side::Server));
    }

    #[test]
    fn test_buffer_never_exceeds_capacity() {
        let now = Instant::now();
        let mut rng = rng();
        let mut fwd = Forwarder::new(Side::Client, Side::Server, 100, Pacing::Plain);
        let mut input = ScriptedStream::with_reads((0..10).map(|_| Step::Data(vec![7; 64])));
        let mut output = ScriptedStream::default();
        output.writes.extend((0..10).map(|_| Step::Accept(30)));

        for _ in 0..20 {
            fwd.on_readable(&mut input);
            assert!(fwd.buffered() <= fwd.capacity());
            fwd.on_writable(&mut output, now, &mut rng);
            assert!(fwd.buffered() <= fwd.capacity());
        }
    }

    #[test]
    fn test_would_block_read_leaves_buffer_untouched() {
        let mut fwd = Forwarder::new(Side::Client, Side::Server, 16, Pacing::Plain);
        let mut input = ScriptedStream::with_reads([Step::WouldBlock]);

        assert!(matches!(fwd.on_readable(&mut input), IoStep::WouldBlock));
        assert_eq!(fwd.buffered(), 0);
        assert!(!fwd.is_input_closed());
    }

    #[test]
    fn test_eof_then_drain_shuts_down_output_once() {
        let now = Instant::now();
        let mut rng = rng();
        let mut fwd = Forwarder::new(Side::Client, Side::Server, 64, Pacing::Plain);
        let mut input = ScriptedStream::with_reads([Step::Data(b"hello".to_vec()), Step::Eof]);
        let mut output = ScriptedStream::default();

        fwd.on_readable(&mut input);
        assert!(!fwd.finish_if_drained(&output));
        fwd.on_readable(&mut input);
        assert!(fwd.is_input_closed());
        // Still holding bytes, so not done yet.
        assert!(!fwd.finish_if_drained(&output));

        fwd.on_writable(&mut output, now, &mut rng);
        assert!(fwd.finish_if_drained(&output));
        assert!(!fwd.finish_if_drained(&output));

        assert!(fwd.is_completed());
        assert_eq!(output.written, b"hello");
        assert_eq!(output.shutdowns.get(), 1);
        assert_eq!(fwd.wants_read(), None);
        assert_eq!(fwd.wants_write(now), None);
    }

    #[test]
    fn test_plain_relay_conserves_bytes_in_order() {
        let now = Instant::now();
        let mut rng = rng();
        let data = pattern(5000);
        let mut fwd = Forwarder::new(Side::Client, Side::Server, 1000, Pacing::Plain);
        let mut input = ScriptedStream::with_reads(
            data.chunks(333)
                .map(|c| Step::Data(c.to_vec()))
                .chain([Step::Eof]),
        );
        let mut output = ScriptedStream::default();
        output
            .writes
            .extend([Step::Accept(10), Step::WouldBlock, Step::Accept(999)]);

        for _ in 0..100 {
            if fwd.is_completed() {
                break;
            }
            fwd.on_readable(&mut input);
            fwd.on_writable(&mut output, now, &mut rng);
            fwd.finish_if_drained(&output);
        }

        assert!(fwd.is_completed());
        assert_eq!(output.written, data);
        assert_eq!(fwd.bytes_in(), 5000);
        assert_eq!(fwd.bytes_out(), 5000);
        assert_eq!(output.shutdowns.get(), 1);
    }

    #[test]
    fn test_stammer_fragments_and_delays_until_drained() {
        let delay = Duration::from_millis(100);
        let data = pattern(10_000);
        let mut rng = rng();
        let mut fwd = Forwarder::new(
            Side::Server,
            Side::Client,
            10_000,
            Pacing::Stammer { delay },
        );
        let mut input = ScriptedStream::with_reads([Step::Data(data.clone()), Step::Eof]);
        let mut output = ScriptedStream::default();
        fwd.on_readable(&mut input);
        assert_eq!(fwd.buffered(), 10_000);

        let mut now = Instant::now();
        let mut sends = 0;
        loop {
            assert!(sends < 500, "stammer did not drain");
            if fwd.wants_read().is_some() {
                fwd.on_readable(&mut input);
            }
            if fwd.finish_if_drained(&output) {
                break;
            }
            if fwd.wants_write(now).is_none() {
                // Nothing sendable yet: the only reason may be a pending delay.
                let until = fwd.pending_deadline(now).expect("blocked without a deadline");
                assert!(until <= now + delay);
                now = until;
                continue;
            }

            let before = fwd.buffered();
            fwd.on_writable(&mut output, now, &mut rng);
            sends += 1;

            let offered = *output.write_calls.last().unwrap();
            assert!((1..=before).contains(&offered));
            if fwd.buffered() > 0 {
                assert_eq!(fwd.pending_deadline(now), Some(now + delay));
                assert_eq!(fwd.wants_write(now), None);
            }
        }

        assert_eq!(output.written, data);
        assert!(sends > 1, "stammer sent everything in one fragment");
    }

    #[test]
    fn test_write_failure_is_a_fault() {
        let now = Instant::now();
        let mut rng = rng();
        let mut fwd = Forwarder::new(Side::Client, Side::Server, 16, Pacing::Plain);
        let mut input = ScriptedStream::with_reads([Step::Data(b"abc".to_vec())]);
        let mut output = ScriptedStream::default();
        output.writes.push_back(Step::Fail(io::ErrorKind::BrokenPipe));

        fwd.on_readable(&mut input);
        match fwd.on_writable(&mut output, now, &mut rng) {
            IoStep::Fault(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected fault, got {other:?}"),
        }
        assert_eq!(fwd.buffered(), 3);
    }

    #[test]
    fn test_output_error_discards_buffer_and_completes() {
        let mut fwd = Forwarder::new(Side::Client, Side::Server, 16, Pacing::Plain);
        let mut input = ScriptedStream::with_reads([Step::Data(b"undelivered".to_vec())]);
        let output = ScriptedStream {
            fail_shutdown: true,
            ..ScriptedStream::default()
        };
        fwd.on_readable(&mut input);

        let outcome = fwd.on_error(Side::Server, &output);
        assert_eq!(outcome, ErrorOutcome::Completed { discarded: 11 });
        assert!(fwd.is_completed());
        assert_eq!(fwd.buffered(), 0);
        assert_eq!(output.shutdowns.get(), 1);

        // Further notifications are no-ops.
        assert_eq!(fwd.on_error(Side::Server, &output), ErrorOutcome::Unaffected);
    }

    #[test]
    fn test_input_error_keeps_draining() {
        let now = Instant::now();
        let mut rng = rng();
        let mut fwd = Forwarder::new(Side::Client, Side::Server, 16, Pacing::Plain);
        let mut input = ScriptedStream::with_reads([Step::Data(b"tail".to_vec())]);
        let mut output = ScriptedStream::default();
        fwd.on_readable(&mut input);

        let outcome = fwd.on_error(Side::Client, &output);
        assert_eq!(outcome, ErrorOutcome::Draining { pending: 4 });
        assert_eq!(fwd.wants_read(), None);

        fwd.on_writable(&mut output, now, &mut rng);
        assert!(fwd.finish_if_drained(&output));
        assert_eq!(output.written, b"tail");
    }

    #[test]
    fn test_input_error_with_empty_buffer_completes() {
        let fwd_output = ScriptedStream::default();
        let mut fwd = Forwarder::new(Side::Server, Side::Client, 16, Pacing::Plain);

        let outcome = fwd.on_error(Side::Server, &fwd_output);
        assert_eq!(outcome, ErrorOutcome::Completed { discarded: 0 });
        assert_eq!(fwd_output.shutdowns.get(), 1);
    }

    #[test]
    fn test_echo_forwarder_treats_shared_endpoint_as_output() {
        let mut fwd = Forwarder::new(Side::Client, Side::Client, 16, Pacing::Plain);
        let mut stream = ScriptedStream::with_reads([Step::Data(b"echo".to_vec())]);
        fwd.on_readable(&mut stream);

        let outcome = fwd.on_error(Side::Client, &stream);
        assert_eq!(outcome, ErrorOutcome::Completed { discarded: 4 });
    }
}
