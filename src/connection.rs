//! The `Connection` abstraction: a byte-oriented, non-packetised duplex
//! stream. Real implementations wrap a serial port or a TCP-bridged serial
//! link; tests use an in-memory loopback pair (see `crate::test_support`).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Opaque identifier for a `Bus`'s connection, stable for the Bus's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// A never-allocated id used as a transient placeholder between a
    /// `DeviceProxy` decoding a reply (which doesn't know its own
    /// connection id) and the owning `Bus` stamping the real one on before
    /// forwarding to the `ReplyDispatcher`. Real ids start at 1.
    pub(crate) fn placeholder() -> Self {
        Self(0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Allocates a fresh `ConnectionId`. Called once per `start_connection`.
pub(crate) fn allocate_connection_id() -> ConnectionId {
    ConnectionId::next()
}


/// Outcome of a bounded read attempt.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `n` bytes were appended to the caller's buffer.
    Read(usize),
    /// No bytes arrived before the timeout elapsed.
    Timeout,
}

/// A duplex, byte-oriented transport. Implementors may be a serial port, a
/// TCP socket carrying a serial bridge protocol, or (in tests) an in-memory
/// loopback.
///
/// `Connection` is intentionally low-level: it knows nothing about OSDP
/// framing. All framing, checksums and secure-channel handling live above
/// this boundary in `crate::frame` and `crate::secure_channel`.
#[async_trait]
pub trait Connection: Send {
    /// Open the underlying transport. A `Bus` calls this once at
    /// `start_connection` time.
    async fn open(&mut self) -> Result<()>;

    /// Close the underlying transport. Idempotent.
    async fn close(&mut self) -> Result<()>;

    /// Append up to `buf.len()` bytes, waiting up to `timeout` for the first
    /// byte to arrive. Returns `ReadOutcome::Timeout` rather than an error
    /// when nothing arrives in time — that is the expected, common case of
    /// an idle bus, not a failure.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<ReadOutcome>;

    /// Write the full contents of `bytes`, or fail.
    async fn write(&mut self, bytes: &[u8]) -> Result<()>;

    /// Best-effort liveness check; does not perform I/O.
    fn is_open(&self) -> bool;
}
