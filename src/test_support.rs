//! In-memory `Connection` plumbing for exercising a `Bus` end to end
//! without real serial hardware. Gated behind `cfg(test)`/`feature =
//! "test-util"` so it never ships in a release build of a consumer but is
//! still reachable from both unit tests (`#[cfg(test)]` modules) and this
//! crate's `tests/` integration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::connection::{Connection, ReadOutcome};
use crate::device::Address;
use crate::error::Result;
use crate::frame::{self, FrameReader};

/// Shared byte pipe underlying one direction of a [`loopback_pair`].
struct Pipe {
    buf: Mutex<VecDeque<u8>>,
    notify: Notify,
}

impl Pipe {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            buf: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        })
    }

    fn push(&self, bytes: &[u8]) {
        self.buf.lock().unwrap().extend(bytes.iter().copied());
        self.notify.notify_waiters();
    }

    async fn pull(&self, out: &mut [u8], timeout: Duration) -> ReadOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut buf = self.buf.lock().unwrap();
                if !buf.is_empty() {
                    let n = out.len().min(buf.len());
                    for slot in out.iter_mut().take(n) {
                        *slot = buf.pop_front().unwrap();
                    }
                    return ReadOutcome::Read(n);
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return ReadOutcome::Timeout;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return ReadOutcome::Timeout,
            }
        }
    }
}

/// One end of an in-memory duplex pair. Implements [`Connection`]; the
/// `responding` flag lets a test simulate a cut connection (a PD that goes
/// silent) without tearing down the pipe itself.
pub struct LoopbackConnection {
    rx: Arc<Pipe>,
    tx: Arc<Pipe>,
    open: bool,
    responding: Arc<AtomicBool>,
}

impl LoopbackConnection {
    /// A handle a test can flip to `false` after construction to model a PD
    /// that stops answering entirely, without tearing down the pipe or
    /// needing to reach back into a moved-away `FakePeripheral`.
    pub fn responding_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.responding)
    }
}

#[async_trait]
impl Connection for LoopbackConnection {
    async fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<ReadOutcome> {
        Ok(self.rx.pull(buf, timeout).await)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.responding.load(Ordering::SeqCst) {
            self.tx.push(bytes);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Build two connected [`LoopbackConnection`]s: bytes written to one side
/// are readable from the other. Both start "responding"; flip the
/// [`AtomicBool`] returned by [`LoopbackConnection::responding_handle`] on
/// the PD-facing end to `false` to simulate a dead link.
pub fn loopback_pair() -> (LoopbackConnection, LoopbackConnection) {
    let a_to_b = Pipe::new();
    let b_to_a = Pipe::new();
    let a_responding = Arc::new(AtomicBool::new(true));
    let b_responding = Arc::new(AtomicBool::new(true));

    let a = LoopbackConnection {
        rx: Arc::clone(&b_to_a),
        tx: Arc::clone(&a_to_b),
        open: false,
        responding: a_responding,
    };
    let b = LoopbackConnection {
        rx: a_to_b,
        tx: b_to_a,
        open: false,
        responding: b_responding,
    };
    (a, b)
}

/// What a [`FakePeripheral`] sends back for one received application
/// command code (the byte at payload offset 0, post security-block).
pub enum ScriptedReply {
    /// Reply with this already-coded payload (reply code byte included).
    Bytes(Vec<u8>),
    /// Don't reply at all this cycle (simulates a single missed exchange).
    Silence,
}

/// Drives one end of a [`loopback_pair`] as a minimal PD: decodes each
/// incoming frame, looks up a canned reply for the command code it
/// carries, and frames a response back with the same address/sequence
/// (OSDP echoes the command's sequence on its reply) the codec expects.
/// Unset codes default to a plain ACK (0x40) so a test only needs to
/// script the replies it cares about.
pub struct FakePeripheral {
    address: Address,
    use_crc: bool,
    connection: LoopbackConnection,
    scripts: std::collections::HashMap<u8, Vec<ScriptedReply>>,
}

impl FakePeripheral {
    pub fn new(address: Address, use_crc: bool, connection: LoopbackConnection) -> Self {
        Self {
            address,
            use_crc,
            connection,
            scripts: std::collections::HashMap::new(),
        }
    }

    /// Queue canned replies (consumed in order, last one repeats) for
    /// command code `code`.
    pub fn script(&mut self, code: u8, replies: Vec<ScriptedReply>) {
        self.scripts.insert(code, replies);
    }

    pub fn connection_mut(&mut self) -> &mut LoopbackConnection {
        &mut self.connection
    }

    /// Run until `connection.is_open()` goes false or `cycles` frames have
    /// been answered, whichever comes first. Meant to be `tokio::spawn`ed
    /// alongside the `Bus` under test.
    pub async fn run(mut self, cycles: usize) {
        let _ = self.connection.open().await;
        let mut reader = FrameReader::new();
        let mut buf = [0u8; 512];

        for _ in 0..cycles {
            let frame_bytes = loop {
                match self.connection.read(&mut buf, Duration::from_millis(500)).await {
                    Ok(ReadOutcome::Read(n)) => {
                        reader.feed(&buf[..n]);
                        if let Some(candidate) = reader.try_take_frame() {
                            break candidate;
                        }
                    }
                    _ => return,
                }
            };

            let Ok((frame, _)) = frame::decode(&frame_bytes) else { continue };
            let code = frame.payload.first().copied().unwrap_or(0x60);

            let reply_payload = match self.scripts.get_mut(&code) {
                Some(queue) if !queue.is_empty() => {
                    let next = if queue.len() > 1 { queue.remove(0) } else { queue[0].take() };
                    match next {
                        ScriptedReply::Bytes(b) => b,
                        ScriptedReply::Silence => continue,
                    }
                }
                _ => vec![0x40],
            };

            let out = frame::encode(self.address, frame.sequence, self.use_crc, false, &reply_payload);
            if self.connection.write(&out).await.is_err() {
                return;
            }
        }
    }
}

impl ScriptedReply {
    fn take(&self) -> Self {
        match self {
            ScriptedReply::Bytes(b) => ScriptedReply::Bytes(b.clone()),
            ScriptedReply::Silence => ScriptedReply::Silence,
        }
    }
}
