//! Per-device state: the `DeviceProxy`.
//!
//! One `DeviceProxy` exists per `(ConnectionId, Address)` pair, owned by the
//! `Bus` that drives its connection. It tracks framing options, secure
//! channel state, the outbound sequence counter, the FIFO command queue and
//! online/offline hysteresis.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::command::{Command, Reply};
use crate::error::{Error, FrameInvalidReason, Result};
use crate::frame::{self, Frame};
use crate::secure_channel::SecureChannelSession;

/// A PD address, 0..=127. `0x7F` is the configuration broadcast address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u8);

pub const BROADCAST: Address = Address(0x7F);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressOutOfRange(pub u8);

impl Address {
    pub fn new(raw: u8) -> std::result::Result<Self, AddressOutOfRange> {
        if raw <= 0x7F {
            Ok(Self(raw))
        } else {
            Err(AddressOutOfRange(raw))
        }
    }

    /// Used by the frame codec, which has already range-checked the byte
    /// read off the wire against the 7-bit address field.
    pub(crate) fn from_raw(raw: u8) -> Self {
        Self(raw & 0x7F)
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == BROADCAST
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#04x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Consecutive missed exchanges (timeout or frame-invalid) before a device
/// is marked offline. This is the default; a
/// `Bus` may override it per `BusConfig::offline_threshold`.
pub const OFFLINE_THRESHOLD: u32 = 5;

/// Tag byte marking a secure-channel security block. OSDP defines several
/// security-block types; only the one application-data wrapping this crate
/// produces is represented here (see `DeviceProxy::frame`).
const SECURITY_BLOCK_TAG: u8 = 0x01;

/// The result of handing a decoded reply to a `DeviceProxy`.
pub enum AcceptOutcome {
    /// The reply completed the head of the command queue.
    Delivered(Reply),
    /// The reply did not match any queued command (e.g. a POLL response
    /// carrying unsolicited card data).
    Unsolicited(Reply),
}

/// Per-(connection, address) device state. Driven by exactly one `Bus` poll
/// loop, which is the only task that ever calls `next_outbound`/
/// `accept_reply`/`on_timeout` — but the roster it lives in is also reached
/// by arbitrary caller tasks enqueueing commands (`ControlPanel::send_command`),
/// so the `Bus` guards every `DeviceProxy` behind its per-connection device
/// map mutex rather than true single-task exclusivity. The invariant that
/// at most one command is outstanding per device is enforced by the poll
/// loop never advancing past the queue head until a reply resolves it, not
/// by the absence of a lock.
pub struct DeviceProxy {
    address: Address,
    use_crc: bool,
    use_secure_channel: bool,
    secure_key: Option<[u8; 16]>,
    session: SecureChannelSession,
    sequence: u8,
    command_queue: VecDeque<Command>,
    last_valid_reply_at: Option<Instant>,
    online: bool,
    consecutive_misses: u32,
    offline_threshold: u32,
    last_error: Option<Error>,
}

impl DeviceProxy {
    pub fn new(
        address: Address,
        use_crc: bool,
        use_secure_channel: bool,
        secure_key: Option<[u8; 16]>,
    ) -> Self {
        Self::with_offline_threshold(address, use_crc, use_secure_channel, secure_key, OFFLINE_THRESHOLD)
    }

    pub fn with_offline_threshold(
        address: Address,
        use_crc: bool,
        use_secure_channel: bool,
        secure_key: Option<[u8; 16]>,
        offline_threshold: u32,
    ) -> Self {
        Self {
            address,
            use_crc,
            use_secure_channel,
            secure_key,
            session: SecureChannelSession::new(),
            sequence: 0,
            command_queue: VecDeque::new(),
            last_valid_reply_at: None,
            online: false,
            consecutive_misses: 0,
            offline_threshold,
            last_error: None,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn online(&self) -> bool {
        self.online
    }

    pub fn last_valid_reply_at(&self) -> Option<Instant> {
        self.last_valid_reply_at
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }

    pub fn has_outstanding_command(&self) -> bool {
        !self.command_queue.is_empty()
    }

    /// Append a command to the FIFO queue. Multiple callers enqueueing
    /// against the same device are resolved in the order they were
    /// enqueued, never re-ordered by reply content.
    pub fn enqueue(&mut self, command: Command) {
        trace!(address = %self.address, code = ?command.code(), "command enqueued");
        self.command_queue.push_back(command);
    }

    /// Select the next frame to transmit: secure-channel establishment
    /// traffic pre-empts application traffic, which pre-empts idle POLLing
    ///.
    pub fn next_outbound(&mut self) -> Vec<u8> {
        if self.use_secure_channel && !self.session.is_established() {
            let payload = self.session.next_establishment_payload(self.secure_key.as_ref());
            return self.frame(&payload);
        }

        if let Some(head) = self.command_queue.front() {
            let payload = head.encode(self);
            return self.frame(&payload);
        }

        self.frame(&crate::command::poll_payload())
    }

    /// Frame `payload` for transmission. Once the secure channel is
    /// established, application traffic is wrapped in a one-byte security
    /// block tag and a trailing 4-byte MAC computed over the chaining
    /// vector;
    /// handshake frames (pre-establishment) go out unwrapped, matching the
    /// plain SCS command framing OSDP uses during negotiation.
    fn frame(&mut self, payload: &[u8]) -> Vec<u8> {
        if self.use_secure_channel && self.session.is_established() {
            let mac = self.session.sign(payload);
            let mut secure_payload = Vec::with_capacity(1 + payload.len() + mac.len());
            secure_payload.push(SECURITY_BLOCK_TAG);
            secure_payload.extend_from_slice(payload);
            secure_payload.extend_from_slice(&mac);
            frame::encode(self.address, self.sequence, self.use_crc, true, &secure_payload)
        } else {
            frame::encode(self.address, self.sequence, self.use_crc, false, payload)
        }
    }

    /// Decode and validate a reply received while this device's outbound
    /// frame was in flight. Advances `sequence` only on success.
    pub fn accept_reply(&mut self, reply_bytes: &[u8]) -> Result<AcceptOutcome> {
        let (frame, _consumed) = frame::decode(reply_bytes)?;
        self.validate(&frame)?;

        let reply_payload = if self.use_secure_channel && self.session.is_established() && frame.use_secure_channel {
            self.unwrap_secure_payload(frame.payload)?
        } else {
            frame.payload.to_vec()
        };

        self.sequence = self.sequence.wrapping_add(1) & 0b11;
        self.last_valid_reply_at = Some(Instant::now());
        self.consecutive_misses = 0;

        let mut reply = Reply::parse(self.address, self.sequence, &reply_payload);

        if self.secure_handshake_step(&reply) {
            return Ok(AcceptOutcome::Unsolicited(reply));
        }

        let matching = self
            .command_queue
            .front()
            .filter(|cmd| cmd.accepts(reply.kind))
            .map(|cmd| (cmd.code(), cmd.transaction_id()));

        if let Some((code, transaction_id)) = matching {
            self.command_queue.pop_front();
            reply.issuing_command_code = Some(code);
            reply.issuing_transaction_id = Some(transaction_id);
            Ok(AcceptOutcome::Delivered(reply))
        } else {
            Ok(AcceptOutcome::Unsolicited(reply))
        }
    }

    /// Strip the security-block tag and trailing MAC from a secure-channel
    /// application reply, verifying the MAC against the session's chaining
    /// vector. AES-128-CBC confidentiality of the payload itself is the
    /// out-of-scope "capability the Bus consumes"; this only
    /// implements the in-scope authentication step.
    fn unwrap_secure_payload(&mut self, raw: &[u8]) -> Result<Vec<u8>> {
        const MAC_LEN: usize = 4;
        if raw.len() < 1 + MAC_LEN {
            return Err(Error::FrameInvalid(FrameInvalidReason::TooShort {
                have: raw.len(),
                need: 1 + MAC_LEN,
            }));
        }
        let body = &raw[1..raw.len() - MAC_LEN];
        let mac: [u8; MAC_LEN] = raw[raw.len() - MAC_LEN..].try_into().unwrap();
        self.session
            .verify(body, &mac)
            .map_err(|phase| Error::SecureChannelFailed { phase })?;
        Ok(body.to_vec())
    }

    fn validate(&self, frame: &Frame<'_>) -> Result<()> {
        if frame.address != self.address {
            return Err(Error::FrameInvalid(FrameInvalidReason::AddressMismatch {
                expected: self.address,
                actual: frame.address,
            }));
        }
        if frame.sequence != self.sequence {
            return Err(Error::FrameInvalid(FrameInvalidReason::SequenceMismatch {
                expected: self.sequence,
                actual: frame.sequence,
            }));
        }
        Ok(())
    }

    /// Feeds establishment-phase replies to the secure channel session.
    /// Returns `true` when the reply was consumed as handshake traffic and
    /// should never be matched against the command queue.
    fn secure_handshake_step(&mut self, reply: &Reply) -> bool {
        if !self.use_secure_channel || self.session.is_established() {
            return false;
        }
        if let Some(key) = self.secure_key {
            self.session.on_reply(reply, &key)
        } else {
            false
        }
    }

    /// Record one missed exchange (timeout or rejected frame). Transitions
    /// to offline after `OFFLINE_THRESHOLD` consecutive misses. Returns
    /// `true` if `online` changed as a result (caller emits
    /// `ConnectionStatusChanged`).
    pub fn on_timeout(&mut self) -> bool {
        self.consecutive_misses += 1;
        if self.consecutive_misses >= self.offline_threshold && self.online {
            self.online = false;
            self.session.break_session();
            warn!(address = %self.address, "device marked offline after {} misses", self.consecutive_misses);
            return true;
        }
        false
    }

    /// Record a successful exchange (used by the Bus right after a
    /// `Delivered`/`Unsolicited` outcome). Returns `true` if `online`
    /// changed (offline -> online).
    pub fn mark_alive(&mut self) -> bool {
        self.consecutive_misses = 0;
        if !self.online {
            self.online = true;
            debug!(address = %self.address, "device marked online");
            return true;
        }
        false
    }

    /// Force the device back to a known-bad state: offline, no secure
    /// session, sequence reset, queue cleared. Used by `ControlPanel::reset_device`
    /// and whenever the secure channel breaks hard enough that resuming the
    /// sequence counter would desynchronise the PD.
    pub fn reset(&mut self) {
        self.online = false;
        self.session.reset();
        self.sequence = 0;
        self.command_queue.clear();
        self.consecutive_misses = 0;
    }

    pub fn set_last_error(&mut self, err: Error) {
        self.last_error = Some(err);
    }
}
