//! Commands, replies, and the reply-for-command correlation table.
//!
//! Byte-level encoding of individual command/reply *payloads* is out of
//! scope: payloads are opaque blobs tagged with a one-byte OSDP
//! command/reply code. What lives here is the part that *is* in scope: the
//! table that says which reply codes can complete which outstanding
//! command, used by `DeviceProxy::accept_reply` to decide whether a reply
//! is `Delivered` or merely `Unsolicited`.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::connection::ConnectionId;
use crate::device::{Address, DeviceProxy};

/// Monotonically assigned so that two concurrent callers sending commands
/// of the same code to the same address are resolved FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(u64);

impl TransactionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// OSDP command codes the façade can issue. `Poll` is never constructed by
/// callers — `DeviceProxy::next_outbound` synthesizes it whenever the queue
/// is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCode {
    Poll,
    IdReport,
    DeviceCapabilities,
    LocalStatusReport,
    InputStatusReport,
    OutputStatusReport,
    ReaderStatusReport,
    OutputControl,
    ReaderLedControl,
    BuzzerControl,
    TextOutput,
    CommConfig,
    ManufacturerSpecific,
    ExtendedWrite,
    GetPivData,
}

impl CommandCode {
    /// Exposes `wire_code` to integration tests (`tests/`), which script a
    /// `FakePeripheral`'s replies by the wire byte a given command arrives
    /// as. Not meant for production callers — the wire encoding of a
    /// command is otherwise an internal detail of this module.
    #[cfg(any(test, feature = "test-util"))]
    pub fn wire_code_for_tests(self) -> u8 {
        self.wire_code()
    }

    pub(crate) fn wire_code(self) -> u8 {
        match self {
            CommandCode::Poll => 0x60,
            CommandCode::IdReport => 0x61,
            CommandCode::DeviceCapabilities => 0x62,
            CommandCode::LocalStatusReport => 0x64,
            CommandCode::InputStatusReport => 0x65,
            CommandCode::OutputStatusReport => 0x66,
            CommandCode::ReaderStatusReport => 0x67,
            CommandCode::OutputControl => 0x68,
            CommandCode::ReaderLedControl => 0x69,
            CommandCode::BuzzerControl => 0x6A,
            CommandCode::TextOutput => 0x6B,
            CommandCode::CommConfig => 0x6E,
            CommandCode::ManufacturerSpecific => 0x80,
            CommandCode::ExtendedWrite => 0x81,
            CommandCode::GetPivData => 0xA0,
        }
    }

    /// Reply codes that complete a command of this kind — the "acceptable
    /// reply types" table. Ack/Nak are always acceptable and
    /// handled separately by `accepts`.
    fn acceptable(self, kind: ReplyKind) -> bool {
        use CommandCode::*;
        use ReplyKind::*;
        match (self, kind) {
            (IdReport, IdReport) => true,
            (DeviceCapabilities, self::ReplyKind::DeviceCapabilities) => true,
            (LocalStatusReport, LocalStatus) => true,
            (InputStatusReport, InputStatus) => true,
            (OutputStatusReport, OutputStatus) => true,
            (ReaderStatusReport, ReaderStatus) => true,
            (OutputControl, OutputStatus) => true,
            (ManufacturerSpecific, self::ReplyKind::ManufacturerSpecific) => true,
            (ExtendedWrite, ExtendedRead) => true,
            (GetPivData, PivData) => true,
            _ => false,
        }
    }
}

/// Tagged reply kind, decoded from the one-byte reply code carried in the
/// payload. Unrecognised codes fall back to `ManufacturerSpecific` rather
/// than failing decode — an unknown reply is still a valid protocol event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    Ack,
    Nak,
    IdReport,
    DeviceCapabilities,
    LocalStatus,
    InputStatus,
    OutputStatus,
    ReaderStatus,
    RawCardData,
    ManufacturerSpecific,
    ExtendedRead,
    PivData,
    /// Secure-channel handshake traffic (challenge/cryptogram exchange).
    /// Never matched against the command queue directly — consumed by
    /// `SecureChannelSession` before correlation is attempted.
    SecureChannel,
}

impl ReplyKind {
    fn from_wire_code(code: u8) -> Self {
        match code {
            0x40 => ReplyKind::Ack,
            0x41 => ReplyKind::Nak,
            0x45 => ReplyKind::IdReport,
            0x46 => ReplyKind::DeviceCapabilities,
            0x48 => ReplyKind::LocalStatus,
            0x49 => ReplyKind::InputStatus,
            0x4A => ReplyKind::OutputStatus,
            0x4B => ReplyKind::ReaderStatus,
            0x50 => ReplyKind::RawCardData,
            0x73 => ReplyKind::ExtendedRead,
            0x90 => ReplyKind::ManufacturerSpecific,
            0xA1 => ReplyKind::PivData,
            0x76 | 0x77 | 0x78 => ReplyKind::SecureChannel,
            _ => ReplyKind::ManufacturerSpecific,
        }
    }
}

/// A queued, immutable outbound command. `encode` is called fresh each time
/// `DeviceProxy::next_outbound` selects this command as head-of-queue, so it
/// can reflect device state (e.g. it is re-framed with the current sequence
/// on every retransmit) without the queue entry itself being mutable.
pub struct Command {
    address: Address,
    code: CommandCode,
    transaction_id: TransactionId,
    encode: Box<dyn Fn(&DeviceProxy) -> Vec<u8> + Send + Sync>,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("address", &self.address)
            .field("code", &self.code)
            .field("transaction_id", &self.transaction_id)
            .finish()
    }
}

impl Command {
    /// `payload` is the already-encoded, opaque application payload (the
    /// byte-level shape of each command's fields is out of scope — see
    /// module docs). Most callers only need this constructor.
    pub fn new(address: Address, code: CommandCode, payload: Vec<u8>) -> Self {
        Self::with_encoder(address, code, move |_device| payload.clone())
    }

    pub fn with_encoder(
        address: Address,
        code: CommandCode,
        encode: impl Fn(&DeviceProxy) -> Vec<u8> + Send + Sync + 'static,
    ) -> Self {
        Self {
            address,
            code,
            transaction_id: TransactionId::next(),
            encode: Box::new(encode),
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn code(&self) -> CommandCode {
        self.code
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub(crate) fn encode(&self, device: &DeviceProxy) -> Vec<u8> {
        let application_payload = (self.encode)(device);
        let mut wire = Vec::with_capacity(application_payload.len() + 1);
        wire.push(self.code.wire_code());
        wire.extend_from_slice(&application_payload);
        wire
    }

    /// Whether `kind` is an acceptable reply for this command:
    /// Ack/Nak always qualify, plus whatever the per-command-code table
    /// allows.
    pub(crate) fn accepts(&self, kind: ReplyKind) -> bool {
        matches!(kind, ReplyKind::Ack | ReplyKind::Nak) || self.code.acceptable(kind)
    }
}

/// The idle keep-alive frame sent whenever a device's command queue is
/// empty and its secure channel (if any) is already established.
pub fn poll_payload() -> Vec<u8> {
    vec![CommandCode::Poll.wire_code()]
}

/// A decoded reply, as handed to the `ReplyDispatcher`.
/// `issuing_command_code`/`issuing_transaction_id` are `None` for
/// unsolicited replies, and `Some` together for delivered ones — the
/// dispatcher matches a delivered reply back to its `PendingRequest` by
/// `issuing_transaction_id`, never by queue position, so a reply is routed
/// to the caller whose command it actually answers even if the order
/// pending requests were registered in raced ahead of the order their
/// commands reached the device queue (see `crate::dispatcher`).
/// `connection_id` is filled in by the `Bus` after `DeviceProxy::accept_reply`
/// returns — a device proxy doesn't need to know which connection it lives
/// on to decode its own traffic.
#[derive(Debug, Clone)]
pub struct Reply {
    pub connection_id: ConnectionId,
    pub address: Address,
    pub sequence: u8,
    pub kind: ReplyKind,
    pub issuing_command_code: Option<CommandCode>,
    pub issuing_transaction_id: Option<TransactionId>,
    pub payload: Vec<u8>,
}

impl Reply {
    pub(crate) fn parse(address: Address, sequence: u8, frame_payload: &[u8]) -> Self {
        let (code, rest) = frame_payload.split_first().unwrap_or((&0, &[]));
        Reply {
            connection_id: ConnectionId::placeholder(),
            address,
            sequence,
            kind: ReplyKind::from_wire_code(*code),
            issuing_command_code: None,
            issuing_transaction_id: None,
            payload: rest.to_vec(),
        }
    }

    pub(crate) fn with_connection_id(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = connection_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_report_command_accepts_id_report_and_nak() {
        let cmd = Command::new(Address::new(1).unwrap(), CommandCode::IdReport, vec![]);
        assert!(cmd.accepts(ReplyKind::IdReport));
        assert!(cmd.accepts(ReplyKind::Nak));
        assert!(cmd.accepts(ReplyKind::Ack));
        assert!(!cmd.accepts(ReplyKind::OutputStatus));
    }

    #[test]
    fn output_control_accepts_output_status_too() {
        let cmd = Command::new(Address::new(1).unwrap(), CommandCode::OutputControl, vec![]);
        assert!(cmd.accepts(ReplyKind::OutputStatus));
        assert!(cmd.accepts(ReplyKind::Ack));
    }

    #[test]
    fn transaction_ids_are_distinct_and_increasing() {
        let a = TransactionId::next();
        let b = TransactionId::next();
        assert!(b.0 > a.0);
    }
}
