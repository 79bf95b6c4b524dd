//! OSDP wire frame encode/decode.
//!
//! ```text
//! SOM(0x53) | Address(1) | LengthLo | LengthHi | Control(1) | [Payload...] | Checksum(1) or CRC(2)
//! ```
//!
//! The codec is stateless: callers supply `use_crc` and, for secure frames,
//! the MAC bytes to verify/append. It never blocks and never retries — that
//! is the `Bus`'s job (see `crate::bus`). It only ever fails with
//! [`crate::error::Error::FrameInvalid`], and always resynchronises on the
//! next `SOM` rather than treating noise as fatal.

use crc::{Crc, CRC_16_IBM_3740};
use modular_bitfield::prelude::*;

use crate::device::Address;
use crate::error::{Error, FrameInvalidReason, Result};

pub const SOM: u8 = 0x53;

/// Minimum frame size: SOM + address + 2 length bytes + control + 1-byte checksum.
pub(crate) const MIN_FRAME_LEN: usize = 1 + 1 + 2 + 1 + 1;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Control byte: sequence (bits 0-1), CRC-vs-checksum (bit 2), secure channel
/// presence (bit 3), remaining bits reserved.
#[bitfield]
#[derive(Debug, Clone, Copy)]
pub struct Control {
    pub sequence: B2,
    pub use_crc: bool,
    pub use_secure_channel: bool,
    #[skip]
    __: B4,
}

/// A decoded frame, borrowing its payload from the buffer it was decoded
/// from so a hot poll loop doesn't need to allocate per reply.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub address: Address,
    pub sequence: u8,
    pub use_crc: bool,
    pub use_secure_channel: bool,
    pub payload: &'a [u8],
}

fn checksum8(bytes: &[u8]) -> u8 {
    let sum: u8 = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    (!sum).wrapping_add(1)
}

/// Encode a frame. `payload` must already carry the security block and MAC
/// suffix if `use_secure_channel` is set — framing a secure channel is the
/// caller's concern (`crate::secure_channel`), not the codec's.
pub fn encode(
    address: Address,
    sequence: u8,
    use_crc: bool,
    use_secure_channel: bool,
    payload: &[u8],
) -> Vec<u8> {
    let control = Control::new()
        .with_sequence(sequence & 0b11)
        .with_use_crc(use_crc)
        .with_use_secure_channel(use_secure_channel);

    let trailer_len = if use_crc { 2 } else { 1 };
    let total_len = 1 + 1 + 2 + 1 + payload.len() + trailer_len;

    let mut out = Vec::with_capacity(total_len);
    out.push(SOM);
    out.push(address.raw());
    out.extend_from_slice(&(total_len as u16).to_le_bytes());
    out.push(control.into_bytes()[0]);
    out.extend_from_slice(payload);

    if use_crc {
        let crc = CRC16.checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());
    } else {
        let sum = checksum8(&out);
        out.push(sum);
    }

    out
}

/// Decode one frame out of `buf`, which must start at a prospective `SOM`
/// (callers resynchronise via [`find_som`] before calling this). Returns the
/// decoded frame and the number of bytes it consumed from `buf`.
pub fn decode(buf: &[u8]) -> Result<(Frame<'_>, usize)> {
    if buf.len() < MIN_FRAME_LEN {
        return Err(Error::FrameInvalid(FrameInvalidReason::TooShort {
            have: buf.len(),
            need: MIN_FRAME_LEN,
        }));
    }
    if buf[0] != SOM {
        return Err(Error::FrameInvalid(FrameInvalidReason::BadStartOfMessage));
    }

    let address = Address::from_raw(buf[1]);
    let declared_len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    let control = Control::from_bytes([buf[4]]);
    let use_crc = control.use_crc();
    let use_secure_channel = control.use_secure_channel();
    let sequence = control.sequence();

    let trailer_len = if use_crc { 2 } else { 1 };
    if declared_len < MIN_FRAME_LEN {
        return Err(Error::FrameInvalid(FrameInvalidReason::LengthMismatch {
            declared: declared_len,
            actual: buf.len(),
        }));
    }
    if buf.len() < declared_len {
        // Not a framing error yet: the caller may simply not have read
        // enough bytes for this frame. Treat as "too short" so the reader
        // keeps accumulating instead of discarding a partially-arrived frame.
        return Err(Error::FrameInvalid(FrameInvalidReason::TooShort {
            have: buf.len(),
            need: declared_len,
        }));
    }

    let frame_bytes = &buf[..declared_len];
    let body_end = declared_len - trailer_len;

    if use_crc {
        let got = u16::from_le_bytes([frame_bytes[body_end], frame_bytes[body_end + 1]]);
        let want = CRC16.checksum(&frame_bytes[..body_end]);
        if got != want {
            return Err(Error::FrameInvalid(FrameInvalidReason::CrcMismatch));
        }
    } else {
        let got = frame_bytes[body_end];
        let want = checksum8(&frame_bytes[..body_end]);
        if got != want {
            return Err(Error::FrameInvalid(FrameInvalidReason::ChecksumMismatch));
        }
    }

    let payload = &frame_bytes[5..body_end];

    Ok((
        Frame {
            address,
            sequence,
            use_crc,
            use_secure_channel,
            payload,
        },
        declared_len,
    ))
}

/// Scan `buf` for the next plausible `SOM`, returning its index. Used to
/// resynchronise after a rejected frame or inter-frame noise; the Bus
/// discards everything before the returned index.
pub fn find_som(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == SOM)
}

/// Accumulates bytes across multiple `Connection::read` calls and hands
/// back one candidate frame's raw bytes once enough have arrived to know
/// its declared length. Checksum/CRC/MAC
/// validation is still the caller's job via [`decode`] — this only does
/// buffering and SOM resynchronisation, so the `Bus`'s per-cycle read loop
/// doesn't need to re-implement either.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Append freshly-read bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Resynchronise on the next `SOM`, discarding any leading noise, then
    /// return the raw bytes of one candidate frame once its declared
    /// length is fully buffered. Returns `None` if more bytes are needed;
    /// callers should keep reading and calling this again.
    pub fn try_take_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let som = find_som(&self.buf)?;
            if som > 0 {
                self.buf.drain(..som);
            }
            if self.buf.len() < 4 {
                return None;
            }
            let declared_len = u16::from_le_bytes([self.buf[2], self.buf[3]]) as usize;
            if declared_len < MIN_FRAME_LEN {
                // Not a real frame length; treat this SOM as noise and keep scanning.
                self.buf.drain(..1);
                continue;
            }
            if self.buf.len() < declared_len {
                return None;
            }
            return Some(self.buf.drain(..declared_len).collect());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_checksum() {
        let payload = [0x01, 0x02, 0x03, 0x04];
        let bytes = encode(Address::new(5).unwrap(), 2, false, false, &payload);
        let (frame, consumed) = decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(frame.address.raw(), 5);
        assert_eq!(frame.sequence, 2);
        assert!(!frame.use_crc);
        assert_eq!(frame.payload, &payload);
    }

    #[test]
    fn round_trip_crc() {
        let payload = [0xAA; 16];
        let bytes = encode(Address::new(0x7F).unwrap(), 3, true, true, &payload);
        let (frame, consumed) = decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert!(frame.use_crc);
        assert!(frame.use_secure_channel);
        assert_eq!(frame.payload, &payload);
    }

    #[test]
    fn bit_flip_detected_checksum() {
        let payload = [0x10, 0x20, 0x30];
        let mut bytes = encode(Address::new(1).unwrap(), 0, false, false, &payload);
        let last = bytes.len() - 1;
        bytes[3] ^= 0x01; // flip a payload-adjacent bit
        let _ = last;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn bit_flip_detected_crc() {
        let payload = [0x10, 0x20, 0x30, 0x40];
        let mut bytes = encode(Address::new(1).unwrap(), 0, true, false, &payload);
        bytes[6] ^= 0x01;
        assert!(decode(&bytes).is_err());
    }

    #[test]
    fn resyncs_past_noise() {
        let payload = [0x01];
        let good = encode(Address::new(9).unwrap(), 1, false, false, &payload);
        let mut noisy = vec![0xFF, 0x00, 0xEE];
        noisy.extend_from_slice(&good);
        let idx = find_som(&noisy).unwrap();
        assert_eq!(idx, 3);
        let (frame, consumed) = decode(&noisy[idx..]).unwrap();
        assert_eq!(consumed, good.len());
        assert_eq!(frame.address.raw(), 9);
    }

    #[test]
    fn frame_reader_reassembles_across_partial_reads() {
        let payload = [0x01, 0x02, 0x03];
        let good = encode(Address::new(4).unwrap(), 1, false, false, &payload);

        let mut reader = FrameReader::new();
        reader.feed(&[0xFF, 0xEE]); // noise before SOM
        assert!(reader.try_take_frame().is_none());

        reader.feed(&good[..good.len() / 2]);
        assert!(reader.try_take_frame().is_none());

        reader.feed(&good[good.len() / 2..]);
        let candidate = reader.try_take_frame().expect("frame complete");
        assert_eq!(candidate, good);

        let (frame, consumed) = decode(&candidate).unwrap();
        assert_eq!(consumed, candidate.len());
        assert_eq!(frame.payload, &payload);
    }

    #[test]
    fn too_short_is_not_fatal_noise() {
        let payload = [0x01, 0x02];
        let bytes = encode(Address::new(1).unwrap(), 0, false, false, &payload);
        let partial = &bytes[..bytes.len() - 1];
        match decode(partial) {
            Err(Error::FrameInvalid(FrameInvalidReason::TooShort { .. })) => {}
            other => panic!("expected TooShort, got {other:?}"),
        }
    }
}
