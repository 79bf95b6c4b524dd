//! Multi-part reply reassembly, used today for `PIVData` and
//! written generically enough to cover `ExtendedRead` if a future command
//! needs it.
//!
//! The byte-level shape of an individual command/reply payload is out of
//! scope, but the fragment *header* —
//! `{whole_length, offset, fragment_length, fragment_bytes}` — is exactly
//! what the `ControlPanel` needs to manage reassembly, so
//! this module assumes a fixed little-endian header shape for it:
//! `[whole_length: u16][offset: u16][fragment_length: u16][fragment_bytes...]`.
//! (Open Question, resolved: the wire-level fragment header isn't specified
//! at this boundary, so this is the simplest self-consistent shape that
//! carries the required fields — see DESIGN.md.)

use crate::error::{Error, Result};

pub(crate) struct PivFragment {
    pub whole_length: usize,
    pub offset: usize,
    pub bytes: Vec<u8>,
}

const HEADER_LEN: usize = 6;

pub(crate) fn parse_piv_fragment(payload: &[u8]) -> Result<PivFragment> {
    if payload.len() < HEADER_LEN {
        return Err(Error::FragmentOutOfRange {
            offset: 0,
            len: 0,
            whole: 0,
        });
    }
    let whole_length = u16::from_le_bytes([payload[0], payload[1]]) as usize;
    let offset = u16::from_le_bytes([payload[2], payload[3]]) as usize;
    let fragment_length = u16::from_le_bytes([payload[4], payload[5]]) as usize;

    let body = payload.get(HEADER_LEN..HEADER_LEN + fragment_length).ok_or(
        Error::FragmentOutOfRange {
            offset,
            len: fragment_length,
            whole: whole_length,
        },
    )?;

    Ok(PivFragment {
        whole_length,
        offset,
        bytes: body.to_vec(),
    })
}

/// Encode one PIV fragment using the same header shape [`parse_piv_fragment`]
/// expects. Exposed for tests and for `crate::test_support`'s in-memory PD
/// simulator.
#[cfg(any(test, feature = "test-util"))]
pub fn encode_piv_fragment(whole_length: usize, offset: usize, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + bytes.len());
    out.extend_from_slice(&(whole_length as u16).to_le_bytes());
    out.extend_from_slice(&(offset as u16).to_le_bytes());
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
    out
}

/// Accumulates fragments for one `(connection, address, reply kind)`
/// reassembly, keyed and owned by the caller (`ControlPanel`'s PIV state
/// map). Tracks per-byte coverage so overlapping fragments are tolerated —
/// only the whole length needs to end up covered, not that
/// fragments partition it disjointly.
pub(crate) struct ReassemblyBuffer {
    pub whole_length: usize,
    bytes: Vec<u8>,
    covered: Vec<bool>,
}

impl ReassemblyBuffer {
    pub fn new(whole_length: usize) -> Self {
        Self {
            whole_length,
            bytes: vec![0u8; whole_length],
            covered: vec![false; whole_length],
        }
    }

    pub fn write_fragment(&mut self, offset: usize, fragment: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(fragment.len())
            .filter(|&end| end <= self.whole_length)
            .ok_or(Error::FragmentOutOfRange {
                offset,
                len: fragment.len(),
                whole: self.whole_length,
            })?;
        self.bytes[offset..end].copy_from_slice(fragment);
        for c in &mut self.covered[offset..end] {
            *c = true;
        }
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.covered.iter().all(|&c| c)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
