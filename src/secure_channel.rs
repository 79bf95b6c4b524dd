//! Per-device secure-channel state machine.
//!
//! The actual AES-128/CMAC primitives are a capability this module consumes
//! rather than reimplements — this module is the state machine *around*
//! that capability: which challenge to send next, whether a cryptogram
//! verifies, and when to declare the channel established or broken. It
//! calls `Cmac::<Aes128>` directly rather than hiding it behind a trait,
//! since there is exactly one MAC construction OSDP's secure channel uses.

use aes::Aes128;
use cmac::{Cmac, Mac};
use rand::RngCore;
use zeroize::Zeroize;

use crate::command::{Reply, ReplyKind};
use crate::error::SecureChannelPhase;

const CHALLENGE_LEN: usize = 8;
const CRYPTOGRAM_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureChannelState {
    None,
    ChallengeSent,
    ServerCryptogramSent,
    Established,
    Broken,
}

fn cmac16(key: &[u8; 16], blocks: &[&[u8]]) -> [u8; 16] {
    let mut mac = Cmac::<Aes128>::new_from_slice(key).expect("aes-128 key is always 16 bytes");
    for block in blocks {
        mac.update(block);
    }
    mac.finalize().into_bytes().into()
}

/// Holds the handshake nonces and, once established, the derived session
/// keys and the MAC chaining vector. Everything here is zeroised on
/// `reset()`/`break_session()` and on `Drop`.
pub struct SecureChannelSession {
    state: SecureChannelState,
    rnd_a: [u8; CHALLENGE_LEN],
    rnd_b: [u8; CHALLENGE_LEN],
    session_enc_key: [u8; 16],
    smac1: [u8; 16],
    smac2: [u8; 16],
    mac_chain: [u8; 16],
    pending_outbound: Vec<u8>,
}

impl SecureChannelSession {
    pub fn new() -> Self {
        Self {
            state: SecureChannelState::None,
            rnd_a: [0; CHALLENGE_LEN],
            rnd_b: [0; CHALLENGE_LEN],
            session_enc_key: [0; 16],
            smac1: [0; 16],
            smac2: [0; 16],
            mac_chain: [0; 16],
            pending_outbound: Vec::new(),
        }
    }

    pub fn state(&self) -> SecureChannelState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == SecureChannelState::Established
    }

    /// Returns the next establishment frame body to send, advancing
    /// `None`/`Broken` into `ChallengeSent` by minting a fresh challenge.
    /// `ChallengeSent`/`ServerCryptogramSent` simply resend the payload
    /// already computed by the last `on_reply` call (or the initial
    /// challenge), since within one poll cycle at most one handshake frame
    /// is outstanding.
    pub fn next_establishment_payload(&mut self, key: Option<&[u8; 16]>) -> Vec<u8> {
        if key.is_none() {
            // Misconfigured device (secure channel requested, no key). Never
            // progress past None; caller sees a perpetual non-established
            // session, so such a device can never accept application commands.
            return Vec::new();
        }

        if matches!(self.state, SecureChannelState::None | SecureChannelState::Broken) {
            let mut rng = rand::thread_rng();
            rng.fill_bytes(&mut self.rnd_a);
            self.state = SecureChannelState::ChallengeSent;
            self.pending_outbound = self.rnd_a.to_vec();
        }

        self.pending_outbound.clone()
    }

    /// Feed a reply received while a handshake frame was outstanding.
    /// Returns `true` (the reply was handshake traffic, never correlated
    /// against the application command queue) whenever the channel isn't
    /// yet `Established`.
    pub fn on_reply(&mut self, reply: &Reply, key: &[u8; 16]) -> bool {
        if self.is_established() {
            return false;
        }

        match self.state {
            SecureChannelState::ChallengeSent => self.on_pd_cryptogram(reply, key),
            SecureChannelState::ServerCryptogramSent => self.on_server_cryptogram_ack(reply),
            SecureChannelState::None | SecureChannelState::Broken | SecureChannelState::Established => {}
        }
        true
    }

    fn on_pd_cryptogram(&mut self, reply: &Reply, key: &[u8; 16]) {
        if reply.kind != ReplyKind::SecureChannel
            || reply.payload.len() < CHALLENGE_LEN + CRYPTOGRAM_LEN
        {
            self.break_session();
            return;
        }

        self.rnd_b.copy_from_slice(&reply.payload[..CHALLENGE_LEN]);
        let pd_cryptogram = &reply.payload[CHALLENGE_LEN..CHALLENGE_LEN + CRYPTOGRAM_LEN];

        let expected = cmac16(key, &[&[0x01], &self.rnd_a, &self.rnd_b]);
        if &expected[..] != pd_cryptogram {
            self.break_session();
            return;
        }

        self.session_enc_key = cmac16(key, &[&[0x02], &self.rnd_a, &self.rnd_b]);
        self.smac1 = cmac16(key, &[&[0x03], &self.rnd_a, &self.rnd_b]);
        self.smac2 = cmac16(key, &[&[0x04], &self.rnd_a, &self.rnd_b]);
        self.mac_chain = self.smac1;

        let server_cryptogram = cmac16(key, &[&[0x05], &self.rnd_b, &self.rnd_a]);
        self.pending_outbound = server_cryptogram.to_vec();
        self.state = SecureChannelState::ServerCryptogramSent;
    }

    fn on_server_cryptogram_ack(&mut self, reply: &Reply) {
        if reply.kind == ReplyKind::Ack {
            self.state = SecureChannelState::Established;
            self.pending_outbound.clear();
        } else {
            self.break_session();
        }
    }

    /// Compute the 4-byte MAC for an outbound application payload and
    /// advance the chaining vector. Only meaningful once `Established`.
    pub fn sign(&mut self, payload: &[u8]) -> [u8; 4] {
        let tag = cmac16(&self.smac1, &[&self.mac_chain, payload]);
        self.mac_chain = tag;
        tag[..4].try_into().unwrap()
    }

    /// Verify a received MAC against the current chaining vector, advancing
    /// it on success. Returns `Err` with `SecureChannelPhase::Mac` on
    /// mismatch — callers should treat this the same as a frame-invalid
    /// timeout.
    pub fn verify(&mut self, payload: &[u8], mac: &[u8; 4]) -> Result<(), SecureChannelPhase> {
        let tag = cmac16(&self.smac2, &[&self.mac_chain, payload]);
        if &tag[..4] != mac {
            return Err(SecureChannelPhase::Mac);
        }
        self.mac_chain = tag;
        Ok(())
    }

    /// Any state to `Broken`: MAC failure, cryptogram mismatch,
    /// or handshake timeout. Forces a restart from `None` on next poll
    /// cycle, and zeroises whatever key material had been derived so far.
    pub fn break_session(&mut self) {
        self.state = SecureChannelState::Broken;
        self.zeroize_keys();
    }

    /// Used by `DeviceProxy::reset`: returns fully to `None`, distinct from
    /// `Broken` in that callers don't need to special-case it — both force
    /// a fresh handshake on the next `next_establishment_payload` call.
    pub fn reset(&mut self) {
        self.state = SecureChannelState::None;
        self.rnd_a.zeroize();
        self.rnd_b.zeroize();
        self.pending_outbound.zeroize();
        self.zeroize_keys();
    }

    /// Test-only shortcut past the handshake, used by `device`'s unit
    /// tests which exercise the established-session framing path without
    /// re-deriving the full challenge/cryptogram exchange (already covered
    /// by this module's own tests).
    #[cfg(test)]
    pub(crate) fn force_established(&mut self, smac1: [u8; 16], smac2: [u8; 16]) {
        self.state = SecureChannelState::Established;
        self.smac1 = smac1;
        self.smac2 = smac2;
    }

    fn zeroize_keys(&mut self) {
        self.session_enc_key.zeroize();
        self.smac1.zeroize();
        self.smac2.zeroize();
        self.mac_chain.zeroize();
    }
}

impl Default for SecureChannelSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SecureChannelSession {
    fn drop(&mut self) {
        self.zeroize_keys();
        self.rnd_a.zeroize();
        self.rnd_b.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Address;

    fn handshake_reply(kind: ReplyKind, payload: Vec<u8>) -> Reply {
        Reply {
            connection_id: crate::connection::testing::fake_id(),
            address: Address::new(1).unwrap(),
            sequence: 0,
            kind,
            issuing_command_code: None,
            issuing_transaction_id: None,
            payload,
        }
    }

    #[test]
    fn full_handshake_reaches_established() {
        let key = [0x42u8; 16];
        let mut session = SecureChannelSession::new();

        let challenge = session.next_establishment_payload(Some(&key));
        assert_eq!(session.state(), SecureChannelState::ChallengeSent);
        assert_eq!(challenge.len(), CHALLENGE_LEN);

        let rnd_a: [u8; 8] = challenge.try_into().unwrap();
        let rnd_b = [0x11u8; 8];
        let pd_cryptogram = cmac16(&key, &[&[0x01], &rnd_a, &rnd_b]);

        let mut pd_reply_payload = rnd_b.to_vec();
        pd_reply_payload.extend_from_slice(&pd_cryptogram);
        let reply = handshake_reply(ReplyKind::SecureChannel, pd_reply_payload);

        assert!(session.on_reply(&reply, &key));
        assert_eq!(session.state(), SecureChannelState::ServerCryptogramSent);

        let ack = handshake_reply(ReplyKind::Ack, vec![]);
        assert!(session.on_reply(&ack, &key));
        assert_eq!(session.state(), SecureChannelState::Established);
    }

    #[test]
    fn bad_cryptogram_breaks_session() {
        let key = [0x42u8; 16];
        let mut session = SecureChannelSession::new();
        let _challenge = session.next_establishment_payload(Some(&key));

        let mut bad_payload = [0x11u8; 8].to_vec();
        bad_payload.extend_from_slice(&[0u8; 16]); // wrong cryptogram
        let reply = handshake_reply(ReplyKind::SecureChannel, bad_payload);

        session.on_reply(&reply, &key);
        assert_eq!(session.state(), SecureChannelState::Broken);
    }

    #[test]
    fn broken_restarts_from_none_on_next_poll() {
        let key = [0x42u8; 16];
        let mut session = SecureChannelSession::new();
        session.break_session();
        let challenge = session.next_establishment_payload(Some(&key));
        assert_eq!(session.state(), SecureChannelState::ChallengeSent);
        assert_eq!(challenge.len(), CHALLENGE_LEN);
    }

    #[test]
    fn sign_and_verify_round_trip_once_established() {
        let mut sender = SecureChannelSession::new();
        sender.state = SecureChannelState::Established;
        sender.smac1 = [7u8; 16];
        sender.smac2 = [7u8; 16];

        let mut receiver = SecureChannelSession::new();
        receiver.state = SecureChannelState::Established;
        receiver.smac1 = [7u8; 16];
        receiver.smac2 = [7u8; 16];

        let payload = b"hello device";
        let mac = sender.sign(payload);
        assert!(receiver.verify(payload, &mac).is_ok());
    }
}
