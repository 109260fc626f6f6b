// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! The B3 secure envelope: wraps/unwraps inner application frames with
//! per-direction sequence counters, deterministic IVs, and MAC
//! verification.

use crate::crypto::{aes128_ctr_xor, hmac_sha256_truncated};
use crate::error::{BridgeError, CryptoError, Result};
use crate::types::SessionState;
use crate::wire::{decode_inner, encode_inner, Frame, OpCode};
use consts::{op, MAC_LEN};

const DIR_CLIENT: u8 = b'C';
const DIR_SERVER: u8 = b'S';

fn derive_iv(k_iv: &[u8; 32], sid: u32, direction: u8, seq: u16) -> [u8; 16] {
    let mut msg = Vec::with_capacity(4 + 4 + 1 + 2);
    msg.extend_from_slice(b"IV1");
    msg.extend_from_slice(&sid.to_be_bytes());
    msg.push(direction);
    msg.extend_from_slice(&seq.to_be_bytes());
    hmac_sha256_truncated(k_iv, &msg)
}

fn derive_mac(k_mac: &[u8; 32], sid: u32, direction: u8, seq: u16, cipher: &[u8]) -> [u8; MAC_LEN] {
    let mut msg = Vec::with_capacity(4 + 4 + 1 + 2 + cipher.len());
    msg.extend_from_slice(b"ENCM");
    msg.extend_from_slice(&sid.to_be_bytes());
    msg.push(direction);
    msg.extend_from_slice(&seq.to_be_bytes());
    msg.extend_from_slice(cipher);
    hmac_sha256_truncated(k_mac, &msg)
}

/// Encrypt `inner_op`/`payload` as a complete outer B3 frame (wire bytes),
/// advancing `session.seq_out`. Abandons (returns an error and does not
/// mutate sequence) rather than reuse an IV at the 0xFFFF boundary.
pub fn seal(session: &mut SessionState, inner_op: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if session.seq_out == SessionState::MAX_SEQ {
        return Err(BridgeError::Crypto(CryptoError::SequenceWrap));
    }

    let seq = session.seq_out;
    let inner = encode_inner(inner_op, payload);

    let iv = derive_iv(&session.keys.k_iv, session.sid, DIR_CLIENT, seq);
    let mut cipher = inner;
    aes128_ctr_xor(&session.keys.k_enc, &iv, &mut cipher);

    let mac = derive_mac(&session.keys.k_mac, session.sid, DIR_CLIENT, seq, &cipher);

    let mut outer_payload = Vec::with_capacity(2 + 2 + cipher.len() + MAC_LEN);
    outer_payload.extend_from_slice(&seq.to_be_bytes());
    outer_payload.extend_from_slice(&(cipher.len() as u16).to_be_bytes());
    outer_payload.extend_from_slice(&cipher);
    outer_payload.extend_from_slice(&mac);

    session.seq_out = session.seq_out.wrapping_add(1);

    Ok(Frame { op: op::SECURE_ENVELOPE, payload: outer_payload }.encode())
}

/// Unwrap a `0xB3` frame, verifying replay protection and the MAC, and
/// return the inner payload only if the inner op matches `expected_inner_op`.
///
/// Any MAC mismatch is a hard session-abandoning error (the caller must
/// drop `SessionState`); a sequence mismatch is a silent drop (replay) that
/// does not advance `seq_in` and does not abandon the session.
pub fn open(session: &mut SessionState, frame: &Frame, expected_inner_op: u8) -> Result<Option<Vec<u8>>> {
    if frame.opcode() != OpCode::SecureEnvelope {
        return Err(BridgeError::Protocol(format!("expected B3 envelope, got {}", frame.opcode())));
    }
    if frame.payload.len() < 2 + 2 + MAC_LEN {
        return Err(BridgeError::Framing("B3 payload too short".into()));
    }

    let seq = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
    let clen = u16::from_be_bytes([frame.payload[2], frame.payload[3]]) as usize;
    let rest = &frame.payload[4..];
    if rest.len() != clen + MAC_LEN {
        return Err(BridgeError::Framing("B3 length fields inconsistent with payload".into()));
    }
    let cipher = &rest[..clen];
    let mac = &rest[clen..];

    if seq != session.seq_in {
        tracing::debug!(seq, expected = session.seq_in, "dropping replayed/reordered B3 frame");
        return Ok(None);
    }

    let expected_mac = derive_mac(&session.keys.k_mac, session.sid, DIR_SERVER, seq, cipher);
    if mac != expected_mac {
        tracing::warn!("B3 MAC mismatch, abandoning session");
        return Err(BridgeError::Crypto(CryptoError::MacMismatch));
    }

    let iv = derive_iv(&session.keys.k_iv, session.sid, DIR_SERVER, seq);
    let mut plaintext = cipher.to_vec();
    aes128_ctr_xor(&session.keys.k_enc, &iv, &mut plaintext);

    let inner = decode_inner(&plaintext)
        .ok_or_else(|| BridgeError::Crypto(CryptoError::DecryptSizeMismatch))?;

    session.seq_in = session.seq_in.wrapping_add(1);

    if inner.op != expected_inner_op {
        return Err(BridgeError::Protocol(format!(
            "unexpected inner op {:#04x}, expected {:#04x}",
            inner.op, expected_inner_op
        )));
    }

    Ok(Some(inner.payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SessionKeys;

    fn paired_sessions() -> (SessionState, SessionState) {
        let keys = SessionKeys { k_enc: [1u8; 32], k_mac: [2u8; 32], k_iv: [3u8; 32] };
        (SessionState::new(0x1234_5678, keys.clone()), SessionState::new(0x1234_5678, keys))
    }

    #[test]
    fn honest_round_trip_preserves_payload_and_advances_sequence() {
        let (mut sender, mut receiver) = paired_sessions();
        let wire = seal(&mut sender, 0xD0, b"hello world").unwrap();
        let frame = crate::framer::Framer::new().push(&wire).remove(0);
        let got = open(&mut receiver, &frame, 0xD0).unwrap().unwrap();
        assert_eq!(got, b"hello world");
        assert_eq!(sender.seq_out, receiver.seq_in);
    }

    #[test]
    fn replay_is_rejected_without_advancing_seq_in() {
        let (mut sender, mut receiver) = paired_sessions();
        let wire = seal(&mut sender, 0xD0, b"once").unwrap();
        let frame = crate::framer::Framer::new().push(&wire).remove(0);
        open(&mut receiver, &frame, 0xD0).unwrap();
        let seq_in_after_first = receiver.seq_in;

        // Replay the exact same frame.
        let result = open(&mut receiver, &frame, 0xD0).unwrap();
        assert!(result.is_none());
        assert_eq!(receiver.seq_in, seq_in_after_first);
    }

    #[test]
    fn flipped_mac_bit_is_rejected_and_would_abandon_session() {
        let (mut sender, mut receiver) = paired_sessions();
        let wire = seal(&mut sender, 0xD0, b"tamper me").unwrap();
        let mut frame = crate::framer::Framer::new().push(&wire).remove(0);
        let last = frame.payload.len() - 1;
        frame.payload[last] ^= 0x01;

        let result = open(&mut receiver, &frame, 0xD0);
        assert!(matches!(result, Err(BridgeError::Crypto(CryptoError::MacMismatch))));
    }

    #[test]
    fn flipped_cipher_bit_is_rejected() {
        let (mut sender, mut receiver) = paired_sessions();
        let wire = seal(&mut sender, 0xD0, b"tamper me too").unwrap();
        let mut frame = crate::framer::Framer::new().push(&wire).remove(0);
        frame.payload[4] ^= 0x01; // first byte of ciphertext
        let result = open(&mut receiver, &frame, 0xD0);
        assert!(matches!(result, Err(BridgeError::Crypto(CryptoError::MacMismatch))));
    }

    #[test]
    fn sending_at_max_seq_abandons_rather_than_wraps() {
        let (mut sender, _receiver) = paired_sessions();
        sender.seq_out = SessionState::MAX_SEQ;
        let result = seal(&mut sender, 0xD0, b"nope");
        assert!(matches!(result, Err(BridgeError::Crypto(CryptoError::SequenceWrap))));
        assert_eq!(sender.seq_out, SessionState::MAX_SEQ, "sequence must not advance on abandonment");
    }
}
