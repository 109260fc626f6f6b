// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! The high-level operation verbs built on top of the secure channel.
//! Every operation here (except [`raw_key_tap`]) assumes an
//! already-established [`SessionState`]; establishing one is the
//! orchestrator's job.

use crate::crypto::md5;
use crate::error::{BridgeError, Result};
use crate::io::FrameReader;
use crate::secure_channel::{open, seal};
use crate::transport::{BleTransport, WriteType};
use crate::types::SessionState;
use crate::wire::{Frame, OpCode};
use consts::op;
use regex::Regex;
use std::time::Duration;

async fn send_secure(
    session: &mut SessionState,
    transport: &mut dyn BleTransport,
    inner_op: u8,
    payload: &[u8],
) -> Result<()> {
    let wire = seal(session, inner_op, payload)?;
    transport.write(&wire, WriteType::WithResponse).await
}

/// Read frames until the expected inner op is recovered, skipping replayed
/// B3 frames (which `open` reports as `Ok(None)`), and surfacing an
/// unsolicited B0 as [`BridgeError::ForcedRehandshake`].
async fn read_secure_reply(
    session: &mut SessionState,
    transport: &mut dyn BleTransport,
    reader: &mut FrameReader,
    expected_inner_op: u8,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(BridgeError::Timeout("secure reply"));
        }
        let frame = reader.next(transport, remaining).await?;
        if frame.opcode() == OpCode::ServerHello {
            return Err(BridgeError::ForcedRehandshake);
        }
        match open(session, &frame, expected_inner_op)? {
            Some(payload) => return Ok(payload),
            None => continue, // replayed frame, keep waiting
        }
    }
}

/// Send a string and verify the dongle typed exactly those bytes via the
/// MD5 echo (`op_out=0xD0`, `op_in=0xD1`).
pub async fn send_string_with_integrity(
    session: &mut SessionState,
    transport: &mut dyn BleTransport,
    reader: &mut FrameReader,
    text: &str,
    append_newline: bool,
    timeout: Duration,
) -> Result<()> {
    let mut bytes = text.as_bytes().to_vec();
    if append_newline {
        bytes.push(b'\n');
    }
    let expected_md5 = md5(&bytes);

    send_secure(session, transport, op::TYPE_STRING, &bytes).await?;
    let reply = read_secure_reply(session, transport, reader, op::TYPE_RESULT, timeout).await?;

    if reply.len() != 1 + 16 {
        return Err(BridgeError::Protocol("malformed D1 reply".into()));
    }
    let status = reply[0];
    let got_md5 = &reply[1..17];

    if status == 0 && got_md5 == expected_md5 {
        Ok(())
    } else {
        Err(BridgeError::Protocol("type-string integrity check failed".into()))
    }
}

/// Get the active keyboard layout code (`C1` -> `C2`).
pub async fn get_layout(
    session: &mut SessionState,
    transport: &mut dyn BleTransport,
    reader: &mut FrameReader,
    timeout: Duration,
) -> Result<String> {
    send_secure(session, transport, op::GET_INFO, &[]).await?;
    let reply = read_secure_reply(session, transport, reader, op::INFO_TEXT, timeout).await?;
    let text = String::from_utf8(reply).map_err(|_| BridgeError::Protocol("INFO text was not valid ASCII/UTF-8".into()))?;
    if text.is_empty() {
        return Err(BridgeError::Protocol("empty INFO reply".into()));
    }

    let re = Regex::new(r"\bLAYOUT=([A-Z0-9_]+)").expect("static pattern is valid");
    re.captures(&text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| BridgeError::Protocol("INFO reply had no LAYOUT field".into()))
}

/// Set the keyboard layout (`C0` -> empty-payload ack).
pub async fn set_layout(
    session: &mut SessionState,
    transport: &mut dyn BleTransport,
    reader: &mut FrameReader,
    layout_code: &str,
    timeout: Duration,
) -> Result<()> {
    send_secure(session, transport, op::SET_LAYOUT, layout_code.as_bytes()).await?;
    let reply = read_secure_reply(session, transport, reader, op::ACK, timeout).await?;
    if !reply.is_empty() {
        return Err(BridgeError::Protocol("set-layout ack carried unexpected payload".into()));
    }
    Ok(())
}

/// Factory reset (`C4` -> ack).
pub async fn factory_reset(
    session: &mut SessionState,
    transport: &mut dyn BleTransport,
    reader: &mut FrameReader,
    timeout: Duration,
) -> Result<()> {
    send_secure(session, transport, op::FACTORY_RESET, &[]).await?;
    read_secure_reply(session, transport, reader, op::ACK, timeout).await?;
    Ok(())
}

/// Enable raw-fast key mode (`C8` with `[0x01]` -> ack). Returns
/// `Ok(())` on success; the orchestrator is responsible for setting
/// `fast_keys_enabled=true` in its observed `ConnectionState`.
pub async fn enable_raw_keys(
    session: &mut SessionState,
    transport: &mut dyn BleTransport,
    reader: &mut FrameReader,
    timeout: Duration,
) -> Result<()> {
    send_secure(session, transport, op::ENABLE_RAW_KEYS, &[0x01]).await?;
    read_secure_reply(session, transport, reader, op::ACK, timeout).await?;
    Ok(())
}

/// Single (or repeated) HID key tap. Unlike every other operation this is
/// sent as a plain framed message, *not* wrapped in a B3 envelope, to
/// minimize latency. Requires the caller to already have confirmed a
/// secure session is live and fast-keys mode is enabled.
pub async fn raw_key_tap(
    transport: &mut dyn BleTransport,
    fast_keys_enabled: bool,
    modifiers: u8,
    usage: u8,
    repeat: Option<u8>,
) -> Result<()> {
    if !fast_keys_enabled {
        return Err(BridgeError::Config("raw key tap requires fast-keys mode to be enabled".into()));
    }

    let mut payload = vec![modifiers, usage];
    if let Some(repeat) = repeat {
        if repeat == 0 {
            return Err(BridgeError::Config("repeat count must be in 1..=255".into()));
        }
        payload.push(repeat);
    }

    let wire = Frame::new(OpCode::RawKeyTap, payload).encode();
    transport.write(&wire, WriteType::WithoutResponse).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockDongle, MockTransport};
    use crate::types::SessionKeys;

    fn session_pair() -> (SessionState, SessionState) {
        let keys = SessionKeys { k_enc: [4u8; 32], k_mac: [5u8; 32], k_iv: [6u8; 32] };
        (SessionState::new(42, keys.clone()), SessionState::new(42, keys))
    }

    #[tokio::test]
    async fn type_string_succeeds_on_matching_md5() {
        let (mut client_session, mut device_session) = session_pair();
        let dongle = MockDongle::default();
        let mut transport = MockTransport::new(dongle.clone());
        let mut reader = FrameReader::new();

        // Simulate the device: decode the D0 it receives, compute the D1 reply.
        let expected = md5(b"hello");
        let mut reply_payload = vec![0u8];
        reply_payload.extend_from_slice(&expected);
        let wire_reply = seal(&mut device_session, op::TYPE_RESULT, &reply_payload).unwrap();
        dongle.push_notification(wire_reply);

        let result = send_string_with_integrity(&mut client_session, &mut transport, &mut reader, "hello", false, Duration::from_secs(1)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn type_string_fails_on_md5_mismatch() {
        let (mut client_session, mut device_session) = session_pair();
        let dongle = MockDongle::default();
        let mut transport = MockTransport::new(dongle.clone());
        let mut reader = FrameReader::new();

        let mut reply_payload = vec![0u8];
        reply_payload.extend_from_slice(&[0xAAu8; 16]); // wrong md5
        let wire_reply = seal(&mut device_session, op::TYPE_RESULT, &reply_payload).unwrap();
        dongle.push_notification(wire_reply);

        let result = send_string_with_integrity(&mut client_session, &mut transport, &mut reader, "hello", false, Duration::from_secs(1)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn get_layout_extracts_layout_field() {
        let (mut client_session, mut device_session) = session_pair();
        let dongle = MockDongle::default();
        let mut transport = MockTransport::new(dongle.clone());
        let mut reader = FrameReader::new();

        let info = b"FW=1.2.3; LAYOUT=US_QWERTY; BAT=90".to_vec();
        let wire_reply = seal(&mut device_session, op::INFO_TEXT, &info).unwrap();
        dongle.push_notification(wire_reply);

        let layout = get_layout(&mut client_session, &mut transport, &mut reader, Duration::from_secs(1)).await.unwrap();
        assert_eq!(layout, "US_QWERTY");
    }

    #[tokio::test]
    async fn raw_key_tap_requires_fast_keys_enabled() {
        let dongle = MockDongle::default();
        let mut transport = MockTransport::new(dongle.clone());
        let result = raw_key_tap(&mut transport, false, 0, 0x04, None).await;
        assert!(result.is_err());

        raw_key_tap(&mut transport, true, 0, 0x04, Some(3)).await.unwrap();
        assert_eq!(dongle.writes().len(), 1);
    }

    #[tokio::test]
    async fn forced_rehandshake_surfaces_as_distinct_error() {
        let (mut client_session, _device_session) = session_pair();
        let dongle = MockDongle::default();
        let mut transport = MockTransport::new(dongle.clone());
        let mut reader = FrameReader::new();

        dongle.push_notification(Frame::new(OpCode::ServerHello, vec![0u8; 69]).encode());

        let result = send_string_with_integrity(&mut client_session, &mut transport, &mut reader, "hi", false, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BridgeError::ForcedRehandshake)));
    }
}
