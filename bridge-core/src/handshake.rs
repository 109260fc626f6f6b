// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! APPKEY provisioning (A0/A2/A3/A1) and MTLS session establishment
//! (B0/B1/B2).

use crate::crypto::{hkdf_sha256_32, hmac_sha256, hmac_sha256_truncated, pbkdf2_hmac_sha256, EphemeralKeyPair};
use crate::error::{BridgeError, HandshakeError, ProvisioningError, Result};
use crate::external::PasswordPrompt;
use crate::io::FrameReader;
use crate::keystore::KeyStore;
use crate::transport::{BleTransport, WriteType};
use crate::types::{AppKey, BridgeConfig, SessionKeys, SessionState};
use crate::wire::{Frame, OpCode};
use unicode_normalization::UnicodeNormalization;

fn reason_of(frame: &Frame) -> String {
    String::from_utf8_lossy(&frame.payload).into_owned()
}

fn normalize_password(raw: &[u8]) -> Vec<u8> {
    let text = String::from_utf8_lossy(raw);
    text.trim().nfkc().collect::<String>().into_bytes()
}

async fn send(transport: &mut dyn BleTransport, op: impl Into<u8>, payload: Vec<u8>) -> Result<()> {
    transport.write(&Frame::new(op, payload).encode(), WriteType::WithResponse).await
}

/// One A0..A1 round trip with a given password. Returns the recovered
/// APPKEY, or the classified [`ProvisioningError`] the device reported.
async fn attempt_provision(
    transport: &mut dyn BleTransport,
    reader: &mut FrameReader,
    password: &[u8],
    config: &BridgeConfig,
) -> Result<AppKey> {
    send(transport, OpCode::AppkeyRequest, Vec::new()).await?;

    let challenge = reader.next(transport, config.ack_timeout).await?;
    let (salt, iters, chal) = match challenge.opcode() {
        OpCode::AppkeyChallenge => {
            let p = &challenge.payload;
            if p.len() != 16 + 4 + 16 {
                return Err(BridgeError::Framing("malformed A2 challenge".into()));
            }
            let salt: [u8; 16] = p[0..16].try_into().unwrap();
            let iters = u32::from_le_bytes(p[16..20].try_into().unwrap());
            let chal: [u8; 16] = p[20..36].try_into().unwrap();
            (salt, iters, chal)
        }
        OpCode::Error => return Err(ProvisioningError::classify(&reason_of(&challenge)).into()),
        other => return Err(BridgeError::Protocol(format!("expected A2, got {other}"))),
    };

    let verif = pbkdf2_hmac_sha256(password, &salt, iters, 32);
    let mut proof_msg = Vec::with_capacity(6 + 16);
    proof_msg.extend_from_slice(b"APPKEY");
    proof_msg.extend_from_slice(&chal);
    let proof = hmac_sha256(&verif, &proof_msg);

    send(transport, OpCode::AppkeyProof, proof.to_vec()).await?;

    let reply = reader.next(transport, config.ack_timeout).await?;
    match reply.opcode() {
        OpCode::AppkeyReply => decode_appkey_reply(&reply.payload, &verif, &chal),
        OpCode::Error => Err(ProvisioningError::classify(&reason_of(&reply)).into()),
        other => Err(BridgeError::Protocol(format!("expected A1, got {other}"))),
    }
}

fn decode_appkey_reply(payload: &[u8], verif: &[u8], chal: &[u8; 16]) -> Result<AppKey> {
    match payload.len() {
        32 => {
            let bytes: [u8; 32] = payload.try_into().unwrap();
            Ok(AppKey::from_bytes(bytes))
        }
        48 => {
            let cipher = &payload[..32];
            let mac = &payload[32..48];

            let mut wrap_msg = Vec::with_capacity(6 + 16);
            wrap_msg.extend_from_slice(b"AKWRAP");
            wrap_msg.extend_from_slice(chal);
            let wrap_key = hmac_sha256(verif, &wrap_msg);

            let mut mac_msg = Vec::with_capacity(5 + 16 + 32);
            mac_msg.extend_from_slice(b"AKMAC");
            mac_msg.extend_from_slice(chal);
            mac_msg.extend_from_slice(cipher);
            let mac_expected: [u8; 16] = hmac_sha256_truncated(&wrap_key, &mac_msg);
            if mac_expected != mac {
                return Err(BridgeError::Crypto(crate::error::CryptoError::MacMismatch));
            }

            let mut iv_msg = Vec::with_capacity(4 + 16);
            iv_msg.extend_from_slice(b"AKIV");
            iv_msg.extend_from_slice(chal);
            let iv: [u8; 16] = hmac_sha256_truncated(verif, &iv_msg);

            let mut plaintext = cipher.to_vec();
            crate::crypto::aes128_ctr_xor(&wrap_key, &iv, &mut plaintext);
            let bytes: [u8; 32] = plaintext.try_into().unwrap();
            Ok(AppKey::from_bytes(bytes))
        }
        other => Err(BridgeError::Framing(format!("unexpected A1 payload length {other}"))),
    }
}

/// Provision an APPKEY for `device_address`, prompting at most once and
/// retrying at most once with a normalized password. Stores the key in
/// `key_store` on success.
pub async fn provision_appkey(
    transport: &mut dyn BleTransport,
    reader: &mut FrameReader,
    password_prompt: &dyn PasswordPrompt,
    device_address: &str,
    key_store: &KeyStore,
    config: &BridgeConfig,
) -> Result<()> {
    let password = password_prompt
        .prompt(device_address)
        .await
        .ok_or_else(|| BridgeError::Config("no password supplied".into()))?;

    let key = match attempt_provision(transport, reader, password.as_bytes(), config).await {
        Err(BridgeError::Provisioning(ProvisioningError::BadProof)) => {
            tracing::debug!("proof rejected, retrying once with normalized password");
            let normalized = normalize_password(password.as_bytes());
            attempt_provision(transport, reader, &normalized, config).await?
        }
        other => other?,
    };

    key_store.put(device_address, &key)
}

/// Run the MTLS session establishment (B0/B1/B2) against an already
/// BLE-connected, notification-ready transport, using a previously
/// provisioned APPKEY.
pub async fn establish_session(
    transport: &mut dyn BleTransport,
    reader: &mut FrameReader,
    appkey: &AppKey,
    config: &BridgeConfig,
) -> Result<SessionState> {
    let b0 = reader
        .next(transport, config.b0_wait_timeout)
        .await
        .map_err(|_| BridgeError::Handshake(HandshakeError::NoB0))?;
    if b0.opcode() != OpCode::ServerHello {
        return Err(BridgeError::Protocol(format!("expected B0, got {}", b0.opcode())));
    }
    if b0.payload.len() != 65 + 4 {
        return Err(BridgeError::Framing("malformed B0 server hello".into()));
    }
    let srv_pub: [u8; 65] = b0.payload[..65].try_into().unwrap();
    let sid = u32::from_be_bytes(b0.payload[65..69].try_into().unwrap());

    let keypair = EphemeralKeyPair::generate();
    let cli_pub = keypair.public_bytes();

    let mut keyx_msg = Vec::with_capacity(4 + 4 + 65 + 65);
    keyx_msg.extend_from_slice(b"KEYX");
    keyx_msg.extend_from_slice(&sid.to_be_bytes());
    keyx_msg.extend_from_slice(&srv_pub);
    keyx_msg.extend_from_slice(&cli_pub);
    let mac16: [u8; 16] = hmac_sha256_truncated(appkey.as_bytes(), &keyx_msg);

    let mut b1_payload = Vec::with_capacity(65 + 16);
    b1_payload.extend_from_slice(&cli_pub);
    b1_payload.extend_from_slice(&mac16);
    send(transport, OpCode::ClientHello, b1_payload).await?;

    let b2 = reader.next(transport, config.ack_timeout).await?;
    match b2.opcode() {
        OpCode::ServerFinish => {}
        OpCode::Error => return Err(HandshakeError::classify(&reason_of(&b2)).into()),
        other => return Err(BridgeError::Protocol(format!("expected B2, got {other}"))),
    }

    let shared = keypair.diffie_hellman(&srv_pub)?;

    let mut info = Vec::with_capacity(3 + 4 + 65 + 65);
    info.extend_from_slice(b"MT1");
    info.extend_from_slice(&sid.to_be_bytes());
    info.extend_from_slice(&srv_pub);
    info.extend_from_slice(&cli_pub);
    let session_key = hkdf_sha256_32(appkey.as_bytes(), &shared, &info);

    let k_enc = hmac_sha256(&session_key, b"ENC");
    let k_mac = hmac_sha256(&session_key, b"MAC");
    let k_iv = hmac_sha256(&session_key, b"IVK");

    let mut sfin_msg = Vec::with_capacity(4 + 4 + 65 + 65);
    sfin_msg.extend_from_slice(b"SFIN");
    sfin_msg.extend_from_slice(&sid.to_be_bytes());
    sfin_msg.extend_from_slice(&srv_pub);
    sfin_msg.extend_from_slice(&cli_pub);
    let expected: [u8; 16] = hmac_sha256_truncated(&k_mac, &sfin_msg);
    if b2.payload != expected {
        return Err(BridgeError::Handshake(HandshakeError::SfinMismatch));
    }

    Ok(SessionState::new(sid, SessionKeys { k_enc, k_mac, k_iv }))
}
