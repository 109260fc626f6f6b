// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! End-to-end scenarios driving the orchestrator against a simulated
//! dongle over the in-memory mock transport.

use bridge_core::crypto::{hkdf_sha256_32, hmac_sha256, hmac_sha256_truncated, pbkdf2_hmac_sha256, EphemeralKeyPair};
use bridge_core::external::{NoPrompt, PasswordPrompt, SecretBytes, TracingObserver};
use bridge_core::keystore::KeyStore;
use bridge_core::preferences::InMemoryPreferences;
use bridge_core::secure_channel::seal;
use bridge_core::transport::mock::{MockDongle, MockTransport};
use bridge_core::types::{AppKey, BridgeConfig, DongleIdentity, SessionState};
use bridge_core::wire::{Frame, OpCode};
use bridge_core::{ConnectState, Orchestrator};
use std::time::Duration;

struct StaticPrompt(Vec<u8>);

#[async_trait::async_trait]
impl PasswordPrompt for StaticPrompt {
    async fn prompt(&self, _device_address: &str) -> Option<SecretBytes> {
        Some(SecretBytes::new(self.0.clone()))
    }
}

fn new_orchestrator(dongle: MockDongle) -> Orchestrator {
    Orchestrator::new(
        Box::new(MockTransport::new(dongle)),
        KeyStore::in_memory(),
        Box::new(InMemoryPreferences::default()),
        Box::new(TracingObserver),
        BridgeConfig::default(),
    )
}

/// Push a valid B0 and spawn a task that watches for the client's B1 write
/// and replies with a correctly-derived B2, exactly mirroring the MTLS
/// math the device side performs.
fn simulate_server_hello_and_finish(dongle: MockDongle, appkey_bytes: [u8; 32], sid: u32) -> tokio::task::JoinHandle<()> {
    let server_kp = EphemeralKeyPair::generate();
    let srv_pub = server_kp.public_bytes();
    let mut b0_payload = Vec::new();
    b0_payload.extend_from_slice(&srv_pub);
    b0_payload.extend_from_slice(&sid.to_be_bytes());
    dongle.push_notification(Frame::new(OpCode::ServerHello, b0_payload).encode());

    tokio::spawn(async move {
        loop {
            let writes = dongle.writes();
            if let Some(b1_bytes) = writes.iter().rev().find(|w| w.first() == Some(&0xB1)) {
                let payload = &b1_bytes[3..];
                let cli_pub: [u8; 65] = payload[..65].try_into().unwrap();

                let shared = server_kp.diffie_hellman(&cli_pub).unwrap();
                let mut info = Vec::new();
                info.extend_from_slice(b"MT1");
                info.extend_from_slice(&sid.to_be_bytes());
                info.extend_from_slice(&srv_pub);
                info.extend_from_slice(&cli_pub);
                let session_key = hkdf_sha256_32(&appkey_bytes, &shared, &info);
                let k_mac = hmac_sha256(&session_key, b"MAC");

                let mut sfin_msg = Vec::new();
                sfin_msg.extend_from_slice(b"SFIN");
                sfin_msg.extend_from_slice(&sid.to_be_bytes());
                sfin_msg.extend_from_slice(&srv_pub);
                sfin_msg.extend_from_slice(&cli_pub);
                let mac: [u8; 16] = hmac_sha256_truncated(&k_mac, &sfin_msg);

                dongle.push_notification(Frame::new(OpCode::ServerFinish, mac.to_vec()).encode());
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
}

fn device_a1_wrapped(password: &[u8], salt: [u8; 16], iters: u32, chal: [u8; 16], key32: [u8; 32]) -> Vec<u8> {
    let verif = pbkdf2_hmac_sha256(password, &salt, iters, 32);
    let mut wrap_msg = Vec::new();
    wrap_msg.extend_from_slice(b"AKWRAP");
    wrap_msg.extend_from_slice(&chal);
    let wrap_key = hmac_sha256(&verif, &wrap_msg);

    let mut plaintext = key32;
    let mut iv_msg = Vec::new();
    iv_msg.extend_from_slice(b"AKIV");
    iv_msg.extend_from_slice(&chal);
    let iv: [u8; 16] = hmac_sha256_truncated(&verif, &iv_msg);
    bridge_core::crypto::aes128_ctr_xor(&wrap_key, &iv, &mut plaintext);
    let cipher = plaintext;

    let mut mac_msg = Vec::new();
    mac_msg.extend_from_slice(b"AKMAC");
    mac_msg.extend_from_slice(&chal);
    mac_msg.extend_from_slice(&cipher);
    let mac: [u8; 16] = hmac_sha256_truncated(&wrap_key, &mac_msg);

    [cipher.to_vec(), mac.to_vec()].concat()
}

#[tokio::test]
async fn scenario_1_cold_start_provisioned_device_happy_path() {
    let dongle = MockDongle::default();
    let appkey = [11u8; 32];
    let ks = KeyStore::in_memory();
    ks.put("dongle-1", &AppKey::from_bytes(appkey)).unwrap();
    let mut orch = Orchestrator::new(
        Box::new(MockTransport::new(dongle.clone())),
        ks,
        Box::new(InMemoryPreferences::default()),
        Box::new(TracingObserver),
        BridgeConfig::default(),
    );

    let sid = 0xAABBCCDDu32;
    let server = simulate_server_hello_and_finish(dongle.clone(), appkey, sid);

    orch.connect("dongle-1", false, &NoPrompt).await.unwrap();
    server.await.unwrap();
    assert_eq!(orch.connect_state(), ConnectState::Secure);
    assert!(orch.connection_state().secure_up);

    // Now drive a type-string round trip, with the "device" computing the
    // MD5 echo over a session mirrored from the client's established keys.
    let established = orch.session().unwrap().clone();
    let mut device_session = SessionState::new(established.sid, established.keys.clone());

    let expected_md5 = bridge_core::crypto::md5(b"hello");
    let mut reply_payload = vec![0u8];
    reply_payload.extend_from_slice(&expected_md5);
    let wire_reply = seal(&mut device_session, consts::op::TYPE_RESULT, &reply_payload).unwrap();
    dongle.push_notification(wire_reply);

    orch.type_string("hello", false, Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn scenario_2_fresh_device_provisioning_then_handshake() {
    let dongle = MockDongle::default();
    let mut orch = new_orchestrator(dongle.clone());

    let salt = [1u8; 16];
    let iters = 10_000u32;
    let chal = [2u8; 16];
    let appkey = [9u8; 32];

    let mut a2 = Vec::new();
    a2.extend_from_slice(&salt);
    a2.extend_from_slice(&iters.to_le_bytes());
    a2.extend_from_slice(&chal);
    dongle.push_notification(Frame::new(OpCode::AppkeyChallenge, a2).encode());
    let wrapped = device_a1_wrapped(b"pw", salt, iters, chal, appkey);
    dongle.push_notification(Frame::new(OpCode::AppkeyReply, wrapped).encode());

    let sid = 0x11223344u32;
    let server = simulate_server_hello_and_finish(dongle.clone(), appkey, sid);
    let prompt = StaticPrompt(b"pw".to_vec());

    orch.connect("fresh-dongle", true, &prompt).await.unwrap();
    server.await.unwrap();

    assert_eq!(orch.connect_state(), ConnectState::Secure);
}

#[tokio::test]
async fn scenario_3_wrong_password_then_normalized_retry_succeeds() {
    let dongle = MockDongle::default();
    let mut orch = new_orchestrator(dongle.clone());

    let salt = [3u8; 16];
    let iters = 100u32;
    let chal = [4u8; 16];
    let appkey = [7u8; 32];

    let mut a2 = Vec::new();
    a2.extend_from_slice(&salt);
    a2.extend_from_slice(&iters.to_le_bytes());
    a2.extend_from_slice(&chal);
    dongle.push_notification(Frame::new(OpCode::AppkeyChallenge, a2.clone()).encode());
    dongle.push_notification(Frame::new(OpCode::Error, b"bad proof".to_vec()).encode());
    dongle.push_notification(Frame::new(OpCode::AppkeyChallenge, a2).encode());
    let wrapped = device_a1_wrapped(b"pw", salt, iters, chal, appkey);
    dongle.push_notification(Frame::new(OpCode::AppkeyReply, wrapped).encode());

    let sid = 0x55667788u32;
    let server = simulate_server_hello_and_finish(dongle.clone(), appkey, sid);
    let prompt = StaticPrompt(b" pw\n".to_vec());

    orch.connect("dongle-3", true, &prompt).await.unwrap();
    server.await.unwrap();

    assert_eq!(orch.connect_state(), ConnectState::Secure);
}

#[tokio::test]
async fn scenario_4_replayed_frame_is_silently_dropped() {
    let dongle = MockDongle::default();
    let ks = KeyStore::in_memory();
    let appkey = [13u8; 32];
    ks.put("dongle-4", &AppKey::from_bytes(appkey)).unwrap();
    let mut orch = Orchestrator::new(
        Box::new(MockTransport::new(dongle.clone())),
        ks,
        Box::new(InMemoryPreferences::default()),
        Box::new(TracingObserver),
        BridgeConfig::default(),
    );

    let sid = 0xDEADBEEFu32;
    let server = simulate_server_hello_and_finish(dongle.clone(), appkey, sid);
    orch.connect("dongle-4", false, &NoPrompt).await.unwrap();
    server.await.unwrap();

    let established = orch.session().unwrap().clone();
    let mut device_session = SessionState::new(established.sid, established.keys.clone());
    let reply = seal(&mut device_session, consts::op::ACK, &[]).unwrap();

    // First delivery is consumed by set_layout's ack wait.
    dongle.push_notification(reply.clone());
    orch.set_layout("US_QWERTY", Duration::from_secs(1)).await.unwrap();
    let seq_in_after_first = orch.session().unwrap().seq_in;

    // Replay the exact same encrypted frame; the read should time out
    // rather than accept it, and seq_in must not advance. A replay is not
    // an abandonment condition: the session and ConnectState must survive.
    dongle.push_notification(reply);
    let result = orch.set_layout("US_QWERTY", Duration::from_millis(50)).await;
    assert!(result.is_err());
    assert_eq!(orch.session().unwrap().seq_in, seq_in_after_first);
    assert_eq!(orch.connect_state(), ConnectState::Secure);
    assert!(orch.connection_state().secure_up);
}

#[tokio::test]
async fn scenario_7_mac_mismatch_abandons_session_and_forces_rehandshake() {
    let dongle = MockDongle::default();
    let ks = KeyStore::in_memory();
    let appkey = [14u8; 32];
    ks.put("dongle-7", &AppKey::from_bytes(appkey)).unwrap();
    let mut orch = Orchestrator::new(
        Box::new(MockTransport::new(dongle.clone())),
        ks,
        Box::new(InMemoryPreferences::default()),
        Box::new(TracingObserver),
        BridgeConfig::default(),
    );

    let sid = 0xC0FFEEu32;
    let server = simulate_server_hello_and_finish(dongle.clone(), appkey, sid);
    orch.connect("dongle-7", false, &NoPrompt).await.unwrap();
    server.await.unwrap();

    let established = orch.session().unwrap().clone();
    let mut device_session = SessionState::new(established.sid, established.keys.clone());
    let mut reply = seal(&mut device_session, consts::op::ACK, &[]).unwrap();
    let last = reply.len() - 1;
    reply[last] ^= 0x01; // flip a MAC byte
    dongle.push_notification(reply);

    let result = orch.set_layout("US_QWERTY", Duration::from_millis(50)).await;
    assert!(result.is_err());
    assert!(orch.session().is_none());
    assert!(!orch.connection_state().secure_up);
    assert!(!orch.connection_state().fast_keys_enabled);
    assert_eq!(orch.connect_state(), ConnectState::Idle);
}

#[tokio::test]
async fn scenario_8_unsolicited_server_hello_abandons_session_and_forces_rehandshake() {
    let dongle = MockDongle::default();
    let ks = KeyStore::in_memory();
    let appkey = [15u8; 32];
    ks.put("dongle-8", &AppKey::from_bytes(appkey)).unwrap();
    let mut orch = Orchestrator::new(
        Box::new(MockTransport::new(dongle.clone())),
        ks,
        Box::new(InMemoryPreferences::default()),
        Box::new(TracingObserver),
        BridgeConfig::default(),
    );

    let sid = 0xFACEu32;
    let server = simulate_server_hello_and_finish(dongle.clone(), appkey, sid);
    orch.connect("dongle-8", false, &NoPrompt).await.unwrap();
    server.await.unwrap();

    // A fresh, unsolicited B0 mid-session signals the device restarted its
    // side of the handshake; this must abandon the stale session rather
    // than be parsed as a reply to whatever we just sent.
    dongle.push_notification(Frame::new(OpCode::ServerHello, vec![0u8; 69]).encode());

    let result = orch.get_layout(Duration::from_millis(50)).await;
    assert!(result.is_err());
    assert!(orch.session().is_none());
    assert!(!orch.connection_state().secure_up);
    assert_eq!(orch.connect_state(), ConnectState::Idle);
}

#[tokio::test]
async fn scenario_5_badmac_triggers_reprovisioning_and_recovers() {
    let dongle = MockDongle::default();
    let ks = KeyStore::in_memory();
    // Store a stale/incorrect APPKEY so the first handshake gets BADMAC.
    ks.put("dongle-5", &AppKey::from_bytes([0xFFu8; 32])).unwrap();
    let mut orch = Orchestrator::new(
        Box::new(MockTransport::new(dongle.clone())),
        ks,
        Box::new(InMemoryPreferences::default()),
        Box::new(TracingObserver),
        BridgeConfig::default(),
    );

    let sid = 0x1;
    let server_kp = EphemeralKeyPair::generate();
    let srv_pub = server_kp.public_bytes();
    let mut b0_payload = Vec::new();
    b0_payload.extend_from_slice(&srv_pub);
    b0_payload.extend_from_slice(&sid.to_be_bytes());
    dongle.push_notification(Frame::new(OpCode::ServerHello, b0_payload).encode());
    // Device rejects the (wrong) client MAC derived from the stale key.
    dongle.push_notification(Frame::new(OpCode::Error, b"BADMAC".to_vec()).encode());

    // Re-provisioning round trip, then a correct handshake.
    let salt = [5u8; 16];
    let iters = 500u32;
    let chal = [6u8; 16];
    let correct_appkey = [21u8; 32];
    let mut a2 = Vec::new();
    a2.extend_from_slice(&salt);
    a2.extend_from_slice(&iters.to_le_bytes());
    a2.extend_from_slice(&chal);
    dongle.push_notification(Frame::new(OpCode::AppkeyChallenge, a2).encode());
    let wrapped = device_a1_wrapped(b"correct-pw", salt, iters, chal, correct_appkey);
    dongle.push_notification(Frame::new(OpCode::AppkeyReply, wrapped).encode());

    let sid2 = 0x2;
    let server = simulate_server_hello_and_finish(dongle.clone(), correct_appkey, sid2);
    let prompt = StaticPrompt(b"correct-pw".to_vec());

    orch.connect("dongle-5", true, &prompt).await.unwrap();
    server.await.unwrap();

    assert_eq!(orch.connect_state(), ConnectState::Secure);
}

#[tokio::test]
async fn scenario_6_fast_path_failure_falls_back_to_the_responding_candidate() {
    let dongle_a = MockDongle::default(); // never sends B0: primary A is unreachable
    let dongle_b = MockDongle::default();
    dongle_b.set_rssi("B", -60);

    let ks = KeyStore::in_memory();
    let appkey_a = [1u8; 32];
    let appkey_b = [2u8; 32];
    ks.put("A", &AppKey::from_bytes(appkey_a)).unwrap();
    ks.put("B", &AppKey::from_bytes(appkey_b)).unwrap();

    let mut registry = std::collections::HashMap::new();
    registry.insert("A".to_string(), dongle_a.clone());
    registry.insert("B".to_string(), dongle_b.clone());
    let transport = MockTransport::with_candidates(dongle_a.clone(), registry);

    let prefs = InMemoryPreferences::default();
    {
        use bridge_core::preferences::PreferencesStore;
        let mut p = prefs.load();
        p.selected_device = Some("A".to_string());
        prefs.save(&p).unwrap();
    }

    let mut cfg = BridgeConfig::default();
    cfg.b0_wait_timeout = Duration::from_millis(50);

    let mut orch = Orchestrator::new(Box::new(transport), ks, Box::new(prefs), Box::new(TracingObserver), cfg);

    let sid_b = 0x9;
    let server = simulate_server_hello_and_finish(dongle_b.clone(), appkey_b, sid_b);

    let candidates = vec![DongleIdentity::new("A"), DongleIdentity::new("B")];
    let new_primary = orch.auto_connect(&candidates).await.unwrap();
    server.await.unwrap();

    assert_eq!(new_primary, "B");
    assert_eq!(orch.connect_state(), ConnectState::Secure);
}
