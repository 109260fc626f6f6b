// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire op-codes and the outer frame shape.
//!
//! `OpCode` mirrors `consts::op` as a typed enum so match arms elsewhere in
//! the crate are exhaustive-checked by the compiler instead of relying on
//! raw `u8` comparisons.

/// A single outer-frame op-code. `TryFrom<u8>` is partial: unknown bytes are
/// not a framing error (the Framer doesn't interpret ops), only operation
/// dispatch rejects them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    AppkeyRequest,
    AppkeyChallenge,
    AppkeyProof,
    AppkeyReply,
    ServerHello,
    ClientHello,
    ServerFinish,
    SecureEnvelope,
    SetLayout,
    GetInfo,
    InfoText,
    FactoryReset,
    EnableRawKeys,
    TypeString,
    TypeResult,
    RawKeyTap,
    Ack,
    Error,
    Unknown(u8),
}

impl From<u8> for OpCode {
    fn from(byte: u8) -> Self {
        use consts::op::*;
        match byte {
            b if b == APPKEY_REQUEST => Self::AppkeyRequest,
            b if b == APPKEY_CHALLENGE => Self::AppkeyChallenge,
            b if b == APPKEY_PROOF => Self::AppkeyProof,
            b if b == APPKEY_REPLY => Self::AppkeyReply,
            b if b == SERVER_HELLO => Self::ServerHello,
            b if b == CLIENT_HELLO => Self::ClientHello,
            b if b == SERVER_FINISH => Self::ServerFinish,
            b if b == SECURE_ENVELOPE => Self::SecureEnvelope,
            b if b == SET_LAYOUT => Self::SetLayout,
            b if b == GET_INFO => Self::GetInfo,
            b if b == INFO_TEXT => Self::InfoText,
            b if b == FACTORY_RESET => Self::FactoryReset,
            b if b == ENABLE_RAW_KEYS => Self::EnableRawKeys,
            b if b == TYPE_STRING => Self::TypeString,
            b if b == TYPE_RESULT => Self::TypeResult,
            b if b == RAW_KEY_TAP => Self::RawKeyTap,
            b if b == ACK => Self::Ack,
            b if b == ERROR => Self::Error,
            other => Self::Unknown(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        use consts::op::*;
        match op {
            OpCode::AppkeyRequest => APPKEY_REQUEST,
            OpCode::AppkeyChallenge => APPKEY_CHALLENGE,
            OpCode::AppkeyProof => APPKEY_PROOF,
            OpCode::AppkeyReply => APPKEY_REPLY,
            OpCode::ServerHello => SERVER_HELLO,
            OpCode::ClientHello => CLIENT_HELLO,
            OpCode::ServerFinish => SERVER_FINISH,
            OpCode::SecureEnvelope => SECURE_ENVELOPE,
            OpCode::SetLayout => SET_LAYOUT,
            OpCode::GetInfo => GET_INFO,
            OpCode::InfoText => INFO_TEXT,
            OpCode::FactoryReset => FACTORY_RESET,
            OpCode::EnableRawKeys => ENABLE_RAW_KEYS,
            OpCode::TypeString => TYPE_STRING,
            OpCode::TypeResult => TYPE_RESULT,
            OpCode::RawKeyTap => RAW_KEY_TAP,
            OpCode::Ack => ACK,
            OpCode::Error => ERROR,
            OpCode::Unknown(b) => b,
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}", u8::from(*self))
    }
}

/// A reassembled outer frame: `[op u8][len u16 LE][payload]` with the
/// header already stripped. Semantic interpretation is the caller's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub op: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(op: impl Into<u8>, payload: Vec<u8>) -> Self {
        Self { op: op.into(), payload }
    }

    pub fn opcode(&self) -> OpCode {
        OpCode::from(self.op)
    }

    /// Serialize as `[op][len LE][payload]` for writing to the transport.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + self.payload.len());
        out.push(self.op);
        out.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Encode an inner application frame `[op u8][len u16 LE][payload]`, used
/// both as the plaintext wrapped by the secure channel and for the
/// unwrapped-on-the-wire raw key tap.
pub fn encode_inner(op: u8, payload: &[u8]) -> Vec<u8> {
    Frame::new(op, payload.to_vec()).encode()
}

/// Decode a single inner frame from an exact-length buffer (no resync: the
/// buffer is expected to already be an exact inner frame, e.g. the
/// plaintext recovered from a B3 envelope).
pub fn decode_inner(buf: &[u8]) -> Option<Frame> {
    if buf.len() < 3 {
        return None;
    }
    let op = buf[0];
    let len = u16::from_le_bytes([buf[1], buf[2]]) as usize;
    if buf.len() != 3 + len {
        return None;
    }
    Some(Frame { op, payload: buf[3..].to_vec() })
}
