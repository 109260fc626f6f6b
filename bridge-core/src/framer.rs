// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Reassembles arbitrary BLE notification chunks into discrete
//! `[op u8][len u16 LE][payload]` frames.
//!
//! Pure byte-to-frame transducer: owns a `FrameBuffer` accumulator and
//! nothing else. Garbage between valid frames is resynced over one byte at
//! a time rather than discarding the whole buffer, so a single corrupted
//! notification can't wedge an otherwise-healthy stream.

use crate::wire::Frame;
use consts::MAX_FRAME_LEN;

const HEADER_LEN: usize = 3;

#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a freshly-received chunk and drain every complete frame it
    /// produces, in order. Trailing partial bytes are kept for next time.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        loop {
            match self.try_take_one() {
                TakeResult::Frame(frame) => frames.push(frame),
                TakeResult::NeedMore => break,
                TakeResult::Resync => continue,
            }
        }
        frames
    }

    /// Attempt to read one frame (or resync) from the front of the buffer.
    fn try_take_one(&mut self) -> TakeResult {
        if self.buf.len() < HEADER_LEN {
            return TakeResult::NeedMore;
        }

        let len = u16::from_le_bytes([self.buf[1], self.buf[2]]) as usize;
        if len > MAX_FRAME_LEN {
            // Implausible header: advance one byte and try again from the
            // next offset rather than dropping everything buffered so far.
            self.buf.remove(0);
            return TakeResult::Resync;
        }

        let total = HEADER_LEN + len;
        if self.buf.len() < total {
            return TakeResult::NeedMore;
        }

        let op = self.buf[0];
        let payload = self.buf[HEADER_LEN..total].to_vec();
        self.buf.drain(0..total);
        TakeResult::Frame(Frame { op, payload })
    }
}

enum TakeResult {
    Frame(Frame),
    NeedMore,
    Resync,
}
