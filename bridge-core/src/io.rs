// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Glue between the raw notification byte-stream and reassembled frames.
//!
//! `FrameReader` is the one place that pulls chunks off a [`BleTransport`]
//! and feeds them to a [`Framer`], handing back whole frames one at a
//! time. It is the sole notification consumer: both the handshake's
//! one-shot waits and (indirectly, one call at a time) the operation
//! layer's replies go through the same reader, so buffered frames are
//! never dropped or duplicated.

use crate::error::{BridgeError, Result};
use crate::framer::Framer;
use crate::transport::BleTransport;
use crate::wire::Frame;
use std::collections::VecDeque;
use std::time::Duration;

pub struct FrameReader {
    framer: Framer,
    pending: VecDeque<Frame>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self { framer: Framer::new(), pending: VecDeque::new() }
    }

    /// Return the next reassembled frame, reading fresh notification
    /// chunks from `transport` as needed until `timeout` elapses.
    pub async fn next(&mut self, transport: &mut dyn BleTransport, timeout: Duration) -> Result<Frame> {
        if let Some(frame) = self.pending.pop_front() {
            return Ok(frame);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(BridgeError::Timeout("notification frame"));
            }
            match transport.await_next_notification(remaining).await {
                Some(chunk) => {
                    let frames = self.framer.push(&chunk);
                    self.pending.extend(frames);
                    if let Some(frame) = self.pending.pop_front() {
                        return Ok(frame);
                    }
                }
                None => return Err(BridgeError::Timeout("notification frame")),
            }
        }
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}
