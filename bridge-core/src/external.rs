// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! External collaborators: the password prompt, connection-state
//! observables, and the toast/log channel. These are contracts the
//! embedding UI implements; `bridge-core` only calls through them.

use crate::types::ConnectionState;
use async_trait::async_trait;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A password buffer that is zeroed on every exit path, including error
/// returns.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// The single password-prompt slot, held by the UI. Consulted by the
/// handshake; the orchestrator clears it on teardown. Silent auto-connect
/// paths should use [`NoPrompt`] rather than calling through to a UI.
#[async_trait]
pub trait PasswordPrompt: Send + Sync {
    /// Returns `None` if the user cancels or no UI is available to prompt.
    async fn prompt(&self, device_address: &str) -> Option<SecretBytes>;
}

/// A prompt that never has a password to offer — used for silent
/// auto-connect attempts where prompting is disallowed.
pub struct NoPrompt;

#[async_trait]
impl PasswordPrompt for NoPrompt {
    async fn prompt(&self, _device_address: &str) -> Option<SecretBytes> {
        None
    }
}

/// Connection-state observables + toast/log channel, collapsed into one
/// trait since both are simple "notify the UI" sinks.
pub trait ConnectionObserver: Send + Sync {
    fn on_state_changed(&self, state: &ConnectionState) {
        let _ = state;
    }
    fn on_message(&self, message: &str) {
        let _ = message;
    }
}

/// Default observer that just logs via `tracing`, so embedders that don't
/// care about UI callbacks still get visibility.
pub struct TracingObserver;

impl ConnectionObserver for TracingObserver {
    fn on_state_changed(&self, state: &ConnectionState) {
        tracing::debug!(?state, "connection state changed");
    }
    fn on_message(&self, message: &str) {
        tracing::info!("{message}");
    }
}
