// SPDX-FileCopyrightText: 2024 Foundation Devices, Inc. <hello@foundation.xyz>
// SPDX-License-Identifier: GPL-3.0-or-later

//! Persistence for [`Preferences`]: selected dongle, layout code, toggles.
//! The orchestrator reads this on every auto-connect attempt and writes it
//! back on selection changes and the auto-disable path.

use crate::error::{BridgeError, Result};
use crate::types::Preferences;
use std::path::PathBuf;
use std::sync::Mutex;

pub trait PreferencesStore: Send + Sync {
    fn load(&self) -> Preferences;
    fn save(&self, prefs: &Preferences) -> Result<()>;
}

/// Process-local store, useful for tests and as a default when no
/// embedding application has wired up real persistence.
#[derive(Default)]
pub struct InMemoryPreferences {
    inner: Mutex<Preferences>,
}

impl PreferencesStore for InMemoryPreferences {
    fn load(&self) -> Preferences {
        self.inner.lock().expect("lock not poisoned").clone()
    }

    fn save(&self, prefs: &Preferences) -> Result<()> {
        *self.inner.lock().expect("lock not poisoned") = prefs.clone();
        Ok(())
    }
}

/// JSON-file-backed store for a real embedding application. Each `save`
/// writes the whole file; there is no partial-update path since
/// `Preferences` is small and saves are infrequent (user-driven toggles,
/// not per-frame).
pub struct FilePreferences {
    path: PathBuf,
}

impl FilePreferences {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PreferencesStore for FilePreferences {
    fn load(&self) -> Preferences {
        std::fs::read(&self.path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    fn save(&self, prefs: &Preferences) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(prefs)
            .map_err(|e| BridgeError::Config(format!("failed to serialize preferences: {e}")))?;
        std::fs::write(&self.path, bytes)
            .map_err(|e| BridgeError::Config(format!("failed to write preferences file: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_round_trips() {
        let store = InMemoryPreferences::default();
        let mut prefs = store.load();
        prefs.selected_device = Some("AA:BB".into());
        store.save(&prefs).unwrap();
        assert_eq!(store.load().selected_device, Some("AA:BB".into()));
    }

    #[test]
    fn file_backed_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!("bridge-core-prefs-test-{}.json", std::process::id()));
        let store = FilePreferences::new(&path);

        let mut prefs = store.load();
        assert_eq!(prefs.selected_device, None);
        prefs.selected_device = Some("11:22:33".into());
        prefs.layout_code = Some("US_QWERTY".into());
        store.save(&prefs).unwrap();

        let store2 = FilePreferences::new(&path);
        let reloaded = store2.load();
        assert_eq!(reloaded.selected_device, Some("11:22:33".into()));
        assert_eq!(reloaded.layout_code, Some("US_QWERTY".into()));

        let _ = std::fs::remove_file(&path);
    }
}
