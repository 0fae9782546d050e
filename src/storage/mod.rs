//! Persistent State
//!
//! Two files under the data directory, both ChaCha20-Poly1305 encrypted
//! at rest under a master key the host keystore supplies: the identity
//! file (signing + noise static secrets) and the settings file (nickname,
//! last rotation state, power profile). Panic wipe deletes both and the
//! next start re-initializes with fresh keys.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use log::{info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::crypto::Identity;
use crate::PowerProfile;

const IDENTITY_FILE: &str = "identity.bin";
const SETTINGS_FILE: &str = "settings.json";

/// 12-byte AEAD nonce prefixed to every sealed file.
const NONCE_SIZE: usize = 12;

/// Settings persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub nickname: String,
    /// Hex of the last ephemeral peer ID put on the wire.
    pub last_ephemeral_id: Option<String>,
    /// Milliseconds since epoch of the last observed rotation bucket.
    pub last_rotation_time: u64,
    pub power_profile: PowerProfile,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            nickname: "anonymous".to_string(),
            last_ephemeral_id: None,
            last_rotation_time: 0,
            power_profile: PowerProfile::Balanced,
        }
    }
}

/// Encrypted-at-rest file store.
pub struct StateStore {
    dir: PathBuf,
    master_key: [u8; 32],
}

impl StateStore {
    pub fn new(dir: impl AsRef<Path>, master_key: [u8; 32]) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;
        Ok(Self { dir, master_key })
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.master_key)
            .context("master key rejected")?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| anyhow::anyhow!("encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            bail!("sealed file too short");
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&self.master_key)
            .context("master key rejected")?;
        cipher
            .decrypt(Nonce::from_slice(&data[..NONCE_SIZE]), &data[NONCE_SIZE..])
            .map_err(|_| anyhow::anyhow!("decryption failed; wrong master key or tampered file"))
    }

    fn identity_path(&self) -> PathBuf {
        self.dir.join(IDENTITY_FILE)
    }

    fn settings_path(&self) -> PathBuf {
        self.dir.join(SETTINGS_FILE)
    }

    /// Load the identity, generating and persisting a fresh one when the
    /// file does not exist. A present-but-unreadable file is an error:
    /// starting with silently regenerated keys would orphan every
    /// existing session.
    pub fn load_or_create_identity(&self) -> Result<Identity> {
        let path = self.identity_path();
        if path.exists() {
            let sealed = fs::read(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let plaintext = self.open(&sealed)?;
            if plaintext.len() != 64 {
                bail!("identity file has unexpected length {}", plaintext.len());
            }
            let identity = Identity::from_bytes(&plaintext[..32], &plaintext[32..])
                .map_err(|err| anyhow::anyhow!("{err}"))?;
            info!("loaded identity {}", identity.fingerprint());
            return Ok(identity);
        }

        let identity = Identity::generate();
        self.save_identity(&identity)?;
        info!("generated fresh identity {}", identity.fingerprint());
        Ok(identity)
    }

    pub fn save_identity(&self, identity: &Identity) -> Result<()> {
        let mut plaintext = Vec::with_capacity(64);
        plaintext.extend_from_slice(identity.signing_secret_bytes().as_ref());
        plaintext.extend_from_slice(identity.noise_secret_bytes().as_ref());
        let sealed = self.seal(&plaintext)?;
        fs::write(self.identity_path(), sealed)
            .with_context(|| format!("writing {}", self.identity_path().display()))
    }

    pub fn load_settings(&self) -> Settings {
        let path = self.settings_path();
        let Ok(sealed) = fs::read(&path) else {
            return Settings::default();
        };
        match self
            .open(&sealed)
            .and_then(|bytes| serde_json::from_slice(&bytes).context("settings parse"))
        {
            Ok(settings) => settings,
            Err(err) => {
                warn!("settings unreadable ({}); using defaults", err);
                Settings::default()
            }
        }
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(settings).context("settings serialize")?;
        let sealed = self.seal(&bytes)?;
        fs::write(self.settings_path(), sealed)
            .with_context(|| format!("writing {}", self.settings_path().display()))
    }

    /// Delete both files. The caller re-initializes the core afterwards,
    /// which generates fresh keys.
    pub fn panic_wipe(&self) -> Result<()> {
        for path in [self.identity_path(), self.settings_path()] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("wiping {}", path.display()))
                }
            }
        }
        info!("panic wipe complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), [7u8; 32]).unwrap();
        (dir, store)
    }

    #[test]
    fn identity_persists_across_reloads() {
        let (_dir, store) = store();
        let first = store.load_or_create_identity().unwrap();
        let second = store.load_or_create_identity().unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
    }

    #[test]
    fn wrong_master_key_is_fatal_not_regenerating() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), [7u8; 32]).unwrap();
        let original = store.load_or_create_identity().unwrap();

        let wrong = StateStore::new(dir.path(), [8u8; 32]).unwrap();
        assert!(wrong.load_or_create_identity().is_err());

        // The original identity is untouched.
        let again = store.load_or_create_identity().unwrap();
        assert_eq!(original.fingerprint(), again.fingerprint());
    }

    #[test]
    fn settings_round_trip() {
        let (_dir, store) = store();
        let mut settings = Settings::default();
        settings.nickname = "ember".into();
        settings.last_rotation_time = 12345;
        store.save_settings(&settings).unwrap();

        let loaded = store.load_settings();
        assert_eq!(loaded.nickname, "ember");
        assert_eq!(loaded.last_rotation_time, 12345);
    }

    #[test]
    fn settings_files_are_not_plaintext() {
        let (dir, store) = store();
        let mut settings = Settings::default();
        settings.nickname = "visible-nickname".into();
        store.save_settings(&settings).unwrap();

        let raw = fs::read(dir.path().join(SETTINGS_FILE)).unwrap();
        let needle = b"visible-nickname";
        assert!(!raw.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn panic_wipe_yields_fresh_identity() {
        let (_dir, store) = store();
        let first = store.load_or_create_identity().unwrap();
        store.panic_wipe().unwrap();
        let second = store.load_or_create_identity().unwrap();
        assert_ne!(first.fingerprint(), second.fingerprint());
        // Wiping an already-clean store is not an error.
        store.panic_wipe().unwrap();
        store.panic_wipe().unwrap();
    }
}
