//! Relay RSA identity — generation, rotation, and the durable slot.
//!
//! Exactly one identity is active per relay instance. It is created at first
//! use and replaced once it is older than the rotation interval. Sessions
//! capture an `Arc` handle at accept time, so a rotation mid-handshake never
//! tears an in-flight session — the old private key lives as long as the
//! last session holding it.
//!
//! Persistence is a single JSON slot (`relay_identity.json` in the data
//! dir), written atomically: tmp file → rename to prevent partial reads.
//! On startup the prior identity is restored if its age is still within the
//! rotation bound, else discarded and regenerated.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crypto::rsa as rsa_kem;
use crate::errors::ProtocolError;

const SLOT_FILE: &str = "relay_identity.json";

// ─── RelayIdentity ───────────────────────────────────────────────────────────

/// The relay's long-lived RSA keypair. The private key never leaves the
/// process; the public DER is advertised to every new client.
pub struct RelayIdentity {
    private: RsaPrivateKey,
    public_der: Vec<u8>,
    created_at: DateTime<Utc>,
}

impl RelayIdentity {
    fn generate(now: DateTime<Utc>) -> Result<Self> {
        let private = rsa_kem::generate_keypair()?;
        let public_der = rsa_kem::public_key_der(&RsaPublicKey::from(&private))?;
        Ok(Self {
            private,
            public_der,
            created_at: now,
        })
    }

    pub fn public_der(&self) -> &[u8] {
        &self.public_der
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Unwrap a client's OAEP-encrypted ECDH point.
    pub fn unwrap_oaep(&self, ciphertext: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        rsa_kem::oaep_decrypt(&self.private, ciphertext)
    }
}

// ─── Durable slot ────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct IdentitySlot {
    /// PKCS#8 DER, base64.
    private_key: String,
    created_at: DateTime<Utc>,
}

// ─── RelayKeyStore ───────────────────────────────────────────────────────────

pub struct RelayKeyStore {
    slot_path: PathBuf,
    rotation: Duration,
    current: Arc<RelayIdentity>,
}

impl RelayKeyStore {
    /// Open the slot under `data_dir`, restoring the prior identity when its
    /// age is within the rotation bound, generating a fresh one otherwise.
    pub fn open(data_dir: &Path, rotation: Duration) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;
        let slot_path = data_dir.join(SLOT_FILE);

        let now = Utc::now();
        let restored = match Self::load_slot(&slot_path) {
            Ok(Some(identity)) if !is_expired(&identity, now, rotation) => {
                info!(created_at = %identity.created_at, "relay identity restored");
                Some(identity)
            }
            Ok(Some(_)) => {
                info!("stored relay identity past rotation bound — regenerating");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!(err = %e, "unreadable relay identity slot — regenerating");
                None
            }
        };

        let current = Arc::new(match restored {
            Some(identity) => identity,
            None => {
                let fresh = RelayIdentity::generate(now)?;
                info!("relay identity generated");
                fresh
            }
        });
        let store = Self {
            slot_path,
            rotation,
            current,
        };
        store.persist()?;
        Ok(store)
    }

    /// The active identity, rotating first if due.
    pub fn current(&mut self) -> Result<Arc<RelayIdentity>> {
        self.rotate_if_due(Utc::now())?;
        Ok(self.current.clone())
    }

    /// Generate and persist a new identity when the active one has aged past
    /// the rotation interval. Existing sessions keep their captured handle.
    pub fn rotate_if_due(&mut self, now: DateTime<Utc>) -> Result<bool> {
        if !is_expired(&self.current, now, self.rotation) {
            return Ok(false);
        }
        self.current = Arc::new(RelayIdentity::generate(now)?);
        self.persist()?;
        info!(created_at = %self.current.created_at, "relay identity rotated");
        Ok(true)
    }

    fn persist(&self) -> Result<()> {
        let slot = IdentitySlot {
            private_key: BASE64.encode(rsa_kem::private_key_der(&self.current.private)?),
            created_at: self.current.created_at,
        };
        let json = serde_json::to_string(&slot)?;

        // Atomic write: write to tmp, then rename
        let tmp = self.slot_path.with_extension("json.tmp");
        fs::write(&tmp, json.as_bytes())
            .with_context(|| format!("cannot write {}", tmp.display()))?;
        fs::rename(&tmp, &self.slot_path)
            .with_context(|| format!("cannot replace {}", self.slot_path.display()))?;
        Ok(())
    }

    fn load_slot(path: &Path) -> Result<Option<RelayIdentity>> {
        let json = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("cannot read {}", path.display())),
        };
        let slot: IdentitySlot = serde_json::from_str(&json).context("identity slot is not valid JSON")?;
        let der = BASE64
            .decode(&slot.private_key)
            .context("identity slot private key is not valid base64")?;
        let private = rsa_kem::private_key_from_der(&der)?;
        let public_der = rsa_kem::public_key_der(&RsaPublicKey::from(&private))?;
        Ok(Some(RelayIdentity {
            private,
            public_der,
            created_at: slot.created_at,
        }))
    }
}

/// A future-dated slot (clock moved backwards) also counts as expired.
fn is_expired(identity: &RelayIdentity, now: DateTime<Utc>, rotation: Duration) -> bool {
    let age = now.signed_duration_since(identity.created_at);
    if age < chrono::Duration::zero() {
        return true;
    }
    age.to_std().map(|a| a >= rotation).unwrap_or(true)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    #[test]
    fn restores_identity_across_restart() {
        let dir = TempDir::new().unwrap();
        let first = RelayKeyStore::open(dir.path(), DAY)
            .unwrap()
            .current()
            .unwrap()
            .public_der()
            .to_vec();
        let second = RelayKeyStore::open(dir.path(), DAY)
            .unwrap()
            .current()
            .unwrap()
            .public_der()
            .to_vec();
        assert_eq!(first, second);
    }

    #[test]
    fn rotates_after_interval() {
        let dir = TempDir::new().unwrap();
        let mut store = RelayKeyStore::open(dir.path(), DAY).unwrap();
        let before = store.current().unwrap().public_der().to_vec();

        let created = store.current().unwrap().created_at();
        assert!(!store.rotate_if_due(created + chrono::Duration::hours(23)).unwrap());
        assert!(store.rotate_if_due(created + chrono::Duration::hours(25)).unwrap());

        let after = store.current().unwrap().public_der().to_vec();
        assert_ne!(before, after);
    }

    #[test]
    fn sessions_keep_their_handle_across_rotation() {
        let dir = TempDir::new().unwrap();
        let mut store = RelayKeyStore::open(dir.path(), DAY).unwrap();
        let held = store.current().unwrap();

        let created = held.created_at();
        store.rotate_if_due(created + chrono::Duration::hours(25)).unwrap();

        // The held handle still unwraps material encrypted under the old key.
        let pk = crate::crypto::rsa::public_key_from_der(held.public_der()).unwrap();
        let wrapped = crate::crypto::rsa::oaep_encrypt(&pk, b"point").unwrap();
        assert_eq!(held.unwrap_oaep(&wrapped).unwrap(), b"point");
    }

    #[test]
    fn expired_slot_regenerated_on_open() {
        let dir = TempDir::new().unwrap();
        let before = {
            let mut store = RelayKeyStore::open(dir.path(), DAY).unwrap();
            store.current().unwrap().public_der().to_vec()
        };

        // Backdate the slot on disk past the rotation bound.
        let path = dir.path().join(SLOT_FILE);
        let mut slot: IdentitySlot =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        slot.created_at = Utc::now() - chrono::Duration::hours(25);
        fs::write(&path, serde_json::to_string(&slot).unwrap()).unwrap();

        let after = RelayKeyStore::open(dir.path(), DAY)
            .unwrap()
            .current()
            .unwrap()
            .public_der()
            .to_vec();
        assert_ne!(before, after);
    }

    #[test]
    fn corrupt_slot_regenerated_on_open() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(SLOT_FILE), b"{ not json").unwrap();
        let store = RelayKeyStore::open(dir.path(), DAY).unwrap();
        assert!(!store.current.public_der().is_empty());
    }
}
