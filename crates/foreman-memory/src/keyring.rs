use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::RwLock;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::info;

use foreman_core::{FabricError, Result};

const KEY_LEN: usize = 32;

/// Per-tenant AES-256-GCM keys for sealing LTM at rest.
///
/// Sealed values are `base64(nonce || ciphertext || tag)`. The tenant id is
/// bound as associated data, so a value sealed for one tenant never opens
/// under another tenant's name even if the keys were equal.
pub struct Keyring {
    keys: RwLock<HashMap<String, Arc<LessSafeKey>>>,
    rng: SystemRandom,
}

impl Keyring {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            rng: SystemRandom::new(),
        }
    }

    /// Build from `[encryption.tenant_keys]` (tenant → base64 key).
    pub fn from_base64_map(map: &BTreeMap<String, String>) -> Result<Self> {
        let ring = Self::new();
        for (tenant, encoded) in map {
            let bytes = BASE64
                .decode(encoded.trim())
                .map_err(|e| FabricError::Crypto(format!("key for {tenant}: {e}")))?;
            ring.insert(tenant, &bytes)?;
        }
        Ok(ring)
    }

    pub fn insert(&self, tenant: &str, key: &[u8]) -> Result<()> {
        if key.len() != KEY_LEN {
            return Err(FabricError::Crypto(format!(
                "key for {tenant} is {} bytes, expected {KEY_LEN}",
                key.len()
            )));
        }
        let unbound = UnboundKey::new(&AES_256_GCM, key)
            .map_err(|_| FabricError::Crypto(format!("rejected key for {tenant}")))?;
        self.keys
            .write()
            .insert(tenant.to_string(), Arc::new(LessSafeKey::new(unbound)));
        Ok(())
    }

    /// Create a fresh random key for `tenant`; returns it base64-encoded for persisting.
    pub fn generate(&self, tenant: &str) -> Result<String> {
        let mut key = [0u8; KEY_LEN];
        self.rng
            .fill(&mut key)
            .map_err(|_| FabricError::Crypto("system RNG unavailable".into()))?;
        self.insert(tenant, &key)?;
        info!(tenant, "generated tenant encryption key");
        Ok(BASE64.encode(key))
    }

    pub fn has_key(&self, tenant: &str) -> bool {
        self.keys.read().contains_key(tenant)
    }

    pub fn tenants(&self) -> Vec<String> {
        let mut tenants: Vec<String> = self.keys.read().keys().cloned().collect();
        tenants.sort();
        tenants
    }

    fn key(&self, tenant: &str) -> Result<Arc<LessSafeKey>> {
        self.keys.read().get(tenant).cloned().ok_or_else(|| {
            FabricError::EncryptionPolicyViolation(format!("no encryption key for tenant {tenant}"))
        })
    }

    pub fn seal(&self, tenant: &str, plaintext: &[u8]) -> Result<String> {
        let key = self.key(tenant)?;
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| FabricError::Crypto("system RNG unavailable".into()))?;

        let mut in_out = plaintext.to_vec();
        key.seal_in_place_append_tag(
            Nonce::assume_unique_for_key(nonce),
            Aad::from(tenant.as_bytes()),
            &mut in_out,
        )
        .map_err(|_| FabricError::Crypto("seal failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&in_out);
        Ok(BASE64.encode(out))
    }

    pub fn open(&self, tenant: &str, sealed: &str) -> Result<Vec<u8>> {
        let key = self.key(tenant)?;
        let raw = BASE64
            .decode(sealed)
            .map_err(|e| FabricError::Crypto(format!("sealed value is not base64: {e}")))?;
        if raw.len() < NONCE_LEN {
            return Err(FabricError::Crypto("sealed value too short".into()));
        }
        let (nonce, body) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce)
            .map_err(|_| FabricError::Crypto("bad nonce".into()))?;
        let mut buf = body.to_vec();
        let plain = key
            .open_in_place(nonce, Aad::from(tenant.as_bytes()), &mut buf)
            .map_err(|_| FabricError::Crypto(format!("cannot open value for tenant {tenant}")))?;
        Ok(plain.to_vec())
    }
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Keyring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyring")
            .field("tenants", &self.tenants())
            .finish()
    }
}
