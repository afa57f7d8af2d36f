// Envelope encryption for namespace secrets.
// Each value gets its own data key, wrapped by a versioned key-encryption key.
// Keys are configured as "key_id:base64_key"; old keys stay available for opening.

use std::collections::HashMap;
use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const SEALED_VERSION: u8 = 1;

/// Sealed secret as stored by a back-end
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sealed {
    v: u8,
    kid: String,
    /// nonce || wrapped data key
    dek: String,
    nonce: String,
    ct: String,
}

/// Seals and opens secret values
#[derive(Clone)]
pub struct SecretCipher {
    primary_id: Arc<str>,
    keys: Arc<HashMap<String, Aes256Gcm>>,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("primary_id", &self.primary_id)
            .finish_non_exhaustive()
    }
}

impl SecretCipher {
    /// Build from "key_id:base64_key" strings; the first seals, all open
    pub fn new(primary: &str, previous: &[&str]) -> Result<Self, StoreError> {
        let (primary_id, cipher) = parse_key(primary)?;
        let mut keys = HashMap::new();
        keys.insert(primary_id.clone(), cipher);
        for key in previous {
            let (id, cipher) = parse_key(key)?;
            if keys.insert(id.clone(), cipher).is_some() {
                return Err(StoreError::Encryption(format!("duplicate key id '{id}'")));
            }
        }
        Ok(Self {
            primary_id: primary_id.into(),
            keys: Arc::new(keys),
        })
    }

    /// Random process-local key; sealed values do not survive a restart
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut key);
        let cipher = Aes256Gcm::new(&key.into());
        let mut keys = HashMap::new();
        keys.insert("ephemeral".to_string(), cipher);
        Self {
            primary_id: "ephemeral".into(),
            keys: Arc::new(keys),
        }
    }

    /// Configured key when present, otherwise an ephemeral one
    pub fn from_config(key: Option<&str>) -> Result<Self, StoreError> {
        match key {
            Some(k) if !k.trim().is_empty() => Self::new(k.trim(), &[]),
            _ => {
                tracing::warn!("no secrets key configured, secrets are sealed with an ephemeral key");
                Ok(Self::ephemeral())
            }
        }
    }

    pub fn primary_key_id(&self) -> &str {
        &self.primary_id
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let kek = self
            .keys
            .get(self.primary_id.as_ref())
            .ok_or_else(|| StoreError::Encryption("primary key missing".to_string()))?;

        let mut dek = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut dek);
        let dek_nonce = random_nonce();
        let wrapped = kek
            .encrypt(Nonce::from_slice(&dek_nonce), dek.as_ref())
            .map_err(|e| StoreError::Encryption(format!("wrap data key: {e}")))?;

        let data_nonce = random_nonce();
        let ct = Aes256Gcm::new(&dek.into())
            .encrypt(Nonce::from_slice(&data_nonce), plaintext)
            .map_err(|e| StoreError::Encryption(format!("seal: {e}")))?;

        let mut dek_field = dek_nonce.to_vec();
        dek_field.extend_from_slice(&wrapped);

        let sealed = Sealed {
            v: SEALED_VERSION,
            kid: self.primary_id.to_string(),
            dek: BASE64.encode(dek_field),
            nonce: BASE64.encode(data_nonce),
            ct: BASE64.encode(ct),
        };
        Ok(serde_json::to_vec(&sealed)?)
    }

    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, StoreError> {
        let sealed: Sealed = serde_json::from_slice(data)
            .map_err(|e| StoreError::Encryption(format!("malformed sealed value: {e}")))?;
        if sealed.v != SEALED_VERSION {
            return Err(StoreError::Encryption(format!(
                "unsupported sealed version {}",
                sealed.v
            )));
        }
        let kek = self
            .keys
            .get(&sealed.kid)
            .ok_or_else(|| StoreError::Encryption(format!("unknown key id '{}'", sealed.kid)))?;

        let dek_field = decode(&sealed.dek)?;
        if dek_field.len() < NONCE_SIZE {
            return Err(StoreError::Encryption("wrapped data key too short".to_string()));
        }
        let (dek_nonce, wrapped) = dek_field.split_at(NONCE_SIZE);
        let dek = kek
            .decrypt(Nonce::from_slice(dek_nonce), wrapped)
            .map_err(|e| StoreError::Encryption(format!("unwrap data key: {e}")))?;
        if dek.len() != KEY_SIZE {
            return Err(StoreError::Encryption("invalid data key size".to_string()));
        }

        let nonce = decode(&sealed.nonce)?;
        if nonce.len() != NONCE_SIZE {
            return Err(StoreError::Encryption("invalid nonce size".to_string()));
        }
        let cipher = Aes256Gcm::new_from_slice(&dek)
            .map_err(|e| StoreError::Encryption(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce), decode(&sealed.ct)?.as_ref())
            .map_err(|e| StoreError::Encryption(format!("open: {e}")))
    }
}

/// New random key in "key_id:base64_key" form
pub fn generate_key(key_id: &str) -> String {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut key);
    format!("{key_id}:{}", BASE64.encode(key))
}

fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut n = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut n);
    n
}

fn decode(s: &str) -> Result<Vec<u8>, StoreError> {
    BASE64
        .decode(s)
        .map_err(|e| StoreError::Encryption(format!("base64: {e}")))
}

fn parse_key(key: &str) -> Result<(String, Aes256Gcm), StoreError> {
    let (id, b64) = key
        .split_once(':')
        .ok_or_else(|| StoreError::Encryption("expected 'key_id:base64_key'".to_string()))?;
    let bytes = decode(b64)?;
    if bytes.len() != KEY_SIZE {
        return Err(StoreError::Encryption(format!(
            "key '{id}' must be {KEY_SIZE} bytes, got {}",
            bytes.len()
        )));
    }
    let cipher =
        Aes256Gcm::new_from_slice(&bytes).map_err(|e| StoreError::Encryption(e.to_string()))?;
    Ok((id.to_string(), cipher))
}
