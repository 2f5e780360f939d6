// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Encryption Key Value Object
//!
//! Process-wide symmetric key for the PHI-bearing stores (cache entries,
//! persisted request blobs, queue payloads, DLQ payloads). Exactly 32 bytes,
//! supplied by configuration as hex. Key material is zeroized on drop and
//! never printed: the `Debug` impl is redacted.
//!
//! Rotation is out-of-band: swap the configured key and call
//! `invalidate_all_phi` on the cache; previously persisted blobs must be
//! re-encrypted by an operator tool.

use serde::Deserialize;
use zeroize::Zeroize;

use crate::error::PipelineError;

/// Required key length in bytes (AES-256 / ChaCha20).
pub const KEY_LEN: usize = 32;

/// 32-byte symmetric key with zero-on-drop semantics.
#[derive(Clone)]
pub struct EncryptionKey {
    data: Vec<u8>,
}

impl EncryptionKey {
    /// Wraps raw key bytes; must be exactly [`KEY_LEN`] long.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self, PipelineError> {
        if data.len() != KEY_LEN {
            return Err(PipelineError::validation(format!(
                "encryption key must be {} bytes, got {}",
                KEY_LEN,
                data.len()
            )));
        }
        Ok(Self { data })
    }

    /// Decodes a 64-hex-character key string.
    pub fn from_hex(hex_str: &str) -> Result<Self, PipelineError> {
        let data = hex::decode(hex_str.trim())
            .map_err(|_| PipelineError::validation("encryption key is not valid hex"))?;
        Self::from_bytes(data)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

impl<'de> Deserialize<'de> for EncryptionKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let hex_str = String::deserialize(deserializer)?;
        EncryptionKey::from_hex(&hex_str).map_err(serde::de::Error::custom)
    }
}
