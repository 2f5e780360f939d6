// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Authenticated Encryption Adapter
//!
//! Concrete implementation of the domain `EncryptionService` port. Two
//! AEAD algorithms are supported, selected by configuration:
//!
//! - **AES-256-GCM** (default): hardware-accelerated on modern CPUs
//! - **ChaCha20-Poly1305**: constant-time on platforms without AES-NI
//!
//! The cipher is keyed once at construction; the 32-byte key is consumed
//! there and zeroized when it drops, so raw key material does not outlive
//! setup. Each payload gets a fresh 12-byte nonce from the system CSPRNG,
//! stored as the prefix of the sealed bytes. Decryption authenticates
//! before returning plaintext: a flipped bit anywhere in the payload fails
//! the call instead of yielding silently corrupted PHI.
//!
//! ## Wire layouts
//!
//! Binary: `nonce(12) || ciphertext+tag`. Text: `hex(nonce):hex(ct+tag)`,
//! the form stored where a printable string is needed.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use ring::rand::{SecureRandom, SystemRandom};
use serde::Deserialize;

use careplan_pipeline_domain::error::PipelineError;
use careplan_pipeline_domain::services::EncryptionService;
use careplan_pipeline_domain::value_objects::EncryptionKey;

/// Nonce length shared by both supported AEADs.
pub const NONCE_LEN: usize = 12;

/// AEAD selection. Serialized form matches the config file values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AeadAlgorithm {
    #[default]
    Aes256Gcm,
    Chacha20Poly1305,
}

// One keyed cipher per process; the key schedule lives inside.
enum Keyed {
    Gcm(Box<Aes256Gcm>),
    Chacha(Box<ChaCha20Poly1305>),
}

/// `EncryptionService` backed by AES-256-GCM or ChaCha20-Poly1305.
pub struct AeadEncryption {
    keyed: Keyed,
    rng: SystemRandom,
}

impl AeadEncryption {
    /// Keys the selected cipher. `key` is dropped (and zeroized) here; the
    /// 32-byte length is guaranteed by the `EncryptionKey` invariant.
    pub fn new(key: EncryptionKey, algorithm: AeadAlgorithm) -> Self {
        let key_bytes = GenericArray::from_slice(key.as_slice());
        let keyed = match algorithm {
            AeadAlgorithm::Aes256Gcm => Keyed::Gcm(Box::new(Aes256Gcm::new(key_bytes))),
            AeadAlgorithm::Chacha20Poly1305 => Keyed::Chacha(Box::new(ChaCha20Poly1305::new(key_bytes))),
        };
        Self {
            keyed,
            rng: SystemRandom::new(),
        }
    }

    fn fresh_nonce(&self) -> Result<[u8; NONCE_LEN], PipelineError> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|e| PipelineError::internal(format!("nonce generation failed: {:?}", e)))?;
        Ok(nonce)
    }

    fn seal(&self, nonce: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, PipelineError> {
        let nonce = GenericArray::from_slice(nonce);
        let sealed = match &self.keyed {
            Keyed::Gcm(cipher) => cipher.encrypt(nonce, plaintext),
            Keyed::Chacha(cipher) => cipher.encrypt(nonce, plaintext),
        };
        // The aead error type is deliberately opaque; no detail to forward.
        sealed.map_err(|_| PipelineError::internal("payload sealing failed"))
    }

    fn open(&self, nonce: &[u8], sealed: &[u8]) -> Result<Vec<u8>, PipelineError> {
        let nonce = GenericArray::from_slice(nonce);
        let opened = match &self.keyed {
            Keyed::Gcm(cipher) => cipher.decrypt(nonce, sealed),
            Keyed::Chacha(cipher) => cipher.decrypt(nonce, sealed),
        };
        opened.map_err(|_| PipelineError::internal("payload failed authentication"))
    }
}

impl EncryptionService for AeadEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, PipelineError> {
        let nonce = self.fresh_nonce()?;
        let sealed = self.seal(&nonce, plaintext)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, PipelineError> {
        if payload.len() < NONCE_LEN {
            return Err(PipelineError::internal("encrypted payload too short"));
        }
        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        self.open(nonce, sealed)
    }

    fn nonce_len(&self) -> usize {
        NONCE_LEN
    }
}
