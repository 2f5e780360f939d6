// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Encryption Service Port
//!
//! Authenticated encryption for every PHI-bearing byte string the pipeline
//! persists: cache entries, request input/result blobs, queue payloads, DLQ
//! payloads. Implementations MUST use an authenticated mode (AES-256-GCM or
//! ChaCha20-Poly1305); tampered ciphertext fails decryption instead of
//! yielding garbage plaintext.
//!
//! The trait is synchronous: AEAD over kilobyte payloads is CPU-bound and
//! cheap, so there is nothing to await.
//!
//! ## Layouts
//!
//! - **Binary**: `nonce || ciphertext+tag`, the form stored in BYTEA
//!   columns and queue fields.
//! - **Text**: `hex(nonce):hex(ciphertext+tag)`, the form used where a
//!   printable string is required.

use crate::error::PipelineError;

pub trait EncryptionService: Send + Sync {
    /// Encrypts with a fresh random nonce; returns `nonce || ciphertext`.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, PipelineError>;

    /// Decrypts and authenticates a `nonce || ciphertext` payload.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PipelineError>;

    /// Encrypts to the `hex(nonce):hex(ciphertext)` text layout.
    fn encrypt_to_text(&self, plaintext: &[u8]) -> Result<String, PipelineError> {
        let bytes = self.encrypt(plaintext)?;
        let (nonce, ct) = bytes.split_at(self.nonce_len());
        Ok(format!("{}:{}", hex::encode(nonce), hex::encode(ct)))
    }

    /// Decrypts the `hex(nonce):hex(ciphertext)` text layout.
    fn decrypt_from_text(&self, text: &str) -> Result<Vec<u8>, PipelineError> {
        let (nonce_hex, ct_hex) = text
            .split_once(':')
            .ok_or_else(|| PipelineError::internal("ciphertext text layout is missing separator"))?;
        let mut bytes = hex::decode(nonce_hex)
            .map_err(|_| PipelineError::internal("ciphertext nonce is not valid hex"))?;
        bytes.extend(
            hex::decode(ct_hex).map_err(|_| PipelineError::internal("ciphertext body is not valid hex"))?,
        );
        self.decrypt(&bytes)
    }

    /// Nonce length of the underlying AEAD (12 for GCM and ChaCha20).
    fn nonce_len(&self) -> usize {
        12
    }
}
