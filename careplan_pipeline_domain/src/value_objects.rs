// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Immutable, self-validating value objects of the care-plan pipeline
//! domain: typed identifiers, the caller-supplied idempotency key, ICD-10
//! condition codes, and the process-wide encryption key.

pub mod condition_code;
pub mod correlation_id;
pub mod encryption_key;
pub mod idempotency_key;
pub mod request_id;

pub use condition_code::{canonical_codes, ConditionCode};
pub use correlation_id::CorrelationId;
pub use encryption_key::{EncryptionKey, KEY_LEN};
pub use idempotency_key::IdempotencyKey;
pub use request_id::RequestId;
