// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Persistence ports. Infrastructure implements them against Postgres; the
//! test suite implements them in memory.

pub mod dead_letter_repository;
pub mod idempotency_repository;
pub mod request_repository;

pub use dead_letter_repository::DeadLetterRepository;
pub use idempotency_repository::IdempotencyRepository;
pub use request_repository::RequestRepository;
