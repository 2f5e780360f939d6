// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Runtime machinery: the stage execution envelope, the saga engine with
//! optimistic locking, and the worker pools.

pub mod saga;
pub mod stage_executor;
pub mod worker;

pub use saga::{with_optimistic_lock, Saga, SagaContext, SagaFailure, SagaStep};
pub use stage_executor::{StageExecutor, StageOutcome, StagePolicy};
pub use worker::{JobHandler, RedisTokenBucket, WorkerPool};
