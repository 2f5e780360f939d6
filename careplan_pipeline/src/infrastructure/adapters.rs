// /////////////////////////////////////////////////////////////////////////////
// Careplan Pipeline RS
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! Technology adapters: AEAD encryption, the Redis lock, queue, progress
//! bus, cancellation flags, and the feature-flag store.

pub mod cancellation;
pub mod encryption;
pub mod feature_flags;
pub mod job_queue;
pub mod ml_offline;
pub mod progress_bus;
pub mod redis_lock;

pub use cancellation::RedisCancellationFlags;
pub use encryption::{AeadAlgorithm, AeadEncryption};
pub use feature_flags::{FeatureFlags, FlagStore, InMemoryFlagStore, RedisFlagStore};
pub use job_queue::RedisJobQueue;
pub use ml_offline::OfflineMlClients;
pub use progress_bus::RedisProgressBus;
pub use redis_lock::{with_lock, RedisLock};
