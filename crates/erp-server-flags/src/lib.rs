// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Feature flags server implementation for the ERP backend.
//!
//! # Architecture
//!
//! - `repository` - Read contracts for flags and overrides, plus an in-memory store
//! - `resolver` - Picks the override that applies to an evaluation
//! - `evaluation` - Deterministic flag evaluation engine
//! - `bucketing` - Stable hashing of bucketing keys into rollout buckets
//! - `bus` - Cache invalidation bus (in-memory and Redis backends)
//! - `cache` - Invalidation-aware read cache in front of the store
//! - `hub` - Realtime broadcast hub feeding SSE clients
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use erp_server_flags::{FlagEvaluator, InMemoryFlagStore};
//! use erp_flags_core::{EvaluationContext, FeatureFlag, FlagStatus, FlagType};
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(InMemoryFlagStore::new());
//! store.upsert_flag(
//!     FeatureFlag::new("inventory.rollout", "Inventory rollout", FlagType::Percentage)
//!         .with_status(FlagStatus::Enabled)
//!         .with_rollout_percentage(100),
//! );
//!
//! let evaluator = FlagEvaluator::new(store.clone(), store);
//! let ctx = EvaluationContext::new().with_tenant_id("acme");
//! let result = evaluator.evaluate("inventory.rollout", &ctx).await.unwrap();
//! assert!(result.value.enabled);
//! # });
//! ```

pub mod bucketing;
pub mod bus;
pub mod cache;
pub mod error;
pub mod evaluation;
pub mod hub;
pub mod repository;
pub mod resolver;

pub use bus::{
	run_subscription, InMemoryBus, InvalidationBus, MessageHandler, ReconnectPolicy, RedisBus,
};
pub use cache::{CacheStats, CachedFlagStore, DEFAULT_CACHE_TTL};
pub use error::{FlagsServerError, Result};
pub use evaluation::{batch_outcome, evaluate_flag, FlagEvaluator};
pub use hub::{BroadcastHub, ClientId, HubConfig, HubStats, SseClient};
pub use repository::{FlagRepository, FlagSeed, InMemoryFlagStore, OverrideRepository};
pub use resolver::OverrideResolver;

// Re-export core types for convenience
pub use erp_flags_core::*;
