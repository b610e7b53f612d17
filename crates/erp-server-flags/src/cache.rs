// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Process-local read cache in front of the flag store.
//!
//! Entries expire after a TTL and are dropped early when the invalidation bus
//! reports a change. Negative lookups are not cached.
//!
//! Every invalidation bumps a generation counter. A read-through fill records
//! the generation before going to the source and is discarded if an
//! invalidation landed while it was in flight.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use erp_flags_core::{CacheUpdateAction, CacheUpdateMessage, FeatureFlag, FlagOverride};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::{run_subscription, InvalidationBus, MessageHandler, ReconnectPolicy};
use crate::error::Result;
use crate::repository::{FlagRepository, OverrideRepository};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct CacheEntry<T> {
	value: T,
	inserted_at: Instant,
}

impl<T> CacheEntry<T> {
	fn new(value: T) -> Self {
		Self {
			value,
			inserted_at: Instant::now(),
		}
	}

	fn is_fresh(&self, ttl: Duration) -> bool {
		self.inserted_at.elapsed() < ttl
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct OverrideLookup {
	flag_key: String,
	tenant_id: Option<String>,
	user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
	pub hits: u64,
	pub misses: u64,
	pub invalidations: u64,
	pub cached_flags: usize,
	pub cached_override_lookups: usize,
}

pub struct CachedFlagStore {
	flags_source: Arc<dyn FlagRepository>,
	overrides_source: Arc<dyn OverrideRepository>,
	ttl: Duration,
	flags: RwLock<HashMap<String, CacheEntry<FeatureFlag>>>,
	overrides: RwLock<HashMap<OverrideLookup, CacheEntry<Vec<FlagOverride>>>>,
	generation: AtomicU64,
	hits: AtomicU64,
	misses: AtomicU64,
	invalidations: AtomicU64,
}

impl CachedFlagStore {
	pub fn new(
		flags_source: Arc<dyn FlagRepository>,
		overrides_source: Arc<dyn OverrideRepository>,
		ttl: Duration,
	) -> Self {
		Self {
			flags_source,
			overrides_source,
			ttl,
			flags: RwLock::new(HashMap::new()),
			overrides: RwLock::new(HashMap::new()),
			generation: AtomicU64::new(0),
			hits: AtomicU64::new(0),
			misses: AtomicU64::new(0),
			invalidations: AtomicU64::new(0),
		}
	}

	/// Drops cached state named by an invalidation message.
	pub fn handle_invalidation(&self, msg: &CacheUpdateMessage) {
		match msg.action {
			CacheUpdateAction::Updated | CacheUpdateAction::Deleted => {
				self.bump_generation();
				self.flags.write().remove(&msg.flag_key);
				self.drop_override_lookups(&msg.flag_key);
			}
			CacheUpdateAction::OverrideUpdated | CacheUpdateAction::OverrideDeleted => {
				self.bump_generation();
				self.drop_override_lookups(&msg.flag_key);
			}
			CacheUpdateAction::InvalidateAll => self.clear(),
			CacheUpdateAction::Unknown => {
				debug!(flag_key = %msg.flag_key, "Ignoring unknown invalidation action");
				return;
			}
		}
		self.invalidations.fetch_add(1, Ordering::Relaxed);
		debug!(action = %msg.action, flag_key = %msg.flag_key, "Flag cache invalidated");
	}

	pub fn clear(&self) {
		self.bump_generation();
		self.flags.write().clear();
		self.overrides.write().clear();
	}

	/// Must run before entries are dropped so that in-flight fills notice.
	fn bump_generation(&self) {
		self.generation.fetch_add(1, Ordering::AcqRel);
	}

	fn drop_override_lookups(&self, flag_key: &str) {
		self
			.overrides
			.write()
			.retain(|lookup, _| lookup.flag_key != flag_key);
	}

	/// Subscribes the cache to `bus` until `cancel` fires.
	pub fn listen(
		self: &Arc<Self>,
		bus: Arc<dyn InvalidationBus>,
		cancel: CancellationToken,
	) -> JoinHandle<()> {
		let weak = Arc::downgrade(self);
		let handler: MessageHandler = Arc::new(move |msg| {
			if let Some(cache) = weak.upgrade() {
				cache.handle_invalidation(&msg);
			}
			Ok(())
		});
		tokio::spawn(run_subscription(
			bus,
			cancel,
			handler,
			ReconnectPolicy::default(),
		))
	}

	pub fn stats(&self) -> CacheStats {
		CacheStats {
			hits: self.hits.load(Ordering::Relaxed),
			misses: self.misses.load(Ordering::Relaxed),
			invalidations: self.invalidations.load(Ordering::Relaxed),
			cached_flags: self.flags.read().len(),
			cached_override_lookups: self.overrides.read().len(),
		}
	}

	fn generation(&self) -> u64 {
		self.generation.load(Ordering::Acquire)
	}

	fn record(&self, hit: bool) {
		let counter = if hit { &self.hits } else { &self.misses };
		counter.fetch_add(1, Ordering::Relaxed);
	}
}

#[async_trait]
impl FlagRepository for CachedFlagStore {
	async fn find_by_key(&self, key: &str) -> Result<Option<FeatureFlag>> {
		let cached = self
			.flags
			.read()
			.get(key)
			.filter(|entry| entry.is_fresh(self.ttl))
			.map(|entry| entry.value.clone());
		self.record(cached.is_some());
		if cached.is_some() {
			return Ok(cached);
		}

		let generation = self.generation();
		let flag = self.flags_source.find_by_key(key).await?;
		if let Some(ref flag) = flag {
			let mut flags = self.flags.write();
			if self.generation() == generation {
				flags.insert(key.to_string(), CacheEntry::new(flag.clone()));
			} else {
				debug!(flag_key = key, "Invalidated during fetch, not caching");
			}
		}
		Ok(flag)
	}

	async fn list_enabled(&self) -> Result<Vec<FeatureFlag>> {
		self.flags_source.list_enabled().await
	}
}

#[async_trait]
impl OverrideRepository for CachedFlagStore {
	async fn find_for_evaluation(
		&self,
		flag_key: &str,
		tenant_id: Option<&str>,
		user_id: Option<&str>,
	) -> Result<Vec<FlagOverride>> {
		let lookup = OverrideLookup {
			flag_key: flag_key.to_string(),
			tenant_id: tenant_id.map(str::to_string),
			user_id: user_id.map(str::to_string),
		};

		let cached = self
			.overrides
			.read()
			.get(&lookup)
			.filter(|entry| entry.is_fresh(self.ttl))
			.map(|entry| entry.value.clone());
		self.record(cached.is_some());
		if let Some(overrides) = cached {
			return Ok(overrides);
		}

		let generation = self.generation();
		let overrides = self
			.overrides_source
			.find_for_evaluation(flag_key, tenant_id, user_id)
			.await?;
		let mut cached = self.overrides.write();
		if self.generation() == generation {
			cached.insert(lookup, CacheEntry::new(overrides.clone()));
		} else {
			debug!(flag_key, "Invalidated during fetch, not caching");
		}
		Ok(overrides)
	}
}
