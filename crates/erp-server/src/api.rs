// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Application state and router construction.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{
	routing::{get, post},
	Router,
};
use erp_flags_core::{CacheUpdateMessage, FeatureFlag, FlagsError};
use erp_server_config::ServerConfig;
use erp_server_flags::{
	BroadcastHub, CachedFlagStore, FlagEvaluator, FlagRepository, FlagSeed, FlagsServerError,
	HubConfig, InMemoryFlagStore, InvalidationBus, OverrideRepository, ReconnectPolicy,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::routes;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
	pub store: Arc<InMemoryFlagStore>,
	/// Read cache in front of `store`; `None` when the TTL is zero.
	pub cache: Option<Arc<CachedFlagStore>>,
	pub evaluator: Arc<FlagEvaluator>,
	pub hub: Arc<BroadcastHub>,
	pub bus: Arc<dyn InvalidationBus>,
}

impl AppState {
	/// Starts the broadcast hub and, when caching is on, the cache's bus listener.
	pub fn start_background(
		&self,
		shutdown: CancellationToken,
	) -> Result<Option<JoinHandle<()>>, FlagsServerError> {
		self.hub.start()?;
		Ok(self
			.cache
			.as_ref()
			.map(|cache| cache.listen(self.bus.clone(), shutdown)))
	}

	/// Drops local cache entries for `msg` and publishes it to every process.
	///
	/// The store write has already happened, so a failed publish is only logged.
	pub async fn publish_change(&self, msg: CacheUpdateMessage) {
		if let Some(cache) = &self.cache {
			cache.handle_invalidation(&msg);
		}
		if let Err(e) = self.bus.publish(&msg).await {
			warn!(
				action = %msg.action,
				flag_key = %msg.flag_key,
				error = %e,
				"Failed to publish cache invalidation"
			);
		}
	}
}

/// Wires the store, cache, evaluator and hub together from configuration.
pub fn create_app_state(
	store: Arc<InMemoryFlagStore>,
	bus: Arc<dyn InvalidationBus>,
	config: &ServerConfig,
) -> AppState {
	let cache_ttl = config.flags.cache_ttl();
	let cache = (!cache_ttl.is_zero())
		.then(|| Arc::new(CachedFlagStore::new(store.clone(), store.clone(), cache_ttl)));

	let flags: Arc<dyn FlagRepository>;
	let overrides: Arc<dyn OverrideRepository>;
	match &cache {
		Some(cache) => {
			flags = cache.clone();
			overrides = cache.clone();
		}
		None => {
			flags = store.clone();
			overrides = store.clone();
		}
	}

	let hub_config = HubConfig {
		client_buffer_size: config.flags.client_buffer_size,
		heartbeat_interval: config.flags.heartbeat_interval(),
		reconnect: ReconnectPolicy::default(),
	};

	AppState {
		store,
		cache,
		evaluator: Arc::new(FlagEvaluator::new(flags, overrides)),
		hub: Arc::new(BroadcastHub::new(bus.clone(), hub_config)),
		bus,
	}
}

pub fn create_router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(routes::health::health_check))
		.route(
			"/api/flags/{key}/evaluate",
			post(routes::flags::evaluate_flag),
		)
		.route(
			"/api/flags/evaluate/batch",
			post(routes::flags::evaluate_batch),
		)
		.route("/api/flags/client-config", post(routes::flags::client_config))
		.route("/api/flags/stream", get(routes::flags::stream_flags))
		.route("/api/flags/stream/stats", get(routes::flags::stream_stats))
		.route("/api/admin/flags", get(routes::admin_flags::list_flags))
		.route(
			"/api/admin/flags/{key}",
			get(routes::admin_flags::get_flag)
				.put(routes::admin_flags::upsert_flag)
				.delete(routes::admin_flags::delete_flag),
		)
		.route(
			"/api/admin/flags/{key}/enable",
			post(routes::admin_flags::enable_flag),
		)
		.route(
			"/api/admin/flags/{key}/disable",
			post(routes::admin_flags::disable_flag),
		)
		.route(
			"/api/admin/flags/{key}/archive",
			post(routes::admin_flags::archive_flag),
		)
		.route(
			"/api/admin/flags/{key}/overrides",
			get(routes::admin_flags::list_overrides).post(routes::admin_flags::create_override),
		)
		.route(
			"/api/admin/flags/{key}/overrides/{id}",
			axum::routing::delete(routes::admin_flags::delete_override),
		)
		.route("/api/admin/cache/stats", get(routes::admin_flags::cache_stats))
		.with_state(state)
}

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
	#[error("failed to read seed file {path}: {source}")]
	SeedRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse seed file {path}: {source}")]
	SeedParse {
		path: PathBuf,
		#[source]
		source: serde_json::Error,
	},

	#[error("seed file {path} contains an invalid flag: {source}")]
	SeedFlag {
		path: PathBuf,
		#[source]
		source: FlagsError,
	},
}

/// Reads a `{flags, overrides}` JSON seed file.
///
/// Malformed keys are rejected. Flags with an inconsistent shape are loaded
/// anyway and report `INVALID_STATE` when evaluated.
pub fn load_seed(path: &Path) -> Result<FlagSeed, StartupError> {
	let content = std::fs::read_to_string(path).map_err(|source| StartupError::SeedRead {
		path: path.to_path_buf(),
		source,
	})?;
	let seed: FlagSeed =
		serde_json::from_str(&content).map_err(|source| StartupError::SeedParse {
			path: path.to_path_buf(),
			source,
		})?;

	for flag in &seed.flags {
		if !FeatureFlag::validate_key(&flag.key) {
			return Err(StartupError::SeedFlag {
				path: path.to_path_buf(),
				source: FlagsError::InvalidFlagKey(flag.key.clone()),
			});
		}
		if let Err(e) = flag.validate() {
			warn!(flag_key = %flag.key, error = %e, "Seeded flag will not evaluate");
		}
	}

	info!(
		path = %path.display(),
		flags = seed.flags.len(),
		overrides = seed.overrides.len(),
		"Loaded flag seed file"
	);
	Ok(seed)
}
