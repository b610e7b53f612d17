// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Read-side contracts for the flag store, plus an in-memory store.
//!
//! Durable persistence lives behind these traits; the engine only reads.

use std::collections::HashMap;

use async_trait::async_trait;
use erp_flags_core::{FeatureFlag, FlagOverride, FlagStatus, FlagsError, OverrideTargetType};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::Result;

#[async_trait]
pub trait FlagRepository: Send + Sync {
	async fn find_by_key(&self, key: &str) -> Result<Option<FeatureFlag>>;

	/// All flags whose status is `enabled`.
	async fn list_enabled(&self) -> Result<Vec<FeatureFlag>>;
}

#[async_trait]
pub trait OverrideRepository: Send + Sync {
	/// Every override for `flag_key` targeting the given user or tenant,
	/// expired ones included. Precedence is applied by the caller.
	async fn find_for_evaluation(
		&self,
		flag_key: &str,
		tenant_id: Option<&str>,
		user_id: Option<&str>,
	) -> Result<Vec<FlagOverride>>;
}

/// Contents of a seed file for [`InMemoryFlagStore`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlagSeed {
	#[serde(default)]
	pub flags: Vec<FeatureFlag>,
	#[serde(default)]
	pub overrides: Vec<FlagOverride>,
}

/// Process-local flag and override store.
#[derive(Debug, Default)]
pub struct InMemoryFlagStore {
	flags: RwLock<HashMap<String, FeatureFlag>>,
	overrides: RwLock<HashMap<String, Vec<FlagOverride>>>,
}

impl InMemoryFlagStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_seed(seed: FlagSeed) -> Self {
		let store = Self::new();
		for flag in seed.flags {
			store.upsert_flag(flag);
		}
		for o in seed.overrides {
			store.upsert_override(o);
		}
		store
	}

	/// Inserts or replaces a flag, bumping its version on replace.
	pub fn upsert_flag(&self, mut flag: FeatureFlag) {
		let mut flags = self.flags.write();
		if let Some(existing) = flags.get(&flag.key) {
			flag.version = existing.version + 1;
			flag.created_at = existing.created_at;
			flag.updated_at = chrono::Utc::now();
		}
		flags.insert(flag.key.clone(), flag);
	}

	pub fn delete_flag(&self, key: &str) -> bool {
		self.overrides.write().remove(key);
		self.flags.write().remove(key).is_some()
	}

	/// Applies a lifecycle transition and returns the updated flag.
	pub fn set_status(&self, key: &str, status: FlagStatus) -> Result<FeatureFlag> {
		let mut flags = self.flags.write();
		let flag = flags
			.get_mut(key)
			.ok_or_else(|| FlagsError::FlagNotFound(key.to_string()))?;
		flag.transition_to(status)?;
		Ok(flag.clone())
	}

	pub fn upsert_override(&self, o: FlagOverride) {
		let mut overrides = self.overrides.write();
		let list = overrides.entry(o.flag_key.clone()).or_default();
		list.retain(|existing| existing.id != o.id);
		list.push(o);
	}

	pub fn delete_override(&self, flag_key: &str, id: erp_flags_core::OverrideId) -> bool {
		let mut overrides = self.overrides.write();
		match overrides.get_mut(flag_key) {
			Some(list) => {
				let before = list.len();
				list.retain(|o| o.id != id);
				before != list.len()
			}
			None => false,
		}
	}

	pub fn flag_count(&self) -> usize {
		self.flags.read().len()
	}

	/// Every stored flag regardless of status, sorted by key.
	pub fn list_all(&self) -> Vec<FeatureFlag> {
		let mut flags: Vec<FeatureFlag> = self.flags.read().values().cloned().collect();
		flags.sort_by(|a, b| a.key.cmp(&b.key));
		flags
	}

	pub fn list_overrides(&self, flag_key: &str) -> Vec<FlagOverride> {
		self
			.overrides
			.read()
			.get(flag_key)
			.cloned()
			.unwrap_or_default()
	}
}

#[async_trait]
impl FlagRepository for InMemoryFlagStore {
	#[instrument(skip(self))]
	async fn find_by_key(&self, key: &str) -> Result<Option<FeatureFlag>> {
		Ok(self.flags.read().get(key).cloned())
	}

	#[instrument(skip(self))]
	async fn list_enabled(&self) -> Result<Vec<FeatureFlag>> {
		let mut flags: Vec<FeatureFlag> = self
			.flags
			.read()
			.values()
			.filter(|f| f.status.is_live())
			.cloned()
			.collect();
		flags.sort_by(|a, b| a.key.cmp(&b.key));
		Ok(flags)
	}
}

#[async_trait]
impl OverrideRepository for InMemoryFlagStore {
	#[instrument(skip(self))]
	async fn find_for_evaluation(
		&self,
		flag_key: &str,
		tenant_id: Option<&str>,
		user_id: Option<&str>,
	) -> Result<Vec<FlagOverride>> {
		let overrides = self.overrides.read();
		let Some(list) = overrides.get(flag_key) else {
			return Ok(Vec::new());
		};

		Ok(list
			.iter()
			.filter(|o| {
				user_id.is_some_and(|id| o.applies_to(OverrideTargetType::User, id))
					|| tenant_id.is_some_and(|id| o.applies_to(OverrideTargetType::Tenant, id))
			})
			.cloned()
			.collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use erp_flags_core::{FlagType, FlagValue, OverrideTarget};

	#[tokio::test]
	async fn test_upsert_bumps_version() {
		let store = InMemoryFlagStore::new();
		store.upsert_flag(FeatureFlag::new("a", "A", FlagType::Boolean));
		store.upsert_flag(FeatureFlag::new("a", "A again", FlagType::Boolean));

		let flag = store.find_by_key("a").await.unwrap().unwrap();
		assert_eq!(flag.version, 2);
		assert_eq!(flag.name, "A again");
	}

	#[test]
	fn test_list_all_includes_every_status() {
		let store = InMemoryFlagStore::new();
		store.upsert_flag(FeatureFlag::new("b", "B", FlagType::Boolean));
		store.upsert_flag(
			FeatureFlag::new("a", "A", FlagType::Boolean).with_status(FlagStatus::Archived),
		);
		let keys: Vec<String> = store.list_all().into_iter().map(|f| f.key).collect();
		assert_eq!(keys, vec!["a", "b"]);
		assert!(store.list_overrides("a").is_empty());
	}

	#[test]
	fn test_set_status_enforces_lifecycle() {
		let store = InMemoryFlagStore::new();
		store.upsert_flag(FeatureFlag::new("a", "A", FlagType::Boolean));

		let enabled = store.set_status("a", FlagStatus::Enabled).unwrap();
		assert_eq!(enabled.status, FlagStatus::Enabled);
		assert_eq!(enabled.version, 2);

		store.set_status("a", FlagStatus::Archived).unwrap();
		let err = store.set_status("a", FlagStatus::Enabled).unwrap_err();
		assert_eq!(err.code(), "CANNOT_ENABLE");
		assert_eq!(store.list_all()[0].status, FlagStatus::Archived);

		let err = store.set_status("missing", FlagStatus::Enabled).unwrap_err();
		assert!(err.is_not_found());
	}

	#[tokio::test]
	async fn test_list_enabled_filters_status() {
		let store = InMemoryFlagStore::new();
		store.upsert_flag(
			FeatureFlag::new("on", "On", FlagType::Boolean).with_status(FlagStatus::Enabled),
		);
		store.upsert_flag(
			FeatureFlag::new("off", "Off", FlagType::Boolean).with_status(FlagStatus::Disabled),
		);
		store.upsert_flag(FeatureFlag::new("draft", "Draft", FlagType::Boolean));

		let keys: Vec<String> = store
			.list_enabled()
			.await
			.unwrap()
			.into_iter()
			.map(|f| f.key)
			.collect();
		assert_eq!(keys, vec!["on".to_string()]);
	}

	#[tokio::test]
	async fn test_find_for_evaluation_matches_targets() {
		let store = InMemoryFlagStore::new();
		store.upsert_override(FlagOverride::new(
			"f",
			OverrideTarget::user("u1"),
			FlagValue::on(),
		));
		store.upsert_override(FlagOverride::new(
			"f",
			OverrideTarget::tenant("t1"),
			FlagValue::off(),
		));
		store.upsert_override(FlagOverride::new(
			"f",
			OverrideTarget::user("u2"),
			FlagValue::on(),
		));

		let found = store
			.find_for_evaluation("f", Some("t1"), Some("u1"))
			.await
			.unwrap();
		assert_eq!(found.len(), 2);

		let found = store.find_for_evaluation("f", None, None).await.unwrap();
		assert!(found.is_empty());

		let found = store
			.find_for_evaluation("other", Some("t1"), Some("u1"))
			.await
			.unwrap();
		assert!(found.is_empty());
	}

	#[tokio::test]
	async fn test_seed_round_trip() {
		let seed: FlagSeed = serde_json::from_str(
			r#"{
				"flags": [{"key":"ops.banner","name":"Banner","flag_type":"boolean","status":"enabled"}],
				"overrides": [{"flag_key":"ops.banner","target_type":"tenant","target_id":"acme","value":{"enabled":true}}]
			}"#,
		)
		.unwrap();
		let store = InMemoryFlagStore::from_seed(seed);

		assert_eq!(store.flag_count(), 1);
		let found = store
			.find_for_evaluation("ops.banner", Some("acme"), None)
			.await
			.unwrap();
		assert_eq!(found.len(), 1);
	}

	#[tokio::test]
	async fn test_delete_flag_drops_overrides() {
		let store = InMemoryFlagStore::new();
		store.upsert_flag(FeatureFlag::new("gone", "Gone", FlagType::Boolean));
		let o = FlagOverride::new("gone", OverrideTarget::user("u"), FlagValue::on());
		let id = o.id;
		store.upsert_override(o);

		assert!(store.delete_override("gone", id));
		assert!(!store.delete_override("gone", id));
		assert!(store.delete_flag("gone"));
		assert!(store.find_by_key("gone").await.unwrap().is_none());
	}
}
