// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Cache invalidation messages exchanged over the invalidation bus.
//!
//! Every message means "drop what you cached for this key"; `invalidate_all`
//! means "drop everything". Consumers must tolerate duplicates and reordering.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheUpdateAction {
	Updated,
	Deleted,
	OverrideUpdated,
	OverrideDeleted,
	InvalidateAll,
	/// Any action this build does not know about.
	#[serde(other)]
	Unknown,
}

impl CacheUpdateAction {
	pub fn as_str(&self) -> &'static str {
		match self {
			CacheUpdateAction::Updated => "updated",
			CacheUpdateAction::Deleted => "deleted",
			CacheUpdateAction::OverrideUpdated => "override_updated",
			CacheUpdateAction::OverrideDeleted => "override_deleted",
			CacheUpdateAction::InvalidateAll => "invalidate_all",
			CacheUpdateAction::Unknown => "unknown",
		}
	}
}

impl std::fmt::Display for CacheUpdateAction {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUpdateMessage {
	pub action: CacheUpdateAction,
	/// Empty for `invalidate_all`.
	#[serde(default)]
	pub flag_key: String,
}

impl CacheUpdateMessage {
	pub fn new(action: CacheUpdateAction, flag_key: impl Into<String>) -> Self {
		Self {
			action,
			flag_key: flag_key.into(),
		}
	}

	pub fn updated(flag_key: impl Into<String>) -> Self {
		Self::new(CacheUpdateAction::Updated, flag_key)
	}

	pub fn deleted(flag_key: impl Into<String>) -> Self {
		Self::new(CacheUpdateAction::Deleted, flag_key)
	}

	pub fn override_updated(flag_key: impl Into<String>) -> Self {
		Self::new(CacheUpdateAction::OverrideUpdated, flag_key)
	}

	pub fn override_deleted(flag_key: impl Into<String>) -> Self {
		Self::new(CacheUpdateAction::OverrideDeleted, flag_key)
	}

	pub fn invalidate_all() -> Self {
		Self::new(CacheUpdateAction::InvalidateAll, String::new())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn actions_use_snake_case_names() {
		let json = serde_json::to_string(&CacheUpdateMessage::override_updated("a.b")).unwrap();
		assert_eq!(json, r#"{"action":"override_updated","flag_key":"a.b"}"#);
	}

	#[test]
	fn unknown_action_does_not_fail_decoding() {
		let msg: CacheUpdateMessage =
			serde_json::from_str(r#"{"action":"renamed","flag_key":"x"}"#).unwrap();
		assert_eq!(msg.action, CacheUpdateAction::Unknown);
	}

	#[test]
	fn invalidate_all_may_omit_key() {
		let msg: CacheUpdateMessage = serde_json::from_str(r#"{"action":"invalidate_all"}"#).unwrap();
		assert_eq!(msg, CacheUpdateMessage::invalidate_all());
	}
}
