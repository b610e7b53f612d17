// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::FlagValue;

/// Unique identifier for a flag override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OverrideId(pub Uuid);

impl OverrideId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for OverrideId {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Display for OverrideId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideTargetType {
	User,
	Tenant,
}

impl std::fmt::Display for OverrideTargetType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			OverrideTargetType::User => write!(f, "user"),
			OverrideTargetType::Tenant => write!(f, "tenant"),
		}
	}
}

/// The principal an override applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverrideTarget {
	pub target_type: OverrideTargetType,
	pub target_id: String,
}

impl OverrideTarget {
	pub fn user(id: impl Into<String>) -> Self {
		Self {
			target_type: OverrideTargetType::User,
			target_id: id.into(),
		}
	}

	pub fn tenant(id: impl Into<String>) -> Self {
		Self {
			target_type: OverrideTargetType::Tenant,
			target_id: id.into(),
		}
	}
}

/// Forces a flag to a fixed value for one user or tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlagOverride {
	#[serde(default)]
	pub id: OverrideId,
	pub flag_key: String,
	#[serde(flatten)]
	pub target: OverrideTarget,
	pub value: FlagValue,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub expires_at: Option<DateTime<Utc>>,
	#[serde(default = "Utc::now")]
	pub created_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub created_by: Option<String>,
}

impl FlagOverride {
	pub fn new(flag_key: impl Into<String>, target: OverrideTarget, value: FlagValue) -> Self {
		Self {
			id: OverrideId::new(),
			flag_key: flag_key.into(),
			target,
			value,
			reason: None,
			expires_at: None,
			created_at: Utc::now(),
			created_by: None,
		}
	}

	pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
		self.expires_at = Some(expires_at);
		self
	}

	pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
		self.created_at = created_at;
		self
	}

	pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
		self.reason = Some(reason.into());
		self
	}

	/// An override whose expiry is at or before `now` no longer applies.
	pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
		self.expires_at.is_some_and(|expires_at| expires_at <= now)
	}

	pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
		!self.is_expired_at(now)
	}

	pub fn applies_to(&self, target_type: OverrideTargetType, target_id: &str) -> bool {
		self.target.target_type == target_type && self.target.target_id == target_id
	}
}
