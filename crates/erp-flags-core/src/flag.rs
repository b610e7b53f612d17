// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{FlagsError, Result};

/// Maximum length of a flag key.
pub const MAX_FLAG_KEY_LEN: usize = 100;

/// Unique identifier for a feature flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlagId(pub Uuid);

impl FlagId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for FlagId {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Display for FlagId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl std::str::FromStr for FlagId {
	type Err = uuid::Error;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		Ok(Self(Uuid::parse_str(s)?))
	}
}

/// How a flag turns its stored configuration into a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagType {
	/// On or off for everyone.
	Boolean,
	/// On for a stable fraction of bucketing keys.
	Percentage,
	/// One of several weighted variants per bucketing key.
	Variant,
}

impl std::fmt::Display for FlagType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			FlagType::Boolean => write!(f, "boolean"),
			FlagType::Percentage => write!(f, "percentage"),
			FlagType::Variant => write!(f, "variant"),
		}
	}
}

/// Lifecycle status of a flag. Only `Enabled` flags are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagStatus {
	#[default]
	Draft,
	Enabled,
	Disabled,
	Archived,
}

impl FlagStatus {
	pub fn is_live(&self) -> bool {
		matches!(self, FlagStatus::Enabled)
	}
}

/// A weighted variant of a variant flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
	pub key: String,
	/// Share of the 0..100 bucket space.
	pub weight: u32,
}

impl Variant {
	pub fn new(key: impl Into<String>, weight: u32) -> Self {
		Self {
			key: key.into(),
			weight,
		}
	}
}

/// The value a flag evaluates to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlagValue {
	pub enabled: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub variant: Option<String>,
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub metadata: HashMap<String, serde_json::Value>,
}

impl FlagValue {
	pub fn on() -> Self {
		Self {
			enabled: true,
			..Default::default()
		}
	}

	pub fn off() -> Self {
		Self::default()
	}

	pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
		self.variant = Some(variant.into());
		self
	}

	pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
		self.metadata.insert(key.into(), value);
		self
	}
}

/// A feature flag as stored by the flag store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureFlag {
	#[serde(default)]
	pub id: FlagId,
	/// Structured key: "inventory.bulk_import"
	pub key: String,
	pub name: String,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub flag_type: FlagType,
	#[serde(default)]
	pub status: FlagStatus,
	#[serde(default)]
	pub default_value: FlagValue,
	/// Rollout for percentage flags, 0..=100.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rollout_percentage: Option<u32>,
	/// Variants for variant flags, in declaration order.
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub variants: Vec<Variant>,
	#[serde(default)]
	pub tags: Vec<String>,
	/// Optimistic concurrency counter, bumped by the write path.
	#[serde(default = "initial_version")]
	pub version: u64,
	#[serde(default = "Utc::now")]
	pub created_at: DateTime<Utc>,
	#[serde(default = "Utc::now")]
	pub updated_at: DateTime<Utc>,
}

fn initial_version() -> u64 {
	1
}

impl FeatureFlag {
	/// Creates a draft flag with an `off` default value.
	pub fn new(key: impl Into<String>, name: impl Into<String>, flag_type: FlagType) -> Self {
		let now = Utc::now();
		Self {
			id: FlagId::new(),
			key: key.into(),
			name: name.into(),
			description: None,
			flag_type,
			status: FlagStatus::Draft,
			default_value: FlagValue::off(),
			rollout_percentage: None,
			variants: Vec::new(),
			tags: Vec::new(),
			version: initial_version(),
			created_at: now,
			updated_at: now,
		}
	}

	pub fn with_status(mut self, status: FlagStatus) -> Self {
		self.status = status;
		self
	}

	pub fn with_default_value(mut self, value: FlagValue) -> Self {
		self.default_value = value;
		self
	}

	pub fn with_rollout_percentage(mut self, percentage: u32) -> Self {
		self.rollout_percentage = Some(percentage);
		self
	}

	pub fn with_variants(mut self, variants: Vec<Variant>) -> Self {
		self.variants = variants;
		self
	}

	pub fn with_description(mut self, description: impl Into<String>) -> Self {
		self.description = Some(description.into());
		self
	}

	pub fn with_tags<I, S>(mut self, tags: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.tags = normalize_tags(tags.into_iter().map(Into::into));
		self
	}

	/// Validates the flag key format.
	///
	/// Valid keys:
	/// - 1-100 characters
	/// - Start with a lowercase ASCII letter
	/// - Continue with lowercase letters, digits, `_`, `-` or `.`
	pub fn validate_key(key: &str) -> bool {
		if key.is_empty() || key.len() > MAX_FLAG_KEY_LEN {
			return false;
		}

		let mut chars = key.chars();
		match chars.next() {
			Some(c) if c.is_ascii_lowercase() => {}
			_ => return false,
		}

		chars.all(|c| {
			c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' || c == '.'
		})
	}

	/// Checks that the stored configuration can be evaluated for this flag type.
	pub fn validate(&self) -> Result<()> {
		if !Self::validate_key(&self.key) {
			return Err(FlagsError::InvalidFlagKey(self.key.clone()));
		}

		match self.flag_type {
			FlagType::Boolean => Ok(()),
			FlagType::Percentage => match self.rollout_percentage {
				None => Err(FlagsError::InvalidState(format!(
					"percentage flag {} has no rollout percentage",
					self.key
				))),
				Some(p) if p > 100 => Err(FlagsError::InvalidState(format!(
					"percentage flag {} has rollout percentage {p} above 100",
					self.key
				))),
				Some(_) => Ok(()),
			},
			FlagType::Variant => self.validate_variants(),
		}
	}

	fn validate_variants(&self) -> Result<()> {
		if self.variants.is_empty() {
			return Err(FlagsError::InvalidState(format!(
				"variant flag {} has no variants",
				self.key
			)));
		}

		let mut seen = std::collections::HashSet::new();
		for variant in &self.variants {
			if variant.key.is_empty() {
				return Err(FlagsError::InvalidState(format!(
					"variant flag {} has a variant with an empty key",
					self.key
				)));
			}
			if !seen.insert(variant.key.as_str()) {
				return Err(FlagsError::InvalidState(format!(
					"variant flag {} declares variant {} twice",
					self.key, variant.key
				)));
			}
		}

		let total: u64 = self.variants.iter().map(|v| u64::from(v.weight)).sum();
		if total != 100 {
			return Err(FlagsError::InvalidState(format!(
				"variant flag {} has weights summing to {total}, expected 100",
				self.key
			)));
		}

		Ok(())
	}

	/// Moves the flag to `status` and bumps its version.
	///
	/// Archived flags cannot be enabled or disabled, nothing returns to draft,
	/// and moving to the current status is rejected.
	pub fn transition_to(&mut self, status: FlagStatus) -> Result<()> {
		let rejected = match (self.status, status) {
			(from, to) if from == to => Some(match to {
				FlagStatus::Enabled => ("ALREADY_ENABLED", "flag is already enabled"),
				FlagStatus::Disabled => ("ALREADY_DISABLED", "flag is already disabled"),
				FlagStatus::Archived => ("ALREADY_ARCHIVED", "flag is already archived"),
				FlagStatus::Draft => ("ALREADY_DRAFT", "flag is already a draft"),
			}),
			(FlagStatus::Archived, FlagStatus::Enabled) => {
				Some(("CANNOT_ENABLE", "cannot enable an archived flag"))
			}
			(FlagStatus::Archived, FlagStatus::Disabled) => {
				Some(("CANNOT_DISABLE", "cannot disable an archived flag"))
			}
			(_, FlagStatus::Draft) => Some(("CANNOT_REVERT_TO_DRAFT", "a flag cannot return to draft")),
			_ => None,
		};

		if let Some((code, message)) = rejected {
			return Err(FlagsError::InvalidTransition {
				code,
				message: format!("{}: {message}", self.key),
			});
		}

		self.status = status;
		self.version += 1;
		self.updated_at = Utc::now();
		Ok(())
	}

	/// The value served while the flag is not live.
	pub fn off_value(&self) -> FlagValue {
		FlagValue {
			enabled: false,
			variant: self.default_value.variant.clone(),
			metadata: HashMap::new(),
		}
	}
}

/// Lowercases, trims and deduplicates tags, keeping first-seen order.
pub fn normalize_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
	let mut out: Vec<String> = Vec::new();
	for tag in tags {
		let tag = tag.trim().to_lowercase();
		if !tag.is_empty() && !out.contains(&tag) {
			out.push(tag);
		}
	}
	out
}
