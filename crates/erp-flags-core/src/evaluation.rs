// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::FlagValue;

/// Bucketing key used when the context names neither a user nor a tenant.
pub const ANONYMOUS_BUCKETING_KEY: &str = "anonymous";

/// Who a flag is being evaluated for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub user_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub tenant_id: Option<String>,
	/// Reserved for targeting; not used by bucketing.
	#[serde(default, skip_serializing_if = "HashMap::is_empty")]
	pub attributes: HashMap<String, serde_json::Value>,
}

impl EvaluationContext {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
		self.user_id = Some(user_id.into());
		self
	}

	pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
		self.tenant_id = Some(tenant_id.into());
		self
	}

	pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
		self.attributes.insert(key.into(), value);
		self
	}

	/// User id, ignoring empty strings.
	pub fn user(&self) -> Option<&str> {
		self.user_id.as_deref().filter(|s| !s.is_empty())
	}

	/// Tenant id, ignoring empty strings.
	pub fn tenant(&self) -> Option<&str> {
		self.tenant_id.as_deref().filter(|s| !s.is_empty())
	}

	/// The key that places this context into a rollout bucket.
	///
	/// User id when present, otherwise tenant id, otherwise [`ANONYMOUS_BUCKETING_KEY`].
	pub fn bucketing_key(&self) -> &str {
		self
			.user()
			.or_else(|| self.tenant())
			.unwrap_or(ANONYMOUS_BUCKETING_KEY)
	}
}

/// Why an evaluation produced its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationReason {
	/// A user-scoped override matched.
	OverrideUser,
	/// A tenant-scoped override matched.
	OverrideTenant,
	/// Boolean flag served its stored default.
	Default,
	/// Percentage rollout placed the context in or out.
	Percentage,
	/// Weighted variant selection.
	Variant,
	/// Flag is not live.
	Disabled,
}

/// Result of evaluating a single flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
	pub flag_key: String,
	pub value: FlagValue,
	pub reason: EvaluationReason,
	pub flag_version: u64,
	pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
	pub fn new(
		flag_key: impl Into<String>,
		value: FlagValue,
		reason: EvaluationReason,
		flag_version: u64,
	) -> Self {
		Self {
			flag_key: flag_key.into(),
			value,
			reason,
			flag_version,
			evaluated_at: Utc::now(),
		}
	}
}

/// Error half of a batch entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationError {
	pub code: String,
	pub message: String,
}

/// Per-key outcome of a batch evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchOutcome {
	Evaluated(EvaluationResult),
	Failed { error: EvaluationError },
}

impl BatchOutcome {
	pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
		BatchOutcome::Failed {
			error: EvaluationError {
				code: code.into(),
				message: message.into(),
			},
		}
	}

	pub fn result(&self) -> Option<&EvaluationResult> {
		match self {
			BatchOutcome::Evaluated(result) => Some(result),
			BatchOutcome::Failed { .. } => None,
		}
	}

	pub fn error(&self) -> Option<&EvaluationError> {
		match self {
			BatchOutcome::Evaluated(_) => None,
			BatchOutcome::Failed { error } => Some(error),
		}
	}
}

/// Batch evaluation response, keyed by flag key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEvaluationResult {
	pub results: HashMap<String, BatchOutcome>,
	pub evaluated_at: DateTime<Utc>,
}

impl BatchEvaluationResult {
	pub fn new(results: HashMap<String, BatchOutcome>) -> Self {
		Self {
			results,
			evaluated_at: Utc::now(),
		}
	}

	pub fn get(&self, flag_key: &str) -> Option<&BatchOutcome> {
		self.results.get(flag_key)
	}

	/// Gets whether a flag is enabled, returning the default if it failed or is missing.
	pub fn get_bool(&self, flag_key: &str, default: bool) -> bool {
		self
			.get(flag_key)
			.and_then(BatchOutcome::result)
			.map(|result| result.value.enabled)
			.unwrap_or(default)
	}
}

/// Snapshot of every live flag for one context, for client bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
	pub flags: HashMap<String, FlagValue>,
	pub evaluated_at: DateTime<Utc>,
}

impl ClientConfig {
	pub fn new(flags: HashMap<String, FlagValue>) -> Self {
		Self {
			flags,
			evaluated_at: Utc::now(),
		}
	}
}
