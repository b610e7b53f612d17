// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use erp_flags_core::{
	BatchOutcome, EvaluationContext, EvaluationReason, EvaluationResult, FeatureFlag,
	FlagOverride, FlagType, FlagValue, FlagsError, OverrideTargetType,
};
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::bucketing::{bucket_for, in_rollout, select_variant};
use crate::error::Result;
use crate::repository::{FlagRepository, OverrideRepository};
use crate::resolver::OverrideResolver;

/// Evaluates a flag for a given context.
///
/// The evaluation order is:
/// 1. A flag that is not `enabled` serves its off value; overrides are not consulted
/// 2. A matching override (already resolved by the caller) wins
/// 3. The stored configuration must be valid for the flag type
/// 4. Boolean flags serve the stored default
/// 5. Percentage flags bucket the context against the rollout
/// 6. Variant flags pick a variant by cumulative weight
///
/// Pure: the result depends only on the arguments.
pub fn evaluate_flag(
	flag: &FeatureFlag,
	matched_override: Option<&FlagOverride>,
	context: &EvaluationContext,
) -> Result<EvaluationResult> {
	if !flag.status.is_live() {
		return Ok(EvaluationResult::new(
			&flag.key,
			flag.off_value(),
			EvaluationReason::Disabled,
			flag.version,
		));
	}

	if let Some(o) = matched_override {
		let reason = match o.target.target_type {
			OverrideTargetType::User => EvaluationReason::OverrideUser,
			OverrideTargetType::Tenant => EvaluationReason::OverrideTenant,
		};
		return Ok(EvaluationResult::new(
			&flag.key,
			o.value.clone(),
			reason,
			flag.version,
		));
	}

	flag.validate()?;

	let result = match flag.flag_type {
		FlagType::Boolean => EvaluationResult::new(
			&flag.key,
			flag.default_value.clone(),
			EvaluationReason::Default,
			flag.version,
		),
		FlagType::Percentage => {
			// validate() guarantees the percentage is present
			let percentage = flag.rollout_percentage.unwrap_or(0);
			let bucket = bucket_for(&flag.key, context.bucketing_key());
			let value = FlagValue {
				enabled: in_rollout(bucket, percentage),
				..flag.default_value.clone()
			};
			EvaluationResult::new(&flag.key, value, EvaluationReason::Percentage, flag.version)
		}
		FlagType::Variant => {
			let bucket = bucket_for(&flag.key, context.bucketing_key());
			let variant = select_variant(&flag.variants, bucket).ok_or_else(|| {
				FlagsError::InvalidState(format!(
					"variant flag {} has no variant for bucket {bucket}",
					flag.key
				))
			})?;
			let value = FlagValue {
				enabled: true,
				variant: Some(variant.key.clone()),
				metadata: flag.default_value.metadata.clone(),
			};
			EvaluationResult::new(&flag.key, value, EvaluationReason::Variant, flag.version)
		}
	};

	Ok(result)
}

/// Server-side evaluation engine backed by the flag store.
#[derive(Clone)]
pub struct FlagEvaluator {
	flags: Arc<dyn FlagRepository>,
	resolver: OverrideResolver,
}

impl FlagEvaluator {
	pub fn new(flags: Arc<dyn FlagRepository>, overrides: Arc<dyn OverrideRepository>) -> Self {
		Self {
			flags,
			resolver: OverrideResolver::new(overrides),
		}
	}

	/// Evaluates a single flag by key.
	pub async fn evaluate(
		&self,
		flag_key: &str,
		ctx: &EvaluationContext,
	) -> Result<EvaluationResult> {
		self.evaluate_at(flag_key, ctx, Utc::now()).await
	}

	#[instrument(skip(self, ctx, now), fields(bucketing_key = ctx.bucketing_key()))]
	pub async fn evaluate_at(
		&self,
		flag_key: &str,
		ctx: &EvaluationContext,
		now: DateTime<Utc>,
	) -> Result<EvaluationResult> {
		let flag = self
			.flags
			.find_by_key(flag_key)
			.await?
			.ok_or_else(|| FlagsError::FlagNotFound(flag_key.to_string()))?;

		let matched = if flag.status.is_live() {
			self.resolver.resolve_at(flag_key, ctx, now).await?
		} else {
			None
		};

		let result = evaluate_flag(&flag, matched.as_ref(), ctx)?;
		debug!(
			flag_key,
			enabled = result.value.enabled,
			reason = ?result.reason,
			"Flag evaluated"
		);
		Ok(result)
	}

	/// Evaluates several flags concurrently. A failing key never affects the others.
	pub async fn evaluate_batch(
		&self,
		flag_keys: &[String],
		ctx: &EvaluationContext,
	) -> HashMap<String, Result<EvaluationResult>> {
		let mut seen = HashSet::new();
		let unique: Vec<&String> = flag_keys.iter().filter(|k| seen.insert(*k)).collect();

		let results = join_all(unique.iter().map(|key| self.evaluate(key, ctx))).await;

		unique
			.into_iter()
			.cloned()
			.zip(results)
			.collect()
	}

	/// Evaluates every enabled flag for `ctx`.
	///
	/// Flags that fail to evaluate are logged and left out of the snapshot.
	#[instrument(skip(self, ctx))]
	pub async fn client_config(&self, ctx: &EvaluationContext) -> Result<HashMap<String, FlagValue>> {
		let flags = self.flags.list_enabled().await?;
		let now = Utc::now();

		let evaluations = join_all(flags.iter().map(|flag| async move {
			let matched = self.resolver.resolve_at(&flag.key, ctx, now).await?;
			evaluate_flag(flag, matched.as_ref(), ctx)
		}))
		.await;

		let mut snapshot = HashMap::with_capacity(flags.len());
		for (flag, evaluation) in flags.iter().zip(evaluations) {
			match evaluation {
				Ok(result) => {
					snapshot.insert(flag.key.clone(), result.value);
				}
				Err(e) => {
					warn!(flag_key = %flag.key, error = %e, "Skipping flag in client config");
				}
			}
		}
		Ok(snapshot)
	}
}

/// Converts one batch entry into its wire shape.
pub fn batch_outcome(result: Result<EvaluationResult>) -> BatchOutcome {
	match result {
		Ok(result) => BatchOutcome::Evaluated(result),
		Err(e) => BatchOutcome::failed(e.code(), e.to_string()),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::FlagsServerError;
	use crate::repository::InMemoryFlagStore;
	use chrono::Duration;
	use erp_flags_core::{FlagStatus, OverrideTarget, Variant};

	fn boolean_flag(key: &str, enabled: bool) -> FeatureFlag {
		FeatureFlag::new(key, key, FlagType::Boolean)
			.with_status(FlagStatus::Enabled)
			.with_default_value(if enabled { FlagValue::on() } else { FlagValue::off() })
	}

	fn percentage_flag(key: &str, percentage: u32) -> FeatureFlag {
		FeatureFlag::new(key, key, FlagType::Percentage)
			.with_status(FlagStatus::Enabled)
			.with_rollout_percentage(percentage)
	}

	fn variant_flag(key: &str) -> FeatureFlag {
		FeatureFlag::new(key, key, FlagType::Variant)
			.with_status(FlagStatus::Enabled)
			.with_variants(vec![Variant::new("control", 50), Variant::new("treatment", 50)])
	}

	fn evaluator(store: InMemoryFlagStore) -> FlagEvaluator {
		let store = Arc::new(store);
		FlagEvaluator::new(store.clone(), store)
	}

	#[test]
	fn test_disabled_flag_serves_off_value() {
		let flag = boolean_flag("a", true).with_status(FlagStatus::Disabled);
		let result = evaluate_flag(&flag, None, &EvaluationContext::new()).unwrap();
		assert!(!result.value.enabled);
		assert_eq!(result.reason, EvaluationReason::Disabled);
	}

	#[test]
	fn test_archived_flag_ignores_override() {
		let flag = boolean_flag("a", true).with_status(FlagStatus::Archived);
		let o = FlagOverride::new("a", OverrideTarget::user("u"), FlagValue::on());
		let ctx = EvaluationContext::new().with_user_id("u");

		let result = evaluate_flag(&flag, Some(&o), &ctx).unwrap();
		assert!(!result.value.enabled);
		assert_eq!(result.reason, EvaluationReason::Disabled);
	}

	#[test]
	fn test_draft_flag_is_off() {
		let flag = boolean_flag("a", true).with_status(FlagStatus::Draft);
		let result = evaluate_flag(&flag, None, &EvaluationContext::new()).unwrap();
		assert!(!result.value.enabled);
	}

	#[test]
	fn test_boolean_flag_serves_default() {
		let result =
			evaluate_flag(&boolean_flag("a", true), None, &EvaluationContext::new()).unwrap();
		assert!(result.value.enabled);
		assert_eq!(result.reason, EvaluationReason::Default);
	}

	#[test]
	fn test_override_wins_over_type_logic() {
		let flag = percentage_flag("p", 0);
		let o = FlagOverride::new("p", OverrideTarget::tenant("t"), FlagValue::on());
		let ctx = EvaluationContext::new().with_tenant_id("t");

		let result = evaluate_flag(&flag, Some(&o), &ctx).unwrap();
		assert!(result.value.enabled);
		assert_eq!(result.reason, EvaluationReason::OverrideTenant);
	}

	#[test]
	fn test_percentage_bounds() {
		let ctx = EvaluationContext::new().with_user_id("user-7");
		assert!(!evaluate_flag(&percentage_flag("p", 0), None, &ctx).unwrap().value.enabled);
		assert!(evaluate_flag(&percentage_flag("p", 100), None, &ctx).unwrap().value.enabled);
	}

	#[test]
	fn test_percentage_is_deterministic() {
		let flag = percentage_flag("billing.rollout", 37);
		let ctx = EvaluationContext::new().with_tenant_id("acme");
		let first = evaluate_flag(&flag, None, &ctx).unwrap();
		for _ in 0..10 {
			assert_eq!(evaluate_flag(&flag, None, &ctx).unwrap().value, first.value);
		}
	}

	#[test]
	fn test_variant_flag_selects_declared_variant() {
		let flag = variant_flag("checkout.layout");
		let ctx = EvaluationContext::new().with_user_id("u-3");
		let result = evaluate_flag(&flag, None, &ctx).unwrap();
		assert!(result.value.enabled);
		assert_eq!(result.reason, EvaluationReason::Variant);
		let variant = result.value.variant.unwrap();
		assert!(variant == "control" || variant == "treatment");
	}

	#[test]
	fn test_corrupt_variant_flag_is_invalid_state() {
		let flag = variant_flag("broken").with_variants(vec![Variant::new("only", 60)]);
		let err = evaluate_flag(&flag, None, &EvaluationContext::new()).unwrap_err();
		assert!(err.is_invalid_state());
	}

	#[test]
	fn test_override_applies_to_corrupt_flag() {
		let flag = variant_flag("broken").with_variants(vec![Variant::new("only", 60)]);
		let o = FlagOverride::new(
			"broken",
			OverrideTarget::user("u1"),
			FlagValue::on().with_variant("only"),
		);
		let ctx = EvaluationContext::new().with_user_id("u1");

		let result = evaluate_flag(&flag, Some(&o), &ctx).unwrap();
		assert_eq!(result.reason, EvaluationReason::OverrideUser);
		assert_eq!(result.value.variant.as_deref(), Some("only"));

		let err = evaluate_flag(&flag, None, &EvaluationContext::new().with_user_id("u2"))
			.unwrap_err();
		assert!(err.is_invalid_state());
	}

	#[tokio::test]
	async fn test_evaluate_unknown_flag_is_not_found() {
		let evaluator = evaluator(InMemoryFlagStore::new());
		let err = evaluator
			.evaluate("missing", &EvaluationContext::new())
			.await
			.unwrap_err();
		assert!(err.is_not_found());
	}

	#[tokio::test]
	async fn test_evaluate_applies_user_override() {
		let store = InMemoryFlagStore::new();
		store.upsert_flag(boolean_flag("reports.export", false));
		store.upsert_override(FlagOverride::new(
			"reports.export",
			OverrideTarget::user("u1"),
			FlagValue::on(),
		));
		let evaluator = evaluator(store);

		let ctx = EvaluationContext::new().with_user_id("u1");
		let result = evaluator.evaluate("reports.export", &ctx).await.unwrap();
		assert!(result.value.enabled);
		assert_eq!(result.reason, EvaluationReason::OverrideUser);

		let other = EvaluationContext::new().with_user_id("u2");
		let result = evaluator.evaluate("reports.export", &other).await.unwrap();
		assert!(!result.value.enabled);
		assert_eq!(result.reason, EvaluationReason::Default);
	}

	#[tokio::test]
	async fn test_expired_override_is_inert() {
		let store = InMemoryFlagStore::new();
		store.upsert_flag(boolean_flag("reports.export", false));
		store.upsert_override(
			FlagOverride::new("reports.export", OverrideTarget::user("u1"), FlagValue::on())
				.with_expires_at(Utc::now() - Duration::seconds(5)),
		);
		let evaluator = evaluator(store);

		let ctx = EvaluationContext::new().with_user_id("u1");
		let result = evaluator.evaluate("reports.export", &ctx).await.unwrap();
		assert!(!result.value.enabled);
		assert_eq!(result.reason, EvaluationReason::Default);
	}

	#[tokio::test]
	async fn test_batch_isolates_failures() {
		let store = InMemoryFlagStore::new();
		store.upsert_flag(boolean_flag("a", true));
		store.upsert_flag(boolean_flag("b", false));
		let evaluator = evaluator(store);

		let keys = vec![
			"a".to_string(),
			"missing".to_string(),
			"b".to_string(),
			"a".to_string(),
		];
		let results = evaluator
			.evaluate_batch(&keys, &EvaluationContext::new())
			.await;

		assert_eq!(results.len(), 3);
		assert!(results["a"].as_ref().unwrap().value.enabled);
		assert!(!results["b"].as_ref().unwrap().value.enabled);
		assert!(matches!(
			results["missing"],
			Err(FlagsServerError::Core(FlagsError::FlagNotFound(_)))
		));
	}

	#[tokio::test]
	async fn test_client_config_skips_broken_flags() {
		let store = InMemoryFlagStore::new();
		store.upsert_flag(boolean_flag("a", true));
		store.upsert_flag(percentage_flag("broken", 0).with_rollout_percentage(250));
		store.upsert_flag(boolean_flag("off", true).with_status(FlagStatus::Disabled));
		let evaluator = evaluator(store);

		let config = evaluator
			.client_config(&EvaluationContext::new().with_tenant_id("acme"))
			.await
			.unwrap();

		assert_eq!(config.len(), 1);
		assert!(config["a"].enabled);
	}

	#[test]
	fn test_batch_outcome_maps_errors() {
		let outcome = batch_outcome(Err(FlagsError::FlagNotFound("x".into()).into()));
		assert_eq!(outcome.error().unwrap().code, "NOT_FOUND");
	}
}
