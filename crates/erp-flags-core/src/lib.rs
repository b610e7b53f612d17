// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the ERP feature flags system.
//!
//! This crate holds the types shared by the server-side evaluation engine
//! (`erp-server-flags`) and the HTTP surface (`erp-server`). It does no I/O.
//!
//! # Overview
//!
//! - Boolean, percentage-rollout and weighted-variant flags
//! - Per-user and per-tenant overrides with optional expiry
//! - Cache invalidation messages carried by the invalidation bus
//! - SSE event types and their wire framing
//!
//! # Example
//!
//! ```
//! use erp_flags_core::{
//!     EvaluationContext, EvaluationReason, EvaluationResult, FlagValue,
//! };
//!
//! let ctx = EvaluationContext::new()
//!     .with_tenant_id("acme")
//!     .with_user_id("user-42");
//! assert_eq!(ctx.bucketing_key(), "user-42");
//!
//! let result = EvaluationResult::new(
//!     "inventory.bulk_import",
//!     FlagValue::on(),
//!     EvaluationReason::Default,
//!     1,
//! );
//! assert!(result.value.enabled);
//! ```

pub mod error;
pub mod evaluation;
pub mod flag;
pub mod invalidation;
pub mod overrides;
pub mod sse;

pub use error::{FlagsError, Result};
pub use evaluation::{
	BatchEvaluationResult, BatchOutcome, ClientConfig, EvaluationContext, EvaluationError,
	EvaluationReason, EvaluationResult, ANONYMOUS_BUCKETING_KEY,
};
pub use flag::{normalize_tags, FeatureFlag, FlagId, FlagStatus, FlagType, FlagValue, Variant};
pub use invalidation::{CacheUpdateAction, CacheUpdateMessage};
pub use overrides::{FlagOverride, OverrideId, OverrideTarget, OverrideTargetType};
pub use sse::{FlagStreamEvent, WireEvent, WILDCARD_FLAG_KEY};

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn flag_key_starts_with_lowercase(s in "[a-z][a-z0-9_.-]{0,99}") {
			prop_assert!(FeatureFlag::validate_key(&s));
		}

		#[test]
		fn flag_key_rejects_uppercase_start(s in "[A-Z][a-z0-9_]{0,50}") {
			prop_assert!(!FeatureFlag::validate_key(&s));
		}

		#[test]
		fn flag_key_rejects_digit_start(s in "[0-9][a-z0-9_]{0,50}") {
			prop_assert!(!FeatureFlag::validate_key(&s));
		}

		#[test]
		fn flag_key_rejects_too_long(s in "[a-z]{101,150}") {
			prop_assert!(!FeatureFlag::validate_key(&s));
		}

		#[test]
		fn normalized_tags_are_unique_and_lowercase(tags in proptest::collection::vec("[A-Za-z ]{0,8}", 0..12)) {
			let normalized = normalize_tags(tags);
			let mut dedup = normalized.clone();
			dedup.sort();
			dedup.dedup();
			prop_assert_eq!(dedup.len(), normalized.len());
			for tag in &normalized {
				prop_assert_eq!(tag, &tag.to_lowercase());
				prop_assert!(!tag.is_empty());
			}
		}
	}
}
