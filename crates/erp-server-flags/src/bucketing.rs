// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Deterministic placement of a bucketing key into the 0..100 bucket space.
//!
//! The same `(flag_key, bucketing_key)` pair always lands in the same bucket,
//! across processes and restarts. Different flags spread the same key
//! independently.

use std::io::Cursor;

use erp_flags_core::Variant;
use murmur3::murmur3_32;

/// Number of buckets; percentages and variant weights are expressed against it.
pub const BUCKET_COUNT: u32 = 100;

/// Returns the bucket in `0..100` for a bucketing key under a flag.
pub fn bucket_for(flag_key: &str, bucketing_key: &str) -> u32 {
	let input = format!("{}:{}", flag_key, bucketing_key);
	let hash = murmur3_32(&mut Cursor::new(input.as_bytes()), 0).unwrap_or(0);
	hash % BUCKET_COUNT
}

/// Whether a bucket falls inside a percentage rollout.
pub fn in_rollout(bucket: u32, percentage: u32) -> bool {
	bucket < percentage
}

/// Selects the variant whose cumulative weight range contains `bucket`.
///
/// Variants are walked in declaration order. Returns `None` only if the
/// weights do not cover the bucket, which validated flags rule out.
pub fn select_variant(variants: &[Variant], bucket: u32) -> Option<&Variant> {
	let mut cumulative = 0u32;
	for variant in variants {
		cumulative = cumulative.saturating_add(variant.weight);
		if bucket < cumulative {
			return Some(variant);
		}
	}
	None
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_bucket_is_stable() {
		assert_eq!(
			bucket_for("billing.new_invoice", "user-1"),
			bucket_for("billing.new_invoice", "user-1")
		);
	}

	#[test]
	fn test_percentage_distribution_over_10k_keys() {
		let included = (0..10_000)
			.filter(|i| in_rollout(bucket_for("inventory.rollout", &format!("user-{i}")), 50))
			.count();
		assert!(
			(4_500..=5_500).contains(&included),
			"expected 45-55% included, got {included}"
		);
	}

	#[test]
	fn test_variant_selection_walks_cumulative_weights() {
		let variants = vec![
			Variant::new("control", 50),
			Variant::new("blue", 30),
			Variant::new("green", 20),
		];
		assert_eq!(select_variant(&variants, 0).unwrap().key, "control");
		assert_eq!(select_variant(&variants, 49).unwrap().key, "control");
		assert_eq!(select_variant(&variants, 50).unwrap().key, "blue");
		assert_eq!(select_variant(&variants, 79).unwrap().key, "blue");
		assert_eq!(select_variant(&variants, 80).unwrap().key, "green");
		assert_eq!(select_variant(&variants, 99).unwrap().key, "green");
	}

	#[test]
	fn test_zero_weight_variant_is_never_selected() {
		let variants = vec![Variant::new("never", 0), Variant::new("always", 100)];
		for bucket in 0..BUCKET_COUNT {
			assert_eq!(select_variant(&variants, bucket).unwrap().key, "always");
		}
	}

	#[test]
	fn test_variant_distribution_follows_weights() {
		let variants = vec![Variant::new("a", 70), Variant::new("b", 30)];
		let a = (0..10_000)
			.filter(|i| {
				let bucket = bucket_for("checkout.layout", &format!("tenant-{i}"));
				select_variant(&variants, bucket).unwrap().key == "a"
			})
			.count();
		assert!((6_500..=7_500).contains(&a), "expected ~70% a, got {a}");
	}
}

#[cfg(test)]
mod proptest_tests {
	use super::*;
	use proptest::prelude::*;

	proptest! {
		#[test]
		fn bucket_is_in_range(flag_key in "[a-z][a-z0-9_.]{0,49}", key in "[a-zA-Z0-9-]{1,50}") {
			prop_assert!(bucket_for(&flag_key, &key) < BUCKET_COUNT);
		}

		#[test]
		fn rollout_is_monotonic(flag_key in "[a-z][a-z0-9_.]{0,49}", key in "[a-zA-Z0-9-]{1,50}") {
			let bucket = bucket_for(&flag_key, &key);
			let mut included = false;
			for pct in 0..=BUCKET_COUNT {
				let now = in_rollout(bucket, pct);
				prop_assert!(!included || now, "excluded at {}% after inclusion", pct);
				included = now;
			}
			prop_assert!(included);
		}

		#[test]
		fn rollout_zero_never_includes(flag_key in "[a-z][a-z0-9_.]{0,49}", key in "[a-zA-Z0-9-]{1,50}") {
			prop_assert!(!in_rollout(bucket_for(&flag_key, &key), 0));
		}

		#[test]
		fn full_weight_always_selects(mut cuts in proptest::collection::vec(0u32..=100, 0..5), bucket in 0u32..100) {
			cuts.push(0);
			cuts.push(BUCKET_COUNT);
			cuts.sort_unstable();
			let variants: Vec<Variant> = cuts
				.windows(2)
				.enumerate()
				.map(|(i, w)| Variant::new(format!("v{i}"), w[1] - w[0]))
				.collect();
			let selected = select_variant(&variants, bucket);
			prop_assert!(selected.is_some());
			prop_assert!(selected.unwrap().weight > 0);
		}
	}
}
