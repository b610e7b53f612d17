// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;

use chrono::{DateTime, Utc};
use erp_flags_core::{EvaluationContext, FlagOverride, OverrideTargetType};
use tracing::{debug, instrument};

use crate::error::Result;
use crate::repository::OverrideRepository;

/// Picks the single override that applies to an evaluation, if any.
///
/// Precedence: an active user override beats an active tenant override.
/// Expired overrides are ignored but left in the store. When several active
/// overrides target the same principal, the most recently created wins.
#[derive(Clone)]
pub struct OverrideResolver {
	repository: Arc<dyn OverrideRepository>,
}

impl OverrideResolver {
	pub fn new(repository: Arc<dyn OverrideRepository>) -> Self {
		Self { repository }
	}

	pub async fn resolve(
		&self,
		flag_key: &str,
		ctx: &EvaluationContext,
	) -> Result<Option<FlagOverride>> {
		self.resolve_at(flag_key, ctx, Utc::now()).await
	}

	#[instrument(skip(self, ctx), fields(user_id = ?ctx.user(), tenant_id = ?ctx.tenant()))]
	pub async fn resolve_at(
		&self,
		flag_key: &str,
		ctx: &EvaluationContext,
		now: DateTime<Utc>,
	) -> Result<Option<FlagOverride>> {
		if ctx.user().is_none() && ctx.tenant().is_none() {
			return Ok(None);
		}

		let candidates = self
			.repository
			.find_for_evaluation(flag_key, ctx.tenant(), ctx.user())
			.await?;

		let resolved = select_override(&candidates, ctx, now).cloned();
		if let Some(ref o) = resolved {
			debug!(
				flag_key,
				override_id = %o.id,
				target_type = %o.target.target_type,
				"Override matched"
			);
		}
		Ok(resolved)
	}
}

/// Applies precedence, expiry and tie-breaking to a candidate set.
pub fn select_override<'a>(
	candidates: &'a [FlagOverride],
	ctx: &EvaluationContext,
	now: DateTime<Utc>,
) -> Option<&'a FlagOverride> {
	let newest_for = |target_type: OverrideTargetType, target_id: &str| {
		candidates
			.iter()
			.filter(|o| o.applies_to(target_type, target_id) && o.is_active_at(now))
			.max_by(|a, b| {
				a.created_at
					.cmp(&b.created_at)
					.then_with(|| a.id.cmp(&b.id))
			})
	};

	ctx
		.user()
		.and_then(|user_id| newest_for(OverrideTargetType::User, user_id))
		.or_else(|| {
			ctx
				.tenant()
				.and_then(|tenant_id| newest_for(OverrideTargetType::Tenant, tenant_id))
		})
}
