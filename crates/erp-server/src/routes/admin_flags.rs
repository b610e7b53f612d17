// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Flag administration over the in-memory store.
//!
//! Every successful mutation publishes a cache invalidation so that caches
//! and stream clients in all processes pick up the change.

use axum::{
	extract::{Path, State},
	http::StatusCode,
	Json,
};
use chrono::{DateTime, Utc};
use erp_flags_core::{
	CacheUpdateMessage, FeatureFlag, FlagOverride, FlagStatus, FlagType, FlagValue, FlagsError,
	OverrideId, OverrideTarget, Variant,
};
use erp_server_flags::{CacheStats, FlagRepository};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::ApiError;

#[derive(Debug, Serialize, Deserialize)]
pub struct UpsertFlagRequest {
	pub name: String,
	#[serde(default)]
	pub description: Option<String>,
	pub flag_type: FlagType,
	#[serde(default)]
	pub status: FlagStatus,
	#[serde(default)]
	pub default_value: FlagValue,
	#[serde(default)]
	pub rollout_percentage: Option<u32>,
	#[serde(default)]
	pub variants: Vec<Variant>,
	#[serde(default)]
	pub tags: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateOverrideRequest {
	#[serde(flatten)]
	pub target: OverrideTarget,
	pub value: FlagValue,
	#[serde(default)]
	pub reason: Option<String>,
	#[serde(default)]
	pub expires_at: Option<DateTime<Utc>>,
	#[serde(default)]
	pub created_by: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListFlagsResponse {
	pub flags: Vec<FeatureFlag>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListOverridesResponse {
	pub overrides: Vec<FlagOverride>,
}

pub async fn list_flags(State(state): State<AppState>) -> Json<ListFlagsResponse> {
	Json(ListFlagsResponse {
		flags: state.store.list_all(),
	})
}

pub async fn get_flag(
	State(state): State<AppState>,
	Path(key): Path<String>,
) -> Result<Json<FeatureFlag>, ApiError> {
	Ok(Json(find_flag(&state, &key).await?))
}

/// PUT /api/admin/flags/{key} - Create or replace a flag.
#[tracing::instrument(skip(state, payload), fields(flag_key = %key))]
pub async fn upsert_flag(
	State(state): State<AppState>,
	Path(key): Path<String>,
	Json(payload): Json<UpsertFlagRequest>,
) -> Result<Json<FeatureFlag>, ApiError> {
	if !FeatureFlag::validate_key(&key) {
		return Err(FlagsError::InvalidFlagKey(key).into());
	}

	let mut flag = FeatureFlag::new(key.clone(), payload.name, payload.flag_type)
		.with_status(payload.status)
		.with_default_value(payload.default_value)
		.with_variants(payload.variants)
		.with_tags(payload.tags);
	flag.description = payload.description;
	flag.rollout_percentage = payload.rollout_percentage;
	flag.validate()?;

	if let Some(existing) = state.store.find_by_key(&key).await? {
		if existing.status == FlagStatus::Archived {
			return Err(FlagsError::InvalidTransition {
				code: "CANNOT_UPDATE",
				message: format!("{key}: cannot update an archived flag"),
			}
			.into());
		}
	}

	state.store.upsert_flag(flag);
	state.publish_change(CacheUpdateMessage::updated(&key)).await;
	tracing::info!(flag_key = %key, "Flag saved");

	Ok(Json(find_flag(&state, &key).await?))
}

pub async fn enable_flag(
	State(state): State<AppState>,
	Path(key): Path<String>,
) -> Result<Json<FeatureFlag>, ApiError> {
	set_status(state, key, FlagStatus::Enabled).await
}

pub async fn disable_flag(
	State(state): State<AppState>,
	Path(key): Path<String>,
) -> Result<Json<FeatureFlag>, ApiError> {
	set_status(state, key, FlagStatus::Disabled).await
}

/// POST /api/admin/flags/{key}/archive - Retire a flag; it can no longer be enabled.
pub async fn archive_flag(
	State(state): State<AppState>,
	Path(key): Path<String>,
) -> Result<Json<FeatureFlag>, ApiError> {
	set_status(state, key, FlagStatus::Archived).await
}

#[tracing::instrument(skip(state), fields(flag_key = %key))]
pub async fn delete_flag(
	State(state): State<AppState>,
	Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
	if !state.store.delete_flag(&key) {
		return Err(FlagsError::FlagNotFound(key).into());
	}
	state.publish_change(CacheUpdateMessage::deleted(&key)).await;
	tracing::info!(flag_key = %key, "Flag deleted");
	Ok(StatusCode::NO_CONTENT)
}

pub async fn list_overrides(
	State(state): State<AppState>,
	Path(key): Path<String>,
) -> Result<Json<ListOverridesResponse>, ApiError> {
	find_flag(&state, &key).await?;
	Ok(Json(ListOverridesResponse {
		overrides: state.store.list_overrides(&key),
	}))
}

#[tracing::instrument(skip(state, payload), fields(flag_key = %key))]
pub async fn create_override(
	State(state): State<AppState>,
	Path(key): Path<String>,
	Json(payload): Json<CreateOverrideRequest>,
) -> Result<(StatusCode, Json<FlagOverride>), ApiError> {
	find_flag(&state, &key).await?;
	if payload.target.target_id.trim().is_empty() {
		return Err(ApiError::bad_request("target_id must not be empty"));
	}

	let mut created = FlagOverride::new(key.clone(), payload.target, payload.value);
	created.reason = payload.reason;
	created.expires_at = payload.expires_at;
	created.created_by = payload.created_by;

	state.store.upsert_override(created.clone());
	state
		.publish_change(CacheUpdateMessage::override_updated(&key))
		.await;
	tracing::info!(
		flag_key = %key,
		override_id = %created.id,
		target_type = ?created.target.target_type,
		"Override created"
	);

	Ok((StatusCode::CREATED, Json(created)))
}

#[tracing::instrument(skip(state), fields(flag_key = %key, override_id = %id))]
pub async fn delete_override(
	State(state): State<AppState>,
	Path((key, id)): Path<(String, Uuid)>,
) -> Result<StatusCode, ApiError> {
	if !state.store.delete_override(&key, OverrideId(id)) {
		return Err(ApiError::not_found(format!("override {id} not found for flag {key}")));
	}
	state
		.publish_change(CacheUpdateMessage::override_deleted(&key))
		.await;
	Ok(StatusCode::NO_CONTENT)
}

/// GET /api/admin/cache/stats - Read cache counters; zeroed when caching is off.
pub async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
	Json(
		state
			.cache
			.as_ref()
			.map(|cache| cache.stats())
			.unwrap_or_default(),
	)
}

#[tracing::instrument(skip(state), fields(flag_key = %key))]
async fn set_status(
	state: AppState,
	key: String,
	status: FlagStatus,
) -> Result<Json<FeatureFlag>, ApiError> {
	let flag = state.store.set_status(&key, status)?;
	state.publish_change(CacheUpdateMessage::updated(&key)).await;
	tracing::info!(flag_key = %key, status = ?status, version = flag.version, "Flag status changed");
	Ok(Json(flag))
}

/// Reads through the store, not the cache, so admins see their own writes.
async fn find_flag(state: &AppState, key: &str) -> Result<FeatureFlag, ApiError> {
	state
		.store
		.find_by_key(key)
		.await?
		.ok_or_else(|| FlagsError::FlagNotFound(key.to_string()).into())
}
