// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Flag evaluation and realtime stream endpoints.
//!
//! - POST /api/flags/{key}/evaluate - Evaluate one flag
//! - POST /api/flags/evaluate/batch - Evaluate several flags; failures are per key
//! - POST /api/flags/client-config - Every live flag for one context
//! - GET /api/flags/stream - SSE stream of flag change notifications
//! - GET /api/flags/stream/stats - Broadcast hub statistics

use std::collections::HashMap;
use std::convert::Infallible;

use axum::{
	extract::{Path, State},
	response::sse::{Event, Sse},
	Json,
};
use erp_flags_core::{
	BatchEvaluationResult, ClientConfig, EvaluationContext, EvaluationResult, WireEvent,
};
use erp_server_flags::{batch_outcome, HubStats};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::error::ApiError;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EvaluateFlagRequest {
	#[serde(default)]
	pub context: EvaluationContext,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BatchEvaluateRequest {
	pub flag_keys: Vec<String>,
	#[serde(default)]
	pub context: EvaluationContext,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ClientConfigRequest {
	#[serde(default)]
	pub context: EvaluationContext,
}

#[tracing::instrument(skip(state, payload), fields(flag_key = %key))]
pub async fn evaluate_flag(
	State(state): State<AppState>,
	Path(key): Path<String>,
	Json(payload): Json<EvaluateFlagRequest>,
) -> Result<Json<EvaluationResult>, ApiError> {
	let result = state.evaluator.evaluate(&key, &payload.context).await?;
	Ok(Json(result))
}

#[tracing::instrument(skip(state, payload), fields(count = payload.flag_keys.len()))]
pub async fn evaluate_batch(
	State(state): State<AppState>,
	Json(payload): Json<BatchEvaluateRequest>,
) -> Result<Json<BatchEvaluationResult>, ApiError> {
	if payload.flag_keys.is_empty() {
		return Err(ApiError::bad_request("flag_keys must not be empty"));
	}

	let results: HashMap<_, _> = state
		.evaluator
		.evaluate_batch(&payload.flag_keys, &payload.context)
		.await
		.into_iter()
		.map(|(key, result)| (key, batch_outcome(result)))
		.collect();

	Ok(Json(BatchEvaluationResult::new(results)))
}

#[tracing::instrument(skip(state, payload))]
pub async fn client_config(
	State(state): State<AppState>,
	Json(payload): Json<ClientConfigRequest>,
) -> Result<Json<ClientConfig>, ApiError> {
	let flags = state.evaluator.client_config(&payload.context).await?;
	Ok(Json(ClientConfig::new(flags)))
}

/// GET /api/flags/stream - Register with the broadcast hub and stream its events.
///
/// The first event is `connected`; the stream ends when the hub drops the
/// client. A disconnecting peer drops the stream, which unregisters the client.
pub async fn stream_flags(
	State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
	let client = state.hub.register_client()?;
	tracing::debug!(client_id = %client.id(), "Opening flag stream");

	let events = client
		.into_stream()
		.map(|wire| Ok::<_, Infallible>(to_sse_event(wire)));

	Ok(Sse::new(events))
}

pub async fn stream_stats(State(state): State<AppState>) -> Json<HubStats> {
	Json(state.hub.stats())
}

fn to_sse_event(wire: WireEvent) -> Event {
	Event::default()
		.event(wire.event)
		.data(wire.data)
		.id(wire.id)
}
