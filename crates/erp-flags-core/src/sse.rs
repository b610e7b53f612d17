// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SSE (Server-Sent Events) types for real-time flag invalidation.
//!
//! # Events
//!
//! - `connected` - First event on a new stream, carries the client id
//! - `flag_updated` - A flag (or one of its overrides) changed; re-fetch it.
//!   Key `*` means re-fetch everything.
//! - `heartbeat` - Keep-alive (every 30s by default)
//!
//! # Example
//!
//! ```
//! use erp_flags_core::sse::{FlagStreamEvent, WireEvent};
//! use erp_flags_core::CacheUpdateMessage;
//!
//! let event = FlagStreamEvent::from_cache_update(&CacheUpdateMessage::deleted("billing.v2")).unwrap();
//! let wire = WireEvent::from_stream_event(&event, 7).unwrap();
//! assert_eq!(
//!     wire.encode(),
//!     "event: flag_updated\ndata: {\"key\":\"billing.v2\",\"value\":{\"enabled\":false}}\nid: 7\n\n"
//! );
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CacheUpdateAction, CacheUpdateMessage, Result};

/// Flag key used in `flag_updated` events that invalidate every flag.
pub const WILDCARD_FLAG_KEY: &str = "*";

/// SSE event types for flag streaming.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum FlagStreamEvent {
	#[serde(rename = "connected")]
	Connected(ConnectedData),

	#[serde(rename = "flag_updated")]
	FlagUpdated(FlagUpdatedData),

	#[serde(rename = "heartbeat")]
	Heartbeat(HeartbeatData),
}

impl FlagStreamEvent {
	/// Returns the event type name as a string.
	pub fn event_type(&self) -> &'static str {
		match self {
			FlagStreamEvent::Connected(_) => "connected",
			FlagStreamEvent::FlagUpdated(_) => "flag_updated",
			FlagStreamEvent::Heartbeat(_) => "heartbeat",
		}
	}

	pub fn connected(client_id: impl Into<String>) -> Self {
		FlagStreamEvent::Connected(ConnectedData {
			client_id: client_id.into(),
		})
	}

	pub fn flag_updated(key: impl Into<String>, enabled: bool) -> Self {
		FlagStreamEvent::FlagUpdated(FlagUpdatedData {
			key: key.into(),
			value: FlagUpdatedValue { enabled },
		})
	}

	pub fn heartbeat() -> Self {
		FlagStreamEvent::Heartbeat(HeartbeatData {
			timestamp: Utc::now(),
		})
	}

	/// Translates a bus message into the event pushed to clients.
	///
	/// Returns `None` for actions that have no client-visible meaning.
	pub fn from_cache_update(msg: &CacheUpdateMessage) -> Option<Self> {
		match msg.action {
			CacheUpdateAction::Updated
			| CacheUpdateAction::OverrideUpdated
			| CacheUpdateAction::OverrideDeleted => {
				Some(Self::flag_updated(msg.flag_key.clone(), true))
			}
			CacheUpdateAction::Deleted => Some(Self::flag_updated(msg.flag_key.clone(), false)),
			CacheUpdateAction::InvalidateAll => Some(Self::flag_updated(WILDCARD_FLAG_KEY, true)),
			CacheUpdateAction::Unknown => None,
		}
	}

	/// Serializes only the payload, without the event tag.
	pub fn data_json(&self) -> Result<String> {
		let json = match self {
			FlagStreamEvent::Connected(data) => serde_json::to_string(data)?,
			FlagStreamEvent::FlagUpdated(data) => serde_json::to_string(data)?,
			FlagStreamEvent::Heartbeat(data) => serde_json::to_string(data)?,
		};
		Ok(json)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectedData {
	pub client_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlagUpdatedData {
	pub key: String,
	pub value: FlagUpdatedValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlagUpdatedValue {
	pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatData {
	pub timestamp: DateTime<Utc>,
}

/// A framed SSE message, ready to be written to a client stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireEvent {
	pub event: String,
	/// Single-line JSON payload.
	pub data: String,
	pub id: String,
}

impl WireEvent {
	pub fn new(event: impl Into<String>, data: impl Into<String>, id: impl Into<String>) -> Self {
		Self {
			event: event.into(),
			data: data.into(),
			id: id.into(),
		}
	}

	pub fn from_stream_event(event: &FlagStreamEvent, id: u64) -> Result<Self> {
		Ok(Self::new(event.event_type(), event.data_json()?, id.to_string()))
	}

	/// Encodes the event as `event: <name>\ndata: <json>\nid: <id>\n\n`.
	pub fn encode(&self) -> String {
		format!("event: {}\ndata: {}\nid: {}\n\n", self.event, self.data, self.id)
	}
}
