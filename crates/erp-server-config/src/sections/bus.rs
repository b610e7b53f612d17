// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Invalidation bus configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_CHANNEL: &str = "erp:feature_flags:invalidation";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusBackend {
	/// Single process only.
	#[default]
	Memory,
	/// Redis PUB/SUB, shared by every server process.
	Redis,
}

impl std::str::FromStr for BusBackend {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.to_ascii_lowercase().as_str() {
			"memory" => Ok(BusBackend::Memory),
			"redis" => Ok(BusBackend::Redis),
			other => Err(format!("unknown bus backend '{other}', expected memory or redis")),
		}
	}
}

impl std::fmt::Display for BusBackend {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			BusBackend::Memory => write!(f, "memory"),
			BusBackend::Redis => write!(f, "redis"),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BusConfigLayer {
	pub backend: Option<BusBackend>,
	pub redis_url: Option<String>,
	pub channel: Option<String>,
}

impl BusConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.backend.is_some() {
			self.backend = other.backend;
		}
		if other.redis_url.is_some() {
			self.redis_url = other.redis_url;
		}
		if other.channel.is_some() {
			self.channel = other.channel;
		}
	}

	pub fn finalize(self) -> BusConfig {
		BusConfig {
			backend: self.backend.unwrap_or_default(),
			redis_url: self.redis_url,
			channel: self.channel.unwrap_or_else(|| DEFAULT_CHANNEL.to_string()),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusConfig {
	pub backend: BusBackend,
	pub redis_url: Option<String>,
	pub channel: String,
}

impl BusConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.backend == BusBackend::Redis && self.redis_url.is_none() {
			return Err(ConfigError::Validation(
				"bus.backend = \"redis\" requires bus.redis_url (ERP_SERVER_BUS_REDIS_URL)"
					.to_string(),
			));
		}
		if self.channel.trim().is_empty() {
			return Err(ConfigError::Validation(
				"bus.channel must not be empty".to_string(),
			));
		}
		Ok(())
	}
}

impl Default for BusConfig {
	fn default() -> Self {
		BusConfigLayer::default().finalize()
	}
}
