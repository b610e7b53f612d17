// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Feature flag engine and realtime hub configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_CLIENT_BUFFER_SIZE: usize = 100;
const DEFAULT_CACHE_TTL_SECS: u64 = 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FlagsConfigLayer {
	pub heartbeat_interval_secs: Option<u64>,
	pub client_buffer_size: Option<usize>,
	pub cache_ttl_secs: Option<u64>,
	pub seed_file: Option<PathBuf>,
}

impl FlagsConfigLayer {
	pub fn merge(&mut self, other: Self) {
		if other.heartbeat_interval_secs.is_some() {
			self.heartbeat_interval_secs = other.heartbeat_interval_secs;
		}
		if other.client_buffer_size.is_some() {
			self.client_buffer_size = other.client_buffer_size;
		}
		if other.cache_ttl_secs.is_some() {
			self.cache_ttl_secs = other.cache_ttl_secs;
		}
		if other.seed_file.is_some() {
			self.seed_file = other.seed_file;
		}
	}

	pub fn finalize(self) -> FlagsConfig {
		FlagsConfig {
			heartbeat_interval_secs: self
				.heartbeat_interval_secs
				.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_SECS),
			client_buffer_size: self.client_buffer_size.unwrap_or(DEFAULT_CLIENT_BUFFER_SIZE),
			cache_ttl_secs: self.cache_ttl_secs.unwrap_or(DEFAULT_CACHE_TTL_SECS),
			seed_file: self.seed_file,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlagsConfig {
	pub heartbeat_interval_secs: u64,
	pub client_buffer_size: usize,
	/// Zero disables the read cache.
	pub cache_ttl_secs: u64,
	/// JSON file of flags and overrides loaded into the in-memory store at startup.
	pub seed_file: Option<PathBuf>,
}

impl FlagsConfig {
	pub fn heartbeat_interval(&self) -> Duration {
		Duration::from_secs(self.heartbeat_interval_secs)
	}

	pub fn cache_ttl(&self) -> Duration {
		Duration::from_secs(self.cache_ttl_secs)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.heartbeat_interval_secs == 0 {
			return Err(ConfigError::Validation(
				"flags.heartbeat_interval_secs must be greater than zero".to_string(),
			));
		}
		if self.client_buffer_size == 0 {
			return Err(ConfigError::Validation(
				"flags.client_buffer_size must be greater than zero".to_string(),
			));
		}
		Ok(())
	}
}

impl Default for FlagsConfig {
	fn default() -> Self {
		FlagsConfigLayer::default().finalize()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_default_values() {
		let config = FlagsConfig::default();
		assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
		assert_eq!(config.client_buffer_size, 100);
		assert_eq!(config.cache_ttl(), Duration::from_secs(60));
		assert!(config.seed_file.is_none());
		assert!(config.validate().is_ok());
	}

	#[test]
	fn test_zero_values_are_rejected() {
		let config = FlagsConfigLayer {
			heartbeat_interval_secs: Some(0),
			..Default::default()
		}
		.finalize();
		assert!(config.validate().is_err());

		let config = FlagsConfigLayer {
			client_buffer_size: Some(0),
			..Default::default()
		}
		.finalize();
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_deserialize_from_toml() {
		let layer: FlagsConfigLayer = toml::from_str(
			r#"
heartbeat_interval_secs = 15
seed_file = "/var/lib/erp/flags.json"
"#,
		)
		.unwrap();
		assert_eq!(layer.heartbeat_interval_secs, Some(15));
		assert_eq!(
			layer.seed_file,
			Some(PathBuf::from("/var/lib/erp/flags.json"))
		);
		assert!(layer.client_buffer_size.is_none());
	}
}
