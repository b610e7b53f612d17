// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

/// Errors specific to the feature flags server.
#[derive(Debug, Error)]
pub enum FlagsServerError {
	#[error(transparent)]
	Core(#[from] erp_flags_core::FlagsError),

	#[error("repository error: {0}")]
	Repository(String),

	/// The invalidation bus transport is down or closed.
	#[error("bus unavailable: {0}")]
	Unavailable(String),

	#[error("subscription cancelled")]
	SubscriptionCancelled,

	#[error("broadcast hub already started")]
	HubAlreadyStarted,

	#[error("broadcast hub is not running")]
	HubNotRunning,

	#[error("serialization error: {0}")]
	Serialization(#[from] serde_json::Error),

	#[error("redis error: {0}")]
	Redis(#[from] redis::RedisError),

	#[error("internal error: {0}")]
	Internal(String),
}

impl FlagsServerError {
	pub fn is_not_found(&self) -> bool {
		matches!(
			self,
			FlagsServerError::Core(erp_flags_core::FlagsError::FlagNotFound(_))
		)
	}

	pub fn is_invalid_state(&self) -> bool {
		matches!(
			self,
			FlagsServerError::Core(erp_flags_core::FlagsError::InvalidState(_))
		)
	}

	pub fn is_unavailable(&self) -> bool {
		matches!(
			self,
			FlagsServerError::Unavailable(_) | FlagsServerError::Redis(_)
		)
	}

	/// Stable machine-readable code for API responses.
	pub fn code(&self) -> &'static str {
		match self {
			FlagsServerError::Core(e) => e.code(),
			FlagsServerError::Unavailable(_) | FlagsServerError::Redis(_) => "UNAVAILABLE",
			FlagsServerError::SubscriptionCancelled => "CANCELLED",
			FlagsServerError::HubAlreadyStarted => "HUB_ALREADY_STARTED",
			FlagsServerError::HubNotRunning => "HUB_NOT_RUNNING",
			FlagsServerError::Repository(_)
			| FlagsServerError::Serialization(_)
			| FlagsServerError::Internal(_) => "INTERNAL",
		}
	}
}

pub type Result<T> = std::result::Result<T, FlagsServerError>;
