// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

/// Errors raised by the flag domain model.
#[derive(Debug, Error)]
pub enum FlagsError {
	#[error("flag not found: {0}")]
	FlagNotFound(String),

	/// The stored record cannot be evaluated, e.g. variant weights that do not sum to 100.
	#[error("invalid flag state: {0}")]
	InvalidState(String),

	#[error("invalid flag key: {0}")]
	InvalidFlagKey(String),

	/// A lifecycle change the current status does not allow.
	#[error("invalid status transition: {message}")]
	InvalidTransition { code: &'static str, message: String },

	#[error("serialization error: {0}")]
	Serialization(String),
}

impl FlagsError {
	/// Stable machine-readable code, used on the wire for batch failures.
	pub fn code(&self) -> &'static str {
		match self {
			FlagsError::FlagNotFound(_) => "NOT_FOUND",
			FlagsError::InvalidState(_) => "INVALID_STATE",
			FlagsError::InvalidFlagKey(_) => "INVALID_FLAG_KEY",
			FlagsError::InvalidTransition { code, .. } => code,
			FlagsError::Serialization(_) => "SERIALIZATION",
		}
	}
}

impl From<serde_json::Error> for FlagsError {
	fn from(err: serde_json::Error) -> Self {
		FlagsError::Serialization(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, FlagsError>;
