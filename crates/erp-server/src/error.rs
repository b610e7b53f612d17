// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! API error responses.

use axum::{
	http::StatusCode,
	response::{IntoResponse, Response},
	Json,
};
use erp_flags_core::FlagsError;
use erp_server_flags::FlagsServerError;
use serde::{Deserialize, Serialize};

/// JSON body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
	pub error: String,
	pub code: String,
}

#[derive(Debug)]
pub struct ApiError {
	pub status: StatusCode,
	pub code: &'static str,
	pub message: String,
}

impl ApiError {
	pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
		Self {
			status,
			code,
			message: message.into(),
		}
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
	}

	pub fn bad_request(message: impl Into<String>) -> Self {
		Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
	}
}

impl From<FlagsServerError> for ApiError {
	fn from(err: FlagsServerError) -> Self {
		let status = match &err {
			FlagsServerError::Core(FlagsError::FlagNotFound(_)) => StatusCode::NOT_FOUND,
			FlagsServerError::Core(FlagsError::InvalidState(_)) => StatusCode::UNPROCESSABLE_ENTITY,
			FlagsServerError::Core(FlagsError::InvalidFlagKey(_)) => StatusCode::BAD_REQUEST,
			FlagsServerError::Core(FlagsError::InvalidTransition { .. }) => StatusCode::CONFLICT,
			FlagsServerError::Unavailable(_)
			| FlagsServerError::Redis(_)
			| FlagsServerError::HubNotRunning => StatusCode::SERVICE_UNAVAILABLE,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};
		if status == StatusCode::INTERNAL_SERVER_ERROR {
			tracing::error!(error = %err, "Request failed");
		}
		Self::new(status, err.code(), err.to_string())
	}
}

impl From<FlagsError> for ApiError {
	fn from(err: FlagsError) -> Self {
		FlagsServerError::from(err).into()
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		(
			self.status,
			Json(ErrorResponse {
				error: self.message,
				code: self.code.to_string(),
			}),
		)
			.into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_status_mapping() {
		let cases = [
			(
				FlagsServerError::Core(FlagsError::FlagNotFound("a".into())),
				StatusCode::NOT_FOUND,
				"NOT_FOUND",
			),
			(
				FlagsServerError::Core(FlagsError::InvalidState("weights".into())),
				StatusCode::UNPROCESSABLE_ENTITY,
				"INVALID_STATE",
			),
			(
				FlagsServerError::Core(FlagsError::InvalidTransition {
					code: "CANNOT_ENABLE",
					message: "sales.quotes: cannot enable an archived flag".into(),
				}),
				StatusCode::CONFLICT,
				"CANNOT_ENABLE",
			),
			(
				FlagsServerError::Unavailable("down".into()),
				StatusCode::SERVICE_UNAVAILABLE,
				"UNAVAILABLE",
			),
			(
				FlagsServerError::HubNotRunning,
				StatusCode::SERVICE_UNAVAILABLE,
				"HUB_NOT_RUNNING",
			),
			(
				FlagsServerError::Repository("db".into()),
				StatusCode::INTERNAL_SERVER_ERROR,
				"INTERNAL",
			),
		];

		for (err, status, code) in cases {
			let api: ApiError = err.into();
			assert_eq!(api.status, status);
			assert_eq!(api.code, code);
		}
	}
}
