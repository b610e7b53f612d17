// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! HTTP surface for the ERP feature flag engine.
//!
//! - `POST /api/flags/{key}/evaluate` and `POST /api/flags/evaluate/batch`
//! - `POST /api/flags/client-config` - every live flag for one context
//! - `GET /api/flags/stream` - Server-Sent Events fed by the broadcast hub
//! - `/api/admin/flags/...` - mutations against the in-memory store that
//!   publish cache invalidations

pub mod api;
pub mod error;
pub mod routes;

pub use api::{create_app_state, create_router, load_seed, AppState, StartupError};
pub use erp_server_config::ServerConfig;
pub use error::{ApiError, ErrorResponse};
