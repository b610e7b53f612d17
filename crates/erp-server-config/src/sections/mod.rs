// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Configuration sections.

mod bus;
mod flags;
mod http;
mod logging;

pub use bus::{BusBackend, BusConfig, BusConfigLayer};
pub use flags::{FlagsConfig, FlagsConfigLayer};
pub use http::{HttpConfig, HttpConfigLayer};
pub use logging::{LoggingConfig, LoggingConfigLayer};
