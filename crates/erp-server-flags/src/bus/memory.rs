// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use erp_flags_core::CacheUpdateMessage;
use parking_lot::RwLock;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{dispatch, InvalidationBus, MessageHandler};
use crate::error::{FlagsServerError, Result};

/// Default number of messages buffered per subscriber.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// Single-process invalidation bus.
///
/// A subscriber that falls more than `capacity` messages behind receives a
/// synthesized `invalidate_all` in place of what it missed.
pub struct InMemoryBus {
	sender: RwLock<Option<broadcast::Sender<CacheUpdateMessage>>>,
}

impl InMemoryBus {
	pub fn new(capacity: usize) -> Self {
		let (sender, _) = broadcast::channel(capacity.max(1));
		Self {
			sender: RwLock::new(Some(sender)),
		}
	}

	pub fn with_defaults() -> Self {
		Self::new(DEFAULT_BUS_CAPACITY)
	}

	pub fn subscriber_count(&self) -> usize {
		self
			.sender
			.read()
			.as_ref()
			.map(broadcast::Sender::receiver_count)
			.unwrap_or(0)
	}

	fn closed() -> FlagsServerError {
		FlagsServerError::Unavailable("in-memory bus closed".to_string())
	}
}

impl Default for InMemoryBus {
	fn default() -> Self {
		Self::with_defaults()
	}
}

#[async_trait]
impl InvalidationBus for InMemoryBus {
	async fn publish(&self, msg: &CacheUpdateMessage) -> Result<()> {
		let sender = self.sender.read().clone().ok_or_else(Self::closed)?;
		// No subscribers is not an error: nothing is cached anywhere.
		let receivers = sender.send(msg.clone()).unwrap_or(0);
		debug!(action = %msg.action, flag_key = %msg.flag_key, receivers, "Published invalidation");
		Ok(())
	}

	async fn subscribe(&self, cancel: CancellationToken, handler: MessageHandler) -> Result<()> {
		let mut rx = self
			.sender
			.read()
			.as_ref()
			.map(broadcast::Sender::subscribe)
			.ok_or_else(Self::closed)?;

		loop {
			tokio::select! {
				biased;

				_ = cancel.cancelled() => return Err(FlagsServerError::SubscriptionCancelled),

				received = rx.recv() => match received {
					Ok(msg) => dispatch(self.name(), &handler, msg),
					Err(RecvError::Lagged(missed)) => {
						warn!(missed, "Invalidation subscriber lagged, invalidating everything");
						dispatch(self.name(), &handler, CacheUpdateMessage::invalidate_all());
					}
					Err(RecvError::Closed) => return Err(Self::closed()),
				},
			}
		}
	}

	async fn close(&self) -> Result<()> {
		if self.sender.write().take().is_some() {
			debug!("In-memory invalidation bus closed");
		}
		Ok(())
	}

	fn name(&self) -> &'static str {
		"memory"
	}
}
