// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use erp_flags_core::CacheUpdateMessage;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{dispatch, InvalidationBus, MessageHandler};
use crate::error::{FlagsServerError, Result};

pub const DEFAULT_REDIS_CHANNEL: &str = "erp:feature_flags:invalidation";

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(2);

/// Multi-process invalidation bus over Redis PUB/SUB.
///
/// Messages are JSON-encoded [`CacheUpdateMessage`]s. Each subscription holds
/// its own PUB/SUB connection; publishing reuses one multiplexed connection
/// and reconnects after a failure.
pub struct RedisBus {
	client: redis::Client,
	channel: String,
	publisher: Mutex<Option<MultiplexedConnection>>,
	operation_timeout: Duration,
	closed: AtomicBool,
	close_token: CancellationToken,
}

impl RedisBus {
	pub fn new(redis_url: &str, channel: impl Into<String>) -> Result<Self> {
		let client = redis::Client::open(redis_url)?;
		Ok(Self {
			client,
			channel: channel.into(),
			publisher: Mutex::new(None),
			operation_timeout: DEFAULT_OPERATION_TIMEOUT,
			closed: AtomicBool::new(false),
			close_token: CancellationToken::new(),
		})
	}

	pub fn channel(&self) -> &str {
		&self.channel
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(FlagsServerError::Unavailable("redis bus closed".to_string()));
		}
		Ok(())
	}

	async fn publisher(&self) -> Result<MultiplexedConnection> {
		if let Some(conn) = self.publisher.lock().clone() {
			return Ok(conn);
		}

		let conn = timeout(
			self.operation_timeout,
			self.client.get_multiplexed_async_connection(),
		)
		.await
		.map_err(|_| FlagsServerError::Unavailable("timed out connecting to redis".to_string()))??;

		*self.publisher.lock() = Some(conn.clone());
		Ok(conn)
	}
}

#[async_trait]
impl InvalidationBus for RedisBus {
	async fn publish(&self, msg: &CacheUpdateMessage) -> Result<()> {
		self.ensure_open()?;
		let payload = serde_json::to_string(msg)?;
		let mut conn = self.publisher().await?;

		let published: std::result::Result<redis::RedisResult<i64>, _> = timeout(
			self.operation_timeout,
			conn.publish(self.channel.as_str(), payload),
		)
		.await;

		match published {
			Ok(Ok(receivers)) => {
				debug!(action = %msg.action, flag_key = %msg.flag_key, receivers, "Published invalidation");
				Ok(())
			}
			Ok(Err(e)) => {
				self.publisher.lock().take();
				Err(e.into())
			}
			Err(_) => {
				self.publisher.lock().take();
				Err(FlagsServerError::Unavailable(
					"timed out publishing to redis".to_string(),
				))
			}
		}
	}

	async fn subscribe(&self, cancel: CancellationToken, handler: MessageHandler) -> Result<()> {
		self.ensure_open()?;

		let mut pubsub = self.client.get_async_pubsub().await?;
		pubsub.subscribe(self.channel.as_str()).await?;
		info!(channel = %self.channel, "Subscribed to redis invalidation channel");

		let messages = pubsub.on_message();
		tokio::pin!(messages);

		loop {
			tokio::select! {
				biased;

				_ = cancel.cancelled() => return Err(FlagsServerError::SubscriptionCancelled),

				_ = self.close_token.cancelled() => {
					return Err(FlagsServerError::Unavailable("redis bus closed".to_string()));
				}

				next = messages.next() => {
					let Some(raw) = next else {
						return Err(FlagsServerError::Unavailable(
							"redis subscription stream ended".to_string(),
						));
					};

					let payload: String = match raw.get_payload() {
						Ok(payload) => payload,
						Err(e) => {
							warn!(error = %e, "Skipping unreadable invalidation payload");
							continue;
						}
					};

					match serde_json::from_str::<CacheUpdateMessage>(&payload) {
						Ok(msg) => dispatch(self.name(), &handler, msg),
						Err(e) => warn!(error = %e, payload = %payload, "Skipping undecodable invalidation message"),
					}
				}
			}
		}
	}

	async fn close(&self) -> Result<()> {
		if !self.closed.swap(true, Ordering::AcqRel) {
			self.close_token.cancel();
			self.publisher.lock().take();
			debug!(channel = %self.channel, "Redis invalidation bus closed");
		}
		Ok(())
	}

	fn name(&self) -> &'static str {
		"redis"
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Arc;

	#[test]
	fn test_rejects_malformed_url() {
		assert!(RedisBus::new("not a redis url", DEFAULT_REDIS_CHANNEL).is_err());
	}

	#[tokio::test]
	async fn test_closed_bus_is_unavailable() {
		let bus = RedisBus::new("redis://127.0.0.1:6379", "test:channel").unwrap();
		assert_eq!(bus.channel(), "test:channel");

		bus.close().await.unwrap();
		let err = bus
			.publish(&CacheUpdateMessage::updated("a"))
			.await
			.unwrap_err();
		assert!(err.is_unavailable());

		let handler: MessageHandler = Arc::new(|_| Ok(()));
		let err = bus
			.subscribe(CancellationToken::new(), handler)
			.await
			.unwrap_err();
		assert!(err.is_unavailable());
	}
}
