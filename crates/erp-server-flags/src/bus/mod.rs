// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Cache invalidation bus.
//!
//! Writers publish a [`CacheUpdateMessage`] after every flag or override
//! mutation; every process subscribes and drops what it cached. Delivery is
//! at-least-once and unordered across publishers.
//!
//! # Backends
//!
//! - [`InMemoryBus`] - single process, `tokio::sync::broadcast`
//! - [`RedisBus`] - multi-process, Redis PUB/SUB

mod memory;
mod redis_bus;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use erp_flags_core::CacheUpdateMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{FlagsServerError, Result};

pub use self::memory::{InMemoryBus, DEFAULT_BUS_CAPACITY};
pub use self::redis_bus::{RedisBus, DEFAULT_REDIS_CHANNEL};

/// Callback invoked for every message a subscription receives.
pub type MessageHandler = Arc<dyn Fn(CacheUpdateMessage) -> Result<()> + Send + Sync>;

#[async_trait]
pub trait InvalidationBus: Send + Sync {
	/// Hands a message to the transport. Returns once the transport accepted it.
	async fn publish(&self, msg: &CacheUpdateMessage) -> Result<()>;

	/// Delivers messages to `handler` until `cancel` fires, then returns
	/// [`FlagsServerError::SubscriptionCancelled`](crate::FlagsServerError::SubscriptionCancelled).
	///
	/// Handler failures are logged and never end the subscription.
	async fn subscribe(&self, cancel: CancellationToken, handler: MessageHandler) -> Result<()>;

	/// Releases transport resources. Active subscriptions end with `Unavailable`.
	async fn close(&self) -> Result<()>;

	fn name(&self) -> &'static str;
}

/// Backoff between subscription attempts after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
	pub base_delay: Duration,
	pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_secs(1),
			max_delay: Duration::from_secs(30),
		}
	}
}

impl ReconnectPolicy {
	/// Exponential delay for the given number of consecutive failures, capped at `max_delay`.
	pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
		let factor = 2u64.saturating_pow(consecutive_failures.saturating_sub(1).min(10));
		let delay_ms = (self.base_delay.as_millis() as u64).saturating_mul(factor);
		Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as u64))
	}
}

/// Keeps a subscription alive until `cancel` fires, resubscribing with
/// backoff whenever the transport fails.
pub async fn run_subscription(
	bus: Arc<dyn InvalidationBus>,
	cancel: CancellationToken,
	handler: MessageHandler,
	policy: ReconnectPolicy,
) {
	let mut consecutive_failures: u32 = 0;

	loop {
		if cancel.is_cancelled() {
			break;
		}

		info!(bus = bus.name(), "Starting invalidation subscription");
		match bus.subscribe(cancel.clone(), handler.clone()).await {
			Err(FlagsServerError::SubscriptionCancelled) => break,
			Ok(()) => {
				debug!(bus = bus.name(), "Invalidation subscription ended");
				consecutive_failures = 0;
			}
			Err(e) => {
				error!(bus = bus.name(), error = %e, "Invalidation subscription failed");
				consecutive_failures = consecutive_failures.saturating_add(1);
			}
		}

		let delay = policy.delay_for(consecutive_failures.max(1));
		warn!(
			bus = bus.name(),
			delay_ms = delay.as_millis() as u64,
			attempts = consecutive_failures,
			"Resubscribing to invalidation bus"
		);

		tokio::select! {
			_ = tokio::time::sleep(delay) => {}
			_ = cancel.cancelled() => break,
		}
	}

	debug!(bus = bus.name(), "Invalidation subscription loop stopped");
}

/// Runs the handler for one message, containing errors and panics.
pub(crate) fn dispatch(bus: &'static str, handler: &MessageHandler, msg: CacheUpdateMessage) {
	let action = msg.action;
	let flag_key = msg.flag_key.clone();

	match std::panic::catch_unwind(AssertUnwindSafe(|| handler(msg))) {
		Ok(Ok(())) => {}
		Ok(Err(e)) => {
			warn!(bus, %action, flag_key = %flag_key, error = %e, "Invalidation handler failed");
		}
		Err(_) => {
			error!(bus, %action, flag_key = %flag_key, "Invalidation handler panicked");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::FlagsServerError;
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[test]
	fn test_dispatch_contains_errors_and_panics() {
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = calls.clone();
		let handler: MessageHandler = Arc::new(move |msg| {
			counter.fetch_add(1, Ordering::SeqCst);
			match msg.flag_key.as_str() {
				"fail" => Err(FlagsServerError::Internal("boom".into())),
				"panic" => panic!("handler panic"),
				_ => Ok(()),
			}
		});

		dispatch("test", &handler, CacheUpdateMessage::updated("fail"));
		dispatch("test", &handler, CacheUpdateMessage::updated("panic"));
		dispatch("test", &handler, CacheUpdateMessage::updated("ok"));

		assert_eq!(calls.load(Ordering::SeqCst), 3);
	}

	#[test]
	fn test_reconnect_delay_is_capped() {
		let policy = ReconnectPolicy::default();
		assert_eq!(policy.delay_for(1), Duration::from_secs(1));
		assert_eq!(policy.delay_for(2), Duration::from_secs(2));
		assert_eq!(policy.delay_for(4), Duration::from_secs(8));
		assert_eq!(policy.delay_for(20), Duration::from_secs(30));
	}

	#[tokio::test(start_paused = true)]
	async fn test_run_subscription_stops_on_cancel() {
		let bus: Arc<dyn InvalidationBus> = Arc::new(InMemoryBus::with_defaults());
		let cancel = CancellationToken::new();
		let handler: MessageHandler = Arc::new(|_| Ok(()));

		let task = tokio::spawn(run_subscription(
			bus.clone(),
			cancel.clone(),
			handler,
			ReconnectPolicy::default(),
		));
		tokio::task::yield_now().await;
		cancel.cancel();

		tokio::time::timeout(Duration::from_secs(1), task)
			.await
			.expect("subscription loop should stop")
			.unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn test_run_subscription_retries_closed_bus_until_cancel() {
		let bus = Arc::new(InMemoryBus::with_defaults());
		bus.close().await.unwrap();
		let cancel = CancellationToken::new();
		let handler: MessageHandler = Arc::new(|_| Ok(()));

		let task = tokio::spawn(run_subscription(
			bus,
			cancel.clone(),
			handler,
			ReconnectPolicy::default(),
		));
		tokio::time::sleep(Duration::from_secs(5)).await;
		assert!(!task.is_finished());

		cancel.cancel();
		tokio::time::timeout(Duration::from_secs(1), task)
			.await
			.expect("subscription loop should stop")
			.unwrap();
	}
}
