// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Realtime broadcast hub: fans invalidation events out to SSE clients.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   subscribe    ┌──────────────────────────────────────┐
//! │ InvalidationBus  │ ─────────────> │            BroadcastHub              │
//! └──────────────────┘                │  clients: RwLock<HashMap<ClientId,   │
//!                                     │           bounded mpsc::Sender>>     │
//!       heartbeat ticker ───────────> │                                      │
//!                                     └──────────────────┬───────────────────┘
//!                                                        │ try_send
//!                        ┌───────────────────────────────┼───────────────┐
//!                        ▼                               ▼               ▼
//!                   SseClient (queue)              SseClient        SseClient
//! ```
//!
//! Sends never block: a full client queue drops that message for that client
//! only. A client whose connection is gone is removed on the next send.
//!
//! # Example
//!
//! ```ignore
//! let hub = BroadcastHub::new(bus, HubConfig::default());
//! hub.start()?;
//!
//! let mut client = hub.register_client()?;
//! while let Some(event) = client.recv().await {
//!     write(event.encode()).await?;
//! }
//!
//! hub.stop();
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use erp_flags_core::{CacheUpdateMessage, FlagStreamEvent, WireEvent};
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{run_subscription, InvalidationBus, MessageHandler, ReconnectPolicy};
use crate::error::{FlagsServerError, Result};

/// Default per-client outbound queue capacity.
pub const DEFAULT_CLIENT_BUFFER_SIZE: usize = 100;

/// Default heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Unique identifier for a connected stream client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(pub Uuid);

impl ClientId {
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}
}

impl Default for ClientId {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Display for ClientId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Configuration for the broadcast hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
	/// Outbound queue capacity per client.
	pub client_buffer_size: usize,
	/// Interval between heartbeat events.
	pub heartbeat_interval: Duration,
	/// Backoff used when the bus subscription fails.
	pub reconnect: ReconnectPolicy,
}

impl Default for HubConfig {
	fn default() -> Self {
		Self {
			client_buffer_size: DEFAULT_CLIENT_BUFFER_SIZE,
			heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
			reconnect: ReconnectPolicy::default(),
		}
	}
}

/// Statistics about the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubStats {
	pub running: bool,
	pub connected_clients: usize,
	pub total_connections: u64,
	pub events_broadcast: u64,
	pub events_dropped: u64,
	pub clients_evicted: u64,
}

struct ClientHandle {
	sender: mpsc::Sender<WireEvent>,
	done: CancellationToken,
	connected_at: DateTime<Utc>,
}

/// State shared between the hub, its background tasks and its clients.
struct HubShared {
	config: HubConfig,
	clients: RwLock<HashMap<ClientId, ClientHandle>>,
	next_event_id: AtomicU64,
	total_connections: AtomicU64,
	events_broadcast: AtomicU64,
	events_dropped: AtomicU64,
	clients_evicted: AtomicU64,
}

impl HubShared {
	fn wire_event(&self, event: &FlagStreamEvent) -> Option<WireEvent> {
		let id = self.next_event_id.fetch_add(1, Ordering::Relaxed) + 1;
		match WireEvent::from_stream_event(event, id) {
			Ok(wire) => Some(wire),
			Err(e) => {
				error!(event_type = event.event_type(), error = %e, "Failed to encode stream event");
				None
			}
		}
	}

	fn remove(&self, id: ClientId) -> bool {
		let removed = self.clients.write().remove(&id);
		match removed {
			Some(handle) => {
				handle.done.cancel();
				let connected_for = Utc::now() - handle.connected_at;
				info!(
					client_id = %id,
					connected_secs = connected_for.num_seconds(),
					"SSE client disconnected"
				);
				true
			}
			None => false,
		}
	}

	fn snapshot(&self) -> Vec<(ClientId, mpsc::Sender<WireEvent>)> {
		self
			.clients
			.read()
			.iter()
			.map(|(id, handle)| (*id, handle.sender.clone()))
			.collect()
	}

	fn broadcast(&self, event: &FlagStreamEvent) -> usize {
		let Some(wire) = self.wire_event(event) else {
			return 0;
		};

		let mut delivered = 0;
		let mut gone = Vec::new();
		for (id, sender) in self.snapshot() {
			match sender.try_send(wire.clone()) {
				Ok(()) => delivered += 1,
				Err(TrySendError::Full(_)) => {
					self.events_dropped.fetch_add(1, Ordering::Relaxed);
					warn!(
						client_id = %id,
						event_type = event.event_type(),
						"Client queue full, dropping event"
					);
				}
				Err(TrySendError::Closed(_)) => gone.push(id),
			}
		}

		for id in gone {
			if self.remove(id) {
				self.clients_evicted.fetch_add(1, Ordering::Relaxed);
			}
		}

		self.events_broadcast.fetch_add(1, Ordering::Relaxed);
		debug!(
			event_type = event.event_type(),
			event_id = %wire.id,
			delivered,
			"Broadcast event"
		);
		delivered
	}

	/// Sends a heartbeat to every client; any client that cannot take it is removed.
	fn heartbeat(&self) {
		let Some(wire) = self.wire_event(&FlagStreamEvent::heartbeat()) else {
			return;
		};

		let mut failed = Vec::new();
		for (id, sender) in self.snapshot() {
			if let Err(e) = sender.try_send(wire.clone()) {
				let reason = match e {
					TrySendError::Full(_) => "queue full",
					TrySendError::Closed(_) => "connection closed",
				};
				warn!(client_id = %id, reason, "Heartbeat failed, removing client");
				failed.push(id);
			}
		}

		for id in failed {
			if self.remove(id) {
				self.clients_evicted.fetch_add(1, Ordering::Relaxed);
			}
		}
	}

	fn handle_update(&self, msg: &CacheUpdateMessage) {
		match FlagStreamEvent::from_cache_update(msg) {
			Some(event) => {
				self.broadcast(&event);
			}
			None => {
				debug!(action = %msg.action, flag_key = %msg.flag_key, "No stream event for invalidation");
			}
		}
	}
}

struct Running {
	shutdown: CancellationToken,
	tasks: Vec<JoinHandle<()>>,
}

/// Pushes flag invalidation events to connected SSE clients.
pub struct BroadcastHub {
	bus: Arc<dyn InvalidationBus>,
	shared: Arc<HubShared>,
	running: Mutex<Option<Running>>,
}

impl BroadcastHub {
	pub fn new(bus: Arc<dyn InvalidationBus>, config: HubConfig) -> Self {
		Self {
			bus,
			shared: Arc::new(HubShared {
				config,
				clients: RwLock::new(HashMap::new()),
				next_event_id: AtomicU64::new(0),
				total_connections: AtomicU64::new(0),
				events_broadcast: AtomicU64::new(0),
				events_dropped: AtomicU64::new(0),
				clients_evicted: AtomicU64::new(0),
			}),
			running: Mutex::new(None),
		}
	}

	/// Starts the bus subscription and heartbeat tasks.
	///
	/// Fails with [`FlagsServerError::HubAlreadyStarted`] if already running.
	pub fn start(&self) -> Result<()> {
		let mut running = self.running.lock();
		if running.is_some() {
			return Err(FlagsServerError::HubAlreadyStarted);
		}

		let shutdown = CancellationToken::new();

		let shared = Arc::downgrade(&self.shared);
		let handler: MessageHandler = Arc::new(move |msg| {
			if let Some(shared) = shared.upgrade() {
				shared.handle_update(&msg);
			}
			Ok(())
		});
		let subscription = tokio::spawn(run_subscription(
			self.bus.clone(),
			shutdown.clone(),
			handler,
			self.shared.config.reconnect,
		));

		let heartbeat = tokio::spawn(heartbeat_loop(
			Arc::downgrade(&self.shared),
			self.shared.config.heartbeat_interval,
			shutdown.clone(),
		));

		*running = Some(Running {
			shutdown,
			tasks: vec![subscription, heartbeat],
		});

		info!(
			bus = self.bus.name(),
			heartbeat_secs = self.shared.config.heartbeat_interval.as_secs(),
			client_buffer_size = self.shared.config.client_buffer_size,
			"Broadcast hub started"
		);
		Ok(())
	}

	/// Stops background tasks and disconnects every client. Idempotent.
	///
	/// Does not wait for the tasks to finish; see [`BroadcastHub::shutdown`].
	pub fn stop(&self) {
		drop(self.stop_inner());
	}

	/// Stops the hub and waits for its background tasks to exit.
	pub async fn shutdown(&self) {
		for task in self.stop_inner() {
			if let Err(e) = task.await {
				warn!(error = %e, "Broadcast hub task ended abnormally");
			}
		}
	}

	fn stop_inner(&self) -> Vec<JoinHandle<()>> {
		let mut running = self.running.lock();
		let Some(state) = running.take() else {
			return Vec::new();
		};

		state.shutdown.cancel();

		let drained: Vec<ClientHandle> = self
			.shared
			.clients
			.write()
			.drain()
			.map(|(_, handle)| handle)
			.collect();
		let disconnected = drained.len();
		for handle in drained {
			handle.done.cancel();
		}

		info!(disconnected, "Broadcast hub stopped");
		state.tasks
	}

	pub fn is_running(&self) -> bool {
		self.running.lock().is_some()
	}

	/// Registers a new stream client. The first queued event is `connected`.
	pub fn register_client(&self) -> Result<SseClient> {
		let running = self.running.lock();
		if running.is_none() {
			return Err(FlagsServerError::HubNotRunning);
		}

		let id = ClientId::new();
		let (sender, receiver) = mpsc::channel(self.shared.config.client_buffer_size.max(1));
		let done = CancellationToken::new();

		if let Some(connected) = self
			.shared
			.wire_event(&FlagStreamEvent::connected(id.to_string()))
		{
			// Fresh queue with capacity >= 1
			let _ = sender.try_send(connected);
		}

		let client_count = {
			let mut clients = self.shared.clients.write();
			clients.insert(
				id,
				ClientHandle {
					sender,
					done: done.clone(),
					connected_at: Utc::now(),
				},
			);
			clients.len()
		};
		drop(running);

		self.shared.total_connections.fetch_add(1, Ordering::Relaxed);
		info!(client_id = %id, clients = client_count, "SSE client connected");

		Ok(SseClient {
			id,
			receiver,
			done,
			hub: Arc::downgrade(&self.shared),
		})
	}

	/// Removes a client and closes its done signal. Unknown ids are ignored.
	pub fn remove_client(&self, id: ClientId) -> bool {
		self.shared.remove(id)
	}

	pub fn client_count(&self) -> usize {
		self.shared.clients.read().len()
	}

	/// Sends an event to every registered client. Returns how many accepted it.
	pub fn broadcast(&self, event: &FlagStreamEvent) -> usize {
		self.shared.broadcast(event)
	}

	pub fn stats(&self) -> HubStats {
		HubStats {
			running: self.is_running(),
			connected_clients: self.client_count(),
			total_connections: self.shared.total_connections.load(Ordering::Relaxed),
			events_broadcast: self.shared.events_broadcast.load(Ordering::Relaxed),
			events_dropped: self.shared.events_dropped.load(Ordering::Relaxed),
			clients_evicted: self.shared.clients_evicted.load(Ordering::Relaxed),
		}
	}
}

impl Drop for BroadcastHub {
	fn drop(&mut self) {
		self.stop();
	}
}

async fn heartbeat_loop(shared: Weak<HubShared>, period: Duration, shutdown: CancellationToken) {
	let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
	// The first tick completes immediately.
	ticker.tick().await;

	loop {
		tokio::select! {
			biased;

			_ = shutdown.cancelled() => break,

			_ = ticker.tick() => {
				let Some(shared) = shared.upgrade() else {
					break;
				};
				shared.heartbeat();
			}
		}
	}

	debug!("Heartbeat task stopped");
}

/// One connected stream. Dropping it unregisters it from the hub.
pub struct SseClient {
	id: ClientId,
	receiver: mpsc::Receiver<WireEvent>,
	done: CancellationToken,
	hub: Weak<HubShared>,
}

impl SseClient {
	pub fn id(&self) -> ClientId {
		self.id
	}

	/// Fires when the client is removed or the hub stops.
	pub fn done(&self) -> &CancellationToken {
		&self.done
	}

	/// Next queued event, or `None` once the client has been removed.
	pub async fn recv(&mut self) -> Option<WireEvent> {
		tokio::select! {
			biased;

			_ = self.done.cancelled() => None,
			event = self.receiver.recv() => event,
		}
	}

	/// Turns the client into a stream of events that ends when the client is removed.
	pub fn into_stream(self) -> impl Stream<Item = WireEvent> + Send + 'static {
		futures::stream::unfold(self, |mut client| async move {
			let event = client.recv().await?;
			Some((event, client))
		})
	}
}

impl Drop for SseClient {
	fn drop(&mut self) {
		if let Some(shared) = self.hub.upgrade() {
			shared.remove(self.id);
		}
	}
}

impl std::fmt::Debug for SseClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SseClient")
			.field("id", &self.id)
			.field("done", &self.done.is_cancelled())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bus::InMemoryBus;
	use erp_flags_core::CacheUpdateAction;

	fn hub_with(config: HubConfig) -> (Arc<InMemoryBus>, BroadcastHub) {
		let bus = Arc::new(InMemoryBus::with_defaults());
		let hub = BroadcastHub::new(bus.clone(), config);
		(bus, hub)
	}

	async fn wait_for_subscribers(bus: &InMemoryBus, n: usize) {
		for _ in 0..200 {
			if bus.subscriber_count() == n {
				return;
			}
			tokio::time::sleep(Duration::from_millis(5)).await;
		}
		panic!("expected {n} bus subscribers, have {}", bus.subscriber_count());
	}

	async fn expect_connected(client: &mut SseClient) {
		let event = client.recv().await.expect("connected event");
		assert_eq!(event.event, "connected");
		assert!(event.data.contains(&client.id().to_string()));
	}

	#[tokio::test]
	async fn test_start_twice_fails_and_stop_is_idempotent() {
		let (_, hub) = hub_with(HubConfig::default());

		hub.start().unwrap();
		assert!(matches!(
			hub.start(),
			Err(FlagsServerError::HubAlreadyStarted)
		));
		assert!(hub.is_running());

		hub.stop();
		hub.stop();
		assert!(!hub.is_running());

		hub.start().unwrap();
		hub.shutdown().await;
	}

	#[tokio::test]
	async fn test_register_requires_running_hub() {
		let (_, hub) = hub_with(HubConfig::default());
		assert!(matches!(
			hub.register_client(),
			Err(FlagsServerError::HubNotRunning)
		));
	}

	#[tokio::test]
	async fn test_broadcast_reaches_each_client_once() {
		let (_, hub) = hub_with(HubConfig::default());
		hub.start().unwrap();

		let mut a = hub.register_client().unwrap();
		let mut b = hub.register_client().unwrap();
		assert_ne!(a.id(), b.id());
		expect_connected(&mut a).await;
		expect_connected(&mut b).await;

		let delivered = hub.broadcast(&FlagStreamEvent::flag_updated("inventory.sync", true));
		assert_eq!(delivered, 2);

		for client in [&mut a, &mut b] {
			let event = client.recv().await.unwrap();
			assert_eq!(event.event, "flag_updated");
			assert_eq!(
				event.data,
				r#"{"key":"inventory.sync","value":{"enabled":true}}"#
			);
			assert!(
				tokio::time::timeout(Duration::from_millis(20), client.recv())
					.await
					.is_err()
			);
		}

		hub.shutdown().await;
	}

	#[tokio::test]
	async fn test_slow_client_does_not_block_others() {
		let (_, hub) = hub_with(HubConfig {
			client_buffer_size: 4,
			..HubConfig::default()
		});
		hub.start().unwrap();

		let _stalled = hub.register_client().unwrap();
		let mut reader = hub.register_client().unwrap();
		expect_connected(&mut reader).await;

		for i in 0..10 {
			hub.broadcast(&FlagStreamEvent::flag_updated(format!("k{i}"), true));
			let event = reader.recv().await.unwrap();
			assert!(event.data.contains(&format!("\"k{i}\"")));
		}

		let stats = hub.stats();
		assert_eq!(stats.connected_clients, 2);
		// The stalled queue holds `connected` plus three updates.
		assert_eq!(stats.events_dropped, 7);

		hub.shutdown().await;
	}

	#[tokio::test]
	async fn test_stop_closes_every_client() {
		let (_, hub) = hub_with(HubConfig::default());
		hub.start().unwrap();

		let mut a = hub.register_client().unwrap();
		let b = hub.register_client().unwrap();
		assert_eq!(hub.client_count(), 2);

		hub.stop();
		assert_eq!(hub.client_count(), 0);
		assert!(a.recv().await.is_none());
		assert!(b.done().is_cancelled());
	}

	#[tokio::test]
	async fn test_dropping_client_unregisters_it() {
		let (_, hub) = hub_with(HubConfig::default());
		hub.start().unwrap();

		let client = hub.register_client().unwrap();
		let id = client.id();
		assert_eq!(hub.client_count(), 1);

		drop(client);
		assert_eq!(hub.client_count(), 0);
		assert!(!hub.remove_client(id));

		hub.shutdown().await;
	}

	#[tokio::test]
	async fn test_bus_messages_are_translated_for_clients() {
		let (bus, hub) = hub_with(HubConfig::default());
		hub.start().unwrap();
		wait_for_subscribers(&bus, 1).await;

		let mut client = hub.register_client().unwrap();
		expect_connected(&mut client).await;

		bus.publish(&CacheUpdateMessage::new(CacheUpdateAction::Unknown, "ignored"))
			.await
			.unwrap();
		bus.publish(&CacheUpdateMessage::deleted("billing.v2"))
			.await
			.unwrap();
		bus.publish(&CacheUpdateMessage::invalidate_all())
			.await
			.unwrap();

		let deleted = client.recv().await.unwrap();
		assert_eq!(
			deleted.data,
			r#"{"key":"billing.v2","value":{"enabled":false}}"#
		);
		let everything = client.recv().await.unwrap();
		assert_eq!(
			everything.data,
			r#"{"key":"*","value":{"enabled":true}}"#
		);

		hub.shutdown().await;
	}

	#[tokio::test]
	async fn test_restart_does_not_duplicate_delivery() {
		let (bus, hub) = hub_with(HubConfig::default());
		hub.start().unwrap();
		wait_for_subscribers(&bus, 1).await;
		hub.shutdown().await;
		wait_for_subscribers(&bus, 0).await;

		hub.start().unwrap();
		wait_for_subscribers(&bus, 1).await;

		let mut client = hub.register_client().unwrap();
		expect_connected(&mut client).await;

		bus.publish(&CacheUpdateMessage::updated("a")).await.unwrap();
		assert_eq!(client.recv().await.unwrap().event, "flag_updated");
		assert!(
			tokio::time::timeout(Duration::from_millis(50), client.recv())
				.await
				.is_err()
		);

		hub.shutdown().await;
	}

	#[tokio::test]
	async fn test_event_ids_increase() {
		let (_, hub) = hub_with(HubConfig::default());
		hub.start().unwrap();
		let mut client = hub.register_client().unwrap();

		let first: u64 = client.recv().await.unwrap().id.parse().unwrap();
		hub.broadcast(&FlagStreamEvent::flag_updated("a", true));
		let second: u64 = client.recv().await.unwrap().id.parse().unwrap();
		assert!(second > first);

		hub.shutdown().await;
	}

	#[tokio::test(start_paused = true)]
	async fn test_heartbeat_is_sent_on_interval() {
		let (_, hub) = hub_with(HubConfig::default());
		hub.start().unwrap();

		let mut client = hub.register_client().unwrap();
		expect_connected(&mut client).await;

		let before = tokio::time::Instant::now();
		let event = client.recv().await.unwrap();
		assert_eq!(event.event, "heartbeat");
		assert!(before.elapsed() >= Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS));

		hub.shutdown().await;
	}

	#[tokio::test(start_paused = true)]
	async fn test_failed_heartbeat_removes_only_that_client() {
		let (_, hub) = hub_with(HubConfig {
			client_buffer_size: 1,
			..HubConfig::default()
		});
		hub.start().unwrap();

		// Never drained: its single slot still holds `connected`.
		let mut stalled = hub.register_client().unwrap();
		let mut healthy = hub.register_client().unwrap();
		expect_connected(&mut healthy).await;

		let event = healthy.recv().await.unwrap();
		assert_eq!(event.event, "heartbeat");
		assert_eq!(hub.client_count(), 1);
		assert!(stalled.recv().await.is_none());
		assert_eq!(hub.stats().clients_evicted, 1);

		hub.shutdown().await;
	}

	#[tokio::test]
	async fn test_client_stream_ends_on_removal() {
		use futures::StreamExt;

		let (_, hub) = hub_with(HubConfig::default());
		hub.start().unwrap();
		let client = hub.register_client().unwrap();
		let id = client.id();
		let mut stream = Box::pin(client.into_stream());

		assert_eq!(stream.next().await.unwrap().event, "connected");
		assert!(hub.remove_client(id));
		assert!(stream.next().await.is_none());

		hub.shutdown().await;
	}
}
