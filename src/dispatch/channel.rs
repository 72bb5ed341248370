//! Named pub/sub channels over a capped log.
//!
//! Publishing appends `{"key": <event>, "data": <payload>}` to the channel's
//! capped log, creating the log on first use. After `kickoff` a consumer
//! task tails the log from the position it had at start and pushes every
//! new entry to the carriers subscribed to its event name.
//!
//! Lifecycle: `Uninitialized -> Ready -> Active -> Stopped`. `Ready` means
//! the log exists; `Active` means the consumer is running.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use futures_util::future::join_all;
use serde_json::{json, Value as JsonValue};
use tokio::task::JoinHandle;

use super::carrier::{deliver_isolated, Carrier};
use crate::config::ChannelConfig;
use crate::error::{ConfigError, TboneResult};
use crate::storage::{CollectionOptions, Document, StoreError, StoreHandle};

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChannelState {
    /// Created; the log may not exist yet.
    Uninitialized = 0,
    /// Log created, consumer not running.
    Ready = 1,
    /// Consumer running.
    Active = 2,
    /// Consumer stopped or failed without restart.
    Stopped = 3,
}

impl ChannelState {
    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Ready,
            2 => Self::Active,
            3 => Self::Stopped,
            _ => Self::Uninitialized,
        }
    }
}

/// Delivery counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    /// Log entries handled by the consumer.
    pub events_consumed: u64,
    /// Successful carrier deliveries.
    pub delivered: u64,
    /// Carrier deliveries that returned false or panicked.
    pub failed: u64,
    /// Times the consumer was restarted after failing.
    pub restarts: u64,
}

type Carriers = HashMap<String, Vec<Arc<dyn Carrier>>>;

/// A named event channel.
pub struct Channel {
    name: String,
    log_name: String,
    store: StoreHandle,
    config: ChannelConfig,
    create_guard: tokio::sync::Mutex<()>,
    created: AtomicBool,
    state: AtomicU8,
    subscribers: RwLock<Carriers>,
    watermark: AtomicU64,
    /// Bumped each time this channel creates its log. Positions restart in
    /// a new log.
    generation: AtomicU64,
    /// Generation the watermark belongs to.
    seen_generation: AtomicU64,
    events_consumed: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    restarts: AtomicU64,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Creates a channel. The backing log is created lazily.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if `config` does not validate.
    pub fn new(
        name: impl Into<String>,
        store: StoreHandle,
        config: ChannelConfig,
    ) -> Result<Arc<Self>, ConfigError> {
        let config = config.validate()?;
        let name = name.into();
        Ok(Arc::new(Self {
            log_name: config.log_name(&name),
            name,
            store,
            config,
            create_guard: tokio::sync::Mutex::new(()),
            created: AtomicBool::new(false),
            state: AtomicU8::new(ChannelState::Uninitialized as u8),
            subscribers: RwLock::new(HashMap::new()),
            watermark: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            seen_generation: AtomicU64::new(0),
            events_consumed: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            consumer: Mutex::new(None),
        }))
    }

    /// Channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the backing capped log.
    #[must_use]
    pub fn log_name(&self) -> &str {
        &self.log_name
    }

    /// Settings the channel was created with.
    #[must_use]
    pub const fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Current consumer state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True while the consumer runs.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Active
    }

    /// Counters since creation.
    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            events_consumed: self.events_consumed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: ChannelState) {
        let previous = ChannelState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            tracing::info!(channel = %self.name, from = ?previous, to = ?state, "channel state changed");
        }
    }

    /// Creates the capped log if it does not exist yet. Concurrent first
    /// calls collapse into a single creation.
    async fn ensure_log(&self) -> TboneResult<()> {
        if self.created.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.create_guard.lock().await;
        if self.created.load(Ordering::Acquire) {
            return Ok(());
        }

        let names = self.store.collection_names().await?;
        if !names.iter().any(|n| n == &self.log_name) {
            let options = CollectionOptions::capped(self.config.capacity, self.config.max_bytes());
            match self.store.create_collection(&self.log_name, &options).await {
                Ok(()) => {
                    self.generation.fetch_add(1, Ordering::AcqRel);
                    tracing::info!(channel = %self.name, log = %self.log_name, "created channel log");
                }
                Err(StoreError::CollectionExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        self.created.store(true, Ordering::Release);
        let _ = self.state.compare_exchange(
            ChannelState::Uninitialized as u8,
            ChannelState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        Ok(())
    }

    /// Appends an event to the log and returns the stored record.
    ///
    /// # Errors
    ///
    /// Returns a store error if the log cannot be created or appended to.
    pub async fn publish(&self, key: &str, data: JsonValue) -> TboneResult<Document> {
        self.ensure_log().await?;
        let mut record = Document::new();
        record.insert("key".to_string(), JsonValue::String(key.to_string()));
        record.insert("data".to_string(), data);

        let position = match self.store.append(&self.log_name, &record).await {
            Err(StoreError::CollectionNotFound(_)) => {
                // The log was dropped under us; recreate it once.
                self.created.store(false, Ordering::Release);
                self.ensure_log().await?;
                self.store.append(&self.log_name, &record).await?
            }
            outcome => outcome?,
        };
        tracing::debug!(channel = %self.name, event = key, position, "published event");
        Ok(record)
    }

    fn read_subscribers(&self) -> std::sync::RwLockReadGuard<'_, Carriers> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_subscribers(&self) -> std::sync::RwLockWriteGuard<'_, Carriers> {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `carrier` for events named `event`.
    pub fn subscribe(&self, event: impl Into<String>, carrier: Arc<dyn Carrier>) {
        let event = event.into();
        tracing::debug!(channel = %self.name, event = %event, "carrier subscribed");
        self.write_subscribers().entry(event).or_default().push(carrier);
    }

    /// Removes `carrier` from `event`. Returns whether it was subscribed.
    pub fn unsubscribe(&self, event: &str, carrier: &Arc<dyn Carrier>) -> bool {
        let mut subscribers = self.write_subscribers();
        let Some(carriers) = subscribers.get_mut(event) else {
            return false;
        };
        let before = carriers.len();
        carriers.retain(|c| !Arc::ptr_eq(c, carrier));
        let removed = carriers.len() != before;
        if carriers.is_empty() {
            subscribers.remove(event);
        }
        removed
    }

    /// Number of carriers subscribed to `event`.
    #[must_use]
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.read_subscribers().get(event).map_or(0, Vec::len)
    }

    fn carriers_for(&self, event: &str) -> Vec<Arc<dyn Carrier>> {
        self.read_subscribers().get(event).cloned().unwrap_or_default()
    }

    /// Starts the consumer. Only entries appended after this call are
    /// delivered. Calling it on an active channel does nothing.
    ///
    /// # Errors
    ///
    /// Returns a store error if the log cannot be created or read.
    pub async fn kickoff(self: &Arc<Self>) -> TboneResult<()> {
        if self.is_active() {
            return Ok(());
        }
        self.ensure_log().await?;
        let start = self.store.latest_position(&self.log_name).await?;
        self.watermark.store(start, Ordering::Release);
        self.seen_generation
            .store(self.generation.load(Ordering::Acquire), Ordering::Release);
        self.set_state(ChannelState::Active);

        let channel = Arc::clone(self);
        let handle = tokio::spawn(async move { channel.supervise().await });
        let previous = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Marks the channel inactive. The consumer exits after its current
    /// wait; use `join` to wait for that.
    pub fn stop(&self) {
        self.set_state(ChannelState::Stopped);
    }

    /// Waits for the consumer task to finish.
    pub async fn join(&self) {
        let handle = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(channel = %self.name, error = %e, "channel consumer task aborted");
            }
        }
    }

    async fn supervise(self: Arc<Self>) {
        tracing::info!(channel = %self.name, log = %self.log_name, "channel consumer started");
        loop {
            match self.consume().await {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!(channel = %self.name, error = %e, "channel consumer failed");
                    if !self.config.restart_on_failure || !self.is_active() {
                        self.set_state(ChannelState::Stopped);
                        break;
                    }
                    tokio::time::sleep(self.config.poll_interval).await;
                    if !self.is_active() {
                        break;
                    }
                    self.restarts.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(channel = %self.name, "restarting channel consumer");
                    self.created.store(false, Ordering::Release);
                }
            }
        }
        tracing::info!(channel = %self.name, "channel consumer stopped");
    }

    async fn consume(&self) -> TboneResult<()> {
        self.ensure_log().await?;
        let latest = self.store.latest_position(&self.log_name).await?;
        // A recreated log restarts its positions.
        if latest < self.watermark.load(Ordering::Acquire) {
            self.watermark.store(latest, Ordering::Release);
        }

        while self.is_active() {
            self.follow_recreated_log();
            let after = self.watermark.load(Ordering::Acquire);
            let next = self
                .store
                .tail_next(&self.log_name, after, self.config.await_timeout)
                .await?;
            // The log was recreated while waiting; `next` may come from
            // either log, so re-read the new one from its start.
            if self.follow_recreated_log() {
                continue;
            }
            match next {
                Some(record) => {
                    self.watermark.store(record.position, Ordering::Release);
                    self.dispatch(&record.document).await;
                }
                None => tokio::time::sleep(self.config.poll_interval).await,
            }
        }
        Ok(())
    }

    /// Resets the watermark to the start of the log if the log was
    /// recreated since the watermark was taken. Returns whether it did.
    fn follow_recreated_log(&self) -> bool {
        let current = self.generation.load(Ordering::Acquire);
        if self.seen_generation.swap(current, Ordering::AcqRel) == current {
            return false;
        }
        tracing::warn!(channel = %self.name, log = %self.log_name, "channel log was recreated, reading it from the start");
        self.watermark.store(0, Ordering::Release);
        true
    }

    async fn dispatch(&self, record: &Document) {
        self.events_consumed.fetch_add(1, Ordering::Relaxed);
        let Some(event) = record.get("key").and_then(JsonValue::as_str) else {
            tracing::warn!(channel = %self.name, "skipping log entry without an event key");
            return;
        };
        let carriers = self.carriers_for(event);
        if carriers.is_empty() {
            return;
        }

        let data = record.get("data").cloned().unwrap_or(JsonValue::Null);
        let payload = json!({
            "type": "event",
            "payload": {"name": event, "data": data},
        });
        let outcomes = join_all(
            carriers
                .iter()
                .map(|carrier| deliver_isolated(carrier.as_ref(), &payload)),
        )
        .await;

        let failed = outcomes.iter().filter(|delivered| !**delivered).count() as u64;
        let delivered = outcomes.len() as u64 - failed;
        self.delivered.fetch_add(delivered, Ordering::Relaxed);
        if failed > 0 {
            self.failed.fetch_add(failed, Ordering::Relaxed);
            tracing::warn!(channel = %self.name, event, failed, "event delivery failed for some carriers");
        }
        tracing::debug!(channel = %self.name, event, delivered, "event delivered");
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("log_name", &self.log_name)
            .field("state", &self.state())
            .field("watermark", &self.watermark.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Process-wide map of channel name to channel.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
}

impl ChannelRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the channel named `name`, creating it on first request.
    /// `store` and `config` are only used on creation.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` if a new channel's config does
    /// not validate.
    pub fn get_or_create(
        &self,
        name: &str,
        store: &StoreHandle,
        config: ChannelConfig,
    ) -> Result<Arc<Channel>, ConfigError> {
        if let Some(channel) = self.get(name) {
            return Ok(channel);
        }
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(channel) = channels.get(name) {
            return Ok(Arc::clone(channel));
        }
        let channel = Channel::new(name, Arc::clone(store), config)?;
        channels.insert(name.to_string(), Arc::clone(&channel));
        Ok(channel)
    }

    /// The channel named `name`, if created.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Channel>> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Removes a channel from the registry and stops it.
    pub fn remove(&self, name: &str) -> Option<Arc<Channel>> {
        let channel = self
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)?;
        channel.stop();
        Some(channel)
    }

    /// Registered channel names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// The process-wide channel registry.
pub fn channels() -> &'static ChannelRegistry {
    static REGISTRY: OnceLock<ChannelRegistry> = OnceLock::new();
    REGISTRY.get_or_init(ChannelRegistry::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::dispatch::carrier::MpscCarrier;
    use crate::storage::MemoryStore;

    fn fast_config() -> ChannelConfig {
        ChannelConfig::default()
            .with_capacity(16)
            .with_poll_interval(Duration::from_millis(5))
            .with_await_timeout(Duration::from_millis(20))
    }

    fn channel(name: &str) -> (Arc<Channel>, StoreHandle) {
        let store = MemoryStore::new().into_handle();
        let channel = Channel::new(name, Arc::clone(&store), fast_config()).unwrap();
        (channel, store)
    }

    async fn recv(rx: &mut mpsc::Receiver<JsonValue>) -> JsonValue {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("carrier queue closed")
    }

    struct Refusing;

    #[async_trait]
    impl Carrier for Refusing {
        async fn deliver(&self, _payload: &JsonValue) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_publish_creates_log_once() {
        let (channel, store) = channel("rooms");
        assert_eq!(channel.state(), ChannelState::Uninitialized);
        assert_eq!(channel.log_name(), "tbone_channel_rooms");

        let publishes = (0..8).map(|i| {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.publish("tick", json!(i)).await })
        });
        for outcome in join_all(publishes).await {
            outcome.unwrap().unwrap();
        }

        let names = store.collection_names().await.unwrap();
        assert_eq!(names, vec!["tbone_channel_rooms".to_string()]);
        assert_eq!(store.latest_position("tbone_channel_rooms").await.unwrap(), 8);
        assert_eq!(channel.state(), ChannelState::Ready);
    }

    #[tokio::test]
    async fn test_publish_returns_record() {
        let (channel, _store) = channel("records");
        let record = channel.publish("created", json!({"id": 1})).await.unwrap();
        assert_eq!(
            JsonValue::Object(record),
            json!({"key": "created", "data": {"id": 1}})
        );
    }

    #[tokio::test]
    async fn test_subscribe_and_unsubscribe() {
        let (channel, _store) = channel("subs");
        let (carrier, _rx) = MpscCarrier::channel(1);
        let carrier: Arc<dyn Carrier> = Arc::new(carrier);
        channel.subscribe("created", Arc::clone(&carrier));
        channel.subscribe("created", Arc::new(Refusing));
        assert_eq!(channel.subscriber_count("created"), 2);

        assert!(channel.unsubscribe("created", &carrier));
        assert!(!channel.unsubscribe("created", &carrier));
        assert_eq!(channel.subscriber_count("created"), 1);
        assert_eq!(channel.subscriber_count("deleted"), 0);
    }

    #[tokio::test]
    async fn test_events_delivered_in_publish_order() {
        let (channel, _store) = channel("ordered");
        let (carrier, mut rx) = MpscCarrier::channel(8);
        channel.subscribe("msg", Arc::new(carrier));
        channel.kickoff().await.unwrap();
        assert!(channel.is_active());

        channel.publish("msg", json!("E1")).await.unwrap();
        channel.publish("other", json!("skip")).await.unwrap();
        channel.publish("msg", json!("E2")).await.unwrap();

        assert_eq!(
            recv(&mut rx).await,
            json!({"type": "event", "payload": {"name": "msg", "data": "E1"}})
        );
        assert_eq!(recv(&mut rx).await["payload"]["data"], json!("E2"));

        channel.stop();
        channel.join().await;
        assert_eq!(channel.state(), ChannelState::Stopped);
        assert_eq!(channel.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_entries_before_kickoff_are_not_delivered() {
        let (channel, _store) = channel("late");
        channel.publish("msg", json!("old")).await.unwrap();

        let (carrier, mut rx) = MpscCarrier::channel(8);
        channel.subscribe("msg", Arc::new(carrier));
        channel.kickoff().await.unwrap();
        channel.publish("msg", json!("new")).await.unwrap();

        assert_eq!(recv(&mut rx).await["payload"]["data"], json!("new"));
        channel.stop();
        channel.join().await;
    }

    #[tokio::test]
    async fn test_failing_carrier_does_not_block_others() {
        let (channel, _store) = channel("isolated");
        let (carrier, mut rx) = MpscCarrier::channel(8);
        channel.subscribe("msg", Arc::new(Refusing));
        channel.subscribe("msg", Arc::new(carrier));
        channel.kickoff().await.unwrap();

        channel.publish("msg", json!(1)).await.unwrap();
        assert_eq!(recv(&mut rx).await["payload"]["data"], json!(1));

        channel.stop();
        channel.join().await;
        let stats = channel.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn test_consumer_restarts_after_log_loss() {
        let (channel, store) = channel("restart");
        let (carrier, mut rx) = MpscCarrier::channel(8);
        channel.subscribe("msg", Arc::new(carrier));
        channel.kickoff().await.unwrap();

        channel.publish("msg", json!("before")).await.unwrap();
        assert_eq!(recv(&mut rx).await["payload"]["data"], json!("before"));

        store.drop_collection("tbone_channel_restart").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(channel.stats().restarts >= 1);
        assert!(channel.is_active());

        channel.publish("msg", json!("after")).await.unwrap();
        assert_eq!(recv(&mut rx).await["payload"]["data"], json!("after"));

        channel.stop();
        channel.join().await;
    }

    #[tokio::test]
    async fn test_publish_right_after_log_loss_is_delivered() {
        let (channel, store) = channel("recreated");
        let (carrier, mut rx) = MpscCarrier::channel(8);
        channel.subscribe("msg", Arc::new(carrier));
        channel.kickoff().await.unwrap();

        channel.publish("msg", json!("before")).await.unwrap();
        assert_eq!(recv(&mut rx).await["payload"]["data"], json!("before"));

        store.drop_collection("tbone_channel_recreated").await.unwrap();
        channel.publish("msg", json!("after")).await.unwrap();
        channel.publish("msg", json!("again")).await.unwrap();
        assert_eq!(recv(&mut rx).await["payload"]["data"], json!("after"));
        assert_eq!(recv(&mut rx).await["payload"]["data"], json!("again"));

        channel.stop();
        channel.join().await;
        assert_eq!(channel.stats().delivered, 3);
    }

    #[tokio::test]
    async fn test_consumer_without_restart_stays_stopped() {
        let store = MemoryStore::new().into_handle();
        let config = fast_config().with_restart_on_failure(false);
        let channel = Channel::new("fragile", Arc::clone(&store), config).unwrap();
        channel.kickoff().await.unwrap();

        store.drop_collection("tbone_channel_fragile").await.unwrap();
        channel.join().await;
        assert_eq!(channel.state(), ChannelState::Stopped);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let store = MemoryStore::new().into_handle();
        let err = Channel::new("bad", store, ChannelConfig::default().with_capacity(0)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSetting { .. }));
    }

    #[test]
    fn test_registry_returns_same_channel_for_name() {
        let registry = ChannelRegistry::new();
        let store = MemoryStore::new().into_handle();
        let a = registry
            .get_or_create("lobby", &store, ChannelConfig::default())
            .unwrap();
        let b = registry
            .get_or_create("lobby", &store, fast_config())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().capacity, ChannelConfig::default().capacity);
        assert_eq!(registry.names(), vec!["lobby".to_string()]);

        assert!(registry.remove("lobby").is_some());
        assert!(registry.get("lobby").is_none());
        assert_eq!(a.state(), ChannelState::Stopped);
    }
}
