//! The realtime provider: one shared channel, its reconnect and polling
//! fallbacks, and the fan-out of order changes to subscribers.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};

use anyhow::Result;
use futures::{stream::BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::{sync::watch, task::AbortHandle};
use tracing::{debug, info, warn};

use self::polling::{Baseline, PollingFallback};
use crate::{
    client::retry::RetryState,
    config::RealtimeConfig,
    filter,
    models::prelude::*,
    pubsub::{SubscriberRegistry, SubscriptionHandle},
    timer::TimerSlot,
    transport::{
        ChangeTransport, ChannelFilter, ChannelSpec, ChannelStatus, OrderQuery, RawChange,
        RecordSource, TransportSignal,
    },
};

pub mod polling;

/////////////////////////////////////////////////////////////////////////////
// ConnectionState
/////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, derive_more::Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[display("CONNECTING")]
    Connecting,
    #[display("SUBSCRIBED")]
    Subscribed,
    #[display("CHANNEL_ERROR")]
    ChannelError,
    #[display("TIMED_OUT")]
    TimedOut,
    #[display("CLOSED")]
    Closed,
    #[display("POLLING")]
    Polling,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool { *self == Self::Subscribed }
}

/// What UI surfaces can observe about the provider.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ProviderStatus {
    pub is_connected: bool,
    pub connection_status: ConnectionState,
    pub identity: Option<Identity>,
}

/////////////////////////////////////////////////////////////////////////////
// RealtimeProvider
/////////////////////////////////////////////////////////////////////////////

/// Owns the single order channel of a session.
///
/// Clones share the same state. Background tasks only hold weak references,
/// so dropping the last clone tears everything down. All methods that start
/// work must be called from within a tokio runtime.
#[derive(Clone)]
pub struct RealtimeProvider {
    inner: Arc<Inner>,
}

impl RealtimeProvider {
    pub fn new<T, S>(config: RealtimeConfig, transport: T, source: S) -> Self
    where
        T: ChangeTransport,
        S: RecordSource,
    {
        let channel = config.default_channel();
        let known_capacity = config.poll_page_size.saturating_mul(KNOWN_ORDERS_PER_PAGE);
        let retry = RetryState::new(Box::new(config.retry_policy()));
        let state = ConnectionState::Connecting;
        let (status, _) = watch::channel(ProviderStatus {
            is_connected: state.is_connected(),
            connection_status: state,
            identity: None,
        });
        let inner = Inner {
            config,
            transport: Arc::new(transport),
            source: Arc::new(source),
            registry: SubscriberRegistry::new(),
            identity: RwLock::new(None),
            push_state: RwLock::new(state),
            status,
            channel: Mutex::new(channel),
            generation: AtomicU64::new(0),
            connection: Mutex::new(None),
            retry: Mutex::new(retry),
            reconnect_timer: TimerSlot::new(),
            polling: Mutex::new(None),
            baseline: Arc::new(Mutex::new(Baseline::new())),
            known: Mutex::new(KnownOrders::new(known_capacity)),
            torn_down: AtomicBool::new(false),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &RealtimeConfig { &self.inner.config }

    /// Opens the default channel. Called once when the provider is mounted,
    /// before any subscriber needs to be registered.
    pub fn init(&self) { self.open_channel(self.inner.config.default_channel()); }

    /// (Re)opens the channel with `filters`; an empty list receives every
    /// change of the watched table.
    pub fn open(&self, filters: Vec<ChannelFilter>) {
        let spec = ChannelSpec::new(self.inner.config.channel_name.clone(), filters);
        self.open_channel(spec);
    }

    /// Tears down the live connection (if any), cancels a pending reconnect
    /// and opens `spec`. Failures show up as state transitions only.
    pub fn open_channel(&self, spec: ChannelSpec) { self.inner.open_channel(spec); }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ChangeEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.inner.registry.subscribe(callback)
    }

    pub fn subscriber_count(&self) -> usize { self.inner.registry.count() }

    /// Replaces the identity used to gate events. The connection is left
    /// untouched.
    pub fn set_identity(&self, identity: Option<Identity>) {
        match &identity {
            Some(identity) => info!("Identity resolved: {} ({})", identity.id, identity.role),
            None => info!("Identity cleared"),
        }
        *self.inner.identity.write() = identity;
        self.inner.publish_status();
    }

    pub fn identity(&self) -> Option<Identity> { self.inner.identity.read().clone() }

    /// POLLING while the poller runs, otherwise the state of the push channel.
    pub fn connection_state(&self) -> ConnectionState { self.inner.connection_state() }

    pub fn status(&self) -> ProviderStatus { self.inner.current_status() }

    pub fn watch_status(&self) -> watch::Receiver<ProviderStatus> { self.inner.status.subscribe() }

    /// Fetches the most recent orders visible to the current identity.
    ///
    /// A failing query is logged and yields an empty list. The result seeds
    /// the polling baseline and the cache used to complete DELETE snapshots.
    pub async fn hydrate(&self) -> Vec<OrderRecord> {
        let query = self.inner.recent_orders_query();
        match self.inner.source.fetch(&query).await {
            Ok(records) => {
                debug!("Hydrated {} orders", records.len());
                self.inner.remember_all(&records);
                self.inner.baseline.lock().seed(records.clone());
                records
            }
            Err(e) => {
                warn!("Hydration failed, starting with no orders: {e:?}");
                Vec::new()
            }
        }
    }

    /// Starts polling regardless of the channel state.
    pub fn start_polling(&self) { self.inner.start_polling(); }

    /// Stops the poller. The reported state falls back to the push channel's.
    pub fn stop_polling(&self) {
        if self.inner.stop_polling() {
            self.inner.publish_status();
        }
    }

    pub fn is_polling(&self) -> bool { self.inner.is_polling() }

    /// Starts over after reconnecting has given up: zeroes the reconnect
    /// counter, stops polling and reopens the last requested channel.
    pub fn reset(&self) {
        info!("Resetting the realtime connection");
        self.inner.retry.lock().reset();
        self.inner.reconnect_timer.reset_count();
        self.inner.stop_polling();
        let spec = self.inner.channel.lock().clone();
        self.inner.open_channel(spec);
    }

    /// Stops everything and removes all subscribers. The provider stays
    /// inert afterwards.
    pub fn teardown(&self) { self.inner.shutdown(); }

    pub fn reconnect_pending(&self) -> bool { self.inner.reconnect_timer.is_pending() }

    /// Reconnect timers armed since the last successful subscription.
    pub fn reconnects_scheduled(&self) -> usize { self.inner.reconnect_timer.armed_count() }

    pub fn reconnect_attempts(&self) -> usize { self.inner.retry.lock().attempts() }
}

/////////////////////////////////////////////////////////////////////////////
// KnownOrders
/////////////////////////////////////////////////////////////////////////////

/// How many pages of orders are remembered for DELETE snapshots.
const KNOWN_ORDERS_PER_PAGE: usize = 4;

/// The most recently seen state of up to `capacity` orders. The order seen
/// least recently is evicted first.
#[derive(Debug)]
struct KnownOrders {
    records: HashMap<String, OrderRecord>,
    recency: VecDeque<String>,
    capacity: usize,
}

impl KnownOrders {
    fn new(capacity: usize) -> Self {
        Self {
            records: HashMap::new(),
            recency: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, id: &str) -> Option<&OrderRecord> { self.records.get(id) }

    fn insert(&mut self, record: OrderRecord) {
        let id = record.id.clone();
        if self.records.insert(id.clone(), record).is_some() {
            self.recency.retain(|known| *known != id);
        }
        self.recency.push_back(id);
        while self.records.len() > self.capacity {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            self.records.remove(&oldest);
        }
    }

    fn remove(&mut self, id: &str) {
        if self.records.remove(id).is_some() {
            self.recency.retain(|known| known != id);
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
// Inner
/////////////////////////////////////////////////////////////////////////////

struct Inner {
    config: RealtimeConfig,
    transport: Arc<dyn ChangeTransport>,
    source: Arc<dyn RecordSource>,
    registry: SubscriberRegistry,

    identity: RwLock<Option<Identity>>,
    /// State of the push channel alone; never POLLING.
    push_state: RwLock<ConnectionState>,
    status: watch::Sender<ProviderStatus>,

    /// The channel last requested via `open`, reused when reconnecting.
    channel: Mutex<ChannelSpec>,
    /// Bumped on every connect so that signals from a replaced connection
    /// are ignored.
    generation: AtomicU64,
    connection: Mutex<Option<AbortHandle>>,

    retry: Mutex<RetryState>,
    reconnect_timer: TimerSlot,

    polling: Mutex<Option<PollingFallback>>,
    baseline: Arc<Mutex<Baseline>>,

    /// Last known state of recent orders, to complete DELETE snapshots.
    known: Mutex<KnownOrders>,

    torn_down: AtomicBool,
}

impl Inner {
    fn is_torn_down(&self) -> bool { self.torn_down.load(Ordering::SeqCst) }

    fn open_channel(self: &Arc<Self>, spec: ChannelSpec) {
        if self.is_torn_down() {
            debug!("Ignoring open on a torn down provider");
            return;
        }
        if self.reconnect_timer.cancel() {
            debug!("Cancelled a pending reconnect");
        }
        *self.channel.lock() = spec;
        self.connect();
    }

    fn connect(self: &Arc<Self>) {
        if self.is_torn_down() {
            return;
        }
        let spec = self.channel.lock().clone();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = self.connection.lock().take() {
            previous.abort();
        }

        info!("Opening channel {} ({} filters)", spec.name, spec.filters.len());
        self.set_push_state(ConnectionState::Connecting);
        let signals = self.transport.open(&spec);
        let task = tokio::spawn(run_connection(Arc::downgrade(self), generation, signals));
        *self.connection.lock() = Some(task.abort_handle());
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn on_channel_status(self: &Arc<Self>, status: ChannelStatus) {
        match status {
            ChannelStatus::Subscribed => {
                self.retry.lock().reset();
                self.reconnect_timer.cancel();
                self.reconnect_timer.reset_count();
                if self.stop_polling() {
                    info!("Push channel is back, polling stopped");
                }
                self.set_push_state(ConnectionState::Subscribed);
            }
            ChannelStatus::ChannelError(reason) => {
                warn!("Channel error: {reason}");
                self.set_push_state(ConnectionState::ChannelError);
                self.schedule_reconnect();
            }
            ChannelStatus::TimedOut => {
                warn!("Channel timed out");
                self.set_push_state(ConnectionState::TimedOut);
                self.schedule_reconnect();
            }
            ChannelStatus::Closed => {
                info!("Channel closed by the server");
                self.set_push_state(ConnectionState::Closed);
            }
        }
    }

    /// The transport ended without a final status.
    fn on_signals_end(self: &Arc<Self>) {
        let state = *self.push_state.read();
        match state {
            ConnectionState::Connecting => self.on_channel_status(ChannelStatus::ChannelError(
                "transport ended before subscribing".into(),
            )),
            ConnectionState::Subscribed => self.on_channel_status(ChannelStatus::Closed),
            _ => (),
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.is_torn_down() {
            return;
        }
        if self.reconnect_timer.is_pending() {
            debug!("A reconnect is already scheduled");
            return;
        }

        let (next_delay, attempts) = {
            let mut retry = self.retry.lock();
            (retry.next_delay(), retry.attempts())
        };
        match next_delay {
            Some(delay) => {
                info!(
                    "({attempts}/{}) reconnecting in {delay:?}",
                    self.config.max_reconnect_attempts
                );
                let this = Arc::downgrade(self);
                self.reconnect_timer.arm(delay, move || {
                    if let Some(inner) = this.upgrade() {
                        inner.connect();
                    }
                });
            }
            None => {
                warn!("Gave up reconnecting after {attempts} attempts");
                if self.config.fallback_to_polling {
                    self.start_polling();
                }
            }
        }
    }

    fn start_polling(self: &Arc<Self>) {
        if self.is_torn_down() {
            return;
        }
        {
            let mut polling = self.polling.lock();
            let running = polling
                .as_ref()
                .map(PollingFallback::is_running)
                .unwrap_or(false);
            if !running {
                info!("Polling every {:?}", self.config.poll_interval());
                let query_from = Arc::downgrade(self);
                let deliver_to = Arc::downgrade(self);
                *polling = Some(PollingFallback::start(
                    self.source.clone(),
                    self.baseline.clone(),
                    self.config.poll_interval(),
                    move || query_from.upgrade().map(|inner| inner.recent_orders_query()),
                    move |events| {
                        if let Some(inner) = deliver_to.upgrade() {
                            inner.on_polled(events);
                        }
                    },
                ));
            }
        }
        self.publish_status();
    }

    /// Returns true if a running poll loop was stopped.
    fn stop_polling(&self) -> bool {
        match self.polling.lock().take() {
            Some(polling) => {
                let running = polling.is_running();
                polling.stop();
                running
            }
            None => false,
        }
    }

    fn recent_orders_query(&self) -> OrderQuery {
        self.config
            .recent_orders_query(self.identity.read().as_ref())
    }

    fn on_raw_change(&self, change: RawChange) {
        if let Some(event) = self.to_change_event(change) {
            self.remember(&event);
            self.deliver(&event);
        }
    }

    fn on_polled(&self, events: Vec<ChangeEvent>) {
        for event in events {
            self.remember(&event);
            self.deliver(&event);
        }
    }

    fn to_change_event(&self, change: RawChange) -> Option<ChangeEvent> {
        let Some(event_type) = EventType::parse(&change.event_type) else {
            debug!("Dropping a change of unknown type: {:?}", change.event_type);
            return None;
        };
        let row = match event_type {
            EventType::Delete => change.old_record.or(change.record),
            EventType::Insert | EventType::Update => change.record.or(change.old_record),
        };
        let Some(row) = row else {
            debug!("Dropping a {event_type} without a record");
            return None;
        };
        let record: OrderRecord = match serde_json::from_value(row) {
            Ok(record) => record,
            Err(e) => {
                debug!("Dropping an undecodable {event_type}: {e}");
                return None;
            }
        };
        let snapshot = if event_type == EventType::Delete {
            match self.known.lock().get(&record.id) {
                Some(known) => known.clone().merge(record),
                None => record,
            }
        } else {
            record
        };
        Some(ChangeEvent::new(event_type, snapshot))
    }

    fn remember(&self, event: &ChangeEvent) {
        let mut known = self.known.lock();
        match event.event_type() {
            EventType::Insert | EventType::Update => known.insert(event.snapshot().clone()),
            EventType::Delete => known.remove(event.entity_id()),
        }
    }

    fn remember_all(&self, records: &[OrderRecord]) {
        let mut known = self.known.lock();
        for record in records {
            known.insert(record.clone());
        }
    }

    fn deliver(&self, event: &ChangeEvent) {
        let identity = self.identity.read().clone();
        if !filter::is_relevant(event, identity.as_ref()) {
            debug!("{} {} is not relevant to the viewer", event.event_type(), event.entity_id());
            return;
        }
        let delivered = self.registry.dispatch(event);
        debug!(
            "{} {} delivered to {delivered} subscribers",
            event.event_type(),
            event.entity_id()
        );
    }

    fn is_polling(&self) -> bool {
        self.polling
            .lock()
            .as_ref()
            .map(PollingFallback::is_running)
            .unwrap_or(false)
    }

    fn connection_state(&self) -> ConnectionState {
        if self.is_polling() {
            ConnectionState::Polling
        } else {
            *self.push_state.read()
        }
    }

    fn set_push_state(&self, state: ConnectionState) {
        let before = std::mem::replace(&mut *self.push_state.write(), state);
        if before != state {
            debug!("Push channel state: {before} -> {state}");
        }
        self.publish_status();
    }

    fn current_status(&self) -> ProviderStatus {
        let state = self.connection_state();
        ProviderStatus {
            is_connected: state.is_connected(),
            connection_status: state,
            identity: self.identity.read().clone(),
        }
    }

    fn publish_status(&self) { self.status.send_replace(self.current_status()); }

    fn abort_connection(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(connection) = self.connection.lock().take() {
            connection.abort();
        }
    }

    fn shutdown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reconnect_timer.cancel();
        self.abort_connection();
        self.stop_polling();
        self.registry.clear();
        self.set_push_state(ConnectionState::Closed);
        info!("Realtime provider torn down");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.reconnect_timer.cancel();
        self.abort_connection();
        self.stop_polling();
    }
}

async fn run_connection(
    inner: Weak<Inner>,
    generation: u64,
    mut signals: BoxStream<'static, TransportSignal>,
) {
    while let Some(signal) = signals.next().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if !inner.is_current(generation) {
            return;
        }
        match signal {
            TransportSignal::Status(status) => inner.on_channel_status(status),
            TransportSignal::Change(change) => inner.on_raw_change(change),
        }
    }
    if let Some(inner) = inner.upgrade() {
        if inner.is_current(generation) {
            inner.on_signals_end();
        }
    }
}
