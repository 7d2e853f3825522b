use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use betty_realtime::prelude::*;
use futures::{channel::mpsc, stream::BoxStream, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};

pub fn config() -> RealtimeConfig {
    RealtimeConfig {
        fallback_to_polling: false,
        ..RealtimeConfig::new_local("anon")
    }
}

/// Lets spawned tasks run. Under a paused clock this also advances time by a
/// few milliseconds, which is shorter than any reconnect delay.
pub async fn settle() { tokio::time::sleep(Duration::from_millis(10)).await; }

pub fn order(id: &str, owner: &str, status: OrderStatus) -> OrderRecord {
    OrderRecord::new(id.into(), status, Some(owner.into()))
}

pub fn row(id: &str, owner: &str, status: &str) -> Value {
    json!({
        "id": id,
        "customer_id": owner,
        "status": status,
        "total_amount": 42.5,
        "created_at": "2024-05-01T10:00:00Z",
    })
}

pub fn insert(id: &str, owner: &str, status: &str) -> RawChange {
    RawChange::new("INSERT").with_record(row(id, owner, status))
}

/// A subscriber recording every event it receives.
pub fn recorder() -> (Arc<Mutex<Vec<ChangeEvent>>>, impl Fn(&ChangeEvent) -> Result<()>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let callback = {
        let events = events.clone();
        move |event: &ChangeEvent| {
            events.lock().push(event.clone());
            Ok(())
        }
    };
    (events, callback)
}

/////////////////////////////////////////////////////////////////////////////
// MockTransport
/////////////////////////////////////////////////////////////////////////////

/// A transport whose channels are driven by the test.
#[derive(Clone, Default)]
pub struct MockTransport {
    channels: Arc<Mutex<Vec<MockChannel>>>,
}

impl MockTransport {
    pub fn new() -> Self { Self::default() }

    /// Number of channels opened so far.
    pub fn opened(&self) -> usize { self.channels.lock().len() }

    pub fn channel(&self, index: usize) -> MockChannel { self.channels.lock()[index].clone() }

    pub fn latest(&self) -> MockChannel {
        self.channels
            .lock()
            .last()
            .cloned()
            .unwrap_or_else(|| panic!("no channel has been opened"))
    }
}

impl ChangeTransport for MockTransport {
    fn open(&self, spec: &ChannelSpec) -> BoxStream<'static, TransportSignal> {
        let (sender, receiver) = mpsc::unbounded();
        self.channels.lock().push(MockChannel {
            spec: spec.clone(),
            sender,
        });
        receiver.boxed()
    }
}

#[derive(Clone)]
pub struct MockChannel {
    pub spec: ChannelSpec,
    sender: mpsc::UnboundedSender<TransportSignal>,
}

impl MockChannel {
    pub fn send(&self, signal: TransportSignal) {
        // The provider may already have let go of this channel.
        let _ = self.sender.unbounded_send(signal);
    }

    pub fn subscribed(&self) { self.send(TransportSignal::Status(ChannelStatus::Subscribed)); }

    pub fn error(&self) {
        self.send(TransportSignal::Status(ChannelStatus::ChannelError(
            "mock failure".into(),
        )));
    }

    pub fn timed_out(&self) { self.send(TransportSignal::Status(ChannelStatus::TimedOut)); }

    pub fn closed(&self) { self.send(TransportSignal::Status(ChannelStatus::Closed)); }

    pub fn change(&self, change: RawChange) { self.send(TransportSignal::Change(change)); }

    /// Ends the stream without a final status.
    pub fn end(&self) { self.sender.close_channel(); }
}

/////////////////////////////////////////////////////////////////////////////
// MockSource
/////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Default)]
pub struct MockSource {
    state: Arc<Mutex<SourceState>>,
}

#[derive(Default)]
struct SourceState {
    records: Vec<OrderRecord>,
    failing: bool,
    queries: Vec<OrderQuery>,
}

impl MockSource {
    pub fn new(records: Vec<OrderRecord>) -> Self {
        let source = Self::default();
        source.set_records(records);
        source
    }

    pub fn set_records(&self, records: Vec<OrderRecord>) { self.state.lock().records = records; }

    pub fn set_failing(&self, failing: bool) { self.state.lock().failing = failing; }

    pub fn fetch_count(&self) -> usize { self.state.lock().queries.len() }

    pub fn last_query(&self) -> Option<OrderQuery> { self.state.lock().queries.last().cloned() }
}

#[async_trait]
impl RecordSource for MockSource {
    async fn fetch(&self, query: &OrderQuery) -> Result<Vec<OrderRecord>> {
        let mut state = self.state.lock();
        state.queries.push(query.clone());
        if state.failing {
            return Err(anyhow!("mock source is failing"));
        }
        Ok(state.records.clone())
    }
}
