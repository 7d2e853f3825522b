use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::order::OrderRecord;

/////////////////////////////////////////////////////////////////////////////
// EventType
/////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    #[display("INSERT")]
    Insert,
    #[display("UPDATE")]
    Update,
    #[display("DELETE")]
    Delete,
}

impl EventType {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

/////////////////////////////////////////////////////////////////////////////
// ChangeEvent
/////////////////////////////////////////////////////////////////////////////

/// One row-level change of an order.
///
/// For INSERT/UPDATE the snapshot is the post-change record; for DELETE it is
/// the last known state of the deleted row. A `ChangeEvent` is consumed once
/// per subscriber and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    entity_id: String,
    event_type: EventType,
    snapshot: OrderRecord,
    received_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(event_type: EventType, snapshot: OrderRecord) -> Self {
        Self {
            entity_id: snapshot.id.clone(),
            event_type,
            snapshot,
            received_at: Utc::now(),
        }
    }

    pub fn insert(snapshot: OrderRecord) -> Self { Self::new(EventType::Insert, snapshot) }

    pub fn update(snapshot: OrderRecord) -> Self { Self::new(EventType::Update, snapshot) }

    pub fn delete(snapshot: OrderRecord) -> Self { Self::new(EventType::Delete, snapshot) }

    pub fn entity_id(&self) -> &str { &self.entity_id }

    pub fn event_type(&self) -> EventType { self.event_type }

    pub fn snapshot(&self) -> &OrderRecord { &self.snapshot }

    pub fn received_at(&self) -> DateTime<Utc> { self.received_at }
}
