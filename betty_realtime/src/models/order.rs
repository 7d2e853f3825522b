//! An order row as seen by the realtime pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/////////////////////////////////////////////////////////////////////////////
// OrderRecord
/////////////////////////////////////////////////////////////////////////////

/// A snapshot of one row of the `orders` table.
///
/// Only the columns the notification surfaces need are kept. Every column
/// except `id` is optional in the JSON so that a partial `old_record`
/// (which only carries the primary key unless the table has
/// `REPLICA IDENTITY FULL`) can still be decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_new::new)]
pub struct OrderRecord {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,

    #[serde(default)]
    pub status: OrderStatus,

    #[serde(default, alias = "customer_id", alias = "user_id")]
    pub owner_id: Option<String>,

    #[new(default)]
    #[serde(default)]
    pub total_amount: f64,

    #[new(default)]
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,

    #[new(default)]
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,

    #[new(default)]
    #[serde(default)]
    pub display_id: Option<String>,
}

impl OrderRecord {
    pub fn is_owned_by(&self, user_id: &str) -> bool { self.owner_id.as_deref() == Some(user_id) }

    /// The id shown to humans: `display_id` if assigned, otherwise the row id.
    pub fn label(&self) -> &str { self.display_id.as_deref().unwrap_or(&self.id) }

    /// Returns true if `self` carries a strictly newer `updated_at` than `other`.
    /// A record that gained an `updated_at` counts as newer.
    pub fn is_newer_than(&self, other: &OrderRecord) -> bool {
        match (self.updated_at, other.updated_at) {
            (Some(mine), Some(theirs)) => mine > theirs,
            (Some(_), None) => true,
            _ => false,
        }
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    /// Overlays the non-empty columns of `partial` onto `self`.
    pub(crate) fn merge(mut self, partial: OrderRecord) -> Self {
        if partial.status != OrderStatus::default() {
            self.status = partial.status;
        }
        if partial.owner_id.is_some() {
            self.owner_id = partial.owner_id;
        }
        if partial.total_amount != 0.0 {
            self.total_amount = partial.total_amount;
        }
        self.created_at = partial.created_at.or(self.created_at);
        self.updated_at = partial.updated_at.or(self.updated_at);
        self.display_id = partial.display_id.or(self.display_id);
        self
    }
}

// Postgres bigint primary keys arrive as JSON numbers, uuids as strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "Invalid order id: {other}"
        ))),
    }
}

/////////////////////////////////////////////////////////////////////////////
// OrderStatus
/////////////////////////////////////////////////////////////////////////////

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, derive_more::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    #[default]
    #[display("pending")]
    Pending,
    #[display("new")]
    New,
    #[display("processing")]
    Processing,
    #[display("confirmed")]
    Confirmed,
    #[display("shipped")]
    Shipped,
    #[display("delivered")]
    Delivered,
    #[display("completed")]
    Completed,
    #[display("cancelled")]
    Cancelled,
    #[serde(other)]
    #[display("other")]
    Other,
}

impl OrderStatus {
    /// Statuses the sales staff still has to act on.
    pub fn is_actionable(&self) -> bool {
        matches!(self, Self::Pending | Self::New | Self::Processing)
    }
}
