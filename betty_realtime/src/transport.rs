//! Seams between the provider and the data backend.
//!
//! [ChangeTransport] is the push side (a channel of row changes) and
//! [RecordSource] the pull side (filtered queries used for hydration and
//! polling). Both are trait objects so tests can swap in doubles.

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use itertools::Itertools;
use serde_json::Value;

use crate::models::prelude::*;

/////////////////////////////////////////////////////////////////////////////
// ChannelSpec
/////////////////////////////////////////////////////////////////////////////

/// A named channel and the row changes it should carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSpec {
    pub name: String,
    pub filters: Vec<ChannelFilter>,
}

impl ChannelSpec {
    pub fn new(name: impl Into<String>, filters: Vec<ChannelFilter>) -> Self {
        Self {
            name: name.into(),
            filters,
        }
    }

    /// An empty filter list receives every change of the watched table and
    /// leaves relevance to the role filter.
    pub fn receives_all(&self) -> bool { self.filters.is_empty() }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelFilter {
    pub table: String,
    pub event: EventFilter,
    pub filter: Option<ColumnFilter>,
}

impl ChannelFilter {
    pub fn all(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            event: EventFilter::All,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: ColumnFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum EventFilter {
    #[display("*")]
    All,
    #[display("{_0}")]
    Only(EventType),
}

/// `<column>=eq.<value>`, the only operator the notification paths use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnFilter {
    pub column: String,
    pub value: String,
}

impl ColumnFilter {
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    /// The right-hand side in PostgREST syntax, ex. `eq.u1`.
    pub fn operand(&self) -> String { format!("eq.{}", self.value) }
}

impl fmt::Display for ColumnFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.column, self.operand())
    }
}

/////////////////////////////////////////////////////////////////////////////
// TransportSignal
/////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Status(ChannelStatus),
    Change(RawChange),
}

/// Channel lifecycle as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// A change message as it came off the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawChange {
    pub event_type: String,
    pub record: Option<Value>,
    pub old_record: Option<Value>,
    pub commit_timestamp: Option<String>,
}

impl RawChange {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            ..Default::default()
        }
    }

    pub fn with_record(mut self, record: Value) -> Self {
        self.record = Some(record);
        self
    }

    pub fn with_old_record(mut self, old_record: Value) -> Self {
        self.old_record = Some(old_record);
        self
    }
}

/// Opens channels to the push backend.
///
/// Opening never fails synchronously: connection and subscription problems
/// arrive as [ChannelStatus] signals on the returned stream. Dropping the
/// stream closes the channel.
pub trait ChangeTransport: Send + Sync + 'static {
    fn open(&self, spec: &ChannelSpec) -> BoxStream<'static, TransportSignal>;
}

/////////////////////////////////////////////////////////////////////////////
// OrderQuery / RecordSource
/////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderQuery {
    pub table: String,
    pub columns: Vec<String>,
    pub filters: Vec<ColumnFilter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

impl OrderQuery {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn select<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn filter(mut self, filter: ColumnFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn newest_first(mut self, column: impl Into<String>) -> Self {
        self.order_by = Some(OrderBy {
            column: column.into(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Query string pairs in PostgREST syntax.
    pub fn to_query_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        let select = if self.columns.is_empty() {
            "*".to_owned()
        } else {
            self.columns.iter().join(",")
        };
        pairs.push(("select".to_owned(), select));
        for filter in &self.filters {
            pairs.push((filter.column.clone(), filter.operand()));
        }
        if let Some(order_by) = &self.order_by {
            let direction = if order_by.descending { "desc" } else { "asc" };
            pairs.push(("order".to_owned(), format!("{}.{direction}", order_by.column)));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_owned(), limit.to_string()));
        }
        pairs
    }
}

#[async_trait]
pub trait RecordSource: Send + Sync + 'static {
    async fn fetch(&self, query: &OrderQuery) -> Result<Vec<OrderRecord>>;
}
