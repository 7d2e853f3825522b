//! Periodic re-fetching used while the push channel is unavailable.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::{
    models::prelude::*,
    transport::{OrderQuery, RecordSource},
};

/////////////////////////////////////////////////////////////////////////////
// Baseline
/////////////////////////////////////////////////////////////////////////////

/// The last snapshot the poller has seen, keyed by order id.
#[derive(Debug, Default)]
pub struct Baseline {
    records: Option<HashMap<String, OrderRecord>>,
}

impl Baseline {
    pub fn new() -> Self { Self::default() }

    pub fn is_cold(&self) -> bool { self.records.is_none() }

    /// Replaces the baseline without synthesizing events.
    pub fn seed(&mut self, records: Vec<OrderRecord>) { self.records = Some(index(records)); }

    /// Diffs `latest` against the baseline and makes it the new baseline.
    ///
    /// Ids that are new produce INSERTs, ids with a newer `updated_at` produce
    /// UPDATEs. Ids that disappeared produce nothing: a row leaving the page
    /// may as well have changed status or been pushed out by newer orders.
    /// A cold baseline is seeded silently.
    pub fn advance(&mut self, latest: Vec<OrderRecord>) -> Vec<ChangeEvent> {
        let events = match &self.records {
            None => Vec::new(),
            Some(previous) => latest
                .iter()
                .filter_map(|record| match previous.get(&record.id) {
                    None => Some(ChangeEvent::insert(record.clone())),
                    Some(before) if record.is_newer_than(before) => {
                        Some(ChangeEvent::update(record.clone()))
                    }
                    Some(_) => None,
                })
                .collect(),
        };
        self.records = Some(index(latest));
        events
    }
}

fn index(records: Vec<OrderRecord>) -> HashMap<String, OrderRecord> {
    records
        .into_iter()
        .map(|record| (record.id.clone(), record))
        .collect()
}

/////////////////////////////////////////////////////////////////////////////
// PollingFallback
/////////////////////////////////////////////////////////////////////////////

/// A running poll loop. Dropping it stops the loop.
#[derive(Debug)]
pub struct PollingFallback {
    task: AbortHandle,
}

impl PollingFallback {
    /// Spawns a loop that, every `interval`, fetches the query returned by
    /// `next_query` and hands the synthesized events to `on_events`.
    ///
    /// Ticks run strictly one after another: the next sleep starts only when
    /// the previous fetch has completed. A failed fetch skips the tick and
    /// leaves the baseline untouched. The loop ends when `next_query` returns
    /// `None`.
    pub fn start<Q, F>(
        source: Arc<dyn RecordSource>,
        baseline: Arc<parking_lot::Mutex<Baseline>>,
        interval: Duration,
        next_query: Q,
        on_events: F,
    ) -> Self
    where
        Q: Fn() -> Option<OrderQuery> + Send + 'static,
        F: Fn(Vec<ChangeEvent>) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            while let Some(query) = next_query() {
                match source.fetch(&query).await {
                    Ok(records) => {
                        let events = baseline.lock().advance(records);
                        debug!("Poll found {} changes", events.len());
                        if !events.is_empty() {
                            on_events(events);
                        }
                    }
                    Err(e) => warn!("Polling {} failed, retrying next tick: {e:?}", query.table),
                }
                tokio::time::sleep(interval).await;
            }
        });
        Self {
            task: task.abort_handle(),
        }
    }

    pub fn stop(&self) { self.task.abort(); }

    pub fn is_running(&self) -> bool { !self.task.is_finished() }
}

impl Drop for PollingFallback {
    fn drop(&mut self) { self.stop(); }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use googletest::prelude::*;

    use super::*;

    fn pending(id: &str) -> OrderRecord {
        OrderRecord::new(id.into(), OrderStatus::Pending, Some("u1".into()))
    }

    #[test]
    fn cold_baseline_is_seeded_silently() {
        let mut baseline = Baseline::new();
        assert!(baseline.is_cold());
        assert_that!(baseline.advance(vec![pending("1"), pending("2")]), empty());
        assert!(!baseline.is_cold());
    }

    #[test]
    fn new_ids_become_inserts() {
        let mut baseline = Baseline::new();
        baseline.seed(vec![pending("1")]);

        let events = baseline.advance(vec![pending("1"), pending("2")]);

        assert_that!(events, len(eq(1)));
        assert_that!(events[0].entity_id(), eq("2"));
        assert_that!(events[0].event_type(), eq(EventType::Insert));
    }

    #[test]
    fn newer_updated_at_becomes_update() {
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap();
        let mut baseline = Baseline::new();
        baseline.seed(vec![pending("1").with_updated_at(t0), pending("2").with_updated_at(t0)]);

        let mut shipped = pending("1").with_updated_at(t1);
        shipped.status = OrderStatus::Shipped;
        let events = baseline.advance(vec![shipped.clone(), pending("2").with_updated_at(t0)]);

        assert_that!(events, len(eq(1)));
        assert_that!(events[0].event_type(), eq(EventType::Update));
        assert_that!(events[0].snapshot(), eq(&shipped));
    }

    #[test]
    fn vanished_ids_are_not_reported() {
        let mut baseline = Baseline::new();
        baseline.seed(vec![pending("1"), pending("2")]);
        assert_that!(baseline.advance(vec![pending("2")]), empty());
        // The vanished id counts as new if it comes back.
        let events = baseline.advance(vec![pending("1"), pending("2")]);
        assert_that!(events, len(eq(1)));
        assert_that!(events[0].entity_id(), eq("1"));
    }

    #[test]
    fn baseline_advances_even_without_changes() {
        let mut baseline = Baseline::new();
        baseline.seed(vec![pending("1")]);
        assert_that!(baseline.advance(vec![pending("1")]), empty());
        assert_that!(baseline.advance(vec![pending("1")]), empty());
    }
}
