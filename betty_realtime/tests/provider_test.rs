use std::time::Duration;

use anyhow::{anyhow, Result};
use betty_realtime::prelude::*;
use googletest::prelude::*;
use serde_json::json;
use test_log::test;
use tokio::time::sleep;

use self::common::{MockSource, MockTransport};

pub mod common;

fn provider(config: RealtimeConfig) -> (RealtimeProvider, MockTransport, MockSource) {
    let transport = MockTransport::new();
    let source = MockSource::default();
    let provider = RealtimeProvider::new(config, transport.clone(), source.clone());
    (provider, transport, source)
}

#[test(tokio::test(start_paused = true))]
async fn connects_on_init() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    let mut status = provider.watch_status();

    provider.init();

    assert_that!(transport.opened(), eq(1));
    assert!(transport.latest().spec.receives_all());
    assert_that!(provider.connection_state(), eq(ConnectionState::Connecting));

    transport.latest().subscribed();
    common::settle().await;

    assert_that!(provider.connection_state(), eq(ConnectionState::Subscribed));
    assert!(status.has_changed()?);
    let current = status.borrow_and_update().clone();
    assert!(current.is_connected);
    assert_that!(current.connection_status, eq(ConnectionState::Subscribed));
    assert_that!(current.identity, none());
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn identity_is_published_without_reconnecting() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    provider.init();
    transport.latest().subscribed();
    common::settle().await;

    provider.set_identity(Some(Identity::sales("s1")));

    assert_that!(provider.status().identity, some(eq(&Identity::sales("s1"))));
    assert_that!(provider.connection_state(), eq(ConnectionState::Subscribed));
    assert_that!(transport.opened(), eq(1));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn changes_are_fanned_out() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    let (events1, callback1) = common::recorder();
    let (events2, callback2) = common::recorder();
    let _handle1 = provider.subscribe(callback1);
    let _handle2 = provider.subscribe(callback2);
    provider.init();
    transport.latest().subscribed();

    transport.latest().change(common::insert("o1", "u1", "pending"));
    transport
        .latest()
        .change(RawChange::new("UPDATE").with_record(common::row("o1", "u1", "processing")));
    common::settle().await;

    for events in [events1, events2] {
        let events = events.lock().clone();
        assert_that!(events, len(eq(2)));
        assert_that!(events[0].event_type(), eq(EventType::Insert));
        assert_that!(events[1].event_type(), eq(EventType::Update));
        assert_that!(events[1].snapshot().status, eq(OrderStatus::Processing));
    }
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn failing_subscriber_does_not_stop_others() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    let _failing = provider.subscribe(|_| Err(anyhow!("broken consumer")));
    let _panicking = provider.subscribe(|_| panic!("panicking consumer"));
    let (events, callback) = common::recorder();
    let _handle = provider.subscribe(callback);
    provider.init();

    transport.latest().change(common::insert("o1", "u1", "pending"));
    common::settle().await;

    assert_that!(events.lock().len(), eq(1));
    assert_that!(provider.subscriber_count(), eq(3));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn malformed_changes_are_dropped() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    let (events, callback) = common::recorder();
    let _handle = provider.subscribe(callback);
    provider.init();

    transport.latest().change(RawChange::new("INSERT"));
    transport.latest().change(RawChange::new("TRUNCATE").with_record(json!({"id": "o1"})));
    transport.latest().change(RawChange::new("INSERT").with_record(json!({"status": "pending"})));
    transport.latest().change(common::insert("o2", "u1", "pending"));
    common::settle().await;

    let events = events.lock().clone();
    assert_that!(events, len(eq(1)));
    assert_that!(events[0].entity_id(), eq("o2"));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn delete_carries_the_last_known_record() -> Result<()> {
    let (provider, transport, source) = provider(common::config());
    source.set_records(vec![common::order("o1", "u1", OrderStatus::Processing)]);
    let (events, callback) = common::recorder();
    let _handle = provider.subscribe(callback);
    provider.init();

    assert_that!(provider.hydrate().await, len(eq(1)));
    // Without REPLICA IDENTITY FULL only the key is sent.
    transport
        .latest()
        .change(RawChange::new("DELETE").with_old_record(json!({"id": "o1"})));
    common::settle().await;

    let events = events.lock().clone();
    assert_that!(events, len(eq(1)));
    assert_that!(events[0].event_type(), eq(EventType::Delete));
    assert_that!(events[0].snapshot().status, eq(OrderStatus::Processing));
    assert_that!(events[0].snapshot().owner_id, some(eq("u1")));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn customers_only_receive_their_own_orders() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    let (events, callback) = common::recorder();
    let _handle = provider.subscribe(callback);
    provider.init();
    provider.set_identity(Some(Identity::customer("u1")));

    transport.latest().change(common::insert("o1", "u1", "pending"));
    transport.latest().change(common::insert("o2", "u2", "pending"));
    common::settle().await;

    let events = events.lock().clone();
    assert_that!(events, len(eq(1)));
    assert_that!(events[0].entity_id(), eq("o1"));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn unsubscribe_removes_only_that_callback() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    let (events1, callback1) = common::recorder();
    let (events2, callback2) = common::recorder();
    let handle1 = provider.subscribe(callback1);
    let _handle2 = provider.subscribe(callback2);
    provider.init();

    handle1.unsubscribe();
    handle1.unsubscribe();
    transport.latest().change(common::insert("o1", "u1", "pending"));
    common::settle().await;

    assert_that!(events1.lock().len(), eq(0));
    assert_that!(events2.lock().len(), eq(1));
    assert_that!(provider.subscriber_count(), eq(1));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn one_pending_reconnect_per_failure_burst() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    provider.init();

    transport.latest().error();
    transport.latest().timed_out();
    common::settle().await;

    assert!(provider.reconnect_pending());
    assert_that!(provider.reconnects_scheduled(), eq(1));
    assert_that!(provider.reconnect_attempts(), eq(1));
    assert_that!(provider.connection_state(), eq(ConnectionState::TimedOut));

    sleep(Duration::from_secs(1)).await;
    common::settle().await;

    assert!(!provider.reconnect_pending());
    assert_that!(transport.opened(), eq(2));
    assert_that!(provider.connection_state(), eq(ConnectionState::Connecting));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn subscribing_resets_the_counter() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    provider.init();

    transport.latest().error();
    common::settle().await;
    sleep(Duration::from_secs(1)).await;
    transport.latest().error();
    common::settle().await;
    assert_that!(provider.reconnect_attempts(), eq(2));

    sleep(Duration::from_secs(2)).await;
    transport.latest().subscribed();
    common::settle().await;

    assert_that!(transport.opened(), eq(3));
    assert_that!(provider.reconnect_attempts(), eq(0));
    assert_that!(provider.reconnects_scheduled(), eq(0));
    assert_that!(provider.connection_state(), eq(ConnectionState::Subscribed));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn remote_close_is_not_retried() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    provider.init();
    transport.latest().subscribed();
    transport.latest().closed();
    common::settle().await;

    assert_that!(provider.connection_state(), eq(ConnectionState::Closed));
    assert!(!provider.reconnect_pending());

    sleep(Duration::from_secs(60)).await;
    assert_that!(transport.opened(), eq(1));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn ended_transport_counts_as_failure_or_close() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    provider.init();

    // Before subscribing: a failure to retry.
    transport.latest().end();
    common::settle().await;
    assert_that!(provider.connection_state(), eq(ConnectionState::ChannelError));
    assert!(provider.reconnect_pending());

    // After subscribing: a remote close.
    sleep(Duration::from_secs(1)).await;
    transport.latest().subscribed();
    transport.latest().end();
    common::settle().await;
    assert_that!(provider.connection_state(), eq(ConnectionState::Closed));
    assert!(!provider.reconnect_pending());
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn open_replaces_the_connection() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    let (events, callback) = common::recorder();
    let _handle = provider.subscribe(callback);
    provider.init();
    transport.latest().error();
    common::settle().await;
    assert!(provider.reconnect_pending());

    let filter = ChannelFilter::all("orders").with_filter(ColumnFilter::eq("customer_id", "u1"));
    provider.open(vec![filter.clone()]);
    common::settle().await;

    assert!(!provider.reconnect_pending());
    assert_that!(transport.opened(), eq(2));
    assert_that!(transport.latest().spec.filters, elements_are![eq(&filter)]);

    // The replaced channel is no longer listened to.
    transport.channel(0).change(common::insert("o1", "u1", "pending"));
    transport.latest().change(common::insert("o2", "u1", "pending"));
    common::settle().await;
    let events = events.lock().clone();
    assert_that!(events, len(eq(1)));
    assert_that!(events[0].entity_id(), eq("o2"));

    // Reconnects reuse the last requested channel. Opening kept the counter,
    // so this is the second attempt.
    transport.latest().error();
    common::settle().await;
    assert_that!(provider.reconnect_attempts(), eq(2));
    sleep(Duration::from_secs(2)).await;
    common::settle().await;
    assert_that!(transport.opened(), eq(3));
    assert_that!(transport.latest().spec.filters, elements_are![eq(&filter)]);
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn customer_channel_is_narrowed_to_their_orders() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    let customer = Identity::customer("u1");
    provider.set_identity(Some(customer.clone()));

    provider.open_channel(provider.config().channel_for(Some(&customer)));

    let channel = transport.latest();
    assert!(!channel.spec.receives_all());
    assert_that!(channel.spec.name, eq("orders-changes-u1"));
    let filter = ChannelFilter::all("orders").with_filter(ColumnFilter::eq("customer_id", "u1"));
    assert_that!(channel.spec.filters, elements_are![eq(&filter)]);
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn hydration_failure_yields_nothing() -> Result<()> {
    let (provider, _, source) = provider(common::config());
    source.set_failing(true);

    assert_that!(provider.hydrate().await, empty());
    assert_that!(source.fetch_count(), eq(1));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn hydration_is_scoped_to_the_identity() -> Result<()> {
    let (provider, _, source) = provider(common::config());
    provider.set_identity(Some(Identity::customer("u1")));

    provider.hydrate().await;

    let query = source.last_query().unwrap();
    assert_that!(query.filters, elements_are![eq(&ColumnFilter::eq("customer_id", "u1"))]);
    assert_that!(query.limit, some(eq(50)));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn subscribing_stops_polling() -> Result<()> {
    let (provider, transport, source) = provider(common::config());
    provider.init();
    provider.start_polling();
    common::settle().await;

    assert!(provider.is_polling());
    assert_that!(provider.connection_state(), eq(ConnectionState::Polling));
    assert_that!(source.fetch_count(), eq(1));

    transport.latest().subscribed();
    common::settle().await;

    assert!(!provider.is_polling());
    sleep(Duration::from_secs(120)).await;
    assert_that!(source.fetch_count(), eq(1));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn polling_state_holds_while_the_poller_runs() -> Result<()> {
    let (provider, transport, _) = provider(common::config());
    provider.init();
    provider.start_polling();
    common::settle().await;
    assert_that!(provider.connection_state(), eq(ConnectionState::Polling));

    transport.latest().error();
    common::settle().await;
    assert!(provider.reconnect_pending());
    assert_that!(provider.connection_state(), eq(ConnectionState::Polling));

    sleep(Duration::from_secs(1)).await;
    common::settle().await;
    assert_that!(transport.opened(), eq(2));
    assert!(provider.is_polling());
    assert_that!(provider.connection_state(), eq(ConnectionState::Polling));
    assert_that!(provider.status().connection_status, eq(ConnectionState::Polling));

    // Stopping the poller reveals the push channel's own state.
    provider.stop_polling();
    assert_that!(provider.connection_state(), eq(ConnectionState::Connecting));

    provider.start_polling();
    transport.latest().subscribed();
    common::settle().await;
    assert!(!provider.is_polling());
    assert_that!(provider.connection_state(), eq(ConnectionState::Subscribed));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn failed_poll_is_retried_on_the_next_tick() -> Result<()> {
    let (provider, _, source) = provider(common::config());
    source.set_records(vec![common::order("1", "u1", OrderStatus::Pending)]);
    let (events, callback) = common::recorder();
    let _handle = provider.subscribe(callback);

    provider.start_polling();
    common::settle().await;
    assert_that!(source.fetch_count(), eq(1));

    source.set_failing(true);
    source.set_records(vec![
        common::order("1", "u1", OrderStatus::Pending),
        common::order("2", "u1", OrderStatus::Pending),
    ]);
    sleep(Duration::from_secs(60)).await;
    common::settle().await;
    assert_that!(source.fetch_count(), eq(2));
    assert_that!(events.lock().len(), eq(0));
    assert!(provider.is_polling());

    source.set_failing(false);
    sleep(Duration::from_secs(60)).await;
    common::settle().await;
    assert_that!(source.fetch_count(), eq(3));

    let events = events.lock().clone();
    assert_that!(events, len(eq(1)));
    assert_that!(events[0].event_type(), eq(EventType::Insert));
    assert_that!(events[0].entity_id(), eq("2"));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn teardown_stops_everything() -> Result<()> {
    let (provider, transport, source) = provider(common::config());
    let (events, callback) = common::recorder();
    let _handle = provider.subscribe(callback);
    provider.init();
    transport.latest().error();
    provider.start_polling();
    common::settle().await;

    provider.teardown();

    assert_that!(provider.subscriber_count(), eq(0));
    assert!(!provider.reconnect_pending());
    assert!(!provider.is_polling());
    assert_that!(provider.connection_state(), eq(ConnectionState::Closed));

    transport.latest().change(common::insert("o1", "u1", "pending"));
    provider.open(Vec::new());
    sleep(Duration::from_secs(120)).await;

    assert_that!(events.lock().len(), eq(0));
    assert_that!(transport.opened(), eq(1));
    assert_that!(source.fetch_count(), eq(1));
    Ok(())
}

#[test(tokio::test(start_paused = true))]
async fn dropping_the_provider_stops_background_work() -> Result<()> {
    let (provider, transport, source) = provider(common::config());
    provider.init();
    transport.latest().error();
    provider.start_polling();
    common::settle().await;

    drop(provider);
    sleep(Duration::from_secs(120)).await;

    assert_that!(transport.opened(), eq(1));
    assert_that!(source.fetch_count(), eq(1));
    Ok(())
}
