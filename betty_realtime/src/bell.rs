//! The notification bell: a consumer keeping a badge of unread order
//! notifications for one viewer.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{models::prelude::*, provider::RealtimeProvider, pubsub::SubscriptionHandle};

/// Raised when an order the viewer tracks shows up or changes status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub order_id: String,
    pub label: String,
    pub event_type: EventType,
    pub status: OrderStatus,
}

impl Alert {
    pub fn route(&self) -> String { order_route(&self.order_id) }
}

pub fn order_route(order_id: &str) -> String { format!("/dashboard/orders/{order_id}") }

pub type AlertHook = Arc<dyn Fn(&Alert) + Send + Sync + 'static>;

#[derive(Debug, Default)]
struct BellState {
    orders: BTreeMap<String, OrderRecord>,
    unread: BTreeSet<String>,
}

/// Cloning a bell shares its state.
#[derive(Clone)]
pub struct NotificationBell {
    viewer: Identity,
    state: Arc<Mutex<BellState>>,
    hook: Option<AlertHook>,
}

impl NotificationBell {
    pub fn new(viewer: Identity) -> Self {
        Self {
            viewer,
            state: Arc::default(),
            hook: None,
        }
    }

    /// Sets a function called with every alert, e.g. to play a sound.
    pub fn with_alert_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn viewer(&self) -> &Identity { &self.viewer }

    /// Whether the bell keeps `order` at all.
    ///
    /// Sales staff only care about orders that still need work; admins see
    /// everything. Customers rely on the provider's gate to only receive
    /// their own orders.
    pub fn tracks(&self, order: &OrderRecord) -> bool {
        match self.viewer.role {
            Role::Sales => order.status.is_actionable(),
            Role::Admin | Role::Customer => true,
        }
    }

    /// Seeds the bell with already existing orders. They are not unread.
    pub fn load(&self, orders: impl IntoIterator<Item = OrderRecord>) {
        let mut state = self.state.lock();
        for order in orders.into_iter().filter(|order| self.tracks(order)) {
            state.orders.insert(order.id.clone(), order);
        }
    }

    /// Applies a change to the local state.
    ///
    /// Applying the same event again changes nothing and raises no alert.
    pub fn apply(&self, event: &ChangeEvent) -> Option<Alert> {
        let alert = self.apply_to_state(event);
        if let (Some(alert), Some(hook)) = (&alert, &self.hook) {
            hook(alert);
        }
        alert
    }

    fn apply_to_state(&self, event: &ChangeEvent) -> Option<Alert> {
        let mut state = self.state.lock();
        let id = event.entity_id();
        let order = event.snapshot();

        if event.event_type() == EventType::Delete || !self.tracks(order) {
            state.orders.remove(id);
            state.unread.remove(id);
            return None;
        }

        let previous = state.orders.insert(id.to_owned(), order.clone());
        match previous {
            Some(previous) if previous.status == order.status => None,
            _ => {
                state.unread.insert(id.to_owned());
                debug!("Order {} is now {}", order.label(), order.status);
                Some(Alert {
                    order_id: id.to_owned(),
                    label: order.label().to_owned(),
                    event_type: event.event_type(),
                    status: order.status,
                })
            }
        }
    }

    pub fn badge_count(&self) -> usize { self.state.lock().unread.len() }

    pub fn is_unread(&self, order_id: &str) -> bool { self.state.lock().unread.contains(order_id) }

    pub fn order(&self, order_id: &str) -> Option<OrderRecord> {
        self.state.lock().orders.get(order_id).cloned()
    }

    pub fn orders(&self) -> Vec<OrderRecord> { self.state.lock().orders.values().cloned().collect() }

    /// Marks the order as read and returns where to navigate, or `None` if
    /// the bell doesn't know the order.
    pub fn open(&self, order_id: &str) -> Option<String> {
        let mut state = self.state.lock();
        if !state.orders.contains_key(order_id) {
            return None;
        }
        state.unread.remove(order_id);
        Some(order_route(order_id))
    }

    pub fn mark_all_read(&self) { self.state.lock().unread.clear(); }

    /// Starts consuming the provider's events. Dropping the handle detaches
    /// the bell.
    pub fn attach(&self, provider: &RealtimeProvider) -> SubscriptionHandle {
        let bell = self.clone();
        provider.subscribe(move |event| {
            bell.apply(event);
            Ok(())
        })
    }
}
