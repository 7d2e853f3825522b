//! Fan-out of [ChangeEvent]s to registered callbacks.

use std::{
    collections::BTreeMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Weak},
};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::error;

use crate::models::prelude::*;

pub type Callback = Arc<dyn Fn(&ChangeEvent) -> Result<()> + Send + Sync + 'static>;

/////////////////////////////////////////////////////////////////////////////
// SubscriberRegistry
/////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    state: Arc<Mutex<RegistryState>>,
}

#[derive(Default)]
struct RegistryState {
    next_id: usize,
    callbacks: BTreeMap<usize, Callback>,
}

impl SubscriberRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionHandle
    where
        F: Fn(&ChangeEvent) -> Result<()> + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, Arc::new(callback));
        SubscriptionHandle {
            id,
            registry: Arc::downgrade(&self.state),
        }
    }

    /// Invokes every callback registered at the time of the call.
    ///
    /// The registry is not locked while callbacks run, so a callback may
    /// (un)subscribe without deadlocking; such changes take effect from the
    /// next dispatch. Errors and panics are logged and do not stop the fan-out.
    /// Returns the number of callbacks that completed successfully.
    pub fn dispatch(&self, event: &ChangeEvent) -> usize {
        let callbacks: Vec<(usize, Callback)> = self
            .state
            .lock()
            .callbacks
            .iter()
            .map(|(id, callback)| (*id, callback.clone()))
            .collect();

        let mut delivered = 0;
        for (id, callback) in callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => error!(
                    "Subscriber {id} failed to handle {} {}: {e:?}",
                    event.event_type(),
                    event.entity_id()
                ),
                Err(_) => error!(
                    "Subscriber {id} panicked while handling {} {}",
                    event.event_type(),
                    event.entity_id()
                ),
            }
        }
        delivered
    }

    pub fn count(&self) -> usize { self.state.lock().callbacks.len() }

    pub fn clear(&self) { self.state.lock().callbacks.clear(); }
}

/////////////////////////////////////////////////////////////////////////////
// SubscriptionHandle
/////////////////////////////////////////////////////////////////////////////

/// Owns exactly one entry of a [SubscriberRegistry].
///
/// The entry is removed by [SubscriptionHandle::unsubscribe] or when the
/// handle is dropped.
#[must_use = "dropping a SubscriptionHandle unsubscribes the callback"]
pub struct SubscriptionHandle {
    id: usize,
    registry: Weak<Mutex<RegistryState>>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> usize { self.id }

    /// Removes the callback. Calling it again, or after the registry has been
    /// cleared or dropped, does nothing.
    pub fn unsubscribe(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().callbacks.remove(&self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|registry| registry.lock().callbacks.contains_key(&self.id))
            .unwrap_or(false)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) { self.unsubscribe(); }
}
