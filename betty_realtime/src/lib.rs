//! Realtime order notifications for the Betty Organic backend.
//!
//! A [RealtimeProvider] keeps one push channel to the `orders` table open,
//! reconnects with exponential backoff, falls back to polling when the
//! channel can't be established, and fans typed [ChangeEvent]s out to its
//! subscribers after gating them by the viewer's role.
//!
//! [RealtimeProvider]: provider::RealtimeProvider
//! [ChangeEvent]: models::change::ChangeEvent

pub mod bell;
pub mod client;
pub mod config;
pub mod error;
pub mod filter;
pub mod models;
pub mod provider;
pub mod pubsub;
pub mod timer;
pub mod transport;

pub mod prelude {
    pub use crate::{
        bell::{Alert, NotificationBell},
        client::{RealtimeClient, RestClient, SupabaseEndpoint},
        config::RealtimeConfig,
        filter::{is_relevant, relevance, Relevance, UNKNOWN_IDENTITY_POLICY},
        models::prelude::*,
        provider::{ConnectionState, ProviderStatus, RealtimeProvider},
        pubsub::{SubscriberRegistry, SubscriptionHandle},
        transport::{
            ChangeTransport, ChannelFilter, ChannelSpec, ChannelStatus, ColumnFilter,
            EventFilter, OrderQuery, RawChange, RecordSource, TransportSignal,
        },
    };
}
