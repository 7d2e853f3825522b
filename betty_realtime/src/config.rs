use std::time::Duration;

use dotenvy::dotenv;
use validator::Validate;

use crate::{
    client::retry::ExponentialBackoff,
    models::prelude::*,
    transport::{ChannelFilter, ChannelSpec, ColumnFilter, OrderQuery},
};

/////////////////////////////////////////////////////////////////////////////
// RealtimeConfig
/////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize, Validate)]
pub struct RealtimeConfig {
    /// `BETTY_SUPABASE_URL`
    ///
    /// Project URL such as `https://xyzcompany.supabase.co`. Both the realtime
    /// socket and the REST endpoint are derived from it.
    #[validate(url)]
    pub supabase_url: String,

    /// `BETTY_SUPABASE_ANON_KEY`
    pub supabase_anon_key: String,

    /// `BETTY_ACCESS_TOKEN`
    ///
    /// JWT of the signed-in user. Row level security applies to both the
    /// change stream and queries, so without it only public rows are visible.
    pub access_token: Option<String>,

    /// `BETTY_SCHEMA`
    #[serde(default = "RealtimeConfig::default_schema")]
    pub schema: String,

    /// `BETTY_TABLE`
    #[serde(default = "RealtimeConfig::default_table")]
    #[validate(length(min = 1))]
    pub table: String,

    /// `BETTY_OWNER_COLUMN`
    ///
    /// Column holding the id of the customer who placed an order.
    #[serde(default = "RealtimeConfig::default_owner_column")]
    #[validate(length(min = 1))]
    pub owner_column: String,

    /// `BETTY_CHANNEL_NAME`
    #[serde(default = "RealtimeConfig::default_channel_name")]
    pub channel_name: String,

    /// `BETTY_RECONNECT_BASE_MS`
    #[serde(default = "RealtimeConfig::default_reconnect_base_ms")]
    #[validate(range(min = 1))]
    pub reconnect_base_ms: u64,

    /// `BETTY_MAX_RECONNECT_ATTEMPTS`
    #[serde(default = "RealtimeConfig::default_max_reconnect_attempts")]
    pub max_reconnect_attempts: usize,

    /// `BETTY_POLL_INTERVAL_SECS`
    ///
    /// Kept coarse so that a fleet of polling clients does not hammer the
    /// database.
    #[serde(default = "RealtimeConfig::default_poll_interval_secs")]
    #[validate(range(min = 1))]
    pub poll_interval_secs: u64,

    /// `BETTY_POLL_PAGE_SIZE`
    #[serde(default = "RealtimeConfig::default_poll_page_size")]
    #[validate(range(min = 1, max = 1000))]
    pub poll_page_size: usize,

    /// `BETTY_FALLBACK_TO_POLLING`
    ///
    /// Whether to switch to polling once reconnecting has given up.
    #[serde(default = "RealtimeConfig::default_fallback_to_polling")]
    pub fallback_to_polling: bool,

    /// `BETTY_JOIN_TIMEOUT_SECS`
    #[serde(default = "RealtimeConfig::default_join_timeout_secs")]
    #[validate(range(min = 1))]
    pub join_timeout_secs: u64,

    /// `BETTY_HEARTBEAT_SECS`
    #[serde(default = "RealtimeConfig::default_heartbeat_secs")]
    #[validate(range(min = 1))]
    pub heartbeat_secs: u64,
}

impl RealtimeConfig {
    const ENV_PREFIX: &'static str = "BETTY_";

    pub fn load_from_env() -> Result<Self, envy::Error> {
        dotenv().ok();
        envy::prefixed(Self::ENV_PREFIX).from_env::<Self>()
    }

    /// A config pointing at a local Supabase stack (`supabase start`).
    pub fn new_local(anon_key: impl Into<String>) -> Self {
        Self {
            supabase_url: "http://127.0.0.1:54321".into(),
            supabase_anon_key: anon_key.into(),
            access_token: None,
            schema: Self::default_schema(),
            table: Self::default_table(),
            owner_column: Self::default_owner_column(),
            channel_name: Self::default_channel_name(),
            reconnect_base_ms: Self::default_reconnect_base_ms(),
            max_reconnect_attempts: Self::default_max_reconnect_attempts(),
            poll_interval_secs: Self::default_poll_interval_secs(),
            poll_page_size: Self::default_poll_page_size(),
            fallback_to_polling: Self::default_fallback_to_polling(),
            join_timeout_secs: Self::default_join_timeout_secs(),
            heartbeat_secs: Self::default_heartbeat_secs(),
        }
    }

    // Functions returning a default value as a workaround for the issue:
    // https://github.com/serde-rs/serde/issues/368
    fn default_schema() -> String { "public".into() }
    fn default_table() -> String { "orders".into() }
    fn default_owner_column() -> String { "customer_id".into() }
    fn default_channel_name() -> String { "orders-changes".into() }
    fn default_reconnect_base_ms() -> u64 { 1000 }
    fn default_max_reconnect_attempts() -> usize { 5 }
    fn default_poll_interval_secs() -> u64 { 60 }
    fn default_poll_page_size() -> usize { 50 }
    fn default_fallback_to_polling() -> bool { true }
    fn default_join_timeout_secs() -> u64 { 10 }
    fn default_heartbeat_secs() -> u64 { 25 }

    pub fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::doubling(
            Duration::from_millis(self.reconnect_base_ms),
            self.max_reconnect_attempts,
        )
    }

    pub fn poll_interval(&self) -> Duration { Duration::from_secs(self.poll_interval_secs) }

    pub fn join_timeout(&self) -> Duration { Duration::from_secs(self.join_timeout_secs) }

    pub fn heartbeat_interval(&self) -> Duration { Duration::from_secs(self.heartbeat_secs) }

    /// The channel opened at mount: every change of the watched table.
    pub fn default_channel(&self) -> ChannelSpec {
        ChannelSpec::new(self.channel_name.clone(), Vec::new())
    }

    /// A channel narrowed server-side to what `identity` can see.
    ///
    /// Only customers are narrowed; staff subscribe broadly and filter on
    /// their side.
    pub fn channel_for(&self, identity: Option<&Identity>) -> ChannelSpec {
        match identity {
            Some(identity) if !identity.role.is_staff() => ChannelSpec::new(
                format!("{}-{}", self.channel_name, identity.id),
                vec![ChannelFilter::all(&self.table)
                    .with_filter(ColumnFilter::eq(&self.owner_column, &identity.id))],
            ),
            _ => self.default_channel(),
        }
    }

    /// The most recent orders visible to `identity`, used for hydration and
    /// polling.
    pub fn recent_orders_query(&self, identity: Option<&Identity>) -> OrderQuery {
        let query = OrderQuery::new(&self.table)
            .select([
                "id",
                "status",
                self.owner_column.as_str(),
                "total_amount",
                "created_at",
                "updated_at",
                "display_id",
            ])
            .newest_first("created_at")
            .limit(self.poll_page_size);
        match identity {
            Some(identity) if identity.role == Role::Customer => {
                query.filter(ColumnFilter::eq(&self.owner_column, &identity.id))
            }
            _ => query,
        }
    }
}
