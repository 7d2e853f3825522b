//! Clients of a hosted Supabase project.

use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use url::Url;

use crate::config::RealtimeConfig;

pub mod realtime;
pub mod rest;
pub mod retry;

pub use self::{realtime::RealtimeClient, rest::RestClient};

/// Credentials and endpoints shared by [RealtimeClient] and [RestClient].
#[derive(Debug, Clone)]
pub struct SupabaseEndpoint {
    url_prefix: Url,
    anon_key: String,
    access_token: Option<String>,
}

impl SupabaseEndpoint {
    pub fn new(url_prefix: &str, anon_key: &str, access_token: Option<&str>) -> Result<Self> {
        Ok(Self {
            url_prefix: Url::parse(url_prefix)?,
            anon_key: anon_key.to_owned(),
            access_token: access_token.map(str::to_owned),
        })
    }

    pub fn from_config(config: &RealtimeConfig) -> Result<Self> {
        Self::new(
            &config.supabase_url,
            &config.supabase_anon_key,
            config.access_token.as_deref(),
        )
    }

    pub fn url_prefix(&self) -> &Url { &self.url_prefix }

    /// The token sent as a bearer: the user's JWT, or the anon key.
    pub fn bearer_token(&self) -> &str { self.access_token.as_deref().unwrap_or(&self.anon_key) }

    pub fn rest_url(&self, table: &str) -> Result<Url> {
        Ok(self.url_prefix.join(&format!("/rest/v1/{table}"))?)
    }

    pub fn realtime_url(&self) -> Result<Url> {
        // Convert the protocol scheme:
        //   http:// -> ws://
        //   https:// -> wss://
        let ws_prefix = if self.url_prefix.scheme().starts_with("http") {
            self.url_prefix.as_str().replacen("http", "ws", 1)
        } else {
            self.url_prefix.to_string()
        };
        let mut url = Url::parse(&ws_prefix)?.join("/realtime/v1/websocket")?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.anon_key)
            .append_pair("vsn", "1.0.0");
        Ok(url)
    }

    pub fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let mut apikey = HeaderValue::from_str(&self.anon_key)?;
        apikey.set_sensitive(true);
        headers.insert("apikey", apikey);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", self.bearer_token()))?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);
        Ok(headers)
    }
}
