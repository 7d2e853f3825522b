//! PostgREST client used for hydration and polling.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::{
    client::SupabaseEndpoint,
    error::ResponseError,
    models::prelude::*,
    transport::{OrderQuery, RecordSource},
};

#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    endpoint: SupabaseEndpoint,
}

impl RestClient {
    pub fn new(endpoint: SupabaseEndpoint) -> Result<Self> {
        let client = Client::builder()
            .default_headers(endpoint.headers()?)
            .build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl RecordSource for RestClient {
    async fn fetch(&self, query: &OrderQuery) -> Result<Vec<OrderRecord>> {
        let url = self.endpoint.rest_url(&query.table)?;
        let response = self
            .client
            .get(url)
            .query(&query.to_query_pairs())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ResponseError {
                url: response.url().to_string(),
                status: response.status().as_u16(),
                body: response.text().await?,
            }
            .into());
        }
        let records = response.json::<Vec<OrderRecord>>().await?;
        debug!("Fetched {} rows from {}", records.len(), query.table);
        Ok(records)
    }
}
