//! HTTP client for the accounting books.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, info, instrument};

use super::field_ops::is_auth_failure;
use super::{decode_items, BooksPaymentFeedItem, BooksSource, FeedBatch, BOOKS_SYSTEM};
use crate::config::BooksConfig;
use crate::error::ReconciliationError;

#[derive(Debug, Deserialize)]
struct PaymentList {
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AccountList {
    #[serde(default)]
    data: Vec<Account>,
}

#[derive(Debug, Deserialize)]
struct Account {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Clone)]
pub struct BooksClient {
    client: Client,
    config: BooksConfig,
}

impl BooksClient {
    pub fn new(config: BooksConfig) -> Result<Self, ReconciliationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ReconciliationError::connectivity(BOOKS_SYSTEM, e))?;
        Ok(Self { client, config })
    }

    pub fn is_configured(&self) -> bool {
        !self.config.base_url.is_empty() && !self.config.access_token.expose_secret().is_empty()
    }

    /// Every failure here is fatal: the books calls are few and each one is needed.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ReconciliationError> {
        if !self.is_configured() {
            return Err(ReconciliationError::connectivity(
                BOOKS_SYSTEM,
                "credentials not configured",
            ));
        }

        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.config.access_token.expose_secret())
            .header("Accept", "application/json")
            .query(query)
            .send()
            .await
            .map_err(|e| ReconciliationError::connectivity(BOOKS_SYSTEM, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %body, url = %url, "Books request failed");
            let reason = if is_auth_failure(status) {
                anyhow!("{} rejected credentials ({})", path, status)
            } else {
                anyhow!("{} returned {}", path, status)
            };
            return Err(ReconciliationError::connectivity(BOOKS_SYSTEM, reason));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ReconciliationError::connectivity(BOOKS_SYSTEM, e))
    }

    async fn payments(
        &self,
        query: &[(&str, String)],
    ) -> Result<FeedBatch<BooksPaymentFeedItem>, ReconciliationError> {
        let list = self.get_json::<PaymentList>("payments", query).await?;
        let (items, malformed) = decode_items(list.data, BOOKS_SYSTEM);
        Ok(FeedBatch {
            items,
            malformed,
            warnings: Vec::new(),
        })
    }
}

#[async_trait]
impl BooksSource for BooksClient {
    #[instrument(skip(self))]
    async fn holding_account_id(&self) -> Result<Option<String>, ReconciliationError> {
        let name = self.config.holding_account_name.clone();
        let accounts = self
            .get_json::<AccountList>("accounts", &[("name", name.clone())])
            .await?;

        let id = accounts
            .data
            .into_iter()
            .find(|a| {
                a.name
                    .as_deref()
                    .is_some_and(|n| n.eq_ignore_ascii_case(&name))
            })
            .map(|a| a.id);

        info!(holding_account = %name, found = id.is_some(), "Resolved holding account");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn fetch_payments(
        &self,
        since: NaiveDate,
    ) -> Result<FeedBatch<BooksPaymentFeedItem>, ReconciliationError> {
        let batch = self.payments(&[("since", since.to_string())]).await?;
        info!(fetched = batch.items.len(), malformed = batch.malformed, "Fetched books payments");
        Ok(batch)
    }

    #[instrument(skip(self))]
    async fn fetch_undeposited(
        &self,
        holding_account_id: &str,
    ) -> Result<FeedBatch<BooksPaymentFeedItem>, ReconciliationError> {
        let batch = self
            .payments(&[("depositAccountRef", holding_account_id.to_string())])
            .await?;
        info!(
            fetched = batch.items.len(),
            malformed = batch.malformed,
            "Fetched undeposited books payments"
        );
        Ok(batch)
    }
}
