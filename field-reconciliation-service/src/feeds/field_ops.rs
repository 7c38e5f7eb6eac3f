//! HTTP client for the field-operations system.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use super::{decode_items, FeedBatch, FieldOpsSource, FieldPaymentFeedItem, FIELD_OPS_SYSTEM};
use crate::config::FieldOpsConfig;
use crate::error::ReconciliationError;

/// Upper bound on pages per fetch, so a misbehaving `hasMore` cannot loop forever.
const MAX_PAGES: u32 = 200;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentPage {
    #[serde(default)]
    data: Vec<serde_json::Value>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct Customer {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Clone)]
pub struct FieldOpsClient {
    client: Client,
    config: FieldOpsConfig,
}

impl FieldOpsClient {
    pub fn new(config: FieldOpsConfig) -> Result<Self, ReconciliationError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ReconciliationError::connectivity(FIELD_OPS_SYSTEM, e))?;
        Ok(Self { client, config })
    }

    /// Check if the client has a base URL and token.
    pub fn is_configured(&self) -> bool {
        !self.config.base_url.is_empty() && !self.config.api_token.expose_secret().is_empty()
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<(StatusCode, Option<T>)> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(self.config.api_token.expose_secret())
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(status = %status, body = %body, url = %url, "Field ops request failed");
            return Ok((status, None));
        }

        let parsed = response.json::<T>().await?;
        Ok((status, Some(parsed)))
    }
}

#[async_trait]
impl FieldOpsSource for FieldOpsClient {
    #[instrument(skip(self))]
    async fn fetch_payments(
        &self,
        since: NaiveDate,
    ) -> Result<FeedBatch<FieldPaymentFeedItem>, ReconciliationError> {
        if !self.is_configured() {
            return Err(ReconciliationError::connectivity(
                FIELD_OPS_SYSTEM,
                "credentials not configured",
            ));
        }

        let mut batch = FeedBatch::default();
        let mut page = 1;

        loop {
            let query = [
                ("paidOnOrAfter", since.to_string()),
                ("page", page.to_string()),
                ("pageSize", self.config.page_size.to_string()),
            ];

            let outcome = self.get_json::<PaymentPage>("payments", &query).await;
            let payload = match outcome {
                Ok((_, Some(payload))) => payload,
                // Nothing has been fetched yet, so the system is unusable for this pass.
                Ok((status, None)) if page == 1 || is_auth_failure(status) => {
                    return Err(ReconciliationError::connectivity(
                        FIELD_OPS_SYSTEM,
                        anyhow!("payments request returned {}", status),
                    ));
                }
                Err(e) if page == 1 => {
                    return Err(ReconciliationError::connectivity(FIELD_OPS_SYSTEM, e));
                }
                Ok((status, None)) => {
                    let err = ReconciliationError::partial(
                        FIELD_OPS_SYSTEM,
                        format!("payments page {} returned {}", page, status),
                    );
                    warn!(error = %err, "Skipping page");
                    batch.warnings.push(err.to_string());
                    break;
                }
                Err(e) => {
                    let err = ReconciliationError::partial(
                        FIELD_OPS_SYSTEM,
                        format!("payments page {}: {}", page, e),
                    );
                    warn!(error = %err, "Skipping page");
                    batch.warnings.push(err.to_string());
                    break;
                }
            };

            let (items, malformed) = decode_items(payload.data, FIELD_OPS_SYSTEM);
            batch.items.extend(items);
            batch.malformed += malformed;

            if !payload.has_more || page >= MAX_PAGES {
                break;
            }
            page += 1;
            tokio::time::sleep(self.config.request_delay).await;
        }

        info!(
            fetched = batch.items.len(),
            malformed = batch.malformed,
            pages = page,
            "Fetched field payments"
        );

        Ok(batch)
    }

    #[instrument(skip(self))]
    async fn customer_name(&self, customer_id: &str) -> Result<Option<String>, ReconciliationError> {
        let path = format!("customers/{}", customer_id);
        match self.get_json::<Customer>(&path, &[]).await {
            Ok((_, Some(customer))) => Ok(customer.name.filter(|n| !n.trim().is_empty())),
            Ok((status, None)) if is_auth_failure(status) => Err(ReconciliationError::connectivity(
                FIELD_OPS_SYSTEM,
                anyhow!("customer lookup returned {}", status),
            )),
            Ok((status, None)) => Err(ReconciliationError::partial(
                FIELD_OPS_SYSTEM,
                format!("customer {} lookup returned {}", customer_id, status),
            )),
            Err(e) => Err(ReconciliationError::partial(
                FIELD_OPS_SYSTEM,
                format!("customer {} lookup: {}", customer_id, e),
            )),
        }
    }
}

pub(crate) fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::Secret;

    fn config(token: &str) -> FieldOpsConfig {
        FieldOpsConfig {
            base_url: "http://localhost:9".to_string(),
            api_token: Secret::new(token.to_string()),
            page_size: 50,
            request_delay: Duration::from_millis(0),
        }
    }

    #[test]
    fn client_without_token_is_not_configured() {
        assert!(!FieldOpsClient::new(config("")).unwrap().is_configured());
        assert!(FieldOpsClient::new(config("token")).unwrap().is_configured());
    }

    #[tokio::test]
    async fn unconfigured_client_fails_as_connectivity() {
        let client = FieldOpsClient::new(config("")).unwrap();
        let since = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();

        let err = client.fetch_payments(since).await.unwrap_err();
        assert!(matches!(err, ReconciliationError::Connectivity { .. }));
    }

    #[test]
    fn auth_statuses_are_fatal() {
        assert!(is_auth_failure(StatusCode::UNAUTHORIZED));
        assert!(is_auth_failure(StatusCode::FORBIDDEN));
        assert!(!is_auth_failure(StatusCode::BAD_GATEWAY));
    }
}
