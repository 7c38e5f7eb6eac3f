//! In-process feeds for tests and local runs without external credentials.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::RwLock;

use super::{
    BooksPaymentFeedItem, BooksSource, FeedBatch, FieldOpsSource, FieldPaymentFeedItem,
    BOOKS_SYSTEM, FIELD_OPS_SYSTEM,
};
use crate::error::ReconciliationError;

#[derive(Default)]
pub struct MockFieldOps {
    payments: RwLock<Vec<FieldPaymentFeedItem>>,
    customers: RwLock<HashMap<String, String>>,
    failing_customers: RwLock<Vec<String>>,
    offline: RwLock<bool>,
    fetch_count: AtomicU64,
    lookup_count: AtomicU64,
}

impl MockFieldOps {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_payments(&self, payments: Vec<FieldPaymentFeedItem>) {
        *self.payments.write().await = payments;
    }

    pub async fn add_customer(&self, customer_id: &str, name: &str) {
        self.customers
            .write()
            .await
            .insert(customer_id.to_string(), name.to_string());
    }

    /// Make lookups for this customer fail as a partial fetch.
    pub async fn fail_customer(&self, customer_id: &str) {
        self.failing_customers
            .write()
            .await
            .push(customer_id.to_string());
    }

    pub async fn set_offline(&self, offline: bool) {
        *self.offline.write().await = offline;
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookup_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FieldOpsSource for MockFieldOps {
    async fn fetch_payments(
        &self,
        since: NaiveDate,
    ) -> Result<FeedBatch<FieldPaymentFeedItem>, ReconciliationError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if *self.offline.read().await {
            return Err(ReconciliationError::connectivity(
                FIELD_OPS_SYSTEM,
                "mock field ops offline",
            ));
        }

        let items = self
            .payments
            .read()
            .await
            .iter()
            .filter(|p| p.date.is_none_or(|d| d >= since))
            .cloned()
            .collect();

        tracing::info!(since = %since, "[MOCK] Field payments served");
        Ok(FeedBatch::new(items))
    }

    async fn customer_name(&self, customer_id: &str) -> Result<Option<String>, ReconciliationError> {
        self.lookup_count.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_customers
            .read()
            .await
            .iter()
            .any(|c| c == customer_id)
        {
            return Err(ReconciliationError::partial(
                FIELD_OPS_SYSTEM,
                format!("customer {} lookup failed", customer_id),
            ));
        }
        Ok(self.customers.read().await.get(customer_id).cloned())
    }
}

pub struct MockBooks {
    payments: RwLock<Vec<BooksPaymentFeedItem>>,
    holding_account_id: Option<String>,
    offline: RwLock<bool>,
    fetch_count: AtomicU64,
}

impl Default for MockBooks {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBooks {
    pub const HOLDING_ACCOUNT_ID: &'static str = "undeposited";

    pub fn new() -> Self {
        Self {
            payments: RwLock::new(Vec::new()),
            holding_account_id: Some(Self::HOLDING_ACCOUNT_ID.to_string()),
            offline: RwLock::new(false),
            fetch_count: AtomicU64::new(0),
        }
    }

    pub async fn set_payments(&self, payments: Vec<BooksPaymentFeedItem>) {
        *self.payments.write().await = payments;
    }

    pub async fn set_offline(&self, offline: bool) {
        *self.offline.write().await = offline;
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    async fn check_online(&self) -> Result<(), ReconciliationError> {
        if *self.offline.read().await {
            return Err(ReconciliationError::connectivity(
                BOOKS_SYSTEM,
                "mock books offline",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BooksSource for MockBooks {
    async fn holding_account_id(&self) -> Result<Option<String>, ReconciliationError> {
        self.check_online().await?;
        Ok(self.holding_account_id.clone())
    }

    async fn fetch_payments(
        &self,
        since: NaiveDate,
    ) -> Result<FeedBatch<BooksPaymentFeedItem>, ReconciliationError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.check_online().await?;

        let items = self
            .payments
            .read()
            .await
            .iter()
            .filter(|p| p.date.is_none_or(|d| d >= since))
            .cloned()
            .collect();
        Ok(FeedBatch::new(items))
    }

    async fn fetch_undeposited(
        &self,
        holding_account_id: &str,
    ) -> Result<FeedBatch<BooksPaymentFeedItem>, ReconciliationError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.check_online().await?;

        let items = self
            .payments
            .read()
            .await
            .iter()
            .filter(|p| {
                p.deposit_account_ref.is_none()
                    || p.deposit_account_ref.as_deref() == Some(holding_account_id)
            })
            .cloned()
            .collect();
        Ok(FeedBatch::new(items))
    }
}
