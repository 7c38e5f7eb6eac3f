//! Common test utilities for field-reconciliation-service integration tests.

#![allow(dead_code)]

use chrono::{Duration, NaiveDate, Utc};
use field_reconciliation_service::config::{
    BooksConfig, FieldOpsConfig, ReconciliationConfig, SyncConfig,
};
use field_reconciliation_service::feeds::{
    BooksPaymentFeedItem, FieldPaymentFeedItem, MockBooks, MockFieldOps,
};
use field_reconciliation_service::matching::MatchingConfig;
use field_reconciliation_service::services::{Database, MemoryStore};
use field_reconciliation_service::startup::{router, AppState};
use rust_decimal::Decimal;
use secrecy::Secret;
use service_core::config::Config as CommonConfig;
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,field_reconciliation_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Migrated Postgres store from `TEST_DATABASE_URL`.
///
/// Returns `None` when the variable is unset, so Postgres-backed tests pass
/// trivially on machines without a database.
pub async fn postgres_store() -> Option<Database> {
    init_tracing();

    let Ok(database_url) = std::env::var("TEST_DATABASE_URL") else {
        tracing::info!("TEST_DATABASE_URL not set - skipping Postgres store test");
        return None;
    };

    let db = Database::new(&database_url, 2, 1)
        .await
        .expect("Failed to connect to TEST_DATABASE_URL");
    db.run_migrations().await.expect("Failed to run migrations");
    Some(db)
}

/// In-memory configuration with no pauses between external calls.
pub fn test_config() -> ReconciliationConfig {
    ReconciliationConfig {
        common: CommonConfig { port: 0 },
        service_name: "field-reconciliation-service-test".to_string(),
        service_version: "test".to_string(),
        log_level: "debug".to_string(),
        otlp_endpoint: None,
        database: None,
        field_ops: FieldOpsConfig {
            base_url: String::new(),
            api_token: Secret::new(String::new()),
            page_size: 100,
            request_delay: std::time::Duration::ZERO,
        },
        books: BooksConfig {
            base_url: String::new(),
            access_token: Secret::new(String::new()),
            holding_account_name: "Undeposited Funds".to_string(),
        },
        sync: SyncConfig {
            request_delay: std::time::Duration::ZERO,
            ..SyncConfig::default()
        },
        matching: MatchingConfig::default(),
    }
}

/// Service wired to an in-memory store and mock feeds.
pub struct TestApp {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub field_ops: Arc<MockFieldOps>,
    pub books: Arc<MockBooks>,
}

impl TestApp {
    pub fn router(&self) -> axum::Router {
        router(self.state.clone())
    }
}

pub fn spawn_app() -> TestApp {
    spawn_app_with(test_config())
}

pub fn spawn_app_with(config: ReconciliationConfig) -> TestApp {
    init_tracing();

    let store = Arc::new(MemoryStore::new());
    let field_ops = Arc::new(MockFieldOps::new());
    let books = Arc::new(MockBooks::new());
    let state = AppState::new(config, store.clone(), field_ops.clone(), books.clone());

    TestApp {
        state,
        store,
        field_ops,
        books,
    }
}

/// A date `n` days before today, inside every default fetch window for small `n`.
pub fn days_ago(n: i64) -> NaiveDate {
    Utc::now().date_naive() - Duration::days(n)
}

pub fn cents(value: i64) -> Decimal {
    Decimal::new(value, 2)
}

pub fn field_item(id: &str, amount: Decimal, date: NaiveDate, name: Option<&str>) -> FieldPaymentFeedItem {
    FieldPaymentFeedItem {
        id: Some(id.to_string()),
        invoice_id: Some(format!("INV-{}", id)),
        customer_id: None,
        amount: Some(amount),
        date: Some(date),
        method: Some("Check".to_string()),
        status: Some("Posted".to_string()),
        customer_name: name.map(str::to_string),
    }
}

/// A books payment already deposited to a bank account.
pub fn books_item(id: &str, amount: Decimal, date: NaiveDate, name: Option<&str>) -> BooksPaymentFeedItem {
    BooksPaymentFeedItem {
        id: Some(id.to_string()),
        customer_ref: None,
        customer_name: name.map(str::to_string),
        date: Some(date),
        amount: Some(amount),
        payment_method_ref: Some("Check".to_string()),
        deposit_account_ref: Some("checking".to_string()),
        deposit_account_name: Some("Business Checking".to_string()),
        memo: None,
    }
}

/// A books payment still sitting in the holding account.
pub fn undeposited_item(
    id: &str,
    amount: Decimal,
    date: NaiveDate,
    name: Option<&str>,
) -> BooksPaymentFeedItem {
    BooksPaymentFeedItem {
        deposit_account_ref: Some(MockBooks::HOLDING_ACCOUNT_ID.to_string()),
        deposit_account_name: Some("Undeposited Funds".to_string()),
        ..books_item(id, amount, date, name)
    }
}
