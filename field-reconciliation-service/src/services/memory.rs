//! In-process store used when no database is configured, and by tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::ReconciliationError;
use crate::matching::TakenSet;
use crate::models::{
    BooksPayment, FieldPayment, MatchStatus, MatchUpdate, ReconciliationRecord, SyncCounts,
    SyncLog, SyncStatus, UpsertOutcome,
};
use crate::services::store::ReconciliationStore;

#[derive(Default)]
struct MemoryState {
    field_payments: HashMap<String, FieldPayment>,
    books_payments: HashMap<String, BooksPayment>,
    records: HashMap<Uuid, ReconciliationRecord>,
    record_by_field_payment: HashMap<String, Uuid>,
    sync_logs: Vec<SyncLog>,
}

/// All state behind one lock, so `apply_match` checks and writes atomically.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn field_payment(&self, field_payment_id: &str) -> Option<FieldPayment> {
        self.state
            .read()
            .await
            .field_payments
            .get(field_payment_id)
            .cloned()
    }

    pub async fn record_for_field_payment(
        &self,
        field_payment_id: &str,
    ) -> Option<ReconciliationRecord> {
        let state = self.state.read().await;
        state
            .record_by_field_payment
            .get(field_payment_id)
            .and_then(|id| state.records.get(id))
            .cloned()
    }
}

fn sort_recent_first(records: &mut [ReconciliationRecord]) {
    records.sort_by(|a, b| {
        b.payment_date
            .cmp(&a.payment_date)
            .then_with(|| b.created_utc.cmp(&a.created_utc))
    });
}

fn record_not_found(record_id: Uuid) -> ReconciliationError {
    ReconciliationError::NotFound(format!("Reconciliation record {} not found", record_id))
}

#[async_trait]
impl ReconciliationStore for MemoryStore {
    async fn health_check(&self) -> Result<(), ReconciliationError> {
        Ok(())
    }

    #[instrument(skip(self, payment), fields(field_payment_id = %payment.field_payment_id))]
    async fn upsert_field_payment(
        &self,
        payment: &FieldPayment,
    ) -> Result<UpsertOutcome, ReconciliationError> {
        let mut state = self.state.write().await;

        let mut cached = payment.clone();
        if cached.customer_name.is_none() {
            if let Some(existing) = state.field_payments.get(&payment.field_payment_id) {
                cached.customer_name = existing.customer_name.clone();
            }
        }
        let known_name = cached.customer_name.clone();
        state
            .field_payments
            .insert(payment.field_payment_id.clone(), cached);

        if let Some(record_id) = state
            .record_by_field_payment
            .get(&payment.field_payment_id)
            .copied()
        {
            debug!("Record already exists");
            if let (Some(record), Some(name)) = (state.records.get_mut(&record_id), known_name) {
                if record.status() == MatchStatus::StOnly && record.customer_name.is_none() {
                    record.customer_name = Some(name);
                    record.updated_utc = Utc::now();
                }
            }
            return Ok(UpsertOutcome::Updated);
        }

        let record = ReconciliationRecord::for_field_payment(payment, Utc::now());
        state
            .record_by_field_payment
            .insert(payment.field_payment_id.clone(), record.record_id);
        state.records.insert(record.record_id, record);

        Ok(UpsertOutcome::Created)
    }

    async fn upsert_books_payment(
        &self,
        payment: &BooksPayment,
    ) -> Result<UpsertOutcome, ReconciliationError> {
        let mut state = self.state.write().await;
        let outcome = match state
            .books_payments
            .insert(payment.books_payment_id.clone(), payment.clone())
        {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Created,
        };
        Ok(outcome)
    }

    async fn get_record(
        &self,
        record_id: Uuid,
    ) -> Result<Option<ReconciliationRecord>, ReconciliationError> {
        Ok(self.state.read().await.records.get(&record_id).cloned())
    }

    async fn find_record_by_field_payment(
        &self,
        field_payment_id: &str,
    ) -> Result<Option<ReconciliationRecord>, ReconciliationError> {
        Ok(self.record_for_field_payment(field_payment_id).await)
    }

    async fn list_records(
        &self,
        status: Option<MatchStatus>,
        limit: i64,
    ) -> Result<Vec<ReconciliationRecord>, ReconciliationError> {
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| status.is_none_or(|s| r.status() == s))
            .cloned()
            .collect();
        sort_recent_first(&mut records);
        records.truncate(limit.clamp(1, 500) as usize);
        Ok(records)
    }

    async fn pending_records(&self) -> Result<Vec<ReconciliationRecord>, ReconciliationError> {
        let state = self.state.read().await;
        let mut records: Vec<_> = state
            .records
            .values()
            .filter(|r| r.status() == MatchStatus::StOnly)
            .cloned()
            .collect();
        sort_recent_first(&mut records);
        Ok(records)
    }

    async fn books_payments(&self) -> Result<Vec<BooksPayment>, ReconciliationError> {
        let state = self.state.read().await;
        let mut payments: Vec<_> = state.books_payments.values().cloned().collect();
        payments.sort_by(|a, b| {
            b.payment_date
                .cmp(&a.payment_date)
                .then_with(|| a.books_payment_id.cmp(&b.books_payment_id))
        });
        Ok(payments)
    }

    async fn get_books_payment(
        &self,
        books_payment_id: &str,
    ) -> Result<Option<BooksPayment>, ReconciliationError> {
        Ok(self
            .state
            .read()
            .await
            .books_payments
            .get(books_payment_id)
            .cloned())
    }

    async fn taken_books_payment_ids(&self) -> Result<TakenSet, ReconciliationError> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.status().claims_books_payment())
            .filter_map(|r| r.books_payment_id.clone())
            .collect())
    }

    #[instrument(skip(self, update), fields(record_id = %record_id, books_payment_id = %update.books_payment_id))]
    async fn apply_match(
        &self,
        record_id: Uuid,
        update: &MatchUpdate,
    ) -> Result<ReconciliationRecord, ReconciliationError> {
        let mut state = self.state.write().await;

        if !state.books_payments.contains_key(&update.books_payment_id) {
            return Err(ReconciliationError::NotFound(format!(
                "Books payment {} not found",
                update.books_payment_id
            )));
        }

        let current = state
            .records
            .get(&record_id)
            .map(ReconciliationRecord::status)
            .ok_or_else(|| record_not_found(record_id))?;
        if update.expected_status.is_some_and(|expected| expected != current) {
            debug!(status = current.as_str(), "Record changed since it was read");
            return Err(ReconciliationError::RecordChanged {
                record_id,
                status: current.as_str().to_string(),
            });
        }

        let held_elsewhere = state.records.values().any(|r| {
            r.record_id != record_id
                && r.status().is_exclusive()
                && r.books_payment_id.as_deref() == Some(update.books_payment_id.as_str())
        });
        if held_elsewhere {
            warn!("Books payment already consumed");
            return Err(ReconciliationError::AlreadyConsumed {
                books_payment_id: update.books_payment_id.clone(),
            });
        }

        let record = state
            .records
            .get_mut(&record_id)
            .ok_or_else(|| record_not_found(record_id))?;

        let now = Utc::now();
        record.books_payment_id = Some(update.books_payment_id.clone());
        record.match_status = update.status.as_str().to_string();
        record.match_confidence = Some(update.confidence);
        record.matched_by = Some(update.matched_by.clone());
        record.matched_utc = Some(now);
        record.is_deposited = update.is_deposited;
        record.deposit_date = update.deposit_date;
        record.updated_utc = now;

        Ok(record.clone())
    }

    async fn apply_manual_match(
        &self,
        record_id: Uuid,
        invoice_id: &str,
        actor_id: &str,
    ) -> Result<ReconciliationRecord, ReconciliationError> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get_mut(&record_id)
            .ok_or_else(|| record_not_found(record_id))?;

        if !record.status().is_exclusive() {
            record.books_payment_id = None;
            record.is_deposited = false;
            record.deposit_date = None;
        }

        let now = Utc::now();
        record.match_status = MatchStatus::ManualMatched.as_str().to_string();
        record.match_confidence = Some(1.0);
        record.invoice_id = Some(invoice_id.to_string());
        record.matched_by = Some(actor_id.to_string());
        record.matched_utc = Some(now);
        record.updated_utc = now;

        Ok(record.clone())
    }

    async fn apply_discrepancy(
        &self,
        record_id: Uuid,
    ) -> Result<ReconciliationRecord, ReconciliationError> {
        let mut state = self.state.write().await;
        let record = state
            .records
            .get_mut(&record_id)
            .ok_or_else(|| record_not_found(record_id))?;

        record.match_status = MatchStatus::Discrepancy.as_str().to_string();
        record.match_confidence = None;
        record.books_payment_id = None;
        record.is_deposited = false;
        record.deposit_date = None;
        record.updated_utc = Utc::now();

        Ok(record.clone())
    }

    async fn start_sync_log(&self) -> Result<SyncLog, ReconciliationError> {
        let log = SyncLog {
            sync_id: Uuid::new_v4(),
            started_utc: Utc::now(),
            completed_utc: None,
            status: SyncStatus::Running.as_str().to_string(),
            records_fetched: 0,
            records_created: 0,
            records_updated: 0,
            matches_found: 0,
            field_payments_fetched: 0,
            field_payments_created: 0,
            records_skipped: 0,
            error_message: None,
        };
        self.state.write().await.sync_logs.push(log.clone());
        Ok(log)
    }

    async fn finish_sync_log(
        &self,
        sync_id: Uuid,
        status: SyncStatus,
        counts: &SyncCounts,
        error_message: Option<&str>,
    ) -> Result<(), ReconciliationError> {
        let mut state = self.state.write().await;
        let log = state
            .sync_logs
            .iter_mut()
            .find(|l| l.sync_id == sync_id)
            .ok_or_else(|| ReconciliationError::NotFound(format!("Sync log {} not found", sync_id)))?;

        log.status = status.as_str().to_string();
        log.completed_utc = Some(Utc::now());
        log.records_fetched = counts.records_fetched;
        log.records_created = counts.records_created;
        log.records_updated = counts.records_updated;
        log.matches_found = counts.matches_found;
        log.field_payments_fetched = counts.field_payments_fetched;
        log.field_payments_created = counts.field_payments_created;
        log.records_skipped = counts.records_skipped;
        log.error_message = error_message.map(str::to_string);
        Ok(())
    }

    async fn list_sync_logs(&self, limit: i64) -> Result<Vec<SyncLog>, ReconciliationError> {
        let state = self.state.read().await;
        Ok(state
            .sync_logs
            .iter()
            .rev()
            .take(limit.clamp(1, 100) as usize)
            .cloned()
            .collect())
    }

    async fn last_successful_sync(&self) -> Result<Option<DateTime<Utc>>, ReconciliationError> {
        let state = self.state.read().await;
        Ok(state
            .sync_logs
            .iter()
            .filter(|l| SyncStatus::from_str(&l.status) == SyncStatus::Completed)
            .map(|l| l.started_utc)
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn field_payment(id: &str) -> FieldPayment {
        FieldPayment {
            field_payment_id: id.to_string(),
            invoice_ref: Some("INV-1".to_string()),
            customer_ref: Some("C1".to_string()),
            amount: Decimal::new(50000, 2),
            payment_date: NaiveDate::from_ymd_opt(2026, 3, 10).unwrap(),
            method: Some("check".to_string()),
            status: Some("posted".to_string()),
            customer_name: Some("Jane Doe".to_string()),
            ingested_utc: Utc::now(),
        }
    }

    #[tokio::test]
    async fn reingesting_a_field_payment_keeps_its_record() {
        let store = MemoryStore::new();
        let payment = field_payment("F1");

        assert_eq!(
            store.upsert_field_payment(&payment).await.unwrap(),
            UpsertOutcome::Created
        );
        let record = store.record_for_field_payment("F1").await.unwrap();
        store
            .apply_discrepancy(record.record_id)
            .await
            .unwrap();

        assert_eq!(
            store.upsert_field_payment(&payment).await.unwrap(),
            UpsertOutcome::Updated
        );
        let after = store.record_for_field_payment("F1").await.unwrap();
        assert_eq!(after.record_id, record.record_id);
        assert_eq!(after.status(), MatchStatus::Discrepancy);
    }

    #[tokio::test]
    async fn missing_name_does_not_erase_cached_name() {
        let store = MemoryStore::new();
        store.upsert_field_payment(&field_payment("F1")).await.unwrap();

        let mut nameless = field_payment("F1");
        nameless.customer_name = None;
        store.upsert_field_payment(&nameless).await.unwrap();

        let cached = store.field_payment("F1").await.unwrap();
        assert_eq!(cached.customer_name.as_deref(), Some("Jane Doe"));
    }

    #[tokio::test]
    async fn late_name_fills_an_unmatched_record_only() {
        let store = MemoryStore::new();
        let mut nameless = field_payment("F1");
        nameless.customer_name = None;
        store.upsert_field_payment(&nameless).await.unwrap();
        let mut other = field_payment("F2");
        other.customer_name = None;
        store.upsert_field_payment(&other).await.unwrap();
        let flagged = store.record_for_field_payment("F2").await.unwrap();
        store.apply_discrepancy(flagged.record_id).await.unwrap();

        store.upsert_field_payment(&field_payment("F1")).await.unwrap();
        store.upsert_field_payment(&field_payment("F2")).await.unwrap();

        let filled = store.record_for_field_payment("F1").await.unwrap();
        assert_eq!(filled.customer_name.as_deref(), Some("Jane Doe"));
        let untouched = store.record_for_field_payment("F2").await.unwrap();
        assert_eq!(untouched.customer_name, None);
    }

    #[tokio::test]
    async fn finishing_unknown_sync_log_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .finish_sync_log(Uuid::new_v4(), SyncStatus::Completed, &SyncCounts::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconciliationError::NotFound(_)));
    }
}
