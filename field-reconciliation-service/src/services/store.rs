//! Persistence seam for cached payments, reconciliation records and sync logs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ReconciliationError;
use crate::matching::TakenSet;
use crate::models::{
    BooksPayment, FieldPayment, MatchStatus, MatchUpdate, ReconciliationRecord, SyncCounts,
    SyncLog, SyncStatus, UpsertOutcome,
};

pub const SYSTEM_ACTOR: &str = "system";

#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    async fn health_check(&self) -> Result<(), ReconciliationError>;

    /// Cache the field payment and create its `st_only` record if none exists.
    ///
    /// `Created` means a new record was written. An existing record is never
    /// modified; only the cached copy of the payment is refreshed.
    async fn upsert_field_payment(
        &self,
        payment: &FieldPayment,
    ) -> Result<UpsertOutcome, ReconciliationError>;

    /// Insert the books payment, or overwrite its mutable fields.
    async fn upsert_books_payment(
        &self,
        payment: &BooksPayment,
    ) -> Result<UpsertOutcome, ReconciliationError>;

    async fn get_record(
        &self,
        record_id: Uuid,
    ) -> Result<Option<ReconciliationRecord>, ReconciliationError>;

    async fn find_record_by_field_payment(
        &self,
        field_payment_id: &str,
    ) -> Result<Option<ReconciliationRecord>, ReconciliationError>;

    /// Records filtered by status, most recent payment first.
    async fn list_records(
        &self,
        status: Option<MatchStatus>,
        limit: i64,
    ) -> Result<Vec<ReconciliationRecord>, ReconciliationError>;

    /// All `st_only` records, most recent payment first.
    async fn pending_records(&self) -> Result<Vec<ReconciliationRecord>, ReconciliationError>;

    async fn books_payments(&self) -> Result<Vec<BooksPayment>, ReconciliationError>;

    async fn get_books_payment(
        &self,
        books_payment_id: &str,
    ) -> Result<Option<BooksPayment>, ReconciliationError>;

    /// Books payments referenced by `matched`, `pending_review` or `manual_matched` records.
    async fn taken_books_payment_ids(&self) -> Result<TakenSet, ReconciliationError>;

    /// Link a record to a books payment.
    ///
    /// Fails with `AlreadyConsumed` when another record holds the books payment
    /// as `matched` or `manual_matched`.
    async fn apply_match(
        &self,
        record_id: Uuid,
        update: &MatchUpdate,
    ) -> Result<ReconciliationRecord, ReconciliationError>;

    /// Human link to an internal invoice. Always allowed.
    async fn apply_manual_match(
        &self,
        record_id: Uuid,
        invoice_id: &str,
        actor_id: &str,
    ) -> Result<ReconciliationRecord, ReconciliationError>;

    /// Flag a record as not reconcilable. Always allowed.
    async fn apply_discrepancy(
        &self,
        record_id: Uuid,
    ) -> Result<ReconciliationRecord, ReconciliationError>;

    async fn start_sync_log(&self) -> Result<SyncLog, ReconciliationError>;

    async fn finish_sync_log(
        &self,
        sync_id: Uuid,
        status: SyncStatus,
        counts: &SyncCounts,
        error_message: Option<&str>,
    ) -> Result<(), ReconciliationError>;

    async fn list_sync_logs(&self, limit: i64) -> Result<Vec<SyncLog>, ReconciliationError>;

    /// Start time of the latest completed pass.
    async fn last_successful_sync(&self) -> Result<Option<DateTime<Utc>>, ReconciliationError>;
}
