//! Domain models for field-reconciliation-service.

#![allow(clippy::should_implement_trait)]

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

// ============================================================================
// Cached External Payments
// ============================================================================

/// Payment collected in the field, as reported by the field-operations system.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct FieldPayment {
    pub field_payment_id: String,
    pub invoice_ref: Option<String>,
    pub customer_ref: Option<String>,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub method: Option<String>,
    pub status: Option<String>,
    pub customer_name: Option<String>,
    pub ingested_utc: DateTime<Utc>,
}

/// Payment recorded in the accounting books.
#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct BooksPayment {
    pub books_payment_id: String,
    pub customer_ref: Option<String>,
    pub customer_name: Option<String>,
    pub payment_date: NaiveDate,
    pub amount: Decimal,
    pub method: Option<String>,
    /// False while the money sits in the undeposited holding account.
    pub is_deposited: bool,
    pub deposit_account: Option<String>,
    pub deposit_date: Option<NaiveDate>,
    pub memo: Option<String>,
    pub synced_utc: DateTime<Utc>,
}

/// Result of an idempotent upsert keyed by external identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
}

// ============================================================================
// Reconciliation Record Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    /// Only the field system knows about this payment so far.
    StOnly,
    Matched,
    PendingReview,
    ManualMatched,
    Discrepancy,
}

impl MatchStatus {
    pub const ALL: [MatchStatus; 5] = [
        Self::StOnly,
        Self::Matched,
        Self::PendingReview,
        Self::ManualMatched,
        Self::Discrepancy,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StOnly => "st_only",
            Self::Matched => "matched",
            Self::PendingReview => "pending_review",
            Self::ManualMatched => "manual_matched",
            Self::Discrepancy => "discrepancy",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "st_only" => Some(Self::StOnly),
            "matched" => Some(Self::Matched),
            "pending_review" => Some(Self::PendingReview),
            "manual_matched" => Some(Self::ManualMatched),
            "discrepancy" => Some(Self::Discrepancy),
            _ => None,
        }
    }

    /// Statuses whose books-payment link removes it from the candidate pool.
    pub fn claims_books_payment(&self) -> bool {
        matches!(
            self,
            Self::Matched | Self::PendingReview | Self::ManualMatched
        )
    }

    /// Statuses that hold a books payment exclusively.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Self::Matched | Self::ManualMatched)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct ReconciliationRecord {
    pub record_id: Uuid,
    pub field_payment_id: String,
    pub books_payment_id: Option<String>,
    pub invoice_id: Option<String>,
    pub amount: Decimal,
    pub payment_date: NaiveDate,
    pub customer_name: Option<String>,
    pub match_status: String,
    pub match_confidence: Option<f64>,
    pub matched_utc: Option<DateTime<Utc>>,
    pub matched_by: Option<String>,
    pub is_deposited: bool,
    pub deposit_date: Option<NaiveDate>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl ReconciliationRecord {
    /// Fresh shadow record for a newly ingested field payment.
    pub fn for_field_payment(payment: &FieldPayment, now: DateTime<Utc>) -> Self {
        Self {
            record_id: Uuid::new_v4(),
            field_payment_id: payment.field_payment_id.clone(),
            books_payment_id: None,
            invoice_id: None,
            amount: payment.amount,
            payment_date: payment.payment_date,
            customer_name: payment.customer_name.clone(),
            match_status: MatchStatus::StOnly.as_str().to_string(),
            match_confidence: None,
            matched_utc: None,
            matched_by: None,
            is_deposited: false,
            deposit_date: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Unknown persisted values read as `st_only` so they stay visible to review.
    pub fn status(&self) -> MatchStatus {
        MatchStatus::from_str(&self.match_status).unwrap_or(MatchStatus::StOnly)
    }
}

/// Link to write through `apply_match`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchUpdate {
    pub books_payment_id: String,
    pub confidence: f64,
    pub status: MatchStatus,
    pub matched_by: String,
    pub is_deposited: bool,
    pub deposit_date: Option<NaiveDate>,
    /// When set, the write only lands if the record is still in this state.
    pub expected_status: Option<MatchStatus>,
}

// ============================================================================
// Sync Log Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Completed,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Running,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct SyncLog {
    pub sync_id: Uuid,
    pub started_utc: DateTime<Utc>,
    pub completed_utc: Option<DateTime<Utc>>,
    pub status: String,
    pub records_fetched: i32,
    pub records_created: i32,
    pub records_updated: i32,
    pub matches_found: i32,
    pub field_payments_fetched: i32,
    pub field_payments_created: i32,
    pub records_skipped: i32,
    pub error_message: Option<String>,
}

/// Counters collected by one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounts {
    pub records_fetched: i32,
    pub records_created: i32,
    pub records_updated: i32,
    pub matches_found: i32,
    pub field_payments_fetched: i32,
    pub field_payments_created: i32,
    pub records_skipped: i32,
}
