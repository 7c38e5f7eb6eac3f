//! Request and response bodies for the HTTP surface.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::matching::ScoredCandidate;
use crate::models::{ReconciliationRecord, SyncLog};

pub const DEFAULT_RECORD_LIMIT: i64 = 100;
pub const DEFAULT_SYNC_LOG_LIMIT: i64 = 20;
pub const DEFAULT_CANDIDATE_LIMIT: usize = 10;

#[derive(Debug, Deserialize, Default)]
pub struct ListRecordsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ManualMatchRequest {
    #[validate(length(min = 1, max = 128, message = "Invoice id cannot be empty"))]
    pub invoice_id: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BooksMatchRequest {
    #[validate(length(min = 1, max = 128, message = "Books payment id cannot be empty"))]
    pub books_payment_id: String,
}

#[derive(Debug, Serialize)]
pub struct RecordListResponse {
    pub records: Vec<ReconciliationRecord>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct CandidateListResponse {
    pub record_id: uuid::Uuid,
    pub candidates: Vec<ScoredCandidate>,
}

#[derive(Debug, Serialize)]
pub struct SyncLogListResponse {
    pub sync_logs: Vec<SyncLog>,
}
