//! Reconciliation endpoints: trigger a pass, review records, apply human overrides.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{
    BooksMatchRequest, CandidateListResponse, LimitQuery, ListRecordsQuery, ManualMatchRequest,
    RecordListResponse, SyncLogListResponse, DEFAULT_CANDIDATE_LIMIT, DEFAULT_RECORD_LIMIT,
    DEFAULT_SYNC_LOG_LIMIT,
};
use crate::error::ReconciliationError;
use crate::middleware::ActorContext;
use crate::models::{MatchStatus, MatchUpdate, ReconciliationRecord};
use crate::services::{record_match_decision, SyncSummary};
use crate::startup::AppState;

async fn load_record(state: &AppState, record_id: Uuid) -> Result<ReconciliationRecord, AppError> {
    state
        .store
        .get_record(record_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Reconciliation record not found")))
}

/// Run one reconciliation pass and return its summary.
pub async fn run_sync(State(state): State<AppState>) -> Result<Json<SyncSummary>, AppError> {
    tracing::info!("Reconciliation pass requested");
    let summary = state.orchestrator.run_reconciliation_sync().await?;
    Ok(Json(summary))
}

pub async fn list_records(
    State(state): State<AppState>,
    Query(query): Query<ListRecordsQuery>,
) -> Result<Json<RecordListResponse>, AppError> {
    let status = match query.status.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(MatchStatus::from_str(raw).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("Unknown match status: {}", raw))
        })?),
        None => None,
    };

    let records = state
        .store
        .list_records(status, query.limit.unwrap_or(DEFAULT_RECORD_LIMIT))
        .await?;

    Ok(Json(RecordListResponse {
        count: records.len(),
        records,
    }))
}

pub async fn get_record(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
) -> Result<Json<ReconciliationRecord>, AppError> {
    Ok(Json(load_record(&state, record_id).await?))
}

/// Books payments scored against a record, best first, for a reviewer to pick from.
pub async fn list_candidates(
    State(state): State<AppState>,
    Path(record_id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<CandidateListResponse>, AppError> {
    let record = load_record(&state, record_id).await?;
    let books = state.store.books_payments().await?;
    let mut taken = state.store.taken_books_payment_ids().await?;

    // The record's own link stays visible so a pending review can be confirmed.
    if let Some(own) = record.books_payment_id.as_ref() {
        taken.remove(own);
    }

    let limit = query
        .limit
        .map(|l| l.clamp(1, 100) as usize)
        .unwrap_or(DEFAULT_CANDIDATE_LIMIT);
    let candidates = state
        .orchestrator
        .engine()
        .rank_candidates(&record, &books, &taken, limit);

    Ok(Json(CandidateListResponse {
        record_id,
        candidates,
    }))
}

pub async fn manual_match(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(record_id): Path<Uuid>,
    Json(payload): Json<ManualMatchRequest>,
) -> Result<Json<ReconciliationRecord>, AppError> {
    payload.validate()?;

    tracing::info!(
        record_id = %record_id,
        invoice_id = %payload.invoice_id,
        user_id = %actor.user_id,
        "Manual match"
    );

    let record = state
        .store
        .apply_manual_match(record_id, &payload.invoice_id, &actor.user_id)
        .await?;
    record_match_decision(MatchStatus::ManualMatched.as_str());

    Ok(Json(record))
}

/// Human confirmation of a specific books payment. Rejected if another record holds it.
pub async fn books_match(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(record_id): Path<Uuid>,
    Json(payload): Json<BooksMatchRequest>,
) -> Result<Json<ReconciliationRecord>, AppError> {
    payload.validate()?;

    let books_payment = state
        .store
        .get_books_payment(&payload.books_payment_id)
        .await?
        .ok_or_else(|| {
            ReconciliationError::NotFound(format!(
                "Books payment {} not found",
                payload.books_payment_id
            ))
        })?;

    tracing::info!(
        record_id = %record_id,
        books_payment_id = %books_payment.books_payment_id,
        user_id = %actor.user_id,
        "Confirming books match"
    );

    let update = MatchUpdate {
        books_payment_id: books_payment.books_payment_id.clone(),
        confidence: 1.0,
        status: MatchStatus::ManualMatched,
        matched_by: actor.user_id,
        is_deposited: books_payment.is_deposited,
        deposit_date: books_payment.deposit_date,
        expected_status: None,
    };

    let record = state.store.apply_match(record_id, &update).await?;
    record_match_decision(MatchStatus::ManualMatched.as_str());

    Ok(Json(record))
}

pub async fn mark_discrepancy(
    State(state): State<AppState>,
    actor: ActorContext,
    Path(record_id): Path<Uuid>,
) -> Result<Json<ReconciliationRecord>, AppError> {
    tracing::info!(record_id = %record_id, user_id = %actor.user_id, "Flagging discrepancy");

    let record = state.store.apply_discrepancy(record_id).await?;
    record_match_decision(MatchStatus::Discrepancy.as_str());

    Ok(Json(record))
}

pub async fn list_sync_logs(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<SyncLogListResponse>, AppError> {
    let sync_logs = state
        .store
        .list_sync_logs(query.limit.unwrap_or(DEFAULT_SYNC_LOG_LIMIT))
        .await?;
    Ok(Json(SyncLogListResponse { sync_logs }))
}
