//! One end-to-end reconciliation pass: refresh both caches, match, log.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::ReconciliationError;
use crate::feeds::{BooksPaymentFeedItem, BooksSource, FieldOpsSource, BOOKS_SYSTEM, FIELD_OPS_SYSTEM};
use crate::matching::{MatchDecision, MatchingEngine};
use crate::models::{MatchStatus, MatchUpdate, SyncCounts, SyncStatus, UpsertOutcome};
use crate::services::metrics::{
    record_error, record_match_decision, record_skipped_item, record_sync_run,
};
use crate::services::store::{ReconciliationStore, SYSTEM_ACTOR};

/// Days re-read before the last successful pass, for payments entered late.
const SINCE_OVERLAP_DAYS: i64 = 1;

/// Outcome of one pass, returned to whoever triggered it.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    #[serde(skip)]
    pub sync_id: Uuid,
    #[serde(skip)]
    pub status: SyncStatus,
    #[serde(flatten)]
    pub counts: SyncCounts,
    pub errors: Vec<String>,
}

impl SyncSummary {
    pub fn succeeded(&self) -> bool {
        self.status == SyncStatus::Completed
    }
}

/// Apply one engine run through the store. Returns the number of confirmed matches.
///
/// Decisions that lose to a concurrent human action are skipped and reported in `errors`.
#[instrument(skip(store, engine, errors))]
pub async fn run_matching(
    store: &dyn ReconciliationStore,
    engine: &MatchingEngine,
    errors: &mut Vec<String>,
) -> Result<i32, ReconciliationError> {
    let records = store.pending_records().await?;
    let books = store.books_payments().await?;
    let taken = store.taken_books_payment_ids().await?;

    let pass = engine.run(&records, &books, taken);
    let mut confirmed = 0;

    for decision in &pass.decisions {
        let update = match decision {
            MatchDecision::Matched {
                books_payment_id,
                confidence,
                is_deposited,
                deposit_date,
                ..
            } => MatchUpdate {
                books_payment_id: books_payment_id.clone(),
                confidence: *confidence,
                status: MatchStatus::Matched,
                matched_by: SYSTEM_ACTOR.to_string(),
                is_deposited: *is_deposited,
                deposit_date: *deposit_date,
                expected_status: Some(MatchStatus::StOnly),
            },
            MatchDecision::PendingReview {
                books_payment_id,
                confidence,
                ..
            } => MatchUpdate {
                books_payment_id: books_payment_id.clone(),
                confidence: *confidence,
                status: MatchStatus::PendingReview,
                matched_by: SYSTEM_ACTOR.to_string(),
                is_deposited: false,
                deposit_date: None,
                expected_status: Some(MatchStatus::StOnly),
            },
            MatchDecision::NoCandidate { record_id } => {
                debug!(record_id = %record_id, "No books candidate");
                continue;
            }
            MatchDecision::Ambiguous {
                record_id,
                candidates,
            } => {
                debug!(record_id = %record_id, candidates = candidates, "Ambiguous, left for review");
                continue;
            }
        };

        match store.apply_match(decision.record_id(), &update).await {
            Ok(_) => {
                record_match_decision(update.status.as_str());
                if update.status == MatchStatus::Matched {
                    confirmed += 1;
                }
            }
            Err(
                err @ (ReconciliationError::AlreadyConsumed { .. }
                | ReconciliationError::RecordChanged { .. }),
            ) => {
                warn!(record_id = %decision.record_id(), error = %err, "Skipping match");
                record_error(err.kind());
                errors.push(format!("Match skipped for record {}: {}", decision.record_id(), err));
            }
            Err(err) => return Err(err),
        }
    }

    info!(
        considered = pass.decisions.len(),
        matched = confirmed,
        "Matching complete"
    );

    Ok(confirmed)
}

/// Drives reconciliation passes. At most one pass runs at a time.
pub struct SyncOrchestrator {
    store: Arc<dyn ReconciliationStore>,
    field_ops: Arc<dyn FieldOpsSource>,
    books: Arc<dyn BooksSource>,
    engine: MatchingEngine,
    config: SyncConfig,
    pass_guard: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn ReconciliationStore>,
        field_ops: Arc<dyn FieldOpsSource>,
        books: Arc<dyn BooksSource>,
        engine: MatchingEngine,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            field_ops,
            books,
            engine,
            config,
            pass_guard: Mutex::new(()),
        }
    }

    pub fn engine(&self) -> &MatchingEngine {
        &self.engine
    }

    pub fn is_running(&self) -> bool {
        self.pass_guard.try_lock().is_err()
    }

    /// Run one pass, or fail with `PassInProgress` if one is already running.
    ///
    /// Fetch failures do not surface as `Err`: they end the pass with a
    /// `failed` sync log and a summary carrying the error. `Err` means the
    /// pass could not be started or logged at all.
    #[instrument(skip(self))]
    pub async fn run_reconciliation_sync(&self) -> Result<SyncSummary, ReconciliationError> {
        let _guard = self
            .pass_guard
            .try_lock()
            .map_err(|_| ReconciliationError::PassInProgress)?;

        let log = self.store.start_sync_log().await?;
        info!(sync_id = %log.sync_id, "Reconciliation pass started");

        let mut counts = SyncCounts::default();
        let mut errors = Vec::new();

        let outcome = self.run_pass(&mut counts, &mut errors).await;

        let status = match outcome {
            Ok(()) => SyncStatus::Completed,
            Err(err) => {
                error!(sync_id = %log.sync_id, error = %err, "Reconciliation pass failed");
                record_error(err.kind());
                errors.push(err.to_string());
                SyncStatus::Failed
            }
        };

        let error_message = (!errors.is_empty()).then(|| errors.join("; "));
        self.store
            .finish_sync_log(log.sync_id, status, &counts, error_message.as_deref())
            .await?;
        record_sync_run(status.as_str());

        info!(
            sync_id = %log.sync_id,
            status = status.as_str(),
            field_payments_fetched = counts.field_payments_fetched,
            field_payments_created = counts.field_payments_created,
            records_fetched = counts.records_fetched,
            records_created = counts.records_created,
            records_updated = counts.records_updated,
            records_skipped = counts.records_skipped,
            matches_found = counts.matches_found,
            "Reconciliation pass finished"
        );

        Ok(SyncSummary {
            sync_id: log.sync_id,
            status,
            counts,
            errors,
        })
    }

    async fn run_pass(
        &self,
        counts: &mut SyncCounts,
        errors: &mut Vec<String>,
    ) -> Result<(), ReconciliationError> {
        let today = Utc::now().date_naive();

        self.ingest_field_payments(today, counts, errors).await?;
        self.pause().await;
        self.ingest_books_payments(today, counts, errors).await?;

        counts.matches_found = run_matching(self.store.as_ref(), &self.engine, errors).await?;
        Ok(())
    }

    /// Start date for the field feed: the last successful pass, bounded by the lookback.
    async fn field_since(&self, today: NaiveDate) -> Result<NaiveDate, ReconciliationError> {
        let floor = today - chrono::Duration::days(self.config.lookback_days);
        let since = match self.store.last_successful_sync().await? {
            Some(last) => (last.date_naive() - chrono::Duration::days(SINCE_OVERLAP_DAYS)).max(floor),
            None => floor,
        };
        Ok(since)
    }

    #[instrument(skip(self, counts, errors))]
    async fn ingest_field_payments(
        &self,
        today: NaiveDate,
        counts: &mut SyncCounts,
        errors: &mut Vec<String>,
    ) -> Result<(), ReconciliationError> {
        let since = self.field_since(today).await?;
        let batch = self.field_ops.fetch_payments(since).await?;

        counts.field_payments_fetched = batch.items.len() as i32 + batch.malformed as i32;
        self.skip(FIELD_OPS_SYSTEM, batch.malformed, counts);
        errors.extend(batch.warnings);

        let mut names: HashMap<String, Option<String>> = HashMap::new();
        let now = Utc::now();

        for item in batch.items {
            let mut payment = match item.into_model(now) {
                Ok(payment) => payment,
                Err(err) => {
                    warn!(error = %err, "Skipping invalid field payment");
                    self.skip(FIELD_OPS_SYSTEM, 1, counts);
                    continue;
                }
            };

            if payment.customer_name.is_none() {
                if let Some(customer_id) = payment.customer_ref.clone() {
                    payment.customer_name = self.lookup_name(&customer_id, &mut names, errors).await?;
                }
            }

            if self.store.upsert_field_payment(&payment).await? == UpsertOutcome::Created {
                counts.field_payments_created += 1;
            }
        }

        Ok(())
    }

    /// Customer name through the per-pass cache. Lookup failures leave the name empty.
    async fn lookup_name(
        &self,
        customer_id: &str,
        names: &mut HashMap<String, Option<String>>,
        errors: &mut Vec<String>,
    ) -> Result<Option<String>, ReconciliationError> {
        if let Some(cached) = names.get(customer_id) {
            return Ok(cached.clone());
        }

        self.pause().await;
        let name = match self.field_ops.customer_name(customer_id).await {
            Ok(name) => name,
            Err(err @ ReconciliationError::PartialFetch { .. }) => {
                warn!(customer_id = %customer_id, error = %err, "Customer lookup failed");
                record_error(err.kind());
                errors.push(err.to_string());
                None
            }
            Err(err) => return Err(err),
        };

        names.insert(customer_id.to_string(), name.clone());
        Ok(name)
    }

    #[instrument(skip(self, counts, errors))]
    async fn ingest_books_payments(
        &self,
        today: NaiveDate,
        counts: &mut SyncCounts,
        errors: &mut Vec<String>,
    ) -> Result<(), ReconciliationError> {
        let holding_account_id = self.books.holding_account_id().await?;
        if holding_account_id.is_none() {
            warn!("Holding account not found; every payment with a destination counts as deposited");
        }

        self.pause().await;
        let since = today - chrono::Duration::days(self.config.books_window_days);
        let mut batches = vec![self.books.fetch_payments(since).await?];

        if let Some(holding) = holding_account_id.as_deref() {
            self.pause().await;
            batches.push(self.books.fetch_undeposited(holding).await?);
        }

        let mut malformed = 0;
        let mut merged: Vec<BooksPaymentFeedItem> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for batch in batches {
            malformed += batch.malformed;
            errors.extend(batch.warnings);
            for item in batch.items {
                // Items without an id cannot be merged; validation drops them below.
                let fresh = match item.id.as_deref() {
                    Some(id) => seen.insert(id.to_string()),
                    None => true,
                };
                if fresh {
                    merged.push(item);
                }
            }
        }

        counts.records_fetched = merged.len() as i32 + malformed as i32;
        self.skip(BOOKS_SYSTEM, malformed, counts);

        let now = Utc::now();
        for item in merged {
            let payment = match item.into_model(holding_account_id.as_deref(), now) {
                Ok(payment) => payment,
                Err(err) => {
                    warn!(error = %err, "Skipping invalid books payment");
                    self.skip(BOOKS_SYSTEM, 1, counts);
                    continue;
                }
            };

            match self.store.upsert_books_payment(&payment).await? {
                UpsertOutcome::Created => counts.records_created += 1,
                UpsertOutcome::Updated => counts.records_updated += 1,
            }
        }

        Ok(())
    }

    fn skip(&self, source: &str, n: usize, counts: &mut SyncCounts) {
        for _ in 0..n {
            record_skipped_item(source);
        }
        counts.records_skipped += n as i32;
    }

    async fn pause(&self) {
        if self.config.request_delay > Duration::ZERO {
            tokio::time::sleep(self.config.request_delay).await;
        }
    }
}
