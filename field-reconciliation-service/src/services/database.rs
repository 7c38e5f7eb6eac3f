//! PostgreSQL store for field-reconciliation-service.

use crate::error::ReconciliationError;
use crate::matching::TakenSet;
use crate::models::{
    BooksPayment, FieldPayment, MatchStatus, MatchUpdate, ReconciliationRecord, SyncCounts,
    SyncLog, SyncStatus, UpsertOutcome,
};
use crate::services::metrics::STORE_OPERATION_DURATION;
use crate::services::store::ReconciliationStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> ReconciliationError {
    move |e| ReconciliationError::Database(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "field-reconciliation-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, ReconciliationError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(db_error("Failed to connect"))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), ReconciliationError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ReconciliationError::Database(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl ReconciliationStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_error("Health check failed"))?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Cache Operations
    // =========================================================================

    #[instrument(skip(self, payment), fields(field_payment_id = %payment.field_payment_id))]
    async fn upsert_field_payment(
        &self,
        payment: &FieldPayment,
    ) -> Result<UpsertOutcome, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["upsert_field_payment"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        sqlx::query(
            r#"
            INSERT INTO field_payments (field_payment_id, invoice_ref, customer_ref, amount, payment_date, method, status, customer_name, ingested_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (field_payment_id) DO UPDATE
            SET invoice_ref = EXCLUDED.invoice_ref,
                customer_ref = EXCLUDED.customer_ref,
                amount = EXCLUDED.amount,
                payment_date = EXCLUDED.payment_date,
                method = EXCLUDED.method,
                status = EXCLUDED.status,
                customer_name = COALESCE(EXCLUDED.customer_name, field_payments.customer_name),
                ingested_utc = EXCLUDED.ingested_utc
            "#,
        )
        .bind(&payment.field_payment_id)
        .bind(&payment.invoice_ref)
        .bind(&payment.customer_ref)
        .bind(payment.amount)
        .bind(payment.payment_date)
        .bind(&payment.method)
        .bind(&payment.status)
        .bind(&payment.customer_name)
        .bind(payment.ingested_utc)
        .execute(&mut *tx)
        .await
        .map_err(db_error("Failed to upsert field payment"))?;

        let shadow = ReconciliationRecord::for_field_payment(payment, payment.ingested_utc);
        let created = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO reconciliation_records (record_id, field_payment_id, amount, payment_date, customer_name, match_status)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (field_payment_id) DO NOTHING
            RETURNING record_id
            "#,
        )
        .bind(shadow.record_id)
        .bind(&shadow.field_payment_id)
        .bind(shadow.amount)
        .bind(shadow.payment_date)
        .bind(&shadow.customer_name)
        .bind(MatchStatus::StOnly.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to create reconciliation record"))?;

        if created.is_none() {
            // A name learned after the record was created still helps unmatched records score.
            sqlx::query(
                r#"
                UPDATE reconciliation_records r
                SET customer_name = f.customer_name,
                    updated_utc = NOW()
                FROM field_payments f
                WHERE r.field_payment_id = $1
                  AND f.field_payment_id = r.field_payment_id
                  AND r.match_status = 'st_only'
                  AND r.customer_name IS NULL
                  AND f.customer_name IS NOT NULL
                "#,
            )
            .bind(&payment.field_payment_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to refresh record customer name"))?;
        }

        tx.commit()
            .await
            .map_err(db_error("Failed to commit field payment"))?;

        timer.observe_duration();

        Ok(match created {
            Some(_) => UpsertOutcome::Created,
            None => UpsertOutcome::Updated,
        })
    }

    #[instrument(skip(self, payment), fields(books_payment_id = %payment.books_payment_id))]
    async fn upsert_books_payment(
        &self,
        payment: &BooksPayment,
    ) -> Result<UpsertOutcome, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["upsert_books_payment"])
            .start_timer();

        // xmax is zero only for freshly inserted tuples.
        let inserted = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO books_payments (books_payment_id, customer_ref, customer_name, payment_date, amount, method, is_deposited, deposit_account, deposit_date, memo, synced_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (books_payment_id) DO UPDATE
            SET customer_ref = EXCLUDED.customer_ref,
                customer_name = EXCLUDED.customer_name,
                payment_date = EXCLUDED.payment_date,
                amount = EXCLUDED.amount,
                method = EXCLUDED.method,
                is_deposited = EXCLUDED.is_deposited,
                deposit_account = EXCLUDED.deposit_account,
                deposit_date = EXCLUDED.deposit_date,
                memo = EXCLUDED.memo,
                synced_utc = EXCLUDED.synced_utc
            RETURNING (xmax = 0)
            "#,
        )
        .bind(&payment.books_payment_id)
        .bind(&payment.customer_ref)
        .bind(&payment.customer_name)
        .bind(payment.payment_date)
        .bind(payment.amount)
        .bind(&payment.method)
        .bind(payment.is_deposited)
        .bind(&payment.deposit_account)
        .bind(payment.deposit_date)
        .bind(&payment.memo)
        .bind(payment.synced_utc)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to upsert books payment"))?;

        timer.observe_duration();

        Ok(if inserted {
            UpsertOutcome::Created
        } else {
            UpsertOutcome::Updated
        })
    }

    #[instrument(skip(self))]
    async fn books_payments(&self) -> Result<Vec<BooksPayment>, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["books_payments"])
            .start_timer();

        let payments = sqlx::query_as::<_, BooksPayment>(
            r#"
            SELECT books_payment_id, customer_ref, customer_name, payment_date, amount, method, is_deposited, deposit_account, deposit_date, memo, synced_utc
            FROM books_payments
            ORDER BY payment_date DESC, books_payment_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list books payments"))?;

        timer.observe_duration();

        Ok(payments)
    }

    #[instrument(skip(self))]
    async fn get_books_payment(
        &self,
        books_payment_id: &str,
    ) -> Result<Option<BooksPayment>, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["get_books_payment"])
            .start_timer();

        let payment = sqlx::query_as::<_, BooksPayment>(
            r#"
            SELECT books_payment_id, customer_ref, customer_name, payment_date, amount, method, is_deposited, deposit_account, deposit_date, memo, synced_utc
            FROM books_payments
            WHERE books_payment_id = $1
            "#,
        )
        .bind(books_payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get books payment"))?;

        timer.observe_duration();

        Ok(payment)
    }

    // =========================================================================
    // Reconciliation Record Operations
    // =========================================================================

    #[instrument(skip(self), fields(record_id = %record_id))]
    async fn get_record(
        &self,
        record_id: Uuid,
    ) -> Result<Option<ReconciliationRecord>, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["get_record"])
            .start_timer();

        let record = sqlx::query_as::<_, ReconciliationRecord>(
            r#"
            SELECT record_id, field_payment_id, books_payment_id, invoice_id, amount, payment_date, customer_name, match_status, match_confidence, matched_utc, matched_by, is_deposited, deposit_date, created_utc, updated_utc
            FROM reconciliation_records
            WHERE record_id = $1
            "#,
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get reconciliation record"))?;

        timer.observe_duration();

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn find_record_by_field_payment(
        &self,
        field_payment_id: &str,
    ) -> Result<Option<ReconciliationRecord>, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["find_record_by_field_payment"])
            .start_timer();

        let record = sqlx::query_as::<_, ReconciliationRecord>(
            r#"
            SELECT record_id, field_payment_id, books_payment_id, invoice_id, amount, payment_date, customer_name, match_status, match_confidence, matched_utc, matched_by, is_deposited, deposit_date, created_utc, updated_utc
            FROM reconciliation_records
            WHERE field_payment_id = $1
            "#,
        )
        .bind(field_payment_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to find reconciliation record"))?;

        timer.observe_duration();

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn list_records(
        &self,
        status: Option<MatchStatus>,
        limit: i64,
    ) -> Result<Vec<ReconciliationRecord>, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["list_records"])
            .start_timer();

        let records = sqlx::query_as::<_, ReconciliationRecord>(
            r#"
            SELECT record_id, field_payment_id, books_payment_id, invoice_id, amount, payment_date, customer_name, match_status, match_confidence, matched_utc, matched_by, is_deposited, deposit_date, created_utc, updated_utc
            FROM reconciliation_records
            WHERE ($1::TEXT IS NULL OR match_status = $1)
            ORDER BY payment_date DESC, created_utc DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list reconciliation records"))?;

        timer.observe_duration();

        Ok(records)
    }

    #[instrument(skip(self))]
    async fn pending_records(&self) -> Result<Vec<ReconciliationRecord>, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["pending_records"])
            .start_timer();

        let records = sqlx::query_as::<_, ReconciliationRecord>(
            r#"
            SELECT record_id, field_payment_id, books_payment_id, invoice_id, amount, payment_date, customer_name, match_status, match_confidence, matched_utc, matched_by, is_deposited, deposit_date, created_utc, updated_utc
            FROM reconciliation_records
            WHERE match_status = $1
            ORDER BY payment_date DESC, created_utc DESC
            "#,
        )
        .bind(MatchStatus::StOnly.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list pending records"))?;

        timer.observe_duration();

        Ok(records)
    }

    #[instrument(skip(self))]
    async fn taken_books_payment_ids(&self) -> Result<TakenSet, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["taken_books_payment_ids"])
            .start_timer();

        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT books_payment_id
            FROM reconciliation_records
            WHERE books_payment_id IS NOT NULL
              AND match_status IN ('matched', 'pending_review', 'manual_matched')
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to load taken books payments"))?;

        timer.observe_duration();

        Ok(ids.into_iter().collect())
    }

    #[instrument(skip(self, update), fields(record_id = %record_id, books_payment_id = %update.books_payment_id))]
    async fn apply_match(
        &self,
        record_id: Uuid,
        update: &MatchUpdate,
    ) -> Result<ReconciliationRecord, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["apply_match"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;

        let books_exists = sqlx::query_scalar::<_, i32>(
            "SELECT 1 FROM books_payments WHERE books_payment_id = $1",
        )
        .bind(&update.books_payment_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to look up books payment"))?;

        if books_exists.is_none() {
            return Err(ReconciliationError::NotFound(format!(
                "Books payment {} not found",
                update.books_payment_id
            )));
        }

        let current = sqlx::query_scalar::<_, String>(
            "SELECT match_status FROM reconciliation_records WHERE record_id = $1 FOR UPDATE",
        )
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to lock reconciliation record"))?
        .ok_or_else(|| {
            ReconciliationError::NotFound(format!("Reconciliation record {} not found", record_id))
        })?;

        if let Some(expected) = update.expected_status {
            if current != expected.as_str() {
                info!(status = %current, "Record changed since it was read");
                return Err(ReconciliationError::RecordChanged {
                    record_id,
                    status: current,
                });
            }
        }

        let holder = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT record_id
            FROM reconciliation_records
            WHERE books_payment_id = $1
              AND match_status IN ('matched', 'manual_matched')
              AND record_id <> $2
            LIMIT 1
            FOR UPDATE
            "#,
        )
        .bind(&update.books_payment_id)
        .bind(record_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error("Failed to check books payment exclusivity"))?;

        if let Some(held_by) = holder {
            warn!(held_by = %held_by, "Books payment already consumed");
            return Err(ReconciliationError::AlreadyConsumed {
                books_payment_id: update.books_payment_id.clone(),
            });
        }

        let record = sqlx::query_as::<_, ReconciliationRecord>(
            r#"
            UPDATE reconciliation_records
            SET books_payment_id = $2,
                match_status = $3,
                match_confidence = $4,
                matched_by = $5,
                matched_utc = NOW(),
                is_deposited = $6,
                deposit_date = $7,
                updated_utc = NOW()
            WHERE record_id = $1
            RETURNING record_id, field_payment_id, books_payment_id, invoice_id, amount, payment_date, customer_name, match_status, match_confidence, matched_utc, matched_by, is_deposited, deposit_date, created_utc, updated_utc
            "#,
        )
        .bind(record_id)
        .bind(&update.books_payment_id)
        .bind(update.status.as_str())
        .bind(update.confidence)
        .bind(&update.matched_by)
        .bind(update.is_deposited)
        .bind(update.deposit_date)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| match e {
            // Lost a race with a concurrent writer on the partial unique index.
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                ReconciliationError::AlreadyConsumed {
                    books_payment_id: update.books_payment_id.clone(),
                }
            }
            other => db_error("Failed to apply match")(other),
        })?
        .ok_or_else(|| {
            ReconciliationError::NotFound(format!("Reconciliation record {} not found", record_id))
        })?;

        tx.commit()
            .await
            .map_err(db_error("Failed to commit match"))?;

        timer.observe_duration();
        info!(
            status = %record.match_status,
            confidence = update.confidence,
            "Match applied"
        );

        Ok(record)
    }

    #[instrument(skip(self), fields(record_id = %record_id))]
    async fn apply_manual_match(
        &self,
        record_id: Uuid,
        invoice_id: &str,
        actor_id: &str,
    ) -> Result<ReconciliationRecord, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["apply_manual_match"])
            .start_timer();

        // A books link survives only if this record already held it exclusively.
        let record = sqlx::query_as::<_, ReconciliationRecord>(
            r#"
            UPDATE reconciliation_records
            SET match_status = 'manual_matched',
                match_confidence = 1.0,
                invoice_id = $2,
                matched_by = $3,
                matched_utc = NOW(),
                books_payment_id = CASE WHEN match_status IN ('matched', 'manual_matched') THEN books_payment_id ELSE NULL END,
                is_deposited = CASE WHEN match_status IN ('matched', 'manual_matched') THEN is_deposited ELSE FALSE END,
                deposit_date = CASE WHEN match_status IN ('matched', 'manual_matched') THEN deposit_date ELSE NULL END,
                updated_utc = NOW()
            WHERE record_id = $1
            RETURNING record_id, field_payment_id, books_payment_id, invoice_id, amount, payment_date, customer_name, match_status, match_confidence, matched_utc, matched_by, is_deposited, deposit_date, created_utc, updated_utc
            "#,
        )
        .bind(record_id)
        .bind(invoice_id)
        .bind(actor_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to apply manual match"))?
        .ok_or_else(|| {
            ReconciliationError::NotFound(format!("Reconciliation record {} not found", record_id))
        })?;

        timer.observe_duration();
        info!(invoice_id = %invoice_id, actor_id = %actor_id, "Manual match applied");

        Ok(record)
    }

    #[instrument(skip(self), fields(record_id = %record_id))]
    async fn apply_discrepancy(
        &self,
        record_id: Uuid,
    ) -> Result<ReconciliationRecord, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["apply_discrepancy"])
            .start_timer();

        let record = sqlx::query_as::<_, ReconciliationRecord>(
            r#"
            UPDATE reconciliation_records
            SET match_status = 'discrepancy',
                match_confidence = NULL,
                books_payment_id = NULL,
                is_deposited = FALSE,
                deposit_date = NULL,
                updated_utc = NOW()
            WHERE record_id = $1
            RETURNING record_id, field_payment_id, books_payment_id, invoice_id, amount, payment_date, customer_name, match_status, match_confidence, matched_utc, matched_by, is_deposited, deposit_date, created_utc, updated_utc
            "#,
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to flag discrepancy"))?
        .ok_or_else(|| {
            ReconciliationError::NotFound(format!("Reconciliation record {} not found", record_id))
        })?;

        timer.observe_duration();
        info!("Record flagged as discrepancy");

        Ok(record)
    }

    // =========================================================================
    // Sync Log Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn start_sync_log(&self) -> Result<SyncLog, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["start_sync_log"])
            .start_timer();

        let log = sqlx::query_as::<_, SyncLog>(
            r#"
            INSERT INTO sync_logs (sync_id, status)
            VALUES ($1, $2)
            RETURNING sync_id, started_utc, completed_utc, status, records_fetched, records_created, records_updated, matches_found, field_payments_fetched, field_payments_created, records_skipped, error_message
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(SyncStatus::Running.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to start sync log"))?;

        timer.observe_duration();

        Ok(log)
    }

    #[instrument(skip(self, counts), fields(sync_id = %sync_id, status = %status.as_str()))]
    async fn finish_sync_log(
        &self,
        sync_id: Uuid,
        status: SyncStatus,
        counts: &SyncCounts,
        error_message: Option<&str>,
    ) -> Result<(), ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["finish_sync_log"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE sync_logs
            SET status = $2,
                completed_utc = NOW(),
                records_fetched = $3,
                records_created = $4,
                records_updated = $5,
                matches_found = $6,
                field_payments_fetched = $7,
                field_payments_created = $8,
                records_skipped = $9,
                error_message = $10
            WHERE sync_id = $1
            "#,
        )
        .bind(sync_id)
        .bind(status.as_str())
        .bind(counts.records_fetched)
        .bind(counts.records_created)
        .bind(counts.records_updated)
        .bind(counts.matches_found)
        .bind(counts.field_payments_fetched)
        .bind(counts.field_payments_created)
        .bind(counts.records_skipped)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to finish sync log"))?;

        timer.observe_duration();

        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_sync_logs(&self, limit: i64) -> Result<Vec<SyncLog>, ReconciliationError> {
        let timer = STORE_OPERATION_DURATION
            .with_label_values(&["list_sync_logs"])
            .start_timer();

        let logs = sqlx::query_as::<_, SyncLog>(
            r#"
            SELECT sync_id, started_utc, completed_utc, status, records_fetched, records_created, records_updated, matches_found, field_payments_fetched, field_payments_created, records_skipped, error_message
            FROM sync_logs
            ORDER BY started_utc DESC
            LIMIT $1
            "#,
        )
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list sync logs"))?;

        timer.observe_duration();

        Ok(logs)
    }

    #[instrument(skip(self))]
    async fn last_successful_sync(&self) -> Result<Option<DateTime<Utc>>, ReconciliationError> {
        let last = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(started_utc) FROM sync_logs WHERE status = $1",
        )
        .bind(SyncStatus::Completed.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("Failed to read last sync"))?;

        Ok(last)
    }
}
