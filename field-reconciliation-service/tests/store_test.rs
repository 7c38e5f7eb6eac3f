//! Store semantics: idempotent upserts, exclusivity, human overrides, sync logs.
//!
//! Scenarios that only touch their own rows run against both `MemoryStore`
//! and Postgres. The Postgres variants need `TEST_DATABASE_URL`.

mod common;

use chrono::Utc;
use common::{cents, days_ago};
use field_reconciliation_service::error::ReconciliationError;
use field_reconciliation_service::models::{
    BooksPayment, FieldPayment, MatchStatus, MatchUpdate, ReconciliationRecord, SyncCounts,
    SyncStatus, UpsertOutcome,
};
use field_reconciliation_service::services::{MemoryStore, ReconciliationStore};
use uuid::Uuid;

/// Per-test identifiers, so runs sharing one database never see each other's rows.
struct Ids(String);

impl Ids {
    fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    fn id(&self, name: &str) -> String {
        format!("{}-{}", name, self.0)
    }
}

fn field_payment(id: &str) -> FieldPayment {
    FieldPayment {
        field_payment_id: id.to_string(),
        invoice_ref: None,
        customer_ref: None,
        amount: cents(50000),
        payment_date: days_ago(1),
        method: Some("Check".to_string()),
        status: None,
        customer_name: Some("Jane Doe".to_string()),
        ingested_utc: Utc::now(),
    }
}

fn books_payment(id: &str, deposited: bool) -> BooksPayment {
    BooksPayment {
        books_payment_id: id.to_string(),
        customer_ref: None,
        customer_name: Some("Jane Doe".to_string()),
        payment_date: days_ago(1),
        amount: cents(50000),
        method: None,
        is_deposited: deposited,
        deposit_account: None,
        deposit_date: deposited.then(|| days_ago(1)),
        memo: None,
        synced_utc: Utc::now(),
    }
}

fn update(books_payment_id: &str, status: MatchStatus) -> MatchUpdate {
    MatchUpdate {
        books_payment_id: books_payment_id.to_string(),
        confidence: 0.9,
        status,
        matched_by: "system".to_string(),
        is_deposited: true,
        deposit_date: Some(days_ago(1)),
        expected_status: None,
    }
}

/// What a pass writes: only lands on a record that is still unmatched.
fn engine_update(books_payment_id: &str) -> MatchUpdate {
    MatchUpdate {
        expected_status: Some(MatchStatus::StOnly),
        ..update(books_payment_id, MatchStatus::Matched)
    }
}

async fn record(store: &dyn ReconciliationStore, field_payment_id: &str) -> ReconciliationRecord {
    store
        .find_record_by_field_payment(field_payment_id)
        .await
        .unwrap()
        .expect("record exists")
}

async fn record_id(store: &dyn ReconciliationStore, field_payment_id: &str) -> Uuid {
    record(store, field_payment_id).await.record_id
}

async fn seed(store: &dyn ReconciliationStore, ids: &Ids) {
    for name in ["F1", "F2"] {
        store
            .upsert_field_payment(&field_payment(&ids.id(name)))
            .await
            .unwrap();
    }
    store
        .upsert_books_payment(&books_payment(&ids.id("B1"), true))
        .await
        .unwrap();
}

// ============================================================================
// Scenarios shared by both stores
// ============================================================================

async fn upserts_are_idempotent_by_identifier(store: &dyn ReconciliationStore, ids: &Ids) {
    let f1 = ids.id("F1");
    let b1 = ids.id("B1");

    assert_eq!(
        store.upsert_field_payment(&field_payment(&f1)).await.unwrap(),
        UpsertOutcome::Created
    );
    let first = record_id(store, &f1).await;
    assert_eq!(
        store.upsert_field_payment(&field_payment(&f1)).await.unwrap(),
        UpsertOutcome::Updated
    );
    assert_eq!(record_id(store, &f1).await, first);

    assert_eq!(
        store.upsert_books_payment(&books_payment(&b1, false)).await.unwrap(),
        UpsertOutcome::Created
    );
    assert_eq!(
        store.upsert_books_payment(&books_payment(&b1, true)).await.unwrap(),
        UpsertOutcome::Updated
    );

    let books = store.get_books_payment(&b1).await.unwrap().unwrap();
    assert!(books.is_deposited);
}

async fn confirmed_books_payment_cannot_be_matched_twice(
    store: &dyn ReconciliationStore,
    ids: &Ids,
) {
    seed(store, ids).await;
    let b1 = ids.id("B1");
    let first = record_id(store, &ids.id("F1")).await;
    let second = record_id(store, &ids.id("F2")).await;

    store
        .apply_match(first, &update(&b1, MatchStatus::Matched))
        .await
        .unwrap();
    let err = store
        .apply_match(second, &update(&b1, MatchStatus::Matched))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ReconciliationError::AlreadyConsumed { ref books_payment_id } if *books_payment_id == b1
    ));
    let untouched = store.get_record(second).await.unwrap().unwrap();
    assert_eq!(untouched.status(), MatchStatus::StOnly);
}

async fn pending_review_does_not_block_a_confident_match(
    store: &dyn ReconciliationStore,
    ids: &Ids,
) {
    seed(store, ids).await;
    let b1 = ids.id("B1");
    let first = record_id(store, &ids.id("F1")).await;
    let second = record_id(store, &ids.id("F2")).await;

    store
        .apply_match(first, &update(&b1, MatchStatus::PendingReview))
        .await
        .unwrap();
    let matched = store
        .apply_match(second, &update(&b1, MatchStatus::Matched))
        .await
        .unwrap();

    assert_eq!(matched.status(), MatchStatus::Matched);
    assert!(matched.matched_utc.is_some());
}

async fn rematching_the_same_record_is_allowed(store: &dyn ReconciliationStore, ids: &Ids) {
    seed(store, ids).await;
    let b1 = ids.id("B1");
    let first = record_id(store, &ids.id("F1")).await;

    store
        .apply_match(first, &update(&b1, MatchStatus::Matched))
        .await
        .unwrap();
    let again = store
        .apply_match(first, &update(&b1, MatchStatus::ManualMatched))
        .await
        .unwrap();

    assert_eq!(again.status(), MatchStatus::ManualMatched);
}

async fn unknown_targets_are_not_found(store: &dyn ReconciliationStore, ids: &Ids) {
    seed(store, ids).await;
    let first = record_id(store, &ids.id("F1")).await;

    let missing_books = store
        .apply_match(first, &update(&ids.id("B404"), MatchStatus::Matched))
        .await
        .unwrap_err();
    assert!(matches!(missing_books, ReconciliationError::NotFound(_)));

    let missing_record = store
        .apply_match(Uuid::new_v4(), &update(&ids.id("B1"), MatchStatus::Matched))
        .await
        .unwrap_err();
    assert!(matches!(missing_record, ReconciliationError::NotFound(_)));

    let manual = store
        .apply_manual_match(Uuid::new_v4(), "INV-9", "user-1")
        .await
        .unwrap_err();
    assert!(matches!(manual, ReconciliationError::NotFound(_)));
}

async fn manual_match_overrides_any_state(store: &dyn ReconciliationStore, ids: &Ids) {
    seed(store, ids).await;
    let b1 = ids.id("B1");
    let first = record_id(store, &ids.id("F1")).await;
    let second = record_id(store, &ids.id("F2")).await;

    store
        .apply_match(first, &update(&b1, MatchStatus::Matched))
        .await
        .unwrap();
    store.apply_discrepancy(second).await.unwrap();

    let kept = store
        .apply_manual_match(first, "INV-9", "user-1")
        .await
        .unwrap();
    assert_eq!(kept.status(), MatchStatus::ManualMatched);
    assert_eq!(kept.match_confidence, Some(1.0));
    assert_eq!(kept.invoice_id.as_deref(), Some("INV-9"));
    assert_eq!(kept.matched_by.as_deref(), Some("user-1"));
    assert_eq!(kept.books_payment_id.as_deref(), Some(b1.as_str()));

    let overridden = store
        .apply_manual_match(second, "INV-10", "user-2")
        .await
        .unwrap();
    assert_eq!(overridden.status(), MatchStatus::ManualMatched);
    assert_eq!(overridden.books_payment_id, None);
}

async fn invoice_link_keeps_a_confirmed_books_link(store: &dyn ReconciliationStore, ids: &Ids) {
    seed(store, ids).await;
    let b1 = ids.id("B1");
    let first = record_id(store, &ids.id("F1")).await;

    store
        .apply_match(first, &update(&b1, MatchStatus::ManualMatched))
        .await
        .unwrap();
    let linked = store
        .apply_manual_match(first, "INV-9", "user-1")
        .await
        .unwrap();

    assert_eq!(linked.books_payment_id.as_deref(), Some(b1.as_str()));
    assert!(linked.is_deposited);
    assert_eq!(linked.deposit_date, Some(days_ago(1)));
    assert!(store.taken_books_payment_ids().await.unwrap().contains(&b1));
}

async fn manual_match_over_pending_review_releases_candidate(
    store: &dyn ReconciliationStore,
    ids: &Ids,
) {
    seed(store, ids).await;
    let b1 = ids.id("B1");
    let first = record_id(store, &ids.id("F1")).await;

    store
        .apply_match(first, &update(&b1, MatchStatus::PendingReview))
        .await
        .unwrap();
    let record = store
        .apply_manual_match(first, "INV-9", "user-1")
        .await
        .unwrap();

    assert_eq!(record.books_payment_id, None);
    assert!(!record.is_deposited);
    assert!(!store.taken_books_payment_ids().await.unwrap().contains(&b1));
}

async fn pass_write_does_not_replace_a_human_decision(
    store: &dyn ReconciliationStore,
    ids: &Ids,
) {
    seed(store, ids).await;
    let b1 = ids.id("B1");
    let first = record_id(store, &ids.id("F1")).await;
    let second = record_id(store, &ids.id("F2")).await;

    // Both records were read as st_only, then a reviewer acted on each.
    store
        .apply_manual_match(first, "INV-9", "user-1")
        .await
        .unwrap();
    store.apply_discrepancy(second).await.unwrap();

    for (record_id, status) in [(first, "manual_matched"), (second, "discrepancy")] {
        let err = store
            .apply_match(record_id, &engine_update(&b1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconciliationError::RecordChanged { status: ref now, .. } if now == status
        ));
    }

    let kept = store.get_record(first).await.unwrap().unwrap();
    assert_eq!(kept.status(), MatchStatus::ManualMatched);
    assert_eq!(kept.matched_by.as_deref(), Some("user-1"));
    assert_eq!(kept.match_confidence, Some(1.0));
    let flagged = store.get_record(second).await.unwrap().unwrap();
    assert_eq!(flagged.status(), MatchStatus::Discrepancy);

    // An unmatched record still takes the pass's write.
    store
        .upsert_field_payment(&field_payment(&ids.id("F3")))
        .await
        .unwrap();
    let third = record_id(store, &ids.id("F3")).await;
    let matched = store.apply_match(third, &engine_update(&b1)).await.unwrap();
    assert_eq!(matched.status(), MatchStatus::Matched);
}

async fn discrepancy_frees_the_books_payment(store: &dyn ReconciliationStore, ids: &Ids) {
    seed(store, ids).await;
    let b1 = ids.id("B1");
    let first = record_id(store, &ids.id("F1")).await;
    let second = record_id(store, &ids.id("F2")).await;

    store
        .apply_match(first, &update(&b1, MatchStatus::Matched))
        .await
        .unwrap();
    assert!(store.taken_books_payment_ids().await.unwrap().contains(&b1));

    let flagged = store.apply_discrepancy(first).await.unwrap();
    assert_eq!(flagged.status(), MatchStatus::Discrepancy);
    assert_eq!(flagged.match_confidence, None);
    assert_eq!(flagged.books_payment_id, None);
    assert!(!store.taken_books_payment_ids().await.unwrap().contains(&b1));

    store
        .apply_match(second, &update(&b1, MatchStatus::Matched))
        .await
        .unwrap();
}

async fn late_customer_name_reaches_unmatched_record(store: &dyn ReconciliationStore, ids: &Ids) {
    let f1 = ids.id("F1");
    let nameless = FieldPayment {
        customer_name: None,
        ..field_payment(&f1)
    };

    store.upsert_field_payment(&nameless).await.unwrap();
    assert_eq!(record(store, &f1).await.customer_name, None);

    store.upsert_field_payment(&field_payment(&f1)).await.unwrap();
    assert_eq!(
        record(store, &f1).await.customer_name.as_deref(),
        Some("Jane Doe")
    );

    // A later nameless copy does not erase what was learned.
    store.upsert_field_payment(&nameless).await.unwrap();
    assert_eq!(
        record(store, &f1).await.customer_name.as_deref(),
        Some("Jane Doe")
    );
}

macro_rules! store_scenarios {
    ($($name:ident),* $(,)?) => {
        mod memory {
            $(
                #[tokio::test]
                async fn $name() {
                    let store = super::MemoryStore::new();
                    super::$name(&store, &super::Ids::new()).await;
                }
            )*
        }

        mod postgres {
            $(
                #[tokio::test]
                async fn $name() {
                    let Some(store) = crate::common::postgres_store().await else {
                        return;
                    };
                    super::$name(&store, &super::Ids::new()).await;
                }
            )*
        }
    };
}

store_scenarios!(
    upserts_are_idempotent_by_identifier,
    confirmed_books_payment_cannot_be_matched_twice,
    pending_review_does_not_block_a_confident_match,
    rematching_the_same_record_is_allowed,
    unknown_targets_are_not_found,
    manual_match_overrides_any_state,
    invoice_link_keeps_a_confirmed_books_link,
    manual_match_over_pending_review_releases_candidate,
    pass_write_does_not_replace_a_human_decision,
    discrepancy_frees_the_books_payment,
    late_customer_name_reaches_unmatched_record,
);

// ============================================================================
// Store-specific checks
// ============================================================================

#[tokio::test]
async fn postgres_cache_keeps_name_when_feed_omits_it() {
    let Some(store) = common::postgres_store().await else {
        return;
    };
    let ids = Ids::new();
    let f1 = ids.id("F1");

    store.upsert_field_payment(&field_payment(&f1)).await.unwrap();
    store
        .upsert_field_payment(&FieldPayment {
            customer_name: None,
            ..field_payment(&f1)
        })
        .await
        .unwrap();

    let cached: Option<String> = sqlx::query_scalar(
        "SELECT customer_name FROM field_payments WHERE field_payment_id = $1",
    )
    .bind(&f1)
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(cached.as_deref(), Some("Jane Doe"));
}

#[tokio::test]
async fn list_records_filters_by_status_and_limit() {
    let store = MemoryStore::new();
    let ids = Ids::new();
    seed(&store, &ids).await;
    let first = record_id(&store, &ids.id("F1")).await;
    store.apply_discrepancy(first).await.unwrap();
    store
        .upsert_field_payment(&field_payment(&ids.id("F3")))
        .await
        .unwrap();

    let unmatched = store
        .list_records(Some(MatchStatus::StOnly), 100)
        .await
        .unwrap();
    assert_eq!(unmatched.len(), 2);
    assert!(unmatched.iter().all(|r| r.status() == MatchStatus::StOnly));

    assert_eq!(store.list_records(None, 1).await.unwrap().len(), 1);
    assert_eq!(store.pending_records().await.unwrap().len(), 2);
}

#[tokio::test]
async fn last_successful_sync_ignores_failed_passes() {
    let store = MemoryStore::new();
    let counts = SyncCounts::default();

    let failed = store.start_sync_log().await.unwrap();
    store
        .finish_sync_log(failed.sync_id, SyncStatus::Failed, &counts, Some("books offline"))
        .await
        .unwrap();
    assert_eq!(store.last_successful_sync().await.unwrap(), None);

    let completed = store.start_sync_log().await.unwrap();
    store
        .finish_sync_log(completed.sync_id, SyncStatus::Completed, &counts, None)
        .await
        .unwrap();
    assert_eq!(
        store.last_successful_sync().await.unwrap(),
        Some(completed.started_utc)
    );

    let logs = store.list_sync_logs(10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].sync_id, completed.sync_id);
    assert_eq!(logs[1].error_message.as_deref(), Some("books offline"));
}
