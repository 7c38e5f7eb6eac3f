//! Greedy matcher from unmatched field payments to books payments.

use std::collections::HashSet;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use super::scorer::{
    self, amounts_match, day_distance, default_amount_tolerance, names_compatible, PaymentFacts,
    ScoreBreakdown,
};
use crate::models::{BooksPayment, MatchStatus, ReconciliationRecord};

/// Books-payment identifiers no longer available as candidates.
pub type TakenSet = HashSet<String>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchingConfig {
    /// Scores at or above this are matched without review.
    pub auto_accept_threshold: f64,
    pub date_window_days: i64,
    /// Narrower window applied when both names are present but unrelated.
    pub name_fallback_window_days: i64,
    pub amount_tolerance: Decimal,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            auto_accept_threshold: 0.8,
            date_window_days: 7,
            name_fallback_window_days: 3,
            amount_tolerance: default_amount_tolerance(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchDecision {
    Matched {
        record_id: Uuid,
        books_payment_id: String,
        confidence: f64,
        is_deposited: bool,
        deposit_date: Option<NaiveDate>,
    },
    PendingReview {
        record_id: Uuid,
        books_payment_id: String,
        confidence: f64,
    },
    NoCandidate {
        record_id: Uuid,
    },
    Ambiguous {
        record_id: Uuid,
        candidates: usize,
    },
}

impl MatchDecision {
    pub fn record_id(&self) -> Uuid {
        match self {
            Self::Matched { record_id, .. }
            | Self::PendingReview { record_id, .. }
            | Self::NoCandidate { record_id }
            | Self::Ambiguous { record_id, .. } => *record_id,
        }
    }

    /// Status the record ends up in after this decision.
    pub fn status(&self) -> MatchStatus {
        match self {
            Self::Matched { .. } => MatchStatus::Matched,
            Self::PendingReview { .. } => MatchStatus::PendingReview,
            Self::NoCandidate { .. } | Self::Ambiguous { .. } => MatchStatus::StOnly,
        }
    }
}

/// Result of one engine run: per-record decisions plus the taken set after the run.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPass {
    pub decisions: Vec<MatchDecision>,
    pub taken: TakenSet,
}

impl MatchPass {
    pub fn matched_count(&self) -> usize {
        self.decisions
            .iter()
            .filter(|d| matches!(d, MatchDecision::Matched { .. }))
            .count()
    }
}

/// A books payment scored against one record, for review screens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredCandidate {
    pub books_payment: BooksPayment,
    pub confidence: f64,
    pub breakdown: ScoreBreakdown,
    pub passes_filter: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MatchingEngine {
    config: MatchingConfig,
}

impl MatchingEngine {
    pub fn new(config: MatchingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Whether `books` survives the amount, date and name filters for `record`.
    pub fn is_candidate(&self, record: PaymentFacts<'_>, books: PaymentFacts<'_>) -> bool {
        if !amounts_match(record.amount, books.amount, self.config.amount_tolerance) {
            return false;
        }

        let days = day_distance(record.date, books.date);
        if days > self.config.date_window_days {
            return false;
        }

        match names_compatible(record.customer_name, books.customer_name) {
            None | Some(true) => true,
            Some(false) => days <= self.config.name_fallback_window_days,
        }
    }

    /// Untaken books payments that pass the filters for `record`.
    pub fn candidates<'a>(
        &self,
        record: &ReconciliationRecord,
        books: &'a [BooksPayment],
        taken: &TakenSet,
    ) -> Vec<&'a BooksPayment> {
        let facts = PaymentFacts::from(record);
        books
            .iter()
            .filter(|b| !taken.contains(&b.books_payment_id))
            .filter(|b| self.is_candidate(facts, PaymentFacts::from(*b)))
            .collect()
    }

    /// Decide one record, claiming the books payment in `taken` on a confident match.
    pub fn decide(
        &self,
        record: &ReconciliationRecord,
        books: &[BooksPayment],
        taken: &mut TakenSet,
    ) -> MatchDecision {
        let candidates = self.candidates(record, books, taken);

        let candidate = match candidates.as_slice() {
            [] => {
                return MatchDecision::NoCandidate {
                    record_id: record.record_id,
                }
            }
            [only] => *only,
            many => {
                return MatchDecision::Ambiguous {
                    record_id: record.record_id,
                    candidates: many.len(),
                }
            }
        };

        let confidence = scorer::score(PaymentFacts::from(record), PaymentFacts::from(candidate));

        if confidence >= self.config.auto_accept_threshold {
            taken.insert(candidate.books_payment_id.clone());
            MatchDecision::Matched {
                record_id: record.record_id,
                books_payment_id: candidate.books_payment_id.clone(),
                confidence,
                is_deposited: candidate.is_deposited,
                deposit_date: candidate.deposit_date,
            }
        } else {
            // Left in the pool: a later record may still claim it confidently.
            MatchDecision::PendingReview {
                record_id: record.record_id,
                books_payment_id: candidate.books_payment_id.clone(),
                confidence,
            }
        }
    }

    /// Run over every `st_only` record, most recent payment date first.
    ///
    /// Assignment is greedy and order dependent: when two records both fit a
    /// single books payment, the more recent one claims it.
    pub fn run(
        &self,
        records: &[ReconciliationRecord],
        books: &[BooksPayment],
        mut taken: TakenSet,
    ) -> MatchPass {
        let mut pending: Vec<&ReconciliationRecord> = records
            .iter()
            .filter(|r| r.status() == MatchStatus::StOnly)
            .collect();
        pending.sort_by(|a, b| b.payment_date.cmp(&a.payment_date));

        let decisions = pending
            .into_iter()
            .map(|record| self.decide(record, books, &mut taken))
            .collect();

        MatchPass { decisions, taken }
    }

    /// Every untaken books payment scored against `record`, best first.
    pub fn rank_candidates(
        &self,
        record: &ReconciliationRecord,
        books: &[BooksPayment],
        taken: &TakenSet,
        limit: usize,
    ) -> Vec<ScoredCandidate> {
        let facts = PaymentFacts::from(record);
        let mut scored: Vec<ScoredCandidate> = books
            .iter()
            .filter(|b| !taken.contains(&b.books_payment_id))
            .map(|b| {
                let other = PaymentFacts::from(b);
                let breakdown = scorer::breakdown(facts, other);
                ScoredCandidate {
                    books_payment: b.clone(),
                    confidence: breakdown.total(),
                    breakdown,
                    passes_filter: self.is_candidate(facts, other),
                }
            })
            .filter(|c| c.breakdown.points() > 0)
            .collect();

        scored.sort_by(|a, b| {
            b.breakdown
                .points()
                .cmp(&a.breakdown.points())
                .then_with(|| a.books_payment.books_payment_id.cmp(&b.books_payment.books_payment_id))
        });
        scored.truncate(limit);
        scored
    }
}
