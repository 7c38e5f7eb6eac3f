//! Confidence scoring for a field payment against one books payment.
//!
//! Scores are accumulated in whole points (hundredths) so that threshold
//! comparisons are exact: amount 40, name up to 40, date up to 20.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::{BooksPayment, FieldPayment, ReconciliationRecord};

const AMOUNT_POINTS: u32 = 40;
const NAME_EXACT_POINTS: u32 = 40;
const NAME_SUBSTRING_POINTS: u32 = 30;
const NAME_TOKEN_POINTS: u32 = 20;
const NAME_TOKEN_CAP: u32 = 30;
const MAX_POINTS: u32 = 100;

/// Words shorter than this many characters are not name tokens.
const MIN_TOKEN_CHARS: usize = 3;

/// One cent.
pub fn default_amount_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

/// The parts of a payment that matching looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PaymentFacts<'a> {
    pub amount: Decimal,
    pub date: NaiveDate,
    pub customer_name: Option<&'a str>,
}

impl<'a> From<&'a FieldPayment> for PaymentFacts<'a> {
    fn from(p: &'a FieldPayment) -> Self {
        Self {
            amount: p.amount,
            date: p.payment_date,
            customer_name: p.customer_name.as_deref(),
        }
    }
}

impl<'a> From<&'a ReconciliationRecord> for PaymentFacts<'a> {
    fn from(r: &'a ReconciliationRecord) -> Self {
        Self {
            amount: r.amount,
            date: r.payment_date,
            customer_name: r.customer_name.as_deref(),
        }
    }
}

impl<'a> From<&'a BooksPayment> for PaymentFacts<'a> {
    fn from(p: &'a BooksPayment) -> Self {
        Self {
            amount: p.amount,
            date: p.payment_date,
            customer_name: p.customer_name.as_deref(),
        }
    }
}

/// Per-signal contribution, in points out of 100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScoreBreakdown {
    pub amount_points: u32,
    pub name_points: u32,
    pub date_points: u32,
}

impl ScoreBreakdown {
    pub fn points(&self) -> u32 {
        (self.amount_points + self.name_points + self.date_points).min(MAX_POINTS)
    }

    pub fn total(&self) -> f64 {
        f64::from(self.points()) / f64::from(MAX_POINTS)
    }
}

/// Confidence in [0, 1] that `field` and `books` are the same payment.
pub fn score(field: PaymentFacts<'_>, books: PaymentFacts<'_>) -> f64 {
    breakdown(field, books).total()
}

pub fn breakdown(field: PaymentFacts<'_>, books: PaymentFacts<'_>) -> ScoreBreakdown {
    let amount_points = if amounts_match(field.amount, books.amount, default_amount_tolerance()) {
        AMOUNT_POINTS
    } else {
        0
    };

    ScoreBreakdown {
        amount_points,
        name_points: name_points(field.customer_name, books.customer_name),
        date_points: date_points(day_distance(field.date, books.date)),
    }
}

/// True when the amounts differ by strictly less than `tolerance`.
/// A difference too large to represent never matches.
pub fn amounts_match(a: Decimal, b: Decimal, tolerance: Decimal) -> bool {
    a.checked_sub(b).is_some_and(|diff| diff.abs() < tolerance)
}

pub fn day_distance(a: NaiveDate, b: NaiveDate) -> i64 {
    (a - b).num_days().abs()
}

fn date_points(days: i64) -> u32 {
    match days {
        0 => 20,
        1 => 15,
        2..=3 => 10,
        4..=7 => 5,
        _ => 0,
    }
}

/// Lower-cased, trimmed name; blank names count as absent.
pub fn normalize_name(name: Option<&str>) -> Option<String> {
    name.map(|n| n.trim().to_lowercase()).filter(|n| !n.is_empty())
}

fn tokens(name: &str) -> Vec<&str> {
    name.split_whitespace()
        .filter(|t| t.chars().count() >= MIN_TOKEN_CHARS)
        .collect()
}

fn tokens_related(a: &str, b: &str) -> bool {
    a == b || a.contains(b) || b.contains(a)
}

fn related_token_pairs(a: &str, b: &str) -> u32 {
    let b_tokens = tokens(b);
    let mut count = 0;
    for ta in tokens(a) {
        for tb in &b_tokens {
            if tokens_related(ta, tb) {
                count += 1;
            }
        }
    }
    count
}

fn name_points(a: Option<&str>, b: Option<&str>) -> u32 {
    let (Some(a), Some(b)) = (normalize_name(a), normalize_name(b)) else {
        return 0;
    };

    if a == b {
        NAME_EXACT_POINTS
    } else if a.contains(&b) || b.contains(&a) {
        NAME_SUBSTRING_POINTS
    } else {
        (NAME_TOKEN_POINTS * related_token_pairs(&a, &b)).min(NAME_TOKEN_CAP)
    }
}

/// Loose name test used to filter candidates.
///
/// Returns `None` when either side has no name, so the caller can skip the test.
pub fn names_compatible(a: Option<&str>, b: Option<&str>) -> Option<bool> {
    let (a, b) = (normalize_name(a)?, normalize_name(b)?);
    Some(a == b || a.contains(&b) || b.contains(&a) || related_token_pairs(&a, &b) > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn facts(amount: &str, date: NaiveDate, name: Option<&'static str>) -> PaymentFacts<'static> {
        PaymentFacts {
            amount: amount.parse().unwrap(),
            date,
            customer_name: name,
        }
    }

    #[test]
    fn identical_payment_scores_one() {
        let f = facts("500.00", date(2026, 1, 10), Some("John Smith"));
        let b = facts("500.00", date(2026, 1, 10), Some("john smith"));
        assert_eq!(score(f, b), 1.0);
    }

    #[test]
    fn reversed_name_scores_by_tokens() {
        let f = facts("500.00", date(2026, 1, 10), Some("John Smith"));
        let b = facts("500.00", date(2026, 1, 10), Some("Smith, John"));
        let parts = breakdown(f, b);
        assert_eq!(parts.amount_points, 40);
        assert_eq!(parts.name_points, 30);
        assert_eq!(parts.date_points, 20);
        assert_eq!(parts.total(), 0.9);
    }

    #[test]
    fn substring_name_scores_thirty() {
        let f = facts("80.00", date(2026, 3, 1), Some("Acme Plumbing"));
        let b = facts("80.00", date(2026, 3, 1), Some("Acme Plumbing LLC"));
        assert_eq!(breakdown(f, b).name_points, 30);
    }

    #[test]
    fn single_shared_token_scores_twenty() {
        let f = facts("80.00", date(2026, 3, 1), Some("Maria Gonzalez"));
        let b = facts("80.00", date(2026, 3, 1), Some("Gonzalez Family Trust"));
        assert_eq!(breakdown(f, b).name_points, 20);
    }

    #[test]
    fn short_words_are_not_tokens() {
        assert_eq!(name_points(Some("Al Li"), Some("Li Al Jr")), 0);
        assert_eq!(names_compatible(Some("Al Li"), Some("Bo Li")), Some(false));
    }

    #[test]
    fn missing_name_scores_zero_and_skips_filter() {
        let f = facts("80.00", date(2026, 3, 1), None);
        let b = facts("80.00", date(2026, 3, 1), Some("Acme"));
        assert_eq!(breakdown(f, b).name_points, 0);
        assert_eq!(names_compatible(None, Some("Acme")), None);
        assert_eq!(names_compatible(Some("   "), Some("Acme")), None);
    }

    #[test]
    fn date_points_step_down_with_distance() {
        assert_eq!(date_points(0), 20);
        assert_eq!(date_points(1), 15);
        assert_eq!(date_points(3), 10);
        assert_eq!(date_points(7), 5);
        assert_eq!(date_points(8), 0);
    }

    #[test]
    fn one_cent_difference_loses_amount_weight() {
        let f = facts("500.00", date(2026, 1, 10), None);
        let b = facts("500.01", date(2026, 1, 10), None);
        assert_eq!(breakdown(f, b).amount_points, 0);
        assert!(amounts_match(
            "500.00".parse().unwrap(),
            "500.009".parse().unwrap(),
            default_amount_tolerance()
        ));
    }

    #[test]
    fn unrepresentable_difference_is_not_a_match() {
        assert!(!amounts_match(Decimal::MAX, Decimal::MIN, default_amount_tolerance()));
        assert!(!amounts_match(Decimal::MIN, Decimal::MAX, default_amount_tolerance()));
    }

    #[test]
    fn score_is_bounded_and_repeatable() {
        let names = [None, Some("A B"), Some("John Smith"), Some("Smith John Smith")];
        for a in names {
            for b in names {
                for offset in [0, 1, 2, 5, 30] {
                    let f = facts("10.00", date(2026, 5, 1), a);
                    let c = facts("10.00", date(2026, 5, 1) + chrono::Days::new(offset), b);
                    let s = score(f, c);
                    assert!((0.0..=1.0).contains(&s));
                    assert_eq!(s, score(f, c));
                }
            }
        }
    }

    #[test]
    fn threshold_sums_are_exact() {
        // 40 + 30 + 10 must land exactly on the auto-accept line.
        let f = facts("25.00", date(2026, 2, 1), Some("Acme"));
        let b = facts("25.00", date(2026, 2, 4), Some("Acme Co"));
        assert_eq!(score(f, b), 0.8);
    }
}
