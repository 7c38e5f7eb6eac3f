//! External payment feeds: the field-operations system and the accounting books.
//!
//! Both feeds hand back explicit item contracts. Items are validated here,
//! at the ingestion boundary, before anything reaches the caches.

pub mod books;
pub mod field_ops;
pub mod mock;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::ReconciliationError;
use crate::models::{BooksPayment, FieldPayment};

pub use books::BooksClient;
pub use field_ops::FieldOpsClient;
pub use mock::{MockBooks, MockFieldOps};

pub const FIELD_OPS_SYSTEM: &str = "field_ops";
pub const BOOKS_SYSTEM: &str = "books";

/// Items from one feed request, plus what had to be dropped on the way.
#[derive(Debug, Clone)]
pub struct FeedBatch<T> {
    pub items: Vec<T>,
    /// Items that could not be decoded at all.
    pub malformed: usize,
    /// Non-fatal failures, e.g. a later page that could not be fetched.
    pub warnings: Vec<String>,
}

impl<T> FeedBatch<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            malformed: 0,
            warnings: Vec::new(),
        }
    }
}

impl<T> Default for FeedBatch<T> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Decode a page item by item so one bad row does not sink the page.
pub(crate) fn decode_items<T>(raw: Vec<serde_json::Value>, system: &'static str) -> (Vec<T>, usize)
where
    T: serde::de::DeserializeOwned,
{
    let mut items = Vec::with_capacity(raw.len());
    let mut malformed = 0;
    for value in raw {
        match serde_json::from_value::<T>(value) {
            Ok(item) => items.push(item),
            Err(e) => {
                malformed += 1;
                tracing::warn!(system = system, error = %e, "Dropping undecodable feed item");
            }
        }
    }
    (items, malformed)
}

/// Largest magnitude the money columns hold: NUMERIC(14, 2).
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(0x107A_3FFF, 0x5AF3, 0, false, 2); // 99_999_999_999_999 * 10^-2

/// Amounts must fit the money columns exactly: whole cents, at most `MAX_AMOUNT`.
fn validate_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.abs() > MAX_AMOUNT {
        return Err(ValidationError::new("amount_range").with_message("Amount is out of range".into()));
    }
    if amount.normalize().scale() > 2 {
        return Err(
            ValidationError::new("amount_scale").with_message("Amount has fractional cents".into()),
        );
    }
    Ok(())
}

// ============================================================================
// Field Operations Feed
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FieldPaymentFeedItem {
    #[serde(default)]
    #[validate(
        required(message = "Payment identifier is required"),
        length(min = 1, message = "Payment identifier cannot be empty")
    )]
    pub id: Option<String>,
    #[serde(default)]
    pub invoice_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    #[validate(
        required(message = "Amount is required"),
        custom(function = "validate_amount")
    )]
    pub amount: Option<Decimal>,
    #[serde(default)]
    #[validate(required(message = "Payment date is required"))]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
}

impl FieldPaymentFeedItem {
    pub fn into_model(self, ingested_utc: DateTime<Utc>) -> Result<FieldPayment, ReconciliationError> {
        self.validate().map_err(|e| {
            ReconciliationError::Validation(format!(
                "field payment {}: {}",
                self.id.as_deref().unwrap_or("<missing id>"),
                e
            ))
        })?;

        match (self.id, self.amount, self.date) {
            (Some(id), Some(amount), Some(date)) => Ok(FieldPayment {
                field_payment_id: id,
                invoice_ref: self.invoice_id,
                customer_ref: self.customer_id,
                amount,
                payment_date: date,
                method: self.method,
                status: self.status,
                customer_name: non_blank(self.customer_name),
                ingested_utc,
            }),
            _ => Err(ReconciliationError::Validation(
                "field payment missing required fields".to_string(),
            )),
        }
    }
}

#[async_trait]
pub trait FieldOpsSource: Send + Sync {
    /// Payments with a payment date on or after `since`.
    async fn fetch_payments(
        &self,
        since: NaiveDate,
    ) -> Result<FeedBatch<FieldPaymentFeedItem>, ReconciliationError>;

    /// Display name for a field-system customer. `None` if the customer has none.
    async fn customer_name(&self, customer_id: &str) -> Result<Option<String>, ReconciliationError>;
}

// ============================================================================
// Accounting Books Feed
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BooksPaymentFeedItem {
    #[serde(default)]
    #[validate(
        required(message = "Payment identifier is required"),
        length(min = 1, message = "Payment identifier cannot be empty")
    )]
    pub id: Option<String>,
    #[serde(default)]
    pub customer_ref: Option<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    #[validate(required(message = "Payment date is required"))]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    #[validate(
        required(message = "Amount is required"),
        custom(function = "validate_amount")
    )]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub payment_method_ref: Option<String>,
    #[serde(default)]
    pub deposit_account_ref: Option<String>,
    #[serde(default)]
    pub deposit_account_name: Option<String>,
    #[serde(default)]
    pub memo: Option<String>,
}

impl BooksPaymentFeedItem {
    /// Funds count as deposited when they were sent to an account other than
    /// the holding account. A payment with no destination sits in the holding
    /// account.
    pub fn is_deposited(&self, holding_account_id: Option<&str>) -> bool {
        match self.deposit_account_ref.as_deref() {
            None => false,
            Some(dest) => Some(dest) != holding_account_id,
        }
    }

    pub fn into_model(
        self,
        holding_account_id: Option<&str>,
        synced_utc: DateTime<Utc>,
    ) -> Result<BooksPayment, ReconciliationError> {
        self.validate().map_err(|e| {
            ReconciliationError::Validation(format!(
                "books payment {}: {}",
                self.id.as_deref().unwrap_or("<missing id>"),
                e
            ))
        })?;

        let is_deposited = self.is_deposited(holding_account_id);
        match (self.id, self.amount, self.date) {
            (Some(id), Some(amount), Some(date)) => Ok(BooksPayment {
                books_payment_id: id,
                customer_ref: self.customer_ref,
                customer_name: non_blank(self.customer_name),
                payment_date: date,
                amount,
                method: self.payment_method_ref,
                is_deposited,
                deposit_account: self.deposit_account_name.or(self.deposit_account_ref),
                deposit_date: is_deposited.then_some(date),
                memo: self.memo,
                synced_utc,
            }),
            _ => Err(ReconciliationError::Validation(
                "books payment missing required fields".to_string(),
            )),
        }
    }
}

#[async_trait]
pub trait BooksSource: Send + Sync {
    /// Identifier of the undeposited holding account, if the books have one.
    async fn holding_account_id(&self) -> Result<Option<String>, ReconciliationError>;

    /// Every payment dated on or after `since`.
    async fn fetch_payments(
        &self,
        since: NaiveDate,
    ) -> Result<FeedBatch<BooksPaymentFeedItem>, ReconciliationError>;

    /// Payments still sitting in the holding account, regardless of date.
    async fn fetch_undeposited(
        &self,
        holding_account_id: &str,
    ) -> Result<FeedBatch<BooksPaymentFeedItem>, ReconciliationError>;
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn field_item_decodes_camel_case_payload() {
        let item: FieldPaymentFeedItem = serde_json::from_value(json!({
            "id": "F1",
            "invoiceId": "INV-1",
            "customerId": "C9",
            "amount": "500.00",
            "date": "2026-01-10",
            "method": "Check",
            "status": "Posted"
        }))
        .unwrap();

        let payment = item.into_model(Utc::now()).unwrap();
        assert_eq!(payment.field_payment_id, "F1");
        assert_eq!(payment.customer_ref.as_deref(), Some("C9"));
        assert_eq!(payment.amount, Decimal::new(50000, 2));
        assert_eq!(payment.customer_name, None);
    }

    #[test]
    fn field_item_without_id_is_rejected() {
        let item: FieldPaymentFeedItem = serde_json::from_value(json!({
            "amount": "10.00",
            "date": "2026-01-10"
        }))
        .unwrap();

        let err = item.into_model(Utc::now()).unwrap_err();
        assert!(matches!(err, ReconciliationError::Validation(_)));
    }

    #[test]
    fn field_item_with_empty_id_is_rejected() {
        let item: FieldPaymentFeedItem = serde_json::from_value(json!({
            "id": "",
            "amount": "10.00",
            "date": "2026-01-10"
        }))
        .unwrap();

        assert!(item.into_model(Utc::now()).is_err());
    }

    #[test]
    fn amounts_outside_the_money_columns_are_rejected() {
        for amount in ["1000000000000.00", "-1000000000000.00", "12.345"] {
            let item: FieldPaymentFeedItem = serde_json::from_value(json!({
                "id": "F1",
                "amount": amount,
                "date": "2026-01-10"
            }))
            .unwrap();

            let err = item.into_model(Utc::now()).unwrap_err();
            assert!(
                matches!(err, ReconciliationError::Validation(_)),
                "{} should be rejected",
                amount
            );
        }
    }

    #[test]
    fn trailing_zeros_and_the_largest_amount_are_accepted() {
        let item: BooksPaymentFeedItem = serde_json::from_value(json!({
            "id": "B1",
            "amount": "999999999999.99",
            "date": "2026-01-10"
        }))
        .unwrap();
        assert_eq!(item.into_model(None, Utc::now()).unwrap().amount, MAX_AMOUNT);

        let item: FieldPaymentFeedItem = serde_json::from_value(json!({
            "id": "F1",
            "amount": "12.300",
            "date": "2026-01-10"
        }))
        .unwrap();
        assert!(item.into_model(Utc::now()).is_ok());
    }

    #[test]
    fn books_item_without_date_is_rejected() {
        let item: BooksPaymentFeedItem = serde_json::from_value(json!({
            "id": "B1",
            "amount": "10.00"
        }))
        .unwrap();

        assert!(item.into_model(None, Utc::now()).is_err());
    }

    #[test]
    fn holding_account_destination_is_undeposited() {
        let item: BooksPaymentFeedItem = serde_json::from_value(json!({
            "id": "B1",
            "amount": "10.00",
            "date": "2026-01-10",
            "depositAccountRef": "4",
            "depositAccountName": "Undeposited Funds"
        }))
        .unwrap();

        let payment = item.into_model(Some("4"), Utc::now()).unwrap();
        assert!(!payment.is_deposited);
        assert_eq!(payment.deposit_date, None);
        assert_eq!(payment.deposit_account.as_deref(), Some("Undeposited Funds"));
    }

    #[test]
    fn bank_destination_is_deposited_on_payment_date() {
        let item: BooksPaymentFeedItem = serde_json::from_value(json!({
            "id": "B1",
            "amount": "10.00",
            "date": "2026-01-10",
            "depositAccountRef": "35"
        }))
        .unwrap();

        let payment = item.into_model(Some("4"), Utc::now()).unwrap();
        assert!(payment.is_deposited);
        assert_eq!(payment.deposit_date, NaiveDate::from_ymd_opt(2026, 1, 10));
    }

    #[test]
    fn missing_destination_is_undeposited() {
        let item: BooksPaymentFeedItem = serde_json::from_value(json!({
            "id": "B1",
            "amount": "10.00",
            "date": "2026-01-10"
        }))
        .unwrap();

        assert!(!item.is_deposited(Some("4")));
    }

    #[test]
    fn undecodable_items_are_counted_not_fatal() {
        let raw = vec![
            json!({"id": "F1", "amount": "1.00", "date": "2026-01-10"}),
            json!({"id": "F2", "amount": "1.00", "date": "not-a-date"}),
            json!("garbage"),
        ];

        let (items, malformed) = decode_items::<FieldPaymentFeedItem>(raw, FIELD_OPS_SYSTEM);
        assert_eq!(items.len(), 1);
        assert_eq!(malformed, 2);
    }
}
