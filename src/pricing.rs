use async_trait::async_trait;
use serde::Serialize;
use ulid::Ulid;

use crate::model::{Amount, Stay, Unit};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quote {
    pub unit_id: Ulid,
    pub stay: Stay,
    pub nights: i64,
    pub nightly_rate: Amount,
    pub total: Amount,
    pub discount_code: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    #[error("unknown discount code: {0}")]
    UnknownDiscountCode(String),
    #[error("price overflow for {nights} nights at {nightly_rate}")]
    Overflow { nights: i64, nightly_rate: Amount },
}

/// Prices a stay. Consumes availability verdicts, never influences them.
#[async_trait]
pub trait Pricing: Send + Sync {
    async fn quote(&self, unit: &Unit, stay: &Stay, discount_code: Option<&str>) -> Result<Quote, PricingError>;
}

/// Nightly base rate times nights. Knows no discount codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NightlyRatePricing;

#[async_trait]
impl Pricing for NightlyRatePricing {
    async fn quote(&self, unit: &Unit, stay: &Stay, discount_code: Option<&str>) -> Result<Quote, PricingError> {
        if let Some(code) = discount_code {
            return Err(PricingError::UnknownDiscountCode(code.to_string()));
        }
        let nights = stay.nights();
        let total = unit
            .nightly_rate
            .checked_mul(nights)
            .ok_or(PricingError::Overflow {
                nights,
                nightly_rate: unit.nightly_rate,
            })?;
        Ok(Quote {
            unit_id: unit.id,
            stay: *stay,
            nights,
            nightly_rate: unit.nightly_rate,
            total,
            discount_code: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn unit(rate: Amount) -> Unit {
        Unit {
            id: Ulid::new(),
            name: None,
            nightly_rate: rate,
            active: true,
        }
    }

    fn stay() -> Stay {
        Stay::new(
            NaiveDate::from_ymd_opt(2030, 3, 10).unwrap(),
            NaiveDate::from_ymd_opt(2030, 3, 13).unwrap(),
        )
    }

    #[test]
    fn rate_times_nights() {
        let quote = tokio_test::block_on(NightlyRatePricing.quote(&unit(12_500), &stay(), None)).unwrap();
        assert_eq!(quote.nights, 3);
        assert_eq!(quote.total, 37_500);
    }

    #[test]
    fn unknown_discount_rejected() {
        let err = tokio_test::block_on(NightlyRatePricing.quote(&unit(12_500), &stay(), Some("SUMMER"))).unwrap_err();
        assert!(matches!(err, PricingError::UnknownDiscountCode(code) if code == "SUMMER"));
    }

    #[test]
    fn overflow_is_an_error() {
        let err = tokio_test::block_on(NightlyRatePricing.quote(&unit(i64::MAX), &stay(), None)).unwrap_err();
        assert!(matches!(err, PricingError::Overflow { nights: 3, .. }));
    }
}
