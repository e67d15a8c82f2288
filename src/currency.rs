//! Home currency conversion at approval time.
//!
//! Computed values are `round(amount * rate, 2)`, half away from zero. When the
//! approver supplies a value of their own it wins, and the field is flagged as
//! overridden if it differs from the computed value by more than the configured
//! tolerance.
use chrono::NaiveDate;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::BTreeMap;

use crate::collaborators::ExchangeRates;
use crate::error::DocumentError;
use crate::revision::{DocumentRevision, HomeAmounts};
use crate::types::{Amount, CalendarDate, Rate};

pub const SOURCE_MANUAL: &str = "MANUAL";
pub const SOURCE_TABLE: &str = "TABLE";
pub const SOURCE_SYSTEM: &str = "SYSTEM";
pub const SOURCE_IDENTITY: &str = "IDENTITY";

pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HomeValue {
    pub value: Decimal,
    pub overridden: bool,
}

/// Picks between the computed home value and one the caller supplied.
pub fn reconcile(computed: Decimal, supplied: Option<Decimal>, tolerance: Decimal) -> HomeValue {
    match supplied {
        Some(supplied) => HomeValue {
            value: supplied,
            // an unrepresentable difference counts as overridden
            overridden: supplied
                .checked_sub(computed)
                .is_none_or(|diff| diff.abs() > tolerance),
        },
        None => HomeValue {
            value: computed,
            overridden: false,
        },
    }
}

/// The rate used for a conversion and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateQuote {
    pub rate: Decimal,
    pub source: String,
    pub date: Option<NaiveDate>,
}

/// Approver supplied home values, keyed per line by line number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HomeValueOverrides {
    pub subtotal: Option<Decimal>,
    pub tax: Option<Decimal>,
    pub equivalent: Option<Decimal>,
    pub line_amounts: BTreeMap<u32, Decimal>,
    pub line_tax_amounts: BTreeMap<u32, Decimal>,
}

/// Rate selection inputs for one approval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateRequest {
    /// Explicit rate; always wins
    pub exchange_rate: Option<Decimal>,
    /// Name of the caller's rate source, recorded with a supplied date
    pub rate_source: Option<String>,
    pub rate_date: Option<NaiveDate>,
}

/// Chooses the rate: an explicit override, then the caller's date, then the
/// pinned system rate at the issue date (or `today`).
pub fn resolve_rate(
    rates: &dyn ExchangeRates,
    from: &str,
    to: &str,
    request: &RateRequest,
    issue_date: Option<NaiveDate>,
    today: NaiveDate,
) -> Result<RateQuote, DocumentError> {
    if from == to {
        return Ok(RateQuote {
            rate: Decimal::ONE,
            source: SOURCE_IDENTITY.to_string(),
            date: None,
        });
    }

    let quote = if let Some(rate) = request.exchange_rate {
        RateQuote {
            rate,
            source: SOURCE_MANUAL.to_string(),
            date: request.rate_date,
        }
    } else if let Some(date) = request.rate_date {
        let rate = rates.rate_on(from, to, date).ok_or_else(|| {
            DocumentError::Validation(format!("no {from}/{to} rate available on {date}"))
        })?;
        RateQuote {
            rate,
            source: request
                .rate_source
                .clone()
                .unwrap_or_else(|| SOURCE_TABLE.to_string()),
            date: Some(date),
        }
    } else {
        let date = issue_date.unwrap_or(today);
        let rate = rates.rate_on(from, to, date).ok_or_else(|| {
            DocumentError::Validation(format!(
                "no {from}/{to} rate pinned for {date}; supply an exchange rate"
            ))
        })?;
        RateQuote {
            rate,
            source: SOURCE_SYSTEM.to_string(),
            date: Some(date),
        }
    };

    if quote.rate <= Decimal::ZERO {
        return Err(DocumentError::Validation(format!(
            "exchange rate must be positive, got {}",
            quote.rate
        )));
    }
    Ok(quote)
}

/// Fills the home currency fields of `revision` in place.
pub fn convert(
    revision: &mut DocumentRevision,
    home_currency: &str,
    quote: &RateQuote,
    overrides: &HomeValueOverrides,
    tolerance: Decimal,
) -> Result<(), DocumentError> {
    let currency = revision.header.currency.clone().ok_or_else(|| {
        DocumentError::Validation("a revision needs a currency to be converted".to_string())
    })?;

    // same currency mirrors the document amounts, supplied values are ignored
    if currency == home_currency {
        revision.home = Some(HomeAmounts {
            currency: home_currency.to_string(),
            exchange_rate: Rate(Decimal::ONE),
            rate_source: SOURCE_IDENTITY.to_string(),
            rate_date: None,
            subtotal: revision.header.subtotal,
            subtotal_overridden: false,
            tax: revision.header.tax,
            tax_overridden: false,
            equivalent: revision.header.total,
            equivalent_overridden: false,
        });
        for item in &mut revision.line_items {
            item.home_amount = item.amount;
            item.home_amount_overridden = false;
            item.home_tax_amount = item.tax_amount;
            item.home_tax_overridden = false;
        }
        return Ok(());
    }

    let field = |amount: Option<Amount>, supplied: Option<Decimal>| {
        amount
            .map(|a| {
                a.value()
                    .checked_mul(quote.rate)
                    .map(|computed| reconcile(round2(computed), supplied, tolerance))
                    .ok_or_else(|| {
                        DocumentError::Validation(format!(
                            "{} at rate {} is out of range",
                            a.value(),
                            quote.rate
                        ))
                    })
            })
            .transpose()
    };

    let subtotal = field(revision.header.subtotal, overrides.subtotal)?;
    let tax = field(revision.header.tax, overrides.tax)?;
    let equivalent = field(revision.header.total, overrides.equivalent)?;

    for item in &mut revision.line_items {
        let amount = field(item.amount, overrides.line_amounts.get(&item.line_no).copied())?;
        item.home_amount = amount.map(|v| Amount(v.value));
        item.home_amount_overridden = amount.is_some_and(|v| v.overridden);

        let tax = field(
            item.tax_amount,
            overrides.line_tax_amounts.get(&item.line_no).copied(),
        )?;
        item.home_tax_amount = tax.map(|v| Amount(v.value));
        item.home_tax_overridden = tax.is_some_and(|v| v.overridden);
    }

    revision.home = Some(HomeAmounts {
        currency: home_currency.to_string(),
        exchange_rate: Rate(quote.rate),
        rate_source: quote.source.clone(),
        rate_date: quote.date.map(CalendarDate),
        subtotal: subtotal.map(|v| Amount(v.value)),
        subtotal_overridden: subtotal.is_some_and(|v| v.overridden),
        tax: tax.map(|v| Amount(v.value)),
        tax_overridden: tax.is_some_and(|v| v.overridden),
        equivalent: equivalent.map(|v| Amount(v.value)),
        equivalent_overridden: equivalent.is_some_and(|v| v.overridden),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::RateTable;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        assert_eq!(round2(dec!(1.005)), dec!(1.01));
        assert_eq!(round2(dec!(-1.005)), dec!(-1.01));
        assert_eq!(round2(dec!(100.00) * dec!(1.35)), dec!(135.00));
    }

    #[test]
    fn override_flag_needs_more_than_tolerance() {
        let computed = dec!(135.00);
        assert!(reconcile(computed, Some(dec!(135.01)), dec!(0.009)).overridden);
        assert!(!reconcile(computed, Some(dec!(135.00)), dec!(0.009)).overridden);
        assert!(!reconcile(computed, None, dec!(0.009)).overridden);
        assert!(reconcile(Decimal::MAX, Some(Decimal::MIN), dec!(0.009)).overridden);
    }

    #[test]
    fn rate_priority() {
        let table = RateTable::new()
            .pin("EUR", "USD", date(2024, 1, 1), dec!(1.10))
            .pin("EUR", "USD", date(2024, 3, 1), dec!(1.08));

        let manual = RateRequest {
            exchange_rate: Some(dec!(1.35)),
            ..RateRequest::default()
        };
        let quote = resolve_rate(&table, "EUR", "USD", &manual, None, date(2024, 6, 1)).unwrap();
        assert_eq!((quote.rate, quote.source.as_str()), (dec!(1.35), SOURCE_MANUAL));

        let dated = RateRequest {
            rate_date: Some(date(2024, 2, 15)),
            rate_source: Some("ECB".into()),
            ..RateRequest::default()
        };
        let quote = resolve_rate(&table, "EUR", "USD", &dated, None, date(2024, 6, 1)).unwrap();
        assert_eq!((quote.rate, quote.source.as_str()), (dec!(1.10), "ECB"));

        let system = RateRequest::default();
        let quote = resolve_rate(
            &table,
            "EUR",
            "USD",
            &system,
            Some(date(2024, 3, 2)),
            date(2024, 6, 1),
        )
        .unwrap();
        assert_eq!((quote.rate, quote.source.as_str()), (dec!(1.08), SOURCE_SYSTEM));

        let err = resolve_rate(&table, "GBP", "USD", &system, None, date(2024, 6, 1)).unwrap_err();
        assert_eq!(err.code().as_str(), "VALIDATION_ERROR");
    }

    #[test]
    fn non_positive_manual_rate_is_rejected() {
        let table = RateTable::new();
        let request = RateRequest {
            exchange_rate: Some(dec!(0)),
            ..RateRequest::default()
        };
        assert!(resolve_rate(&table, "EUR", "USD", &request, None, date(2024, 1, 1)).is_err());
    }
}
