//! Czech sole-trader tax calculator.
//!
//! Pure arithmetic over one tax year: progressive income tax, flat-rate
//! versus actual expenses, social and health insurance, and VAT. Every
//! monetary intermediate is rounded to whole CZK where it is produced.

pub mod calculator;
pub mod rules;
pub mod vat;

pub use calculator::{compare_methods, ExpenseMethod, MethodResult, TaxComparison, TaxInput};
pub use rules::{ActivityType, TaxYearRules};
pub use vat::{calculate_vat, VatRate, VatSummary};

/// Round to the nearest whole CZK, halves rounding up.
pub fn round_czk(amount: f64) -> f64 {
    (amount + 0.5).floor()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_czk_halves_up() {
        assert_eq!(round_czk(10.5), 11.0);
        assert_eq!(round_czk(10.49), 10.0);
        assert_eq!(round_czk(-10.5), -10.0);
    }
}
