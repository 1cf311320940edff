use serde::{Deserialize, Serialize};

use crate::round_czk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VatRate {
    /// 21 %
    Standard,
    /// 12 %
    Reduced,
}

impl VatRate {
    pub fn percent(self) -> f64 {
        match self {
            Self::Standard => 21.0,
            Self::Reduced => 12.0,
        }
    }

    /// VAT due on a net amount.
    pub fn vat_on_net(self, net: f64) -> f64 {
        round_czk(net * self.percent() / 100.0)
    }

    /// VAT contained in a gross amount.
    pub fn vat_in_gross(self, gross: f64) -> f64 {
        let rate = self.percent() / 100.0;
        round_czk(gross * rate / (1.0 + rate))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VatSummary {
    pub collected: f64,
    pub paid: f64,
    /// Positive when payable, negative for a refund.
    pub liability: f64,
    pub is_refund: bool,
}

/// Net VAT position for a period.
pub fn calculate_vat(collected: f64, paid: f64) -> VatSummary {
    let collected = round_czk(collected);
    let paid = round_czk(paid);
    let liability = collected - paid;
    VatSummary {
        collected,
        paid,
        liability,
        is_refund: liability < 0.0,
    }
}
