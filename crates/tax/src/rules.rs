use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Activity class determining the flat-rate expense percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    /// Crafts and agriculture, 80 %.
    Crafts,
    /// Other trades, 60 %.
    Trades,
    /// Liberal professions and other self-employment, 40 %.
    ProfessionalServices,
    /// Rental income, 30 %.
    Rental,
}

#[derive(Debug, Error)]
#[error("unknown activity type '{0}'")]
pub struct UnknownActivity(pub String);

impl FromStr for ActivityType {
    type Err = UnknownActivity;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "crafts" => Ok(Self::Crafts),
            "trades" => Ok(Self::Trades),
            "professional_services" => Ok(Self::ProfessionalServices),
            "rental" => Ok(Self::Rental),
            other => Err(UnknownActivity(other.to_string())),
        }
    }
}

/// Flat-rate percentage and its annual ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlatRate {
    pub rate: f64,
    pub cap: f64,
}

/// Rates and thresholds for one tax year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxYearRules {
    pub year: i32,
    pub base_rate: f64,
    pub higher_rate: f64,
    /// Tax base above which `higher_rate` applies.
    pub higher_rate_threshold: f64,
    pub taxpayer_credit: f64,
    pub social_rate: f64,
    pub health_rate: f64,
    /// Share of profit forming the insurance assessment base.
    pub assessment_share: f64,
    pub social_min_monthly_base: f64,
    pub social_max_annual_base: f64,
    pub health_min_monthly_base: f64,
    pub crafts: FlatRate,
    pub trades: FlatRate,
    pub professional_services: FlatRate,
    pub rental: FlatRate,
}

impl TaxYearRules {
    pub fn cz_2024() -> Self {
        Self {
            year: 2024,
            base_rate: 0.15,
            higher_rate: 0.23,
            higher_rate_threshold: 1_582_812.0,
            taxpayer_credit: 30_840.0,
            social_rate: 0.292,
            health_rate: 0.135,
            assessment_share: 0.5,
            social_min_monthly_base: 13_191.0,
            social_max_annual_base: 2_110_416.0,
            health_min_monthly_base: 21_984.0,
            crafts: FlatRate { rate: 0.80, cap: 1_600_000.0 },
            trades: FlatRate { rate: 0.60, cap: 1_200_000.0 },
            professional_services: FlatRate { rate: 0.40, cap: 800_000.0 },
            rental: FlatRate { rate: 0.30, cap: 600_000.0 },
        }
    }

    pub fn flat_rate(&self, activity: ActivityType) -> FlatRate {
        match activity {
            ActivityType::Crafts => self.crafts,
            ActivityType::Trades => self.trades,
            ActivityType::ProfessionalServices => self.professional_services,
            ActivityType::Rental => self.rental,
        }
    }
}

impl Default for TaxYearRules {
    fn default() -> Self {
        Self::cz_2024()
    }
}
