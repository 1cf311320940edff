//! Tax calculator endpoints.

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use studio_core::StudioError;
use studio_tax::{calculate_vat, compare_methods, ActivityType, TaxComparison, TaxInput, VatSummary};

use crate::rest::{ApiResult, AppState};

#[derive(Debug, Deserialize)]
pub struct TaxRequest {
    pub gross_income: f64,
    #[serde(default)]
    pub tax_deductible_expenses: f64,
    #[serde(default)]
    pub activity: Option<ActivityType>,
    #[serde(default)]
    pub months_active: Option<u32>,
    #[serde(default)]
    pub apply_taxpayer_credit: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct VatRequest {
    pub collected: f64,
    pub paid: f64,
}

fn validate_amount(name: &str, value: f64) -> Result<(), StudioError> {
    if !value.is_finite() || value < 0.0 {
        return Err(StudioError::Validation(format!(
            "'{name}' must be a non-negative number"
        )));
    }
    Ok(())
}

/// POST /v1/tax/calculate
pub async fn calculate_tax(
    State(state): State<AppState>,
    Json(req): Json<TaxRequest>,
) -> ApiResult<Json<TaxComparison>> {
    validate_amount("gross_income", req.gross_income)?;
    validate_amount("tax_deductible_expenses", req.tax_deductible_expenses)?;
    let months_active = req.months_active.unwrap_or(12);
    if !(1..=12).contains(&months_active) {
        return Err(StudioError::Validation("'months_active' must be between 1 and 12".into()).into());
    }

    let input = TaxInput {
        gross_income: req.gross_income,
        tax_deductible_expenses: req.tax_deductible_expenses,
        activity: req.activity.unwrap_or(state.tax_defaults.activity),
        months_active,
        apply_taxpayer_credit: req
            .apply_taxpayer_credit
            .unwrap_or(state.tax_defaults.apply_taxpayer_credit),
    };
    metrics::counter!("api.tax.calculations").increment(1);
    Ok(Json(compare_methods(&input, &state.tax_rules)))
}

/// POST /v1/tax/vat
pub async fn calculate_vat_liability(Json(req): Json<VatRequest>) -> ApiResult<Json<VatSummary>> {
    validate_amount("collected", req.collected)?;
    validate_amount("paid", req.paid)?;
    Ok(Json(calculate_vat(req.collected, req.paid)))
}
