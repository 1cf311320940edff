use serde::{Deserialize, Serialize};

use crate::round_czk;
use crate::rules::{ActivityType, TaxYearRules};

/// Annual figures of a sole trader.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TaxInput {
    pub gross_income: f64,
    pub tax_deductible_expenses: f64,
    pub activity: ActivityType,
    #[serde(default = "default_months")]
    pub months_active: u32,
    #[serde(default = "default_true")]
    pub apply_taxpayer_credit: bool,
}

impl TaxInput {
    pub fn new(gross_income: f64, tax_deductible_expenses: f64, activity: ActivityType) -> Self {
        Self {
            gross_income,
            tax_deductible_expenses,
            activity,
            months_active: default_months(),
            apply_taxpayer_credit: true,
        }
    }
}

fn default_months() -> u32 {
    12
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpenseMethod {
    Actual,
    FlatRate,
}

/// Full result for one expense method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodResult {
    pub method: ExpenseMethod,
    pub expenses: f64,
    pub profit: f64,
    pub income_tax_before_credit: f64,
    pub taxpayer_credit: f64,
    pub income_tax: f64,
    pub social_insurance: f64,
    pub health_insurance: f64,
    pub total_burden: f64,
    pub net_income: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxComparison {
    pub actual_expenses_method: MethodResult,
    pub flat_rate_method: MethodResult,
    pub recommended_method: ExpenseMethod,
    pub tax_savings: f64,
}

/// Two-bracket progressive tax on `tax_base`.
pub fn calculate_income_tax(tax_base: f64, rules: &TaxYearRules) -> f64 {
    if tax_base <= 0.0 {
        return 0.0;
    }
    if tax_base <= rules.higher_rate_threshold {
        return round_czk(tax_base * rules.base_rate);
    }
    let lower = round_czk(rules.higher_rate_threshold * rules.base_rate);
    let upper = round_czk((tax_base - rules.higher_rate_threshold) * rules.higher_rate);
    lower + upper
}

/// Flat-rate expenses for the activity, capped at the annual ceiling.
pub fn flat_rate_expenses(gross_income: f64, activity: ActivityType, rules: &TaxYearRules) -> f64 {
    let flat = rules.flat_rate(activity);
    round_czk(gross_income.max(0.0) * flat.rate).min(flat.cap)
}

/// Annual social insurance on the profit.
pub fn calculate_social_insurance(profit: f64, months: u32, rules: &TaxYearRules) -> f64 {
    let minimum = round_czk(rules.social_min_monthly_base * f64::from(months));
    let base = assessment_base(profit, rules)
        .max(minimum)
        .min(rules.social_max_annual_base);
    round_czk(base * rules.social_rate)
}

/// Annual health insurance on the profit.
pub fn calculate_health_insurance(profit: f64, months: u32, rules: &TaxYearRules) -> f64 {
    let minimum = round_czk(rules.health_min_monthly_base * f64::from(months));
    let base = assessment_base(profit, rules).max(minimum);
    round_czk(base * rules.health_rate)
}

fn assessment_base(profit: f64, rules: &TaxYearRules) -> f64 {
    round_czk(profit.max(0.0) * rules.assessment_share)
}

/// Evaluate one method given the expenses it allows.
pub fn evaluate_method(
    input: &TaxInput,
    method: ExpenseMethod,
    expenses: f64,
    rules: &TaxYearRules,
) -> MethodResult {
    let expenses = round_czk(expenses);
    let profit = round_czk(input.gross_income - expenses).max(0.0);
    let income_tax_before_credit = calculate_income_tax(profit, rules);
    let taxpayer_credit = if input.apply_taxpayer_credit {
        income_tax_before_credit.min(rules.taxpayer_credit)
    } else {
        0.0
    };
    let income_tax = income_tax_before_credit - taxpayer_credit;
    let social_insurance = calculate_social_insurance(profit, input.months_active, rules);
    let health_insurance = calculate_health_insurance(profit, input.months_active, rules);
    let total_burden = income_tax + social_insurance + health_insurance;

    MethodResult {
        method,
        expenses,
        profit,
        income_tax_before_credit,
        taxpayer_credit,
        income_tax,
        social_insurance,
        health_insurance,
        total_burden,
        net_income: round_czk(input.gross_income - expenses - total_burden),
    }
}

/// Compute both methods and recommend the one with strictly lower income
/// tax; ties keep actual expenses.
pub fn compare_methods(input: &TaxInput, rules: &TaxYearRules) -> TaxComparison {
    let actual = evaluate_method(
        input,
        ExpenseMethod::Actual,
        input.tax_deductible_expenses,
        rules,
    );
    let flat = evaluate_method(
        input,
        ExpenseMethod::FlatRate,
        flat_rate_expenses(input.gross_income, input.activity, rules),
        rules,
    );

    let recommended_method = if flat.income_tax < actual.income_tax {
        ExpenseMethod::FlatRate
    } else {
        ExpenseMethod::Actual
    };
    let tax_savings = (actual.income_tax - flat.income_tax).abs();

    TaxComparison {
        actual_expenses_method: actual,
        flat_rate_method: flat,
        recommended_method,
        tax_savings,
    }
}
