use serde::Serialize;

use super::error::EngineError;
use super::types::{SocialInsuranceConfig, TaxBracket, TaxBracketTable, TaxSchedule};

pub const ISRAEL_2025_LABEL: &str = "2025/2026";

impl TaxSchedule {
    /// Israeli income tax brackets (annual ILS) and Bituach Leumi + health
    /// insurance rates for 2025/2026.
    pub fn israel_2025() -> Self {
        let brackets = [
            (0.0, 0.10),
            (84_120.0, 0.14),
            (120_720.0, 0.20),
            (193_800.0, 0.31),
            (269_280.0, 0.35),
            (560_280.0, 0.47),
            // 47% plus the 3% surtax
            (721_560.0, 0.50),
        ]
        .into_iter()
        .map(|(threshold, rate)| TaxBracket { threshold, rate })
        .collect();

        Self {
            label: ISRAEL_2025_LABEL.to_string(),
            brackets: TaxBracketTable::new(brackets).expect("built-in bracket table is valid"),
            social_insurance: SocialInsuranceConfig {
                low_rate: 0.0427,
                high_rate: 0.1217,
                monthly_threshold: 7_522.0,
                monthly_cap: 50_695.0,
            },
        }
    }

    pub fn by_label(label: &str) -> Option<Self> {
        match label.trim() {
            ISRAEL_2025_LABEL | "2025" | "2026" | "israel-2025" => Some(Self::israel_2025()),
            _ => None,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBreakdown {
    pub gross: f64,
    pub income_tax: f64,
    pub social_insurance: f64,
    pub net: f64,
}

impl TaxBreakdown {
    pub fn total_deductions(&self) -> f64 {
        self.income_tax + self.social_insurance
    }
}

/// Income tax and social insurance on a generic gross monthly amount.
///
/// Salary and pension withdrawals go through the same calculator.
#[derive(Copy, Clone, Debug)]
pub struct TaxCalculator<'a> {
    schedule: &'a TaxSchedule,
}

impl<'a> TaxCalculator<'a> {
    pub fn new(schedule: &'a TaxSchedule) -> Self {
        Self { schedule }
    }

    pub fn income_tax(&self, annual_income: f64) -> f64 {
        if annual_income <= 0.0 {
            return 0.0;
        }
        let brackets = self.schedule.brackets.brackets();
        let mut tax = 0.0;
        for (idx, bracket) in brackets.iter().enumerate() {
            if annual_income <= bracket.threshold {
                break;
            }
            let upper = brackets
                .get(idx + 1)
                .map_or(annual_income, |next| annual_income.min(next.threshold));
            tax += bracket.rate * (upper - bracket.threshold).max(0.0);
        }
        tax
    }

    pub fn social_insurance(&self, monthly_income: f64) -> f64 {
        if monthly_income <= 0.0 {
            return 0.0;
        }
        let si = &self.schedule.social_insurance;
        let low_part = monthly_income.min(si.monthly_threshold);
        let high_part = (monthly_income.min(si.monthly_cap) - si.monthly_threshold).max(0.0);
        si.low_rate * low_part + si.high_rate * high_part
    }

    pub fn net_from_gross(&self, monthly_gross: f64) -> Result<TaxBreakdown, EngineError> {
        if !monthly_gross.is_finite() || monthly_gross < 0.0 {
            return Err(EngineError::InvalidInput(format!(
                "gross monthly amount must be finite and >= 0, got {monthly_gross}"
            )));
        }
        let income_tax = self.income_tax(monthly_gross * 12.0) / 12.0;
        let social_insurance = self.social_insurance(monthly_gross);
        Ok(TaxBreakdown {
            gross: monthly_gross,
            income_tax,
            social_insurance,
            net: monthly_gross - income_tax - social_insurance,
        })
    }

    /// Total deductions as a fraction of gross; zero for non-positive gross.
    pub fn effective_rate(&self, monthly_gross: f64) -> Result<f64, EngineError> {
        let breakdown = self.net_from_gross(monthly_gross)?;
        if monthly_gross <= 0.0 {
            return Ok(0.0);
        }
        Ok(breakdown.total_deductions() / monthly_gross)
    }
}
