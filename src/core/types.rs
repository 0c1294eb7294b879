use serde::{Deserialize, Serialize};

use super::error::EngineError;

/// Upper bound on every age, so horizons stay within 1,800 months.
pub const MAX_AGE: f64 = 150.0;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Work,
    Bridge,
    PostPension,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonId {
    Primary,
    Spouse,
}

impl PersonId {
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Spouse,
            Self::Spouse => Self::Primary,
        }
    }
}

/// How post-start pension income relates to the pension principal.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PensionIncomeMode {
    /// `balance / divisor` is an annuity factor; the principal keeps compounding.
    #[default]
    Annuity,
    /// Gross pension income is debited from the principal every month.
    Drawdown,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaxBracket {
    pub threshold: f64,
    pub rate: f64,
}

/// Progressive annual income tax brackets. Validated on construction.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TaxBracketTable {
    brackets: Vec<TaxBracket>,
}

impl TaxBracketTable {
    pub fn new(brackets: Vec<TaxBracket>) -> Result<Self, EngineError> {
        let Some(first) = brackets.first() else {
            return Err(EngineError::config("tax bracket table must not be empty"));
        };
        if first.threshold != 0.0 {
            return Err(EngineError::config(
                "first tax bracket threshold must be 0",
            ));
        }
        for bracket in &brackets {
            if !bracket.threshold.is_finite() || !(0.0..=1.0).contains(&bracket.rate) {
                return Err(EngineError::config(format!(
                    "tax bracket at {} has an invalid threshold or rate {}",
                    bracket.threshold, bracket.rate
                )));
            }
        }
        for pair in brackets.windows(2) {
            if pair[1].threshold <= pair[0].threshold {
                return Err(EngineError::config(
                    "tax bracket thresholds must be strictly increasing",
                ));
            }
            if pair[1].rate < pair[0].rate {
                return Err(EngineError::config(
                    "tax bracket rates must be non-decreasing",
                ));
            }
        }
        Ok(Self { brackets })
    }

    pub fn brackets(&self) -> &[TaxBracket] {
        &self.brackets
    }
}

/// Two-tier social insurance (national + health insurance) on monthly income.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SocialInsuranceConfig {
    pub low_rate: f64,
    pub high_rate: f64,
    pub monthly_threshold: f64,
    pub monthly_cap: f64,
}

impl SocialInsuranceConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !(0.0..=1.0).contains(&self.low_rate)
            || !(0.0..=1.0).contains(&self.high_rate)
            || self.low_rate > self.high_rate
        {
            return Err(EngineError::config(
                "social insurance rates must satisfy 0 <= low_rate <= high_rate <= 1",
            ));
        }
        if !self.monthly_threshold.is_finite()
            || !self.monthly_cap.is_finite()
            || self.monthly_threshold < 0.0
            || self.monthly_threshold >= self.monthly_cap
        {
            return Err(EngineError::config(
                "social insurance threshold must be >= 0 and below the cap",
            ));
        }
        Ok(())
    }
}

/// Tax brackets and social insurance for one tax year, e.g. "2025/2026".
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TaxSchedule {
    pub label: String,
    pub brackets: TaxBracketTable,
    pub social_insurance: SocialInsuranceConfig,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OldAgePension {
    pub amount_month: f64,
    pub start_age: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncomeStep {
    pub from_age: f64,
    pub gross_income_month: f64,
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SpendStep {
    pub from_age: f64,
    pub spend_month: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OneTimeEvent {
    pub age: f64,
    pub amount: f64,
    #[serde(default)]
    pub label: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PersonParams {
    pub age_now: f64,
    pub retire_age: f64,
    pub pension_start_age: f64,
    pub gross_income_month: f64,
    pub employee_pension_rate: f64,
    pub employer_pension_rate: f64,
    pub hishtalmut_rate: f64,
    pub hishtalmut_cap_month: f64,
    pub pension_balance_now: f64,
    /// Mekadem: monthly pension income is `balance / pension_divisor`.
    pub pension_divisor: f64,
    pub old_age_pension: Option<OldAgePension>,
    pub income_schedule: Vec<IncomeStep>,
    pub pension_tax_free_month: f64,
}

impl PersonParams {
    pub fn age_at(&self, month_index: u32) -> f64 {
        self.age_now + month_index as f64 / 12.0
    }

    /// Gross salary at `age`: the last schedule step at or before it, else the base income.
    pub fn gross_income_at(&self, age: f64) -> f64 {
        self.income_schedule
            .iter()
            .rev()
            .find(|step| step.from_age <= age)
            .map(|step| step.gross_income_month)
            .unwrap_or(self.gross_income_month)
    }

    /// Month index closest to the pension start age.
    pub fn pension_start_month(&self) -> u32 {
        ((self.pension_start_age - self.age_now) * 12.0).round().max(0.0) as u32
    }

    pub fn validate(&self, who: &str) -> Result<(), EngineError> {
        for (name, value) in [
            ("age_now", self.age_now),
            ("retire_age", self.retire_age),
            ("pension_start_age", self.pension_start_age),
        ] {
            if !value.is_finite() || !(0.0..=MAX_AGE).contains(&value) {
                return Err(EngineError::config(format!(
                    "{who} {name} must be an age between 0 and {MAX_AGE}"
                )));
            }
        }
        if self.age_now > self.retire_age {
            return Err(EngineError::config(format!(
                "{who} retire_age {} cannot be before age_now {}",
                self.retire_age, self.age_now
            )));
        }
        if self.retire_age > self.pension_start_age {
            return Err(EngineError::config(format!(
                "{who} retire_age {} cannot be after pension_start_age {}",
                self.retire_age, self.pension_start_age
            )));
        }
        if !self.pension_divisor.is_finite() || self.pension_divisor <= 0.0 {
            return Err(EngineError::config(format!(
                "{who} pension_divisor must be > 0"
            )));
        }
        for (name, value) in [
            ("gross_income_month", self.gross_income_month),
            ("hishtalmut_cap_month", self.hishtalmut_cap_month),
            ("pension_balance_now", self.pension_balance_now),
            ("pension_tax_free_month", self.pension_tax_free_month),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::config(format!("{who} {name} must be >= 0")));
            }
        }
        for (name, rate) in [
            ("employee_pension_rate", self.employee_pension_rate),
            ("employer_pension_rate", self.employer_pension_rate),
            ("hishtalmut_rate", self.hishtalmut_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(EngineError::config(format!(
                    "{who} {name} must be between 0 and 1"
                )));
            }
        }
        if let Some(old_age) = self.old_age_pension {
            if !old_age.amount_month.is_finite() || old_age.amount_month < 0.0 {
                return Err(EngineError::config(format!(
                    "{who} old-age pension amount must be >= 0"
                )));
            }
            if !old_age.start_age.is_finite() {
                return Err(EngineError::config(format!(
                    "{who} old-age pension start age must be finite"
                )));
            }
        }
        let mut previous_age = f64::NEG_INFINITY;
        for step in &self.income_schedule {
            if step.from_age < self.age_now {
                return Err(EngineError::config(format!(
                    "{who} income schedule age {} cannot be before age_now {}",
                    step.from_age, self.age_now
                )));
            }
            if step.from_age > self.pension_start_age {
                return Err(EngineError::config(format!(
                    "{who} income schedule age {} cannot be after pension_start_age {}",
                    step.from_age, self.pension_start_age
                )));
            }
            if !step.gross_income_month.is_finite() || step.gross_income_month < 0.0 {
                return Err(EngineError::config(format!(
                    "{who} income schedule income {} cannot be negative",
                    step.gross_income_month
                )));
            }
            if step.from_age < previous_age {
                return Err(EngineError::config(format!(
                    "{who} income schedule must be ordered by age"
                )));
            }
            previous_age = step.from_age;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HouseholdParams {
    pub primary: PersonParams,
    pub spouse: PersonParams,
    pub liquid_balance_now: f64,
    pub spend_month: f64,
    pub real_annual_return: f64,
    pub end_age: f64,
    pub tax: TaxSchedule,
    /// Spend changes keyed to the primary person's age.
    pub expense_schedule: Vec<SpendStep>,
    /// Lump sums keyed to the primary person's age; positive is income.
    pub one_time_events: Vec<OneTimeEvent>,
    pub liquid_floor: f64,
    pub pension_income_mode: PensionIncomeMode,
}

impl HouseholdParams {
    pub fn monthly_return(&self) -> f64 {
        (1.0 + self.real_annual_return).powf(1.0 / 12.0) - 1.0
    }

    /// Months until the younger person reaches `end_age`.
    pub fn horizon_months(&self) -> u32 {
        let youngest = self.primary.age_now.min(self.spouse.age_now);
        ((self.end_age - youngest) * 12.0).round().max(0.0) as u32
    }

    pub fn person(&self, id: PersonId) -> &PersonParams {
        match id {
            PersonId::Primary => &self.primary,
            PersonId::Spouse => &self.spouse,
        }
    }

    pub fn person_mut(&mut self, id: PersonId) -> &mut PersonParams {
        match id {
            PersonId::Primary => &mut self.primary,
            PersonId::Spouse => &mut self.spouse,
        }
    }

    pub fn with_retire_age(&self, id: PersonId, retire_age: f64) -> Self {
        let mut params = self.clone();
        params.person_mut(id).retire_age = retire_age;
        params
    }

    pub fn spend_at(&self, primary_age: f64) -> f64 {
        self.expense_schedule
            .iter()
            .rev()
            .find(|step| step.from_age <= primary_age)
            .map(|step| step.spend_month)
            .unwrap_or(self.spend_month)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        self.primary.validate("primary")?;
        self.spouse.validate("spouse")?;
        self.tax.social_insurance.validate()?;

        for (name, value) in [
            ("liquid_balance_now", self.liquid_balance_now),
            ("spend_month", self.spend_month),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(EngineError::config(format!("{name} must be >= 0")));
            }
        }
        if !self.real_annual_return.is_finite() || self.real_annual_return <= -1.0 {
            return Err(EngineError::config("real_annual_return must be > -1"));
        }
        if !self.liquid_floor.is_finite() {
            return Err(EngineError::config("liquid_floor must be finite"));
        }
        if !self.end_age.is_finite()
            || self.end_age <= self.primary.age_now
            || self.end_age <= self.spouse.age_now
        {
            return Err(EngineError::config(
                "end_age must be greater than both current ages",
            ));
        }
        if self.end_age > MAX_AGE {
            return Err(EngineError::config(format!(
                "end_age must be at most {MAX_AGE}"
            )));
        }

        let mut previous_age = f64::NEG_INFINITY;
        for step in &self.expense_schedule {
            if step.from_age < self.primary.age_now || step.from_age > self.end_age {
                return Err(EngineError::config(format!(
                    "expense schedule age {} must be between age_now {} and end_age {}",
                    step.from_age, self.primary.age_now, self.end_age
                )));
            }
            if !step.spend_month.is_finite() || step.spend_month < 0.0 {
                return Err(EngineError::config(format!(
                    "expense schedule spend {} cannot be negative",
                    step.spend_month
                )));
            }
            if step.from_age < previous_age {
                return Err(EngineError::config(
                    "expense schedule must be ordered by age",
                ));
            }
            previous_age = step.from_age;
        }

        for event in &self.one_time_events {
            if event.age < self.primary.age_now || event.age > self.end_age {
                return Err(EngineError::config(format!(
                    "one-time event at age {} must be between age_now {} and end_age {}",
                    event.age, self.primary.age_now, self.end_age
                )));
            }
            if !event.amount.is_finite() {
                return Err(EngineError::config("one-time event amount must be finite"));
            }
        }
        Ok(())
    }
}

/// One person's cashflow for one month, before balances are updated.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonCashflow {
    pub age: f64,
    pub phase: Phase,
    pub gross_income: f64,
    pub income_tax: f64,
    pub social_insurance: f64,
    pub employee_pension_contribution: f64,
    pub employer_pension_contribution: f64,
    pub hishtalmut_contribution: f64,
    pub net_to_hand: f64,
    pub pension_income_gross: f64,
    pub pension_income_net: f64,
    pub old_age_pension: f64,
}

impl PersonCashflow {
    pub fn cash_available(&self) -> f64 {
        self.net_to_hand + self.pension_income_net + self.old_age_pension
    }

    pub fn pension_contribution(&self) -> f64 {
        self.employee_pension_contribution + self.employer_pension_contribution
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonMonth {
    #[serde(flatten)]
    pub cashflow: PersonCashflow,
    pub pension_balance_start: f64,
    pub pension_balance: f64,
}

/// One simulated month. Ages and phases are as of the start of the month,
/// balances as of its end.
#[derive(Copy, Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonthRecord {
    pub month_index: u32,
    pub primary: PersonMonth,
    pub spouse: PersonMonth,
    pub cash_in: f64,
    pub spend: f64,
    pub one_time_event: f64,
    pub hishtalmut_total: f64,
    pub pension_income_total: f64,
    /// Signed: positive is saved to liquid, negative is drawn from it.
    pub liquid_flow: f64,
    pub liquid_draw: f64,
    pub liquid_save: f64,
    pub liquid_balance: f64,
}

impl MonthRecord {
    pub fn person(&self, id: PersonId) -> &PersonMonth {
        match id {
            PersonId::Primary => &self.primary,
            PersonId::Spouse => &self.spouse,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonSummary {
    pub reached_pension_start: bool,
    pub pension_balance_at_start: f64,
    pub pension_income_month: f64,
    pub liquid_at_pension_start: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationResult {
    pub ok: bool,
    pub failure_reason: String,
    pub failure_month: Option<u32>,
    pub records: Vec<MonthRecord>,
    pub primary: PersonSummary,
    pub spouse: PersonSummary,
    pub liquid_at_first_pension_start: f64,
    pub liquid_end: f64,
}

impl SimulationResult {
    pub fn summary(&self, id: PersonId) -> &PersonSummary {
        match id {
            PersonId::Primary => &self.primary,
            PersonId::Spouse => &self.spouse,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioRow {
    pub retirement_age: f64,
    pub person: PersonId,
    pub ok: bool,
    pub failure_reason: String,
    pub liquid_at_pension_start: f64,
    pub pension_at_start: f64,
    pub pension_income_month: f64,
    pub other_pension_at_start: f64,
    pub other_pension_income_month: f64,
    pub liquid_end: f64,
    pub working_years: f64,
}
