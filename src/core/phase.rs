use super::error::EngineError;
use super::tax::TaxCalculator;
use super::types::{Phase, PersonCashflow, PersonParams};

/// Phase at `age`. A month exactly on a boundary belongs to the later phase.
pub fn phase_at(person: &PersonParams, age: f64) -> Phase {
    if age < person.retire_age {
        Phase::Work
    } else if age < person.pension_start_age {
        Phase::Bridge
    } else {
        Phase::PostPension
    }
}

/// Resolves one person's cashflow for `month_index`.
///
/// `pension_balance` is the opening balance of the month; post-pension income
/// is read from it before that month's growth.
pub fn resolve_person_month(
    person: &PersonParams,
    month_index: u32,
    pension_balance: f64,
    calc: &TaxCalculator<'_>,
) -> Result<PersonCashflow, EngineError> {
    let age = person.age_at(month_index);
    let phase = phase_at(person, age);
    let mut flow = PersonCashflow {
        age,
        phase,
        gross_income: 0.0,
        income_tax: 0.0,
        social_insurance: 0.0,
        employee_pension_contribution: 0.0,
        employer_pension_contribution: 0.0,
        hishtalmut_contribution: 0.0,
        net_to_hand: 0.0,
        pension_income_gross: 0.0,
        pension_income_net: 0.0,
        old_age_pension: 0.0,
    };

    match phase {
        Phase::Work => {
            let gross = person.gross_income_at(age);
            let taxes = calc.net_from_gross(gross)?;
            flow.gross_income = gross;
            flow.income_tax = taxes.income_tax;
            flow.social_insurance = taxes.social_insurance;
            flow.employee_pension_contribution = person.employee_pension_rate * gross;
            flow.employer_pension_contribution = person.employer_pension_rate * gross;
            flow.hishtalmut_contribution =
                (person.hishtalmut_rate * gross).min(person.hishtalmut_cap_month);
            flow.net_to_hand = taxes.net - flow.employee_pension_contribution;
        }
        Phase::Bridge => {}
        Phase::PostPension => {
            let gross = (pension_balance / person.pension_divisor).max(0.0);
            let taxable = (gross - person.pension_tax_free_month).max(0.0);
            let taxes = calc.net_from_gross(taxable)?;
            flow.pension_income_gross = gross;
            flow.income_tax = taxes.income_tax;
            flow.social_insurance = taxes.social_insurance;
            flow.pension_income_net = gross - taxes.total_deductions();
            if let Some(old_age) = person.old_age_pension {
                if age >= old_age.start_age {
                    flow.old_age_pension = old_age.amount_month;
                }
            }
        }
    }

    Ok(flow)
}
