use super::error::EngineError;
use super::phase::resolve_person_month;
use super::tax::TaxCalculator;
use super::types::{
    HouseholdParams, MonthRecord, PensionIncomeMode, PersonCashflow, PersonId, PersonMonth,
    PersonParams, PersonSummary, SimulationResult,
};

/// Runs the household month by month until the younger person reaches
/// `end_age`, or until liquid savings fall below the floor.
///
/// Cashflows use an end-of-month convention: the month's net position and
/// hishtalmut credit are added to liquid before that month's growth.
pub fn simulate(params: &HouseholdParams) -> Result<SimulationResult, EngineError> {
    params.validate()?;

    let calc = TaxCalculator::new(&params.tax);
    let r_month = params.monthly_return();
    let horizon = params.horizon_months();

    let mut liquid = params.liquid_balance_now;
    let mut pension = [
        params.primary.pension_balance_now,
        params.spouse.pension_balance_now,
    ];
    let mut events_applied = vec![false; params.one_time_events.len()];
    let mut records = Vec::with_capacity(horizon as usize);
    let mut failure = None;

    for month_index in 0..horizon {
        let primary = resolve_person_month(&params.primary, month_index, pension[0], &calc)?;
        let spouse = resolve_person_month(&params.spouse, month_index, pension[1], &calc)?;

        let cash_in = primary.cash_available() + spouse.cash_available();
        let spend = params.spend_at(primary.age);
        let one_time_event = take_due_events(params, primary.age, &mut events_applied);
        let net_position = cash_in - spend + one_time_event;
        let hishtalmut_total = primary.hishtalmut_contribution + spouse.hishtalmut_contribution;

        liquid = (liquid + net_position + hishtalmut_total) * (1.0 + r_month);
        let primary = advance_pension(&mut pension[0], primary, r_month, params.pension_income_mode);
        let spouse = advance_pension(&mut pension[1], spouse, r_month, params.pension_income_mode);

        records.push(MonthRecord {
            month_index,
            primary,
            spouse,
            cash_in,
            spend,
            one_time_event,
            hishtalmut_total,
            pension_income_total: primary.cashflow.pension_income_net
                + spouse.cashflow.pension_income_net,
            liquid_flow: net_position,
            liquid_draw: (-net_position).max(0.0),
            liquid_save: net_position.max(0.0),
            liquid_balance: liquid,
        });

        if liquid < params.liquid_floor {
            let age = primary.cashflow.age;
            tracing::debug!(month_index, age, liquid, "liquid savings exhausted");
            failure = Some((month_index, failure_reason(params.liquid_floor, month_index, age)));
            break;
        }
    }

    let liquid_end = records
        .last()
        .map_or(params.liquid_balance_now, |r| r.liquid_balance);
    let first_pension_month = params
        .primary
        .pension_start_month()
        .min(params.spouse.pension_start_month());
    let liquid_at_first_pension_start = records
        .get(first_pension_month as usize)
        .map_or(0.0, |r| r.liquid_balance);

    let (ok, failure_month, failure_reason) = match failure {
        Some((month, reason)) => (false, Some(month), reason),
        None => (true, None, String::new()),
    };

    Ok(SimulationResult {
        ok,
        failure_reason,
        failure_month,
        primary: summarize_person(&records, &params.primary, PersonId::Primary),
        spouse: summarize_person(&records, &params.spouse, PersonId::Spouse),
        records,
        liquid_at_first_pension_start,
        liquid_end,
    })
}

fn failure_reason(floor: f64, month_index: u32, age: f64) -> String {
    if floor == 0.0 {
        format!("liquid depleted at month {month_index} (age {age:.1})")
    } else {
        format!("liquid fell below the {floor:.0} floor at month {month_index} (age {age:.1})")
    }
}

fn take_due_events(params: &HouseholdParams, primary_age: f64, applied: &mut [bool]) -> f64 {
    let mut total = 0.0;
    for (event, done) in params.one_time_events.iter().zip(applied.iter_mut()) {
        if !*done && primary_age >= event.age {
            total += event.amount;
            *done = true;
        }
    }
    total
}

/// Contributions are added before growth. In annuity mode the income drawn
/// via the divisor leaves the principal untouched.
fn advance_pension(
    balance: &mut f64,
    cashflow: PersonCashflow,
    r_month: f64,
    mode: PensionIncomeMode,
) -> PersonMonth {
    let opening = *balance;
    let mut principal = opening + cashflow.pension_contribution();
    if mode == PensionIncomeMode::Drawdown {
        principal = (principal - cashflow.pension_income_gross).max(0.0);
    }
    *balance = principal * (1.0 + r_month);
    PersonMonth {
        cashflow,
        pension_balance_start: opening,
        pension_balance: *balance,
    }
}

fn summarize_person(records: &[MonthRecord], person: &PersonParams, id: PersonId) -> PersonSummary {
    let Some(record) = records.get(person.pension_start_month() as usize) else {
        return PersonSummary::default();
    };
    let month = record.person(id);
    PersonSummary {
        reached_pension_start: true,
        pension_balance_at_start: month.pension_balance_start,
        pension_income_month: month.pension_balance_start / person.pension_divisor,
        liquid_at_pension_start: record.liquid_balance,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::types::{OldAgePension, OneTimeEvent, Phase, SpendStep, TaxSchedule};
    use proptest::prelude::{prop_assert, prop_assert_eq, proptest};

    const EPS: f64 = 1e-6;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= EPS,
            "expected {expected}, got {actual}"
        );
    }

    fn assert_rel(actual: f64, expected: f64, rel: f64) {
        assert!(
            (actual - expected).abs() <= expected.abs() * rel,
            "expected {expected}, got {actual}, relative tolerance {rel}"
        );
    }

    pub(crate) fn earner(age_now: f64, retire_age: f64, pension_start_age: f64) -> PersonParams {
        PersonParams {
            age_now,
            retire_age,
            pension_start_age,
            gross_income_month: 30_000.0,
            employee_pension_rate: 0.06,
            employer_pension_rate: 0.125,
            hishtalmut_rate: 0.10,
            hishtalmut_cap_month: 1_571.2,
            pension_balance_now: 0.0,
            pension_divisor: 200.0,
            old_age_pension: None,
            income_schedule: Vec::new(),
            pension_tax_free_month: 0.0,
        }
    }

    pub(crate) fn non_earner(age_now: f64, pension_start_age: f64) -> PersonParams {
        PersonParams {
            gross_income_month: 0.0,
            ..earner(age_now, age_now, pension_start_age)
        }
    }

    /// Age 35, retire 50, pension 60, horizon 95, 5% real, one earner on 30k.
    pub(crate) fn single_earner_household() -> HouseholdParams {
        HouseholdParams {
            primary: earner(35.0, 50.0, 60.0),
            spouse: non_earner(35.0, 60.0),
            liquid_balance_now: 500_000.0,
            spend_month: 12_000.0,
            real_annual_return: 0.05,
            end_age: 95.0,
            tax: TaxSchedule::israel_2025(),
            expense_schedule: Vec::new(),
            one_time_events: Vec::new(),
            liquid_floor: 0.0,
            pension_income_mode: PensionIncomeMode::Annuity,
        }
    }

    fn idle_household(pension: f64, r_annual: f64, end_age: f64) -> HouseholdParams {
        let mut person = non_earner(40.0, 150.0);
        person.pension_balance_now = pension;
        HouseholdParams {
            primary: person,
            spouse: non_earner(40.0, 150.0),
            liquid_balance_now: 0.0,
            spend_month: 0.0,
            real_annual_return: r_annual,
            end_age,
            tax: TaxSchedule::israel_2025(),
            expense_schedule: Vec::new(),
            one_time_events: Vec::new(),
            liquid_floor: 0.0,
            pension_income_mode: PensionIncomeMode::Annuity,
        }
    }

    #[test]
    fn single_earner_reference_plan_is_feasible() {
        let params = single_earner_household();
        let result = simulate(&params).expect("valid params");

        assert!(result.ok, "unexpected failure: {}", result.failure_reason);
        assert!(result.failure_reason.is_empty());
        assert!(result.liquid_end >= 0.0);
        assert_eq!(result.records.len(), 720);
        assert!(result.primary.reached_pension_start);
        assert!(result.primary.pension_income_month > 0.0);
    }

    #[test]
    fn deficit_while_working_fails_in_first_month() {
        let mut params = single_earner_household();
        params.liquid_balance_now = 0.0;
        params.spend_month = 40_000.0;
        let result = simulate(&params).expect("valid params");

        assert!(!result.ok);
        assert_eq!(result.failure_month, Some(0));
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.failure_reason, "liquid depleted at month 0 (age 35.0)");
        assert_eq!(result.records[0].primary.cashflow.phase, Phase::Work);
    }

    #[test]
    fn thin_savings_fail_during_bridge_phase() {
        let mut params = single_earner_household();
        params.liquid_balance_now = 0.0;
        params.spend_month = 17_000.0;
        let result = simulate(&params).expect("valid params");

        assert!(!result.ok);
        let last = result.records.last().expect("records kept up to failure");
        assert_eq!(last.primary.cashflow.phase, Phase::Bridge);
        assert!(last.liquid_balance < 0.0);
        assert_eq!(result.failure_month, Some(last.month_index));
        assert!(result.failure_reason.starts_with("liquid depleted at month"));
        assert!(result.records[..result.records.len() - 1]
            .iter()
            .all(|r| r.liquid_balance >= 0.0));
    }

    #[test]
    fn identical_inputs_produce_identical_runs() {
        let params = single_earner_household();
        let a = simulate(&params).expect("valid params");
        let b = simulate(&params).expect("valid params");
        assert_eq!(a, b);
        let json_a = serde_json::to_string(&a).expect("serialize");
        let json_b = serde_json::to_string(&b).expect("serialize");
        assert_eq!(json_a, json_b);
    }

    #[test]
    fn idle_pension_compounds_at_monthly_return() {
        let params = idle_household(250_000.0, 0.04, 50.0);
        let result = simulate(&params).expect("valid params");
        let r_month = params.monthly_return();

        assert!(result.ok);
        assert_eq!(result.records.len(), 120);
        for record in &result.records {
            let n = record.month_index as i32 + 1;
            assert_rel(record.primary.pension_balance, 250_000.0 * (1.0 + r_month).powi(n), 1e-12);
        }
        assert_rel(result.records[119].primary.pension_balance, 250_000.0 * 1.04f64.powi(10), 1e-9);
    }

    #[test]
    fn annuity_mode_leaves_pension_principal_compounding() {
        // Modelling choice: the divisor is an annuity factor, so paying
        // pension income does not reduce the principal.
        let mut params = idle_household(1_000_000.0, 0.03, 70.0);
        params.primary.retire_age = 40.0;
        params.primary.pension_start_age = 40.0;
        let result = simulate(&params).expect("valid params");
        let r_month = params.monthly_return();

        let first = &result.records[0];
        assert_approx(first.primary.cashflow.pension_income_gross, 1_000_000.0 / 200.0);
        assert_rel(
            result.records[11].primary.pension_balance,
            1_000_000.0 * (1.0 + r_month).powi(12),
            1e-12,
        );
        assert!(
            result.records[12].primary.cashflow.pension_income_gross
                > first.primary.cashflow.pension_income_gross
        );
        assert!(result.liquid_end > 0.0);
    }

    #[test]
    fn drawdown_mode_debits_pension_income_from_principal() {
        let mut params = idle_household(1_000_000.0, 0.0, 45.0);
        params.primary.retire_age = 40.0;
        params.primary.pension_start_age = 40.0;
        params.pension_income_mode = PensionIncomeMode::Drawdown;
        let result = simulate(&params).expect("valid params");

        let first = &result.records[0];
        assert_approx(first.primary.pension_balance, 1_000_000.0 - 5_000.0);
        let second = &result.records[1];
        assert_approx(second.primary.cashflow.pension_income_gross, 995_000.0 / 200.0);
    }

    #[test]
    fn pension_income_is_read_before_monthly_growth() {
        let mut params = idle_household(600_000.0, 0.06, 45.0);
        params.primary.retire_age = 40.0;
        params.primary.pension_start_age = 40.0;
        let result = simulate(&params).expect("valid params");
        let r_month = params.monthly_return();

        let second = &result.records[1];
        assert_approx(second.primary.pension_balance_start, 600_000.0 * (1.0 + r_month));
        assert_approx(
            second.primary.cashflow.pension_income_gross,
            600_000.0 * (1.0 + r_month) / 200.0,
        );
    }

    #[test]
    fn work_month_credits_net_and_hishtalmut_to_liquid() {
        let mut params = single_earner_household();
        params.real_annual_return = 0.0;
        params.liquid_balance_now = 1_000.0;
        let result = simulate(&params).expect("valid params");
        let first = &result.records[0];
        let flow = first.primary.cashflow;

        assert_approx(first.cash_in, flow.net_to_hand);
        assert_approx(first.liquid_flow, flow.net_to_hand - 12_000.0);
        assert_approx(first.liquid_save, first.liquid_flow);
        assert_approx(first.liquid_draw, 0.0);
        assert_approx(
            first.liquid_balance,
            1_000.0 + flow.net_to_hand - 12_000.0 + 1_571.2,
        );
        assert_approx(first.primary.pension_balance, 0.06 * 30_000.0 + 0.125 * 30_000.0);
    }

    #[test]
    fn bridge_month_draws_spend_from_liquid() {
        let mut params = single_earner_household();
        params.primary.retire_age = 35.0;
        params.real_annual_return = 0.0;
        let result = simulate(&params).expect("valid params");
        let first = &result.records[0];

        assert_eq!(first.primary.cashflow.phase, Phase::Bridge);
        assert_approx(first.liquid_draw, 12_000.0);
        assert_approx(first.liquid_save, 0.0);
        assert_approx(first.liquid_balance, 488_000.0);
    }

    #[test]
    fn summary_is_read_at_pension_start_record() {
        let params = single_earner_household();
        let result = simulate(&params).expect("valid params");
        let start = &result.records[300];

        assert_eq!(start.primary.cashflow.phase, Phase::PostPension);
        assert_eq!(result.records[299].primary.cashflow.phase, Phase::Bridge);
        assert_approx(result.primary.pension_balance_at_start, start.primary.pension_balance_start);
        assert_approx(
            result.primary.pension_income_month,
            start.primary.cashflow.pension_income_gross,
        );
        assert_approx(result.primary.liquid_at_pension_start, start.liquid_balance);
        assert_approx(result.liquid_at_first_pension_start, start.liquid_balance);
        assert_approx(
            result.liquid_end,
            result.records.last().expect("records").liquid_balance,
        );
    }

    #[test]
    fn horizon_is_anchored_to_younger_person() {
        let mut params = single_earner_household();
        params.primary = earner(40.0, 50.0, 60.0);
        params.spouse = non_earner(35.0, 60.0);
        let result = simulate(&params).expect("valid params");

        assert_eq!(params.horizon_months(), 720);
        assert_eq!(result.records.len(), 720);
        let last = result.records.last().expect("records");
        assert_approx(last.primary.cashflow.age, 40.0 + 719.0 / 12.0);
        assert_approx(last.spouse.cashflow.age, 35.0 + 719.0 / 12.0);
    }

    #[test]
    fn old_age_pension_adds_to_household_cash() {
        let mut params = idle_household(0.0, 0.0, 72.0);
        params.primary.age_now = 70.0;
        params.primary.retire_age = 70.0;
        params.primary.pension_start_age = 70.0;
        params.spouse.age_now = 70.0;
        params.spouse.retire_age = 70.0;
        params.spouse.pension_start_age = 70.0;
        params.primary.old_age_pension = Some(OldAgePension {
            amount_month: 2_000.0,
            start_age: 70.0,
        });
        params.spend_month = 1_500.0;
        let result = simulate(&params).expect("valid params");

        assert!(result.ok);
        assert_approx(result.records[0].cash_in, 2_000.0);
        assert_approx(result.liquid_end, 24.0 * 500.0);
    }

    #[test]
    fn one_time_events_apply_once_and_expense_schedule_changes_spend() {
        let mut params = single_earner_household();
        params.real_annual_return = 0.0;
        params.one_time_events = vec![OneTimeEvent {
            age: 36.0,
            amount: -50_000.0,
            label: "car".to_string(),
        }];
        params.expense_schedule = vec![SpendStep {
            from_age: 37.0,
            spend_month: 9_000.0,
        }];
        let result = simulate(&params).expect("valid params");

        let events: Vec<_> = result
            .records
            .iter()
            .filter(|r| r.one_time_event != 0.0)
            .map(|r| r.month_index)
            .collect();
        assert_eq!(events, vec![12]);
        assert_approx(result.records[12].one_time_event, -50_000.0);
        assert_approx(result.records[23].spend, 12_000.0);
        assert_approx(result.records[24].spend, 9_000.0);
    }

    #[test]
    fn liquid_floor_marks_plan_infeasible_earlier() {
        let mut params = single_earner_household();
        params.primary.retire_age = 35.0;
        params.real_annual_return = 0.0;
        params.liquid_floor = 450_000.0;
        let result = simulate(&params).expect("valid params");

        assert!(!result.ok);
        // 500k - 12k * 5 = 440k is the first balance below the floor.
        assert_eq!(result.failure_month, Some(4));
        assert!(result.failure_reason.contains("floor"));
    }

    #[test]
    fn configuration_errors_are_raised_before_simulating() {
        let mut early = single_earner_household();
        early.primary.retire_age = 30.0;
        assert!(matches!(simulate(&early), Err(EngineError::Configuration(_))));

        let mut late = single_earner_household();
        late.primary.retire_age = 61.0;
        assert!(matches!(simulate(&late), Err(EngineError::Configuration(_))));

        let mut divisor = single_earner_household();
        divisor.spouse.pension_divisor = 0.0;
        assert!(matches!(simulate(&divisor), Err(EngineError::Configuration(_))));

        let mut negative = single_earner_household();
        negative.liquid_balance_now = -1.0;
        assert!(matches!(simulate(&negative), Err(EngineError::Configuration(_))));

        let mut horizon = single_earner_household();
        horizon.end_age = 30.0;
        assert!(matches!(simulate(&horizon), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn absurd_ages_are_rejected_without_allocating() {
        let mut far_end = single_earner_household();
        far_end.end_age = 1.0e12;
        assert!(matches!(simulate(&far_end), Err(EngineError::Configuration(_))));

        let mut far_pension = single_earner_household();
        far_pension.spouse.pension_start_age = 1.0e12;
        assert!(matches!(simulate(&far_pension), Err(EngineError::Configuration(_))));

        let mut oldest = single_earner_household();
        oldest.end_age = 150.0;
        assert!(simulate(&oldest).is_ok());
        assert_eq!(oldest.horizon_months(), 1_380);
    }

    proptest! {
        #![proptest_config(proptest::test_runner::Config::with_cases(24))]

        #[test]
        fn prop_truncation_matches_feasibility(
            liquid in 0u32..800_000,
            spend in 5_000u32..30_000,
            retire_offset in 0u32..25,
            r_bp in 0u32..600
        ) {
            let mut params = single_earner_household();
            params.liquid_balance_now = liquid as f64;
            params.spend_month = spend as f64;
            params.primary.retire_age = 35.0 + retire_offset as f64;
            params.real_annual_return = r_bp as f64 / 10_000.0;
            let result = simulate(&params).expect("valid params");

            if result.ok {
                prop_assert_eq!(result.records.len(), params.horizon_months() as usize);
                prop_assert!(result.records.iter().all(|r| r.liquid_balance >= 0.0));
            } else {
                let last = result.records.last().expect("failing month is recorded");
                prop_assert!(last.liquid_balance < 0.0);
                prop_assert_eq!(result.failure_month, Some(last.month_index));
            }
            for (idx, record) in result.records.iter().enumerate() {
                prop_assert_eq!(record.month_index as usize, idx);
            }
        }
    }
}
