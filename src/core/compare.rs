use rayon::prelude::*;

use super::engine::simulate;
use super::error::EngineError;
use super::types::{HouseholdParams, PersonId, ScenarioRow, SimulationResult};

/// Runs one simulation per candidate retirement age for `person` and returns
/// one row per age, in input order. Runs are independent and evaluated in
/// parallel; any invalid age fails the whole batch.
pub fn compare_scenarios(
    params: &HouseholdParams,
    person: PersonId,
    ages: &[f64],
) -> Result<Vec<ScenarioRow>, EngineError> {
    params.validate()?;
    tracing::debug!(?person, scenarios = ages.len(), "comparing retirement ages");

    ages.par_iter()
        .map(|&age| {
            let candidate = params.with_retire_age(person, age);
            let result = simulate(&candidate)?;
            Ok(scenario_row(&candidate, person, age, &result))
        })
        .collect()
}

fn scenario_row(
    params: &HouseholdParams,
    person: PersonId,
    retirement_age: f64,
    result: &SimulationResult,
) -> ScenarioRow {
    let own = result.summary(person);
    let other = result.summary(person.other());
    ScenarioRow {
        retirement_age,
        person,
        ok: result.ok,
        failure_reason: result.failure_reason.clone(),
        liquid_at_pension_start: own.liquid_at_pension_start,
        pension_at_start: own.pension_balance_at_start,
        pension_income_month: own.pension_income_month,
        other_pension_at_start: other.pension_balance_at_start,
        other_pension_income_month: other.pension_income_month,
        liquid_end: result.liquid_end,
        working_years: retirement_age - params.person(person).age_now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::tests::single_earner_household;

    #[test]
    fn rows_follow_input_order() {
        let params = single_earner_household();
        let ages = [55.0, 40.0, 50.5, 45.0];
        let rows = compare_scenarios(&params, PersonId::Primary, &ages).expect("valid ages");

        assert_eq!(rows.len(), ages.len());
        for (row, age) in rows.iter().zip(ages) {
            assert_eq!(row.retirement_age, age);
            assert_eq!(row.person, PersonId::Primary);
            assert!((row.working_years - (age - 35.0)).abs() < 1e-12);
        }
    }

    #[test]
    fn rows_match_individual_runs() {
        let params = single_earner_household();
        let ages = [36.0, 48.0, 60.0];
        let rows = compare_scenarios(&params, PersonId::Primary, &ages).expect("valid ages");

        for (row, age) in rows.iter().zip(ages) {
            let result =
                simulate(&params.with_retire_age(PersonId::Primary, age)).expect("valid age");
            assert_eq!(row.ok, result.ok);
            assert_eq!(row.failure_reason, result.failure_reason);
            assert_eq!(row.liquid_end, result.liquid_end);
            assert_eq!(row.pension_at_start, result.primary.pension_balance_at_start);
            assert_eq!(row.pension_income_month, result.primary.pension_income_month);
            assert_eq!(row.other_pension_at_start, result.spouse.pension_balance_at_start);
            assert_eq!(
                row.liquid_at_pension_start,
                result.primary.liquid_at_pension_start
            );
        }
    }

    #[test]
    fn later_retirement_builds_a_larger_pension() {
        let params = single_earner_household();
        let rows =
            compare_scenarios(&params, PersonId::Primary, &[45.0, 55.0]).expect("valid ages");
        assert!(rows[1].pension_at_start > rows[0].pension_at_start);
    }

    #[test]
    fn spouse_rows_report_the_primary_as_other() {
        let params = single_earner_household();
        let rows = compare_scenarios(&params, PersonId::Spouse, &[40.0]).expect("valid ages");
        let direct =
            simulate(&params.with_retire_age(PersonId::Spouse, 40.0)).expect("valid age");
        assert_eq!(rows[0].person, PersonId::Spouse);
        assert_eq!(rows[0].other_pension_at_start, direct.primary.pension_balance_at_start);
    }

    #[test]
    fn empty_age_list_gives_no_rows() {
        let params = single_earner_household();
        let rows = compare_scenarios(&params, PersonId::Primary, &[]).expect("valid");
        assert!(rows.is_empty());
    }

    #[test]
    fn invalid_age_fails_the_batch() {
        let params = single_earner_household();
        let err = compare_scenarios(&params, PersonId::Primary, &[50.0, 61.0])
            .expect_err("retire after pension start");
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
