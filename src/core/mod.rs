mod compare;
mod engine;
mod error;
mod phase;
mod solver;
mod tax;
mod types;

pub use compare::compare_scenarios;
pub use engine::simulate;
pub use error::EngineError;
pub use phase::{phase_at, resolve_person_month};
pub use solver::{
    JointSearchOutcome, NO_FEASIBLE_AGE, NO_FEASIBLE_JOINT_AGE, SearchConfig, SearchOutcome,
    SearchStrategy, SpendSolveConfig, SpendSolveIteration, SpendSolveResult, candidate_ages,
    find_earliest_feasible, find_earliest_joint, solve_max_spend,
};
pub use tax::{ISRAEL_2025_LABEL, TaxBreakdown, TaxCalculator};
pub use types::{
    HouseholdParams, IncomeStep, MAX_AGE, MonthRecord, OldAgePension, OneTimeEvent,
    PensionIncomeMode, PersonCashflow, PersonId, PersonMonth, PersonParams, PersonSummary, Phase,
    ScenarioRow, SimulationResult, SocialInsuranceConfig, SpendStep, TaxBracket, TaxBracketTable, TaxSchedule,
};
