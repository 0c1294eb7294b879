use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::engine::simulate;
use super::error::EngineError;
use super::types::{HouseholdParams, MAX_AGE, PersonId, SimulationResult};

pub const NO_FEASIBLE_AGE: &str = "no feasible retirement age in range";
pub const NO_FEASIBLE_JOINT_AGE: &str = "no feasible joint retirement age in range";

/// How retirement-age candidates are evaluated.
///
/// All strategies assume feasibility is monotone non-decreasing in the
/// retirement age: more working months cannot make a plan less feasible, all
/// else equal. `Linear` does not rely on it. `Parallel` evaluates every
/// candidate and keeps the lowest feasible one, so it does not rely on it
/// either. `Bisect` does, and re-checks a window below the boundary linearly.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchStrategy {
    #[default]
    Linear,
    Parallel,
    Bisect,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SearchConfig {
    pub person: PersonId,
    pub strategy: SearchStrategy,
    /// Clamped up to the person's current age.
    pub min_age: Option<f64>,
    /// Clamped down to the person's pension start age.
    pub max_age: Option<f64>,
    pub verify_window_months: u32,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            person: PersonId::Primary,
            strategy: SearchStrategy::Linear,
            min_age: None,
            max_age: None,
            verify_window_months: 12,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SearchOutcome {
    Feasible {
        retire_age: f64,
        result: SimulationResult,
    },
    Exhausted {
        reason: String,
    },
}

impl SearchOutcome {
    pub fn retire_age(&self) -> Option<f64> {
        match self {
            Self::Feasible { retire_age, .. } => Some(*retire_age),
            Self::Exhausted { .. } => None,
        }
    }

    pub fn result(&self) -> Option<&SimulationResult> {
        match self {
            Self::Feasible { result, .. } => Some(result),
            Self::Exhausted { .. } => None,
        }
    }
}

/// Retirement ages to try for `config.person`, ascending in monthly steps.
pub fn candidate_ages(params: &HouseholdParams, config: &SearchConfig) -> Vec<f64> {
    let person = params.person(config.person);
    let lower = config.min_age.unwrap_or(person.age_now).max(person.age_now);
    let upper = config
        .max_age
        .unwrap_or(person.pension_start_age)
        .min(person.pension_start_age);
    if lower > upper {
        return Vec::new();
    }

    let steps = ((upper - lower) * 12.0).round().min(MAX_AGE * 12.0) as u32;
    (0..=steps)
        .map(|m| (lower + m as f64 / 12.0).min(upper))
        .collect()
}

/// Earliest retirement age for `config.person` whose run is feasible, with
/// every other parameter held fixed.
pub fn find_earliest_feasible(
    params: &HouseholdParams,
    config: SearchConfig,
) -> Result<SearchOutcome, EngineError> {
    params.validate()?;
    let candidates = candidate_ages(params, &config);

    let found = match config.strategy {
        SearchStrategy::Linear => linear_scan(params, config.person, &candidates)?,
        SearchStrategy::Parallel => parallel_scan(params, config.person, &candidates)?,
        SearchStrategy::Bisect => bisect_scan(
            params,
            config.person,
            &candidates,
            config.verify_window_months as usize,
        )?,
    };

    Ok(match found {
        Some((retire_age, result)) => {
            tracing::info!(
                person = ?config.person,
                retire_age,
                candidates = candidates.len(),
                "found earliest feasible retirement age"
            );
            SearchOutcome::Feasible { retire_age, result }
        }
        None => {
            tracing::info!(
                person = ?config.person,
                candidates = candidates.len(),
                "no feasible retirement age"
            );
            SearchOutcome::Exhausted {
                reason: NO_FEASIBLE_AGE.to_string(),
            }
        }
    })
}

fn run_candidate(
    params: &HouseholdParams,
    person: PersonId,
    retire_age: f64,
) -> Result<SimulationResult, EngineError> {
    simulate(&params.with_retire_age(person, retire_age))
}

fn linear_scan(
    params: &HouseholdParams,
    person: PersonId,
    candidates: &[f64],
) -> Result<Option<(f64, SimulationResult)>, EngineError> {
    for &age in candidates {
        let result = run_candidate(params, person, age)?;
        if result.ok {
            return Ok(Some((age, result)));
        }
    }
    Ok(None)
}

fn parallel_scan(
    params: &HouseholdParams,
    person: PersonId,
    candidates: &[f64],
) -> Result<Option<(f64, SimulationResult)>, EngineError> {
    candidates
        .par_iter()
        .map(|&age| run_candidate(params, person, age).map(|result| (age, result)))
        .find_first(|run| run.as_ref().map_or(true, |(_, result)| result.ok))
        .transpose()
}

fn bisect_scan(
    params: &HouseholdParams,
    person: PersonId,
    candidates: &[f64],
    verify_window: usize,
) -> Result<Option<(f64, SimulationResult)>, EngineError> {
    let found = bisect_earliest(candidates.len(), verify_window, |idx| {
        let result = run_candidate(params, person, candidates[idx])?;
        tracing::debug!(idx, age = candidates[idx], ok = result.ok, "bisect step");
        Ok::<_, EngineError>((result.ok, result))
    })?;
    Ok(found.map(|(idx, result)| (candidates[idx], result)))
}

/// Lowest feasible index in `0..len`, found by bisection on the assumption
/// that feasibility is monotone, then re-checked linearly over the
/// `verify_window` indices just below the bisection boundary.
fn bisect_earliest<R, E>(
    len: usize,
    verify_window: usize,
    mut run: impl FnMut(usize) -> Result<(bool, R), E>,
) -> Result<Option<(usize, R)>, E> {
    if len == 0 {
        return Ok(None);
    }
    let (top_ok, top) = run(len - 1)?;
    if !top_ok {
        return Ok(None);
    }
    let (bottom_ok, bottom) = run(0)?;
    if bottom_ok {
        return Ok(Some((0, bottom)));
    }

    // lo is infeasible and hi feasible throughout.
    let mut lo = 0;
    let mut hi = len - 1;
    let mut hi_result = top;
    while hi - lo > 1 {
        let mid = lo + (hi - lo) / 2;
        let (ok, result) = run(mid)?;
        if ok {
            hi = mid;
            hi_result = result;
        } else {
            lo = mid;
        }
    }

    for idx in hi.saturating_sub(verify_window)..hi {
        let (ok, result) = run(idx)?;
        if ok {
            return Ok(Some((idx, result)));
        }
    }
    Ok(Some((hi, hi_result)))
}

#[derive(Clone, Debug, PartialEq)]
pub enum JointSearchOutcome {
    Feasible {
        primary_retire_age: f64,
        spouse_retire_age: f64,
        result: SimulationResult,
    },
    Exhausted {
        reason: String,
    },
}

/// Earliest month at which both persons can stop working together.
pub fn find_earliest_joint(params: &HouseholdParams) -> Result<JointSearchOutcome, EngineError> {
    params.validate()?;
    let last_month = |age_now: f64, pension_start_age: f64| {
        ((pension_start_age - age_now) * 12.0).floor().max(0.0) as u32
    };
    let max_month = last_month(params.primary.age_now, params.primary.pension_start_age).min(
        last_month(params.spouse.age_now, params.spouse.pension_start_age),
    );

    let found = (0..=max_month)
        .into_par_iter()
        .map(|month| {
            let mut candidate = params.clone();
            candidate.primary.retire_age = params.primary.age_at(month);
            candidate.spouse.retire_age = params.spouse.age_at(month);
            simulate(&candidate).map(|result| (month, result))
        })
        .find_first(|run| run.as_ref().map_or(true, |(_, result)| result.ok))
        .transpose()?;

    Ok(match found {
        Some((month, result)) => {
            tracing::info!(month, "found earliest joint retirement");
            JointSearchOutcome::Feasible {
                primary_retire_age: params.primary.age_at(month),
                spouse_retire_age: params.spouse.age_at(month),
                result,
            }
        }
        None => JointSearchOutcome::Exhausted {
            reason: NO_FEASIBLE_JOINT_AGE.to_string(),
        },
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpendSolveConfig {
    pub target_end_liquid: f64,
    pub search_min: f64,
    /// Defaults to an upper bound derived from starting liquid and salaries.
    pub search_max: Option<f64>,
    pub liquid_tolerance: f64,
    pub spend_tolerance: f64,
    pub max_iterations: u32,
}

impl Default for SpendSolveConfig {
    fn default() -> Self {
        Self {
            target_end_liquid: 0.0,
            search_min: 0.0,
            search_max: None,
            liquid_tolerance: 1_000.0,
            spend_tolerance: 100.0,
            max_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendSolveIteration {
    pub iteration: u32,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub candidate_spend: f64,
    pub ok: bool,
    pub liquid_end: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpendSolveResult {
    pub target_end_liquid: f64,
    pub search_min: f64,
    pub search_max: f64,
    pub solved_spend: Option<f64>,
    pub result: Option<SimulationResult>,
    pub iterations: Vec<SpendSolveIteration>,
    pub converged: bool,
    pub feasible: bool,
    pub message: String,
}

/// Largest monthly spend whose run stays feasible and ends with at least
/// `target_end_liquid` (less `liquid_tolerance`).
pub fn solve_max_spend(
    params: &HouseholdParams,
    config: SpendSolveConfig,
) -> Result<SpendSolveResult, EngineError> {
    params.validate()?;
    validate_spend_config(&config)?;
    let search_max = match config.search_max {
        Some(search_max) => search_max,
        None => {
            let bound = default_spend_upper_bound(params);
            if bound <= config.search_min {
                tracing::info!(bound, "no positive spend bound");
                return Ok(SpendSolveResult {
                    target_end_liquid: config.target_end_liquid,
                    search_min: config.search_min,
                    search_max: bound,
                    solved_spend: None,
                    result: None,
                    iterations: Vec::new(),
                    converged: false,
                    feasible: false,
                    message: "Household has no savings or income to spend from.".to_string(),
                });
            }
            bound
        }
    };
    if !search_max.is_finite() || search_max <= config.search_min {
        return Err(EngineError::config(
            "spend search max must be finite and greater than search min",
        ));
    }

    let meets = |result: &SimulationResult| {
        result.ok && result.liquid_end >= config.target_end_liquid - config.liquid_tolerance
    };
    let evaluate = |spend: f64| {
        let mut candidate = params.clone();
        candidate.spend_month = spend;
        simulate(&candidate)
    };

    let mut iterations = Vec::with_capacity(config.max_iterations as usize);
    let low_eval = evaluate(config.search_min)?;
    let high_eval = evaluate(search_max)?;

    let mut solved_spend = None;
    let mut solved_result = None;
    let mut converged = false;
    let feasible;
    let message;

    if !meets(&low_eval) {
        feasible = false;
        message = "No feasible spend found within the search bounds.".to_string();
    } else if meets(&high_eval) {
        solved_spend = Some(search_max);
        solved_result = Some(high_eval);
        converged = true;
        feasible = true;
        message = "Upper spend bound is still feasible; increase search max for a higher target."
            .to_string();
    } else {
        let mut lo = config.search_min;
        let mut hi = search_max;
        let mut lo_result = low_eval;
        let mut it = 0;
        while it < config.max_iterations {
            it += 1;
            let mid = (lo + hi) * 0.5;
            let eval = evaluate(mid)?;
            let ok = meets(&eval);
            tracing::debug!(iteration = it, lo, hi, mid, ok, "spend bisection");
            iterations.push(SpendSolveIteration {
                iteration: it,
                lower_bound: lo,
                upper_bound: hi,
                candidate_spend: mid,
                ok,
                liquid_end: eval.liquid_end,
            });

            if ok {
                lo = mid;
                lo_result = eval;
            } else {
                hi = mid;
            }

            if (hi - lo).abs() <= config.spend_tolerance {
                converged = true;
                break;
            }
        }
        solved_spend = Some(lo);
        solved_result = Some(lo_result);
        feasible = true;
        message = if converged {
            "Solved maximum sustainable spend.".to_string()
        } else {
            "Reached max iterations before tolerance was met; returning best estimate.".to_string()
        };
    }

    tracing::info!(?solved_spend, converged, feasible, "spend solver finished");
    Ok(SpendSolveResult {
        target_end_liquid: config.target_end_liquid,
        search_min: config.search_min,
        search_max,
        solved_spend,
        result: solved_result,
        iterations,
        converged,
        feasible,
        message,
    })
}

/// Twice the household's monthly inflows plus its liquid savings spread over
/// the horizon. Pension income is the opening annuity `balance / divisor`.
fn default_spend_upper_bound(params: &HouseholdParams) -> f64 {
    let months = params.horizon_months().max(1) as f64;
    let inflows: f64 = [&params.primary, &params.spouse]
        .into_iter()
        .map(|person| {
            person.gross_income_month
                + person.pension_balance_now / person.pension_divisor
                + person.old_age_pension.map_or(0.0, |p| p.amount_month)
        })
        .sum();
    params.liquid_balance_now * 2.0 / months + inflows * 2.0
}

fn validate_spend_config(config: &SpendSolveConfig) -> Result<(), EngineError> {
    if !config.search_min.is_finite() || config.search_min < 0.0 {
        return Err(EngineError::config("spend search min must be finite and >= 0"));
    }
    if !config.target_end_liquid.is_finite() {
        return Err(EngineError::config("target end liquid must be finite"));
    }
    if !config.liquid_tolerance.is_finite() || config.liquid_tolerance < 0.0 {
        return Err(EngineError::config("liquid tolerance must be >= 0"));
    }
    if !config.spend_tolerance.is_finite() || config.spend_tolerance <= 0.0 {
        return Err(EngineError::config("spend tolerance must be > 0"));
    }
    if config.max_iterations == 0 {
        return Err(EngineError::config("max iterations must be > 0"));
    }
    Ok(())
}
