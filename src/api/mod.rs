use axum::{
    Router,
    extract::{
        Json, Query,
        rejection::{JsonRejection, QueryRejection},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::net::TcpListener;

use crate::core::{
    EngineError, HouseholdParams, ISRAEL_2025_LABEL, IncomeStep, JointSearchOutcome,
    OldAgePension, OneTimeEvent, PensionIncomeMode, PersonId, PersonParams, ScenarioRow,
    SearchConfig, SearchOutcome, SearchStrategy, SimulationResult, SocialInsuranceConfig,
    SpendSolveConfig, SpendSolveIteration, SpendStep, TaxBracket, TaxBracketTable, TaxBreakdown,
    TaxCalculator, TaxSchedule, compare_scenarios, find_earliest_feasible, find_earliest_joint,
    simulate, solve_max_spend,
};

/// Flat household description used by the HTTP API, config files and the CLI.
/// Missing fields take the defaults below.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PlannerConfig {
    pub age_now: f64,
    pub retire_age: f64,
    pub pension_start_age: f64,
    pub spouse_age_now: f64,
    pub spouse_retire_age: f64,
    pub spouse_pension_start_age: f64,
    pub end_age: f64,
    pub r_annual_real: f64,

    pub gross_income_month: f64,
    pub pension_rate: f64,
    pub pension_rate_employer: f64,
    pub hishtalmut_rate: f64,
    /// Salary ceiling the hishtalmut rate applies to.
    pub hishtalmut_salary_cap: f64,
    pub income_schedule: Vec<IncomeStep>,

    pub spouse_gross_income_month: f64,
    pub spouse_pension_rate: f64,
    pub spouse_pension_rate_employer: f64,
    pub spouse_hishtalmut_rate: f64,
    pub spouse_hishtalmut_salary_cap: f64,
    pub spouse_income_schedule: Vec<IncomeStep>,

    pub spend_month: f64,
    pub expense_schedule: Vec<SpendStep>,
    pub one_time_events: Vec<OneTimeEvent>,
    pub liquid_now: f64,
    pub liquid_floor: f64,
    pub pension_now: f64,
    pub spouse_pension_now: f64,
    pub mekadem: f64,
    pub spouse_mekadem: f64,
    pub pension_income_mode: PensionIncomeMode,
    pub pension_tax_free_month: f64,
    pub spouse_pension_tax_free_month: f64,

    pub old_age_pension_month: f64,
    pub old_age_pension_start_age: f64,

    pub tax_year: String,
    pub tax_brackets: Option<Vec<TaxBracket>>,
    pub social_insurance: Option<SocialInsuranceConfig>,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            age_now: 38.0,
            retire_age: 65.0,
            pension_start_age: 67.0,
            spouse_age_now: 36.0,
            spouse_retire_age: 65.0,
            spouse_pension_start_age: 67.0,
            end_age: 95.0,
            r_annual_real: 0.03,
            gross_income_month: 18_000.0,
            pension_rate: 0.06,
            pension_rate_employer: 0.125,
            hishtalmut_rate: 0.10,
            hishtalmut_salary_cap: 15_712.0,
            income_schedule: Vec::new(),
            spouse_gross_income_month: 15_000.0,
            spouse_pension_rate: 0.06,
            spouse_pension_rate_employer: 0.125,
            spouse_hishtalmut_rate: 0.10,
            spouse_hishtalmut_salary_cap: 15_712.0,
            spouse_income_schedule: Vec::new(),
            spend_month: 16_000.0,
            expense_schedule: Vec::new(),
            one_time_events: Vec::new(),
            liquid_now: 300_000.0,
            liquid_floor: 0.0,
            pension_now: 400_000.0,
            spouse_pension_now: 350_000.0,
            mekadem: 230.0,
            spouse_mekadem: 230.0,
            pension_income_mode: PensionIncomeMode::Annuity,
            pension_tax_free_month: 0.0,
            spouse_pension_tax_free_month: 0.0,
            old_age_pension_month: 2_000.0,
            old_age_pension_start_age: 70.0,
            tax_year: ISRAEL_2025_LABEL.to_string(),
            tax_brackets: None,
            social_insurance: None,
        }
    }
}

impl PlannerConfig {
    fn tax_schedule(&self) -> Result<TaxSchedule, EngineError> {
        let mut schedule = TaxSchedule::by_label(&self.tax_year).ok_or_else(|| {
            EngineError::Configuration(format!("unknown tax_year {:?}", self.tax_year))
        })?;
        if let Some(brackets) = &self.tax_brackets {
            schedule.brackets = TaxBracketTable::new(brackets.clone())?;
            schedule.label = format!("{} (custom brackets)", schedule.label);
        }
        if let Some(social_insurance) = self.social_insurance {
            social_insurance.validate()?;
            schedule.social_insurance = social_insurance;
        }
        Ok(schedule)
    }

    fn old_age_pension(&self) -> Option<OldAgePension> {
        (self.old_age_pension_month > 0.0).then_some(OldAgePension {
            amount_month: self.old_age_pension_month,
            start_age: self.old_age_pension_start_age,
        })
    }
}

/// Validates a planner config and converts it to engine parameters.
pub fn build_household(config: &PlannerConfig) -> Result<HouseholdParams, EngineError> {
    if !config.hishtalmut_salary_cap.is_finite() || config.hishtalmut_salary_cap < 0.0 {
        return Err(EngineError::config("hishtalmut_salary_cap must be >= 0"));
    }
    if !config.spouse_hishtalmut_salary_cap.is_finite() || config.spouse_hishtalmut_salary_cap < 0.0
    {
        return Err(EngineError::config(
            "spouse_hishtalmut_salary_cap must be >= 0",
        ));
    }

    let primary = PersonParams {
        age_now: config.age_now,
        retire_age: config.retire_age,
        pension_start_age: config.pension_start_age,
        gross_income_month: config.gross_income_month,
        employee_pension_rate: config.pension_rate,
        employer_pension_rate: config.pension_rate_employer,
        hishtalmut_rate: config.hishtalmut_rate,
        hishtalmut_cap_month: config.hishtalmut_rate * config.hishtalmut_salary_cap,
        pension_balance_now: config.pension_now,
        pension_divisor: config.mekadem,
        old_age_pension: config.old_age_pension(),
        income_schedule: config.income_schedule.clone(),
        pension_tax_free_month: config.pension_tax_free_month,
    };
    let spouse = PersonParams {
        age_now: config.spouse_age_now,
        retire_age: config.spouse_retire_age,
        pension_start_age: config.spouse_pension_start_age,
        gross_income_month: config.spouse_gross_income_month,
        employee_pension_rate: config.spouse_pension_rate,
        employer_pension_rate: config.spouse_pension_rate_employer,
        hishtalmut_rate: config.spouse_hishtalmut_rate,
        hishtalmut_cap_month: config.spouse_hishtalmut_rate * config.spouse_hishtalmut_salary_cap,
        pension_balance_now: config.spouse_pension_now,
        pension_divisor: config.spouse_mekadem,
        old_age_pension: config.old_age_pension(),
        income_schedule: config.spouse_income_schedule.clone(),
        pension_tax_free_month: config.spouse_pension_tax_free_month,
    };

    let params = HouseholdParams {
        primary,
        spouse,
        liquid_balance_now: config.liquid_now,
        spend_month: config.spend_month,
        real_annual_return: config.r_annual_real,
        end_age: config.end_age,
        tax: config.tax_schedule()?,
        expense_schedule: config.expense_schedule.clone(),
        one_time_events: config.one_time_events.clone(),
        liquid_floor: config.liquid_floor,
        pension_income_mode: config.pension_income_mode,
    };
    params.validate()?;
    Ok(params)
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct SearchRequest {
    #[serde(flatten)]
    config: PlannerConfig,
    person: Option<PersonId>,
    strategy: Option<SearchStrategy>,
    min_age: Option<f64>,
    max_age: Option<f64>,
    joint: bool,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct CompareRequest {
    #[serde(flatten)]
    config: PlannerConfig,
    person: Option<PersonId>,
    ages: Vec<f64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
struct SpendRequest {
    #[serde(flatten)]
    config: PlannerConfig,
    target_end_liquid: Option<f64>,
    search_min: Option<f64>,
    search_max: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TaxQuery {
    gross: f64,
    tax_year: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    feasible: bool,
    person: Option<PersonId>,
    retire_age: Option<f64>,
    spouse_retire_age: Option<f64>,
    reason: Option<String>,
    result: Option<SimulationResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompareResponse {
    person: PersonId,
    rows: Vec<ScenarioRow>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpendResponse {
    feasible: bool,
    converged: bool,
    solved_spend: Option<f64>,
    search_min: f64,
    search_max: f64,
    message: String,
    iterations: Vec<SpendSolveIteration>,
    result: Option<SimulationResult>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaxResponse {
    tax_year: String,
    #[serde(flatten)]
    breakdown: TaxBreakdown,
    effective_rate: f64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

fn run_simulation(config: &PlannerConfig) -> Result<SimulationResult, EngineError> {
    simulate(&build_household(config)?)
}

fn run_search(request: &SearchRequest) -> Result<SearchResponse, EngineError> {
    let params = build_household(&request.config)?;
    if request.joint {
        return Ok(match find_earliest_joint(&params)? {
            JointSearchOutcome::Feasible {
                primary_retire_age,
                spouse_retire_age,
                result,
            } => SearchResponse {
                feasible: true,
                person: None,
                retire_age: Some(primary_retire_age),
                spouse_retire_age: Some(spouse_retire_age),
                reason: None,
                result: Some(result),
            },
            JointSearchOutcome::Exhausted { reason } => SearchResponse {
                feasible: false,
                person: None,
                retire_age: None,
                spouse_retire_age: None,
                reason: Some(reason),
                result: None,
            },
        });
    }

    let person = request.person.unwrap_or(PersonId::Primary);
    let config = SearchConfig {
        person,
        strategy: request.strategy.unwrap_or_default(),
        min_age: request.min_age,
        max_age: request.max_age,
        ..SearchConfig::default()
    };
    Ok(match find_earliest_feasible(&params, config)? {
        SearchOutcome::Feasible { retire_age, result } => SearchResponse {
            feasible: true,
            person: Some(person),
            retire_age: Some(retire_age),
            spouse_retire_age: None,
            reason: None,
            result: Some(result),
        },
        SearchOutcome::Exhausted { reason } => SearchResponse {
            feasible: false,
            person: Some(person),
            retire_age: None,
            spouse_retire_age: None,
            reason: Some(reason),
            result: None,
        },
    })
}

fn run_compare(request: &CompareRequest) -> Result<CompareResponse, EngineError> {
    let params = build_household(&request.config)?;
    let person = request.person.unwrap_or(PersonId::Primary);
    let rows = compare_scenarios(&params, person, &request.ages)?;
    Ok(CompareResponse { person, rows })
}

fn run_spend_solver(request: &SpendRequest) -> Result<SpendResponse, EngineError> {
    let params = build_household(&request.config)?;
    let defaults = SpendSolveConfig::default();
    let solved = solve_max_spend(
        &params,
        SpendSolveConfig {
            target_end_liquid: request.target_end_liquid.unwrap_or(defaults.target_end_liquid),
            search_min: request.search_min.unwrap_or(defaults.search_min),
            search_max: request.search_max,
            ..defaults
        },
    )?;
    Ok(SpendResponse {
        feasible: solved.feasible,
        converged: solved.converged,
        solved_spend: solved.solved_spend,
        search_min: solved.search_min,
        search_max: solved.search_max,
        message: solved.message,
        iterations: solved.iterations,
        result: solved.result,
    })
}

fn tax_breakdown(gross: f64, tax_year: Option<&str>) -> Result<TaxResponse, EngineError> {
    let label = tax_year.unwrap_or(ISRAEL_2025_LABEL);
    let schedule = TaxSchedule::by_label(label)
        .ok_or_else(|| EngineError::InvalidInput(format!("unknown tax_year {label:?}")))?;
    let calc = TaxCalculator::new(&schedule);
    Ok(TaxResponse {
        tax_year: schedule.label.clone(),
        breakdown: calc.net_from_gross(gross)?,
        effective_rate: calc.effective_rate(gross)?,
    })
}

pub async fn run_http_server(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let app = Router::new()
        .route("/api/simulate", post(simulate_handler))
        .route("/api/search", post(search_handler))
        .route("/api/compare", post(compare_handler))
        .route("/api/solve-spend", post(spend_handler))
        .route("/api/tax", get(tax_handler))
        .fallback(not_found_handler);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "household planner API listening");

    axum::serve(listener, app).await
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found")
}

async fn simulate_handler(payload: Result<Json<PlannerConfig>, JsonRejection>) -> Response {
    match payload {
        Ok(Json(config)) => run_blocking(move || run_simulation(&config)).await,
        Err(rejection) => error_response(rejection.status(), &rejection.body_text()),
    }
}

async fn search_handler(payload: Result<Json<SearchRequest>, JsonRejection>) -> Response {
    match payload {
        Ok(Json(request)) => run_blocking(move || run_search(&request)).await,
        Err(rejection) => error_response(rejection.status(), &rejection.body_text()),
    }
}

async fn compare_handler(payload: Result<Json<CompareRequest>, JsonRejection>) -> Response {
    match payload {
        Ok(Json(request)) => run_blocking(move || run_compare(&request)).await,
        Err(rejection) => error_response(rejection.status(), &rejection.body_text()),
    }
}

async fn spend_handler(payload: Result<Json<SpendRequest>, JsonRejection>) -> Response {
    match payload {
        Ok(Json(request)) => run_blocking(move || run_spend_solver(&request)).await,
        Err(rejection) => error_response(rejection.status(), &rejection.body_text()),
    }
}

async fn tax_handler(query: Result<Query<TaxQuery>, QueryRejection>) -> Response {
    match query {
        Ok(Query(query)) => engine_response(tax_breakdown(query.gross, query.tax_year.as_deref())),
        Err(rejection) => error_response(rejection.status(), &rejection.body_text()),
    }
}

/// Runs engine work on the blocking pool so rayon scans do not stall the
/// async workers.
async fn run_blocking<T, F>(job: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
{
    match tokio::task::spawn_blocking(job).await {
        Ok(outcome) => engine_response(outcome),
        Err(err) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("engine task failed: {err}"),
        ),
    }
}

fn engine_response<T: Serialize>(outcome: Result<T, EngineError>) -> Response {
    match outcome {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: T) -> Response {
    let mut response = (status, Json(body)).into_response();
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        "no-store".parse().expect("valid header"),
    );
    response
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    json_response(
        status,
        ErrorResponse {
            error: msg.to_string(),
        },
    )
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliPerson {
    Primary,
    Spouse,
}

impl From<CliPerson> for PersonId {
    fn from(value: CliPerson) -> Self {
        match value {
            CliPerson::Primary => PersonId::Primary,
            CliPerson::Spouse => PersonId::Spouse,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum CliSearchStrategy {
    Linear,
    Parallel,
    Bisect,
}

impl From<CliSearchStrategy> for SearchStrategy {
    fn from(value: CliSearchStrategy) -> Self {
        match value {
            CliSearchStrategy::Linear => SearchStrategy::Linear,
            CliSearchStrategy::Parallel => SearchStrategy::Parallel,
            CliSearchStrategy::Bisect => SearchStrategy::Bisect,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "household-fire",
    about = "Household retirement cashflow planner (salary, pension, hishtalmut, Israeli tax)"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Simulate the configured plan month by month.
    Simulate {
        #[command(flatten)]
        config: ConfigArgs,
    },
    /// Find the earliest feasible retirement age.
    Search {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long, value_enum, default_value_t = CliSearchStrategy::Linear)]
        strategy: CliSearchStrategy,
        #[arg(long, value_enum, default_value_t = CliPerson::Primary)]
        person: CliPerson,
        #[arg(long)]
        min_age: Option<f64>,
        #[arg(long)]
        max_age: Option<f64>,
        #[arg(long, help = "Both persons retire in the same month")]
        joint: bool,
    },
    /// Compare several retirement ages side by side.
    Compare {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long, value_delimiter = ',', num_args = 1.., required = true)]
        ages: Vec<f64>,
        #[arg(long, value_enum, default_value_t = CliPerson::Primary)]
        person: CliPerson,
    },
    /// Solve for the largest sustainable monthly spend.
    SolveSpend {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        target_end_liquid: Option<f64>,
        #[arg(long)]
        search_max: Option<f64>,
    },
    /// Income tax and social insurance on a monthly gross amount.
    Tax {
        #[arg(long)]
        gross: f64,
        #[arg(long)]
        tax_year: Option<String>,
    },
}

/// Overrides applied on top of the defaults or a `--config` JSON file.
#[derive(Args, Clone, Debug, Default)]
pub struct ConfigArgs {
    #[arg(long, help = "JSON file with planner fields")]
    config: Option<PathBuf>,
    #[arg(long)]
    age_now: Option<f64>,
    #[arg(long)]
    retire_age: Option<f64>,
    #[arg(long)]
    pension_start_age: Option<f64>,
    #[arg(long)]
    spouse_age_now: Option<f64>,
    #[arg(long)]
    spouse_retire_age: Option<f64>,
    #[arg(long)]
    spouse_pension_start_age: Option<f64>,
    #[arg(long)]
    end_age: Option<f64>,
    #[arg(long, help = "Real annual return as a fraction, e.g. 0.03")]
    r_annual_real: Option<f64>,
    #[arg(long)]
    gross_income_month: Option<f64>,
    #[arg(long)]
    spouse_gross_income_month: Option<f64>,
    #[arg(long)]
    spend_month: Option<f64>,
    #[arg(long)]
    liquid_now: Option<f64>,
    #[arg(long)]
    pension_now: Option<f64>,
    #[arg(long)]
    spouse_pension_now: Option<f64>,
    #[arg(long)]
    liquid_floor: Option<f64>,
    #[arg(long)]
    tax_year: Option<String>,
}

impl ConfigArgs {
    fn load(&self) -> Result<PlannerConfig, String> {
        let mut config = match &self.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
                planner_config_from_json(&raw)?
            }
            None => PlannerConfig::default(),
        };

        let overrides = [
            (self.age_now, &mut config.age_now),
            (self.retire_age, &mut config.retire_age),
            (self.pension_start_age, &mut config.pension_start_age),
            (self.spouse_age_now, &mut config.spouse_age_now),
            (self.spouse_retire_age, &mut config.spouse_retire_age),
            (
                self.spouse_pension_start_age,
                &mut config.spouse_pension_start_age,
            ),
            (self.end_age, &mut config.end_age),
            (self.r_annual_real, &mut config.r_annual_real),
            (self.gross_income_month, &mut config.gross_income_month),
            (
                self.spouse_gross_income_month,
                &mut config.spouse_gross_income_month,
            ),
            (self.spend_month, &mut config.spend_month),
            (self.liquid_now, &mut config.liquid_now),
            (self.pension_now, &mut config.pension_now),
            (self.spouse_pension_now, &mut config.spouse_pension_now),
            (self.liquid_floor, &mut config.liquid_floor),
        ];
        for (value, slot) in overrides {
            if let Some(v) = value {
                *slot = v;
            }
        }
        if let Some(tax_year) = &self.tax_year {
            config.tax_year = tax_year.clone();
        }
        Ok(config)
    }
}

fn planner_config_from_json(json: &str) -> Result<PlannerConfig, String> {
    serde_json::from_str::<PlannerConfig>(json).map_err(|e| format!("Invalid planner JSON: {e}"))
}

/// Runs one CLI command and prints its JSON result to stdout.
pub async fn run_cli(cli: Cli) -> Result<(), String> {
    let output = match cli.command {
        Command::Serve { port } => {
            return run_http_server(port)
                .await
                .map_err(|e| format!("Server error: {e}"));
        }
        Command::Simulate { config } => to_json(run_simulation(&config.load()?))?,
        Command::Search {
            config,
            strategy,
            person,
            min_age,
            max_age,
            joint,
        } => to_json(run_search(&SearchRequest {
            config: config.load()?,
            person: Some(person.into()),
            strategy: Some(strategy.into()),
            min_age,
            max_age,
            joint,
        }))?,
        Command::Compare {
            config,
            ages,
            person,
        } => to_json(run_compare(&CompareRequest {
            config: config.load()?,
            person: Some(person.into()),
            ages,
        }))?,
        Command::SolveSpend {
            config,
            target_end_liquid,
            search_max,
        } => to_json(run_spend_solver(&SpendRequest {
            config: config.load()?,
            target_end_liquid,
            search_min: None,
            search_max,
        }))?,
        Command::Tax { gross, tax_year } => to_json(tax_breakdown(gross, tax_year.as_deref()))?,
    };
    println!("{output}");
    Ok(())
}

fn to_json<T: Serialize>(outcome: Result<T, EngineError>) -> Result<String, String> {
    let body = outcome.map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&body).map_err(|e| format!("Failed to encode JSON: {e}"))
}
