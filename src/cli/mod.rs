//! Command-line surface: argument parsing, dispatch and text rendering.

use crate::commands::batch_commands::{run_batch, run_health_check, BatchRunRequest};
use crate::commands::history_commands::{get_execution, list_executions};
use crate::commands::scenario_commands::{run_scenario, ScenarioRunRequest};
use crate::commands::AppContext;
use crate::config::{RunnerConfig, DEFAULT_CONFIG_PATH};
use crate::domain::{
    AssertionResult, ExecutionStatus, ScenarioExecutionResult, StepStatus, TestExecutionResult,
    VariableMap,
};
use crate::engine::env::stringify;
use crate::error::{Error, Result};
use crate::storage;
use crate::store::ExecutionSummaryRow;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use std::fmt::Write as _;
use std::path::PathBuf;

pub const EXIT_PASSED: i32 = 0;
pub const EXIT_FAILED: i32 = 1;
pub const EXIT_USAGE: i32 = 2;

/// getman-runner - run API scenarios and test batches from the command line
#[derive(Parser, Debug)]
#[command(name = "getman-runner")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Runner configuration file
    #[arg(long, global = true, env = "GETMAN_RUNNER_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a scenario definition
    Scenario(ScenarioArgs),

    /// Run a list of independent test cases
    Batch(BatchArgs),

    /// GET each path and expect 200
    Health(HealthArgs),

    /// List recorded executions
    History(HistoryArgs),

    /// Print one recorded execution as JSON
    Show(ShowArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable summary
    #[default]
    Text,
    /// The full result record as JSON
    Json,
}

#[derive(Args, Debug)]
pub struct OutputArgs {
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,

    /// Also write the result as JSON to this path
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Do not record the execution in the database
    #[arg(long)]
    pub no_store: bool,
}

#[derive(Args, Debug)]
pub struct ScenarioArgs {
    /// Scenario file (.json or .toml)
    pub file: PathBuf,

    #[arg(long)]
    pub base_url: Option<String>,

    /// Environment name from the config
    #[arg(long = "env")]
    pub environment: Option<String>,

    /// Variable override, `key=value`
    #[arg(long = "var", value_parser = parse_key_val)]
    pub vars: Vec<(String, String)>,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug)]
pub struct BatchArgs {
    /// Test case file (.json or .toml)
    pub file: PathBuf,

    #[arg(long)]
    pub base_url: Option<String>,

    #[arg(long = "env")]
    pub environment: Option<String>,

    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Retries per case on transport errors
    #[arg(long)]
    pub retries: Option<u32>,

    /// Per-case timeout in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug)]
pub struct HealthArgs {
    /// Paths to check
    #[arg(required = true)]
    pub paths: Vec<String>,

    #[arg(long)]
    pub base_url: Option<String>,

    #[arg(long)]
    pub concurrency: Option<usize>,

    #[command(flatten)]
    pub output: OutputArgs,
}

#[derive(Args, Debug)]
pub struct HistoryArgs {
    /// Only runs of this scenario
    #[arg(long)]
    pub scenario: Option<String>,

    #[arg(long, default_value_t = 20)]
    pub limit: usize,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub output: OutputFormat,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub execution_id: String,
}

fn parse_key_val(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in `{raw}`"));
    }
    Ok((key.to_string(), value.to_string()))
}

pub fn load_context(cli: &Cli) -> Result<AppContext> {
    let config = RunnerConfig::load(&cli.config)?;
    AppContext::new(config)
}

/// Exit code for an error that stopped a command before it produced a result.
pub fn exit_code_for_error(err: &Error) -> i32 {
    match err {
        Error::InvalidDefinition(_)
        | Error::Disabled(_)
        | Error::InvalidConfig(_)
        | Error::Toml(_)
        | Error::MalformedRule(_)
        | Error::MissingVariable { .. } => EXIT_USAGE,
        _ => EXIT_FAILED,
    }
}

fn exit_code(status: ExecutionStatus) -> i32 {
    if status == ExecutionStatus::Passed {
        EXIT_PASSED
    } else {
        EXIT_FAILED
    }
}

fn scoped(ctx: &AppContext, output: &OutputArgs) -> AppContext {
    if output.no_store {
        ctx.clone().without_store()
    } else {
        ctx.clone()
    }
}

fn emit<T: Serialize>(result: &T, text: String, output: &OutputArgs) -> Result<()> {
    if let Some(path) = &output.report {
        storage::write_report(path, result)?;
    }
    match output.output {
        OutputFormat::Text => print!("{text}"),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(result)?),
    }
    Ok(())
}

/// Run one subcommand and return the process exit code.
pub async fn execute(command: Commands, ctx: &AppContext) -> Result<i32> {
    match command {
        Commands::Scenario(args) => {
            let scenario = storage::load_scenario(&args.file)?;
            let mut request = ScenarioRunRequest::new(scenario);
            request.base_url = args.base_url;
            request.environment = args.environment;
            request.overrides = args
                .vars
                .into_iter()
                .map(|(key, value)| (key, Value::String(value)))
                .collect::<VariableMap>();

            let result = run_scenario(&scoped(ctx, &args.output), request).await?;
            emit(&result, render_scenario(&result), &args.output)?;
            Ok(exit_code(result.status))
        }
        Commands::Batch(args) => {
            let cases = storage::load_test_cases(&args.file)?;
            let mut request = BatchRunRequest::new(cases);
            request.base_url = args.base_url;
            request.environment = args.environment;
            request.concurrency = args.concurrency;
            request.retry_count = args.retries;
            request.timeout_ms = args.timeout_ms;

            let result = run_batch(&scoped(ctx, &args.output), request).await?;
            emit(&result, render_batch(&result), &args.output)?;
            Ok(exit_code(result.status))
        }
        Commands::Health(args) => {
            let result = run_health_check(
                &scoped(ctx, &args.output),
                &args.paths,
                args.base_url,
                args.concurrency,
            )
            .await?;
            emit(&result, render_batch(&result), &args.output)?;
            Ok(exit_code(result.status))
        }
        Commands::History(args) => {
            let rows = list_executions(ctx, args.scenario.as_deref(), args.limit)?;
            match args.output {
                OutputFormat::Text => print!("{}", render_history(&rows)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
            Ok(EXIT_PASSED)
        }
        Commands::Show(args) => match get_execution(ctx, &args.execution_id)? {
            Some(execution) => {
                println!("{}", serde_json::to_string_pretty(&execution)?);
                Ok(EXIT_PASSED)
            }
            None => {
                eprintln!("No execution `{}` recorded", args.execution_id);
                Ok(EXIT_FAILED)
            }
        },
    }
}

// ─── Text rendering ───────────────────────────────────────────────────────────

fn step_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Passed => "PASS ",
        StepStatus::Failed => "FAIL ",
        StepStatus::Error => "ERROR",
        StepStatus::Skipped => "SKIP ",
    }
}

fn render_assertion(out: &mut String, indent: &str, assertion: &AssertionResult) {
    if assertion.passed {
        return;
    }
    let actual = assertion
        .actual
        .as_ref()
        .map(stringify)
        .unwrap_or_else(|| "<missing>".to_string());
    let _ = writeln!(
        out,
        "{indent}  {:?} {:?}{}: expected {}, got {}",
        assertion.assertion_type,
        assertion.source,
        assertion
            .expression
            .as_deref()
            .map(|expr| format!(" {expr}"))
            .unwrap_or_default(),
        stringify(&assertion.expected),
        actual,
    );
    if let Some(message) = &assertion.message {
        let _ = writeln!(out, "{indent}    {message}");
    }
}

pub fn render_scenario(result: &ScenarioExecutionResult) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Scenario `{}` {} in {}ms (attempt {}, execution {})",
        result.scenario_name,
        result.status.as_str(),
        result.duration_ms,
        result.attempts,
        result.execution_id
    );

    for step in &result.step_results {
        let indent = if step.parent_step_id.is_some() { "    " } else { "  " };
        let iteration = step
            .iteration
            .map(|index| format!(" #{index}"))
            .unwrap_or_default();
        let mut line = format!(
            "{indent}{} [{}] {}{} ({})",
            step_label(step.status),
            step.step_order,
            if step.name.is_empty() { &step.step_id } else { &step.name },
            iteration,
            step.step_type
        );
        if let Some(response) = &step.response {
            let _ = write!(line, " -> {} in {}ms", response.status_code, response.response_time_ms);
        }
        let _ = writeln!(out, "{line}");
        if let Some(message) = &step.error_message {
            let _ = writeln!(out, "{indent}  {message}");
        }
        for assertion in &step.assertion_results {
            render_assertion(&mut out, indent, assertion);
        }
    }

    let _ = writeln!(
        out,
        "Steps: {} total, {} passed, {} failed, {} skipped",
        result.total_steps, result.passed_steps, result.failed_steps, result.skipped_steps
    );
    out
}

pub fn render_batch(result: &TestExecutionResult) -> String {
    let mut out = String::new();
    let summary = &result.summary;
    let _ = writeln!(
        out,
        "{} {} in {}ms (execution {})",
        result.execution_type.as_str(),
        result.status.as_str(),
        summary.duration_ms,
        result.execution_id
    );

    for case in &result.results {
        let mut line = format!(
            "  {} {}",
            step_label(case.status),
            if case.name.is_empty() { &case.case_id } else { &case.name }
        );
        if let Some(response) = &case.response {
            let _ = write!(line, " -> {} in {}ms", response.status_code, response.response_time_ms);
        }
        if case.attempts > 1 {
            let _ = write!(line, " after {} attempts", case.attempts);
        }
        let _ = writeln!(out, "{line}");
        if let Some(message) = &case.error_message {
            let _ = writeln!(out, "    {message}");
        }
        for assertion in &case.assertion_results {
            render_assertion(&mut out, "  ", assertion);
        }
    }

    let _ = writeln!(
        out,
        "Cases: {} total, {} passed, {} failed, {} error, {} skipped ({:.1}% pass)",
        summary.total, summary.passed, summary.failed, summary.error, summary.skipped,
        summary.pass_rate
    );
    if summary.latency.max_ms > 0.0 {
        let latency = &summary.latency;
        let _ = writeln!(
            out,
            "Latency: min {}ms, avg {}ms, p50 {}ms, p95 {}ms, p99 {}ms, max {}ms",
            latency.min_ms, latency.avg_ms, latency.p50_ms, latency.p95_ms, latency.p99_ms,
            latency.max_ms
        );
    }
    out
}

pub fn render_history(rows: &[ExecutionSummaryRow]) -> String {
    if rows.is_empty() {
        return "No executions recorded.\n".to_string();
    }
    let mut out = String::new();
    for row in rows {
        let _ = writeln!(
            out,
            "{}  {:<12} {:<9} {}/{} passed  {}ms  {}  {}",
            row.started_at,
            row.kind,
            row.status.as_str(),
            row.passed,
            row.total,
            row.duration_ms,
            row.subject,
            row.execution_id
        );
    }
    out
}
