use crate::domain::{
    ordered, ExecutionStatus, RequestSnapshot, RequestStep, ResponseSnapshot, Scenario,
    ScenarioExecutionResult, Step, StepKind, StepResult, StepStatus, VariableMap,
    MAX_LOOP_ITERATIONS,
};
use crate::engine::assertion::{all_passed, evaluate_all, validate_assertion};
use crate::engine::cancel::CancelSignal;
use crate::engine::condition::Condition;
use crate::engine::env::{is_identifier, layer_variables, resolve_request, RequestTemplate};
use crate::engine::extract::{apply_extractions, validate_extraction};
use crate::engine::http::{call_with_deadline, HttpTransport};
use crate::engine::response::ResponseView;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_STEP_TIMEOUT_MS: u64 = 30_000;

/// Per-run inputs that are not part of the scenario definition.
#[derive(Debug, Clone)]
pub struct ExecutionOptions {
    pub execution_id: String,
    pub base_url: Option<String>,
    pub environment: Option<String>,
    /// Global and environment variables, below the scenario's own.
    pub globals: VariableMap,
    /// Caller overrides, above the scenario's own.
    pub overrides: VariableMap,
    pub default_timeout_ms: u64,
}

impl ExecutionOptions {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            base_url: None,
            environment: None,
            globals: VariableMap::new(),
            overrides: VariableMap::new(),
            default_timeout_ms: DEFAULT_STEP_TIMEOUT_MS,
        }
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    fn initial_variables(&self, scenario: &Scenario) -> VariableMap {
        let seeded = layer_variables(&self.globals, &scenario.variables);
        layer_variables(&seeded, &self.overrides)
    }
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

// ─── Validation ───────────────────────────────────────────────────────────────

fn step_error(step: &Step, err: Error) -> Error {
    Error::invalid(format!("step `{}`: {err}", step.id))
}

fn check_step_list(steps: &[Step], seen_ids: &mut HashSet<String>) -> Result<()> {
    let mut orders = HashSet::new();
    for step in steps {
        if !orders.insert(step.order) {
            return Err(Error::invalid(format!(
                "duplicate step order {} (step `{}`)",
                step.order, step.id
            )));
        }
        if !seen_ids.insert(step.id.clone()) {
            return Err(Error::invalid(format!("duplicate step id `{}`", step.id)));
        }
        match &step.kind {
            StepKind::Condition(condition) => {
                check_step_list(&condition.then_steps, seen_ids)?;
                check_step_list(&condition.else_steps, seen_ids)?;
            }
            StepKind::Loop(loop_step) => {
                if loop_step.count == 0 || loop_step.count > MAX_LOOP_ITERATIONS {
                    return Err(Error::invalid(format!(
                        "step `{}`: loop count must be between 1 and {MAX_LOOP_ITERATIONS}",
                        step.id
                    )));
                }
                if !is_identifier(&loop_step.index_variable) {
                    return Err(Error::invalid(format!(
                        "step `{}`: `{}` is not a valid index variable",
                        step.id, loop_step.index_variable
                    )));
                }
                check_step_list(&loop_step.steps, seen_ids)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Checks the executor needs before any step runs: enabled, unique ids and
/// orders, loop bounds.
pub fn check_structure(scenario: &Scenario) -> Result<()> {
    if !scenario.enabled {
        return Err(Error::Disabled(scenario.id.clone()));
    }
    check_step_list(&scenario.steps, &mut HashSet::new())
}

fn compile_rules(steps: &[Step]) -> Result<()> {
    for step in steps {
        match &step.kind {
            StepKind::Request(request) => {
                reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
                    .map_err(|_| {
                        step_error(step, Error::malformed(format!("bad method `{}`", request.method)))
                    })?;
                for rule in &request.extractions {
                    validate_extraction(rule).map_err(|err| step_error(step, err))?;
                }
                for rule in &request.assertions {
                    validate_assertion(rule).map_err(|err| step_error(step, err))?;
                }
            }
            StepKind::Extract { extractions } => {
                for rule in extractions {
                    validate_extraction(rule).map_err(|err| step_error(step, err))?;
                }
            }
            StepKind::Assert { assertions } => {
                for rule in assertions {
                    validate_assertion(rule).map_err(|err| step_error(step, err))?;
                }
            }
            StepKind::Condition(condition) => {
                Condition::parse(&condition.condition).map_err(|err| step_error(step, err))?;
                compile_rules(&condition.then_steps)?;
                compile_rules(&condition.else_steps)?;
            }
            StepKind::Loop(loop_step) => {
                if let Some(expression) = &loop_step.while_condition {
                    Condition::parse(expression).map_err(|err| step_error(step, err))?;
                }
                compile_rules(&loop_step.steps)?;
            }
            StepKind::Wait { .. } => {}
        }
    }
    Ok(())
}

/// Full definition check: structure plus every rule, method and expression compiles.
pub fn validate_scenario(scenario: &Scenario) -> Result<()> {
    check_structure(scenario)?;
    compile_rules(&scenario.steps)
}

// ─── Executor ─────────────────────────────────────────────────────────────────

/// Drives scenarios against an injected [`HttpTransport`].
#[derive(Clone)]
pub struct ScenarioExecutor {
    transport: Arc<dyn HttpTransport>,
}

impl ScenarioExecutor {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Run a scenario to a terminal state. Only definition problems return `Err`;
    /// every runtime failure is recorded in the result.
    #[instrument(
        skip(self, scenario, options, cancel),
        fields(scenario_id = %scenario.id, execution_id = %options.execution_id)
    )]
    pub async fn execute(
        &self,
        scenario: &Scenario,
        options: &ExecutionOptions,
        mut cancel: CancelSignal,
    ) -> Result<ScenarioExecutionResult> {
        check_structure(scenario)?;

        let started = Instant::now();
        let mut result = ScenarioExecutionResult::pending(options.execution_id.clone(), scenario);
        result.base_url = options.base_url.clone();
        result.environment = options.environment.clone();
        result.set_status(ExecutionStatus::Running)?;

        let max_attempts = if scenario.retry_on_failure {
            scenario.max_retries.saturating_add(1)
        } else {
            1
        };

        let final_status = loop {
            result.attempts += 1;
            let initial = options.initial_variables(scenario);
            info!(
                attempt = result.attempts,
                steps = scenario.steps.len(),
                "Running scenario `{}`",
                scenario.name
            );

            let mut attempt = Attempt {
                transport: self.transport.as_ref(),
                options,
                cancel: &mut cancel,
                variables: initial.clone(),
                last_response: None,
                results: Vec::new(),
                cancelled: false,
            };
            attempt.run_steps(&scenario.steps, None).await;
            let Attempt {
                variables,
                results,
                cancelled,
                ..
            } = attempt;

            result.variables = initial;
            result.final_variables = variables;
            result.step_results = results;
            result.tally();

            let failed = result.step_results.iter().any(|step| step.status.is_failure());
            if failed && !cancelled && result.attempts < max_attempts {
                warn!(
                    attempt = result.attempts,
                    failed_steps = result.failed_steps,
                    "Scenario attempt failed, retrying"
                );
                continue;
            }

            break if failed {
                ExecutionStatus::Failed
            } else if cancelled {
                ExecutionStatus::Cancelled
            } else {
                ExecutionStatus::Passed
            };
        };

        result.duration_ms = started.elapsed().as_millis() as u64;
        result.set_status(final_status)?;
        info!(
            status = final_status.as_str(),
            attempts = result.attempts,
            passed = result.passed_steps,
            failed = result.failed_steps,
            skipped = result.skipped_steps,
            duration_ms = result.duration_ms,
            "Scenario finished"
        );
        Ok(result)
    }
}

// ─── Attempt ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Parent<'a> {
    step_id: &'a str,
    iteration: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListOutcome {
    Completed,
    Aborted,
    Cancelled,
}

type ListFuture<'s> = Pin<Box<dyn Future<Output = ListOutcome> + Send + 's>>;

/// State private to one attempt: its variable map, results and last response.
struct Attempt<'a> {
    transport: &'a dyn HttpTransport,
    options: &'a ExecutionOptions,
    cancel: &'a mut CancelSignal,
    variables: VariableMap,
    last_response: Option<ResponseView>,
    results: Vec<StepResult>,
    cancelled: bool,
}

impl<'a> Attempt<'a> {
    fn record(&mut self, mut result: StepResult, parent: Option<Parent<'_>>) -> usize {
        if let Some(parent) = parent {
            result.parent_step_id = Some(parent.step_id.to_string());
            result.iteration = parent.iteration;
        }
        self.results.push(result);
        self.results.len() - 1
    }

    fn skip_all(&mut self, steps: &[&Step], parent: Option<Parent<'_>>) {
        for step in steps {
            self.record(StepResult::skipped(step), parent);
        }
    }

    fn observe_cancel(&mut self) -> bool {
        if !self.cancelled && self.cancel.is_cancelled() {
            info!("Cancellation observed, skipping remaining steps");
            self.cancelled = true;
        }
        self.cancelled
    }

    fn run_steps<'s>(&'s mut self, steps: &'s [Step], parent: Option<Parent<'s>>) -> ListFuture<'s> {
        Box::pin(async move {
            let ordered = ordered(steps);
            for (position, step) in ordered.iter().enumerate() {
                if self.observe_cancel() {
                    self.skip_all(&ordered[position..], parent);
                    return ListOutcome::Cancelled;
                }

                let status = self.run_step(step, parent).await;

                if self.cancelled {
                    self.skip_all(&ordered[position + 1..], parent);
                    return ListOutcome::Cancelled;
                }
                if status.is_failure() && !step.continue_on_failure {
                    debug!(step_id = %step.id, "Step failed, skipping the rest");
                    self.skip_all(&ordered[position + 1..], parent);
                    return ListOutcome::Aborted;
                }
            }
            ListOutcome::Completed
        })
    }

    async fn run_step(&mut self, step: &Step, parent: Option<Parent<'_>>) -> StepStatus {
        let started = Instant::now();
        debug!(step_id = %step.id, step_type = step.kind.name(), "Running step");

        let index = match &step.kind {
            StepKind::Wait { wait_time_ms } => {
                let mut result = StepResult::new(step, StepStatus::Passed);
                let sleep = tokio::time::sleep(Duration::from_millis(*wait_time_ms));
                let interrupted = tokio::select! {
                    _ = sleep => false,
                    _ = self.cancel.cancelled() => true,
                };
                if interrupted {
                    self.cancelled = true;
                    result.status = StepStatus::Skipped;
                    result.error_message = Some("Cancelled during wait".to_string());
                }
                self.record(result, parent)
            }
            StepKind::Request(request) => {
                let result = self.run_request(step, request).await;
                self.record(result, parent)
            }
            StepKind::Extract { extractions } => {
                let mut result = StepResult::new(step, StepStatus::Passed);
                match self.last_response.as_ref() {
                    None => fail(&mut result, "No response in scope to extract from"),
                    Some(view) => match apply_extractions(view, extractions, &mut self.variables) {
                        Ok(extracted) => result.extracted_variables = extracted,
                        Err(err) => fail(&mut result, err.to_string()),
                    },
                }
                self.record(result, parent)
            }
            StepKind::Assert { assertions } => {
                let mut result = StepResult::new(step, StepStatus::Passed);
                match self.last_response.as_ref() {
                    None => fail(&mut result, "No response in scope to assert against"),
                    Some(view) => match evaluate_all(view, assertions) {
                        Ok(outcomes) => {
                            if !all_passed(&outcomes) {
                                result.status = StepStatus::Failed;
                            }
                            result.assertion_results = outcomes;
                        }
                        Err(err) => fail(&mut result, err.to_string()),
                    },
                }
                self.record(result, parent)
            }
            StepKind::Condition(condition) => {
                let index = self.record(StepResult::new(step, StepStatus::Passed), parent);
                match Condition::parse(&condition.condition)
                    .and_then(|parsed| parsed.evaluate(&self.variables))
                {
                    Err(err) => fail(&mut self.results[index], err.to_string()),
                    Ok(holds) => {
                        debug!(step_id = %step.id, holds, "Condition evaluated");
                        let branch = if holds {
                            &condition.then_steps
                        } else {
                            &condition.else_steps
                        };
                        let scope = Parent {
                            step_id: &step.id,
                            iteration: None,
                        };
                        let outcome = self.run_steps(branch, Some(scope)).await;
                        self.close_container(index, outcome);
                    }
                }
                index
            }
            StepKind::Loop(loop_step) => {
                let index = self.record(StepResult::new(step, StepStatus::Passed), parent);
                let guard = match loop_step.while_condition.as_deref().map(Condition::parse) {
                    Some(Err(err)) => {
                        fail(&mut self.results[index], err.to_string());
                        None
                    }
                    Some(Ok(parsed)) => Some(Some(parsed)),
                    None => Some(None),
                };

                if let Some(guard) = guard {
                    let iterations = loop_step.count.min(MAX_LOOP_ITERATIONS);
                    for iteration in 0..iterations {
                        if self.observe_cancel() {
                            self.close_container(index, ListOutcome::Cancelled);
                            break;
                        }
                        self.variables
                            .insert(loop_step.index_variable.clone(), Value::from(iteration));
                        if let Some(guard) = &guard {
                            match guard.evaluate(&self.variables) {
                                Ok(true) => {}
                                Ok(false) => break,
                                Err(err) => {
                                    fail(&mut self.results[index], err.to_string());
                                    break;
                                }
                            }
                        }

                        let scope = Parent {
                            step_id: &step.id,
                            iteration: Some(iteration),
                        };
                        let outcome = self.run_steps(&loop_step.steps, Some(scope)).await;
                        if outcome != ListOutcome::Completed {
                            self.close_container(index, outcome);
                            break;
                        }
                    }
                }
                index
            }
        };

        let result = &mut self.results[index];
        result.duration_ms = started.elapsed().as_millis() as u64;
        if result.status == StepStatus::Error {
            warn!(
                step_id = %step.id,
                error = result.error_message.as_deref().unwrap_or_default(),
                "Step errored"
            );
        }
        result.status
    }

    fn close_container(&mut self, index: usize, outcome: ListOutcome) {
        let result = &mut self.results[index];
        match outcome {
            ListOutcome::Completed => {}
            ListOutcome::Aborted => {
                result.status = StepStatus::Failed;
                result.error_message = Some("A nested step failed".to_string());
            }
            ListOutcome::Cancelled => {
                result.error_message = Some("Cancelled before nested steps finished".to_string());
            }
        }
    }

    async fn run_request(&mut self, step: &Step, request: &RequestStep) -> StepResult {
        let mut result = StepResult::new(step, StepStatus::Passed);
        let template = RequestTemplate {
            method: &request.method,
            url: &request.url,
            headers: &request.headers,
            query: &request.query,
            body: request.body.as_ref(),
            timeout_ms: request.timeout_ms,
        };

        let mut payload =
            match resolve_request(template, &self.variables, self.options.base_url.as_deref()) {
                Ok(payload) => payload,
                Err(err) => {
                    fail(&mut result, err.to_string());
                    return result;
                }
            };
        let timeout_ms = request
            .timeout_ms
            .filter(|ms| *ms > 0)
            .unwrap_or(self.options.default_timeout_ms);
        payload.timeout_ms = Some(timeout_ms);
        result.request = Some(RequestSnapshot::from(&payload));

        let response = match call_with_deadline(self.transport, &payload, timeout_ms).await {
            Ok(response) => response,
            Err(err) => {
                fail(&mut result, err.to_string());
                return result;
            }
        };
        result.response = Some(ResponseSnapshot::from(&response));
        let view = ResponseView::new(response);

        match apply_extractions(&view, &request.extractions, &mut self.variables) {
            Ok(extracted) => result.extracted_variables = extracted,
            Err(err) => fail(&mut result, err.to_string()),
        }

        if result.status != StepStatus::Error {
            match evaluate_all(&view, &request.assertions) {
                Ok(outcomes) => {
                    if !all_passed(&outcomes) {
                        result.status = StepStatus::Failed;
                    }
                    result.assertion_results = outcomes;
                }
                Err(err) => fail(&mut result, err.to_string()),
            }
        }

        self.last_response = Some(view);
        result
    }
}

fn fail(result: &mut StepResult, message: impl Into<String>) {
    result.status = StepStatus::Error;
    result.error_message = Some(message.into());
}
