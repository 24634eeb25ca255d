use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-execution variable store. Keys are variable names.
pub type VariableMap = BTreeMap<String, Value>;

// ─── Definitions ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub variables: VariableMap,
    #[serde(default)]
    pub retry_on_failure: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Sort a step list by `order` without touching the definition.
pub fn ordered(steps: &[Step]) -> Vec<&Step> {
    let mut sorted: Vec<&Step> = steps.iter().collect();
    sorted.sort_by_key(|step| step.order);
    sorted
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub order: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub continue_on_failure: bool,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step_type", rename_all = "snake_case")]
pub enum StepKind {
    Request(RequestStep),
    Wait {
        wait_time_ms: u64,
    },
    Condition(ConditionStep),
    Loop(LoopStep),
    Extract {
        #[serde(default)]
        extractions: Vec<ExtractionRule>,
    },
    Assert {
        #[serde(default)]
        assertions: Vec<AssertionRule>,
    },
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Request(_) => "request",
            StepKind::Wait { .. } => "wait",
            StepKind::Condition(_) => "condition",
            StepKind::Loop(_) => "loop",
            StepKind::Extract { .. } => "extract",
            StepKind::Assert { .. } => "assert",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStep {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    #[serde(default)]
    pub query: BTreeMap<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub extractions: Vec<ExtractionRule>,
    #[serde(default)]
    pub assertions: Vec<AssertionRule>,
}

/// Runs `then_steps` when `condition` holds, `else_steps` otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionStep {
    pub condition: String,
    #[serde(default)]
    pub then_steps: Vec<Step>,
    #[serde(default)]
    pub else_steps: Vec<Step>,
}

/// Repeats `steps` up to `count` times while the optional `while` expression holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopStep {
    pub count: u32,
    #[serde(default, rename = "while")]
    pub while_condition: Option<String>,
    #[serde(default = "default_index_variable")]
    pub index_variable: String,
    #[serde(default)]
    pub steps: Vec<Step>,
}

pub const MAX_LOOP_ITERATIONS: u32 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRule {
    pub name: String,
    pub source: ExtractionSource,
    #[serde(default)]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    #[serde(rename = "jsonpath", alias = "json_path")]
    JsonPath,
    Regex,
    Header,
    Status,
    Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionRule {
    #[serde(rename = "type")]
    pub assertion_type: AssertionType,
    pub source: AssertionSource,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub expected: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionType {
    Equals,
    NotEquals,
    Contains,
    Regex,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    Exists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionSource {
    Status,
    #[serde(rename = "jsonpath", alias = "json_path")]
    JsonPath,
    Header,
    Body,
    ResponseTime,
}

// ─── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    #[serde(rename = "type")]
    pub assertion_type: AssertionType,
    pub source: AssertionSource,
    pub expression: Option<String>,
    pub expected: Value,
    pub actual: Option<Value>,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Passed => "passed",
            StepStatus::Failed => "failed",
            StepStatus::Error => "error",
            StepStatus::Skipped => "skipped",
        }
    }

    /// Failed and errored steps both break a scenario.
    pub fn is_failure(self) -> bool {
        matches!(self, StepStatus::Failed | StepStatus::Error)
    }
}

/// Inverse of [`StepStatus::as_str`]. Unknown names read back as `Error`.
pub fn step_status_from_str(value: &str) -> StepStatus {
    match value {
        "passed" => StepStatus::Passed,
        "failed" => StepStatus::Failed,
        "skipped" => StepStatus::Skipped,
        _ => StepStatus::Error,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Passed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Passed => "passed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Passed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    fn can_transition_to(self, next: ExecutionStatus) -> bool {
        match self {
            ExecutionStatus::Pending => {
                matches!(next, ExecutionStatus::Running | ExecutionStatus::Cancelled)
            }
            ExecutionStatus::Running => next.is_terminal(),
            _ => false,
        }
    }

    /// Validate a lifecycle move; terminal states never change.
    pub fn transition(self, next: ExecutionStatus) -> Result<ExecutionStatus> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

/// Inverse of [`ExecutionStatus::as_str`]. Unknown names read back as `Failed`.
pub fn execution_status_from_str(value: &str) -> ExecutionStatus {
    match value {
        "pending" => ExecutionStatus::Pending,
        "running" => ExecutionStatus::Running,
        "passed" => ExecutionStatus::Passed,
        "cancelled" => ExecutionStatus::Cancelled,
        _ => ExecutionStatus::Failed,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub query: BTreeMap<String, String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSnapshot {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub response_time_ms: u64,
}

impl From<&crate::domain::SendRequestPayload> for RequestSnapshot {
    fn from(payload: &crate::domain::SendRequestPayload) -> Self {
        Self {
            method: payload.method.clone(),
            url: payload.url.clone(),
            headers: payload.headers.clone(),
            query: payload.query.clone(),
            body: payload.body.clone(),
        }
    }
}

impl From<&crate::domain::SendResponsePayload> for ResponseSnapshot {
    fn from(payload: &crate::domain::SendResponsePayload) -> Self {
        Self {
            status_code: payload.status,
            headers: payload.headers.clone(),
            body: payload.body.clone(),
            response_time_ms: payload.time,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub step_order: i64,
    #[serde(default)]
    pub name: String,
    pub step_type: String,
    pub status: StepStatus,
    #[serde(default)]
    pub request: Option<RequestSnapshot>,
    #[serde(default)]
    pub response: Option<ResponseSnapshot>,
    #[serde(default)]
    pub extracted_variables: VariableMap,
    #[serde(default)]
    pub assertion_results: Vec<AssertionResult>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub parent_step_id: Option<String>,
    #[serde(default)]
    pub iteration: Option<u32>,
}

impl StepResult {
    pub fn new(step: &Step, status: StepStatus) -> Self {
        Self {
            step_id: step.id.clone(),
            step_order: step.order,
            name: step.name.clone(),
            step_type: step.kind.name().to_string(),
            status,
            request: None,
            response: None,
            extracted_variables: VariableMap::new(),
            assertion_results: Vec::new(),
            error_message: None,
            duration_ms: 0,
            parent_step_id: None,
            iteration: None,
        }
    }

    pub fn skipped(step: &Step) -> Self {
        Self::new(step, StepStatus::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioExecutionResult {
    pub execution_id: String,
    pub scenario_id: String,
    pub scenario_name: String,
    pub status: ExecutionStatus,
    pub attempts: u32,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub environment: Option<String>,
    /// Variables the final attempt started from.
    pub variables: VariableMap,
    /// Variables as they stood when the final attempt stopped.
    pub final_variables: VariableMap,
    pub step_results: Vec<StepResult>,
    pub total_steps: u32,
    pub passed_steps: u32,
    pub failed_steps: u32,
    pub skipped_steps: u32,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ScenarioExecutionResult {
    pub fn pending(execution_id: impl Into<String>, scenario: &Scenario) -> Self {
        Self {
            execution_id: execution_id.into(),
            scenario_id: scenario.id.clone(),
            scenario_name: scenario.name.clone(),
            status: ExecutionStatus::Pending,
            attempts: 0,
            base_url: None,
            environment: None,
            variables: VariableMap::new(),
            final_variables: VariableMap::new(),
            step_results: Vec::new(),
            total_steps: 0,
            passed_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
            duration_ms: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn set_status(&mut self, next: ExecutionStatus) -> Result<()> {
        self.status = self.status.transition(next)?;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Recount totals from `step_results`. Errors count as failures.
    pub fn tally(&mut self) {
        self.total_steps = self.step_results.len() as u32;
        self.passed_steps = self.count(StepStatus::Passed);
        self.failed_steps = self.count(StepStatus::Failed) + self.count(StepStatus::Error);
        self.skipped_steps = self.count(StepStatus::Skipped);
    }

    fn count(&self, status: StepStatus) -> u32 {
        self.step_results
            .iter()
            .filter(|result| result.status == status)
            .count() as u32
    }
}

fn default_enabled() -> bool {
    true
}

pub(crate) fn default_method() -> String {
    "GET".to_string()
}

fn default_index_variable() -> String {
    "loop_index".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_deserializes_by_step_type_tag() {
        let step: Step = serde_json::from_value(json!({
            "id": "s1",
            "order": 2,
            "step_type": "request",
            "method": "POST",
            "url": "/login",
            "body": {"user": "${username}"},
            "extractions": [
                {"name": "token", "source": "jsonpath", "expression": "$.data.token"}
            ],
            "assertions": [
                {"type": "equals", "source": "status", "expected": 200}
            ]
        }))
        .expect("request step");

        let StepKind::Request(request) = &step.kind else {
            panic!("expected a request step");
        };
        assert_eq!(request.method, "POST");
        assert_eq!(request.extractions[0].source, ExtractionSource::JsonPath);
        assert_eq!(request.assertions[0].assertion_type, AssertionType::Equals);
        assert!(!step.continue_on_failure);
    }

    #[test]
    fn nested_loop_and_wait_steps_deserialize() {
        let step: Step = serde_json::from_value(json!({
            "id": "loop",
            "order": 1,
            "step_type": "loop",
            "count": 3,
            "while": "attempts < 3",
            "steps": [
                {"id": "pause", "order": 1, "step_type": "wait", "wait_time_ms": 10}
            ]
        }))
        .expect("loop step");

        let StepKind::Loop(loop_step) = &step.kind else {
            panic!("expected a loop step");
        };
        assert_eq!(loop_step.count, 3);
        assert_eq!(loop_step.index_variable, "loop_index");
        assert_eq!(loop_step.while_condition.as_deref(), Some("attempts < 3"));
        assert!(matches!(
            loop_step.steps[0].kind,
            StepKind::Wait { wait_time_ms: 10 }
        ));
    }

    #[test]
    fn ordered_sorts_by_order() {
        let scenario: Scenario = serde_json::from_value(json!({
            "id": "sc",
            "name": "ordering",
            "steps": [
                {"id": "b", "order": 20, "step_type": "wait", "wait_time_ms": 0},
                {"id": "a", "order": 10, "step_type": "wait", "wait_time_ms": 0}
            ]
        }))
        .expect("scenario");

        let ids: Vec<&str> = ordered(&scenario.steps)
            .iter()
            .map(|step| step.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(scenario.enabled);
        assert_eq!(scenario.max_retries, 0);
    }

    #[test]
    fn execution_status_rejects_leaving_terminal_state() {
        assert_eq!(
            ExecutionStatus::Pending.transition(ExecutionStatus::Running).ok(),
            Some(ExecutionStatus::Running)
        );
        assert!(ExecutionStatus::Running
            .transition(ExecutionStatus::Passed)
            .is_ok());
        assert!(ExecutionStatus::Passed
            .transition(ExecutionStatus::Running)
            .is_err());
        assert!(ExecutionStatus::Pending
            .transition(ExecutionStatus::Passed)
            .is_err());
    }

    #[test]
    fn status_strings_round_trip_through_storage_names() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Passed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(execution_status_from_str(status.as_str()), status);
        }
        assert_eq!(step_status_from_str("skipped"), StepStatus::Skipped);
        assert_eq!(step_status_from_str("bogus"), StepStatus::Error);
    }
}
