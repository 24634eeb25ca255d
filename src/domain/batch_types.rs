use crate::domain::scenario_types::{
    default_method, AssertionResult, ExecutionStatus, RequestSnapshot, ResponseSnapshot, StepStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One independent, single-request test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, Value>,
    #[serde(default)]
    pub query: BTreeMap<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    /// Regex the response body must match.
    #[serde(default)]
    pub expected_response_pattern: Option<String>,
    #[serde(default)]
    pub max_response_time_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    TestRun,
    HealthCheck,
    Scenario,
}

impl ExecutionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionType::TestRun => "test_run",
            ExecutionType::HealthCheck => "health_check",
            ExecutionType::Scenario => "scenario",
        }
    }
}

pub fn execution_type_from_str(value: &str) -> ExecutionType {
    match value {
        "health_check" => ExecutionType::HealthCheck,
        "scenario" => ExecutionType::Scenario,
        _ => ExecutionType::TestRun,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub case_id: String,
    #[serde(default)]
    pub name: String,
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default)]
    pub request: Option<RequestSnapshot>,
    #[serde(default)]
    pub response: Option<ResponseSnapshot>,
    #[serde(default)]
    pub assertion_results: Vec<AssertionResult>,
    #[serde(default)]
    pub error_message: Option<String>,
    /// Transport error code when the case ended in `error`.
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl TestCaseResult {
    pub fn skipped(case: &TestCase, reason: impl Into<String>) -> Self {
        Self {
            case_id: case.id.clone(),
            name: case.name.clone(),
            status: StepStatus::Skipped,
            attempts: 0,
            request: None,
            response: None,
            assertion_results: Vec::new(),
            error_message: Some(reason.into()),
            error_type: None,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LatencyMetrics {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BatchSummary {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub error: u64,
    pub skipped: u64,
    /// Percentage of all cases that passed.
    pub pass_rate: f64,
    pub duration_ms: u64,
    #[serde(default)]
    pub latency: LatencyMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestExecutionResult {
    pub execution_id: String,
    pub execution_type: ExecutionType,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub base_url: Option<String>,
    pub summary: BatchSummary,
    pub results: Vec<TestCaseResult>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

fn default_expected_status() -> u16 {
    200
}

fn default_enabled() -> bool {
    true
}
