use crate::domain::{
    AssertionRule, AssertionSource, AssertionType, BatchSummary, ExecutionStatus, ExecutionType,
    LatencyMetrics, RequestSnapshot, ResponseSnapshot, StepStatus, TestCase, TestCaseResult,
    TestExecutionResult, VariableMap,
};
use crate::engine::assertion::{all_passed, evaluate_all};
use crate::engine::cancel::CancelSignal;
use crate::engine::env::{resolve_request, RequestTemplate};
use crate::engine::http::{call_with_deadline, HttpTransport};
use crate::engine::response::ResponseView;
use crate::error::{Error, Result};
use chrono::Utc;
use hdrhistogram::Histogram;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_CASE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub execution_id: String,
    pub execution_type: ExecutionType,
    pub base_url: Option<String>,
    /// Global variables; cases never share state beyond this read-only map.
    pub variables: VariableMap,
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
}

impl BatchOptions {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            execution_type: ExecutionType::TestRun,
            base_url: None,
            variables: VariableMap::new(),
            concurrency: DEFAULT_CONCURRENCY,
            timeout_ms: DEFAULT_CASE_TIMEOUT_MS,
            retry_count: 0,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }
}

/// GET cases expecting 200 for each path.
pub fn health_check_cases(paths: &[String]) -> Vec<TestCase> {
    paths
        .iter()
        .enumerate()
        .map(|(index, path)| TestCase {
            id: format!("health-{}", index + 1),
            name: path.clone(),
            method: "GET".to_string(),
            url: path.clone(),
            headers: Default::default(),
            query: Default::default(),
            body: None,
            expected_status: 200,
            expected_response_pattern: None,
            max_response_time_ms: None,
            timeout_ms: None,
            enabled: true,
        })
        .collect()
}

/// Status check, optional body pattern and optional response time ceiling.
fn implicit_assertions(case: &TestCase) -> Vec<AssertionRule> {
    let mut rules = vec![AssertionRule {
        assertion_type: AssertionType::Equals,
        source: AssertionSource::Status,
        expression: None,
        expected: Value::from(case.expected_status),
    }];
    if let Some(pattern) = case
        .expected_response_pattern
        .as_deref()
        .filter(|pattern| !pattern.is_empty())
    {
        rules.push(AssertionRule {
            assertion_type: AssertionType::Regex,
            source: AssertionSource::Body,
            expression: None,
            expected: Value::String(pattern.to_string()),
        });
    }
    if let Some(max_ms) = case.max_response_time_ms {
        rules.push(AssertionRule {
            assertion_type: AssertionType::LessOrEqual,
            source: AssertionSource::ResponseTime,
            expression: None,
            expected: Value::from(max_ms),
        });
    }
    rules
}

#[derive(Default)]
struct RunningStats {
    count: u64,
    mean: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }

        self.count += 1;
        self.mean += (value - self.mean) / self.count as f64;
    }
}

fn round_to_3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

fn latency_metrics(results: &[TestCaseResult]) -> Result<LatencyMetrics> {
    let mut stats = RunningStats::default();
    let mut histogram = Histogram::<u64>::new_with_bounds(1, 60_000_000, 3)
        .map_err(|err| Error::Internal(format!("Failed to initialize latency histogram: {err}")))?;

    for response in results.iter().filter_map(|result| result.response.as_ref()) {
        let latency_ms = response.response_time_ms as f64;
        stats.add(latency_ms);
        let latency_us = ((latency_ms * 1000.0).round().max(1.0) as u64).min(60_000_000);
        let _ = histogram.record(latency_us);
    }

    if stats.count == 0 {
        return Ok(LatencyMetrics::default());
    }

    let quantile = |q: f64| round_to_3(histogram.value_at_quantile(q) as f64 / 1000.0);
    Ok(LatencyMetrics {
        min_ms: round_to_3(stats.min),
        avg_ms: round_to_3(stats.mean),
        max_ms: round_to_3(stats.max),
        p50_ms: quantile(0.50),
        p95_ms: quantile(0.95),
        p99_ms: quantile(0.99),
    })
}

/// Count outcomes and compute the pass rate over every case, skipped included.
pub fn summarize(results: &[TestCaseResult], duration_ms: u64) -> Result<BatchSummary> {
    let count = |status: StepStatus| {
        results
            .iter()
            .filter(|result| result.status == status)
            .count() as u64
    };
    let total = results.len() as u64;
    let passed = count(StepStatus::Passed);
    let pass_rate = if total == 0 {
        0.0
    } else {
        round_to_3(passed as f64 / total as f64 * 100.0)
    };

    Ok(BatchSummary {
        total,
        passed,
        failed: count(StepStatus::Failed),
        error: count(StepStatus::Error),
        skipped: count(StepStatus::Skipped),
        pass_rate,
        duration_ms,
        latency: latency_metrics(results)?,
    })
}

/// Runs independent test cases on a bounded worker pool.
#[derive(Clone)]
pub struct BatchExecutor {
    transport: Arc<dyn HttpTransport>,
}

impl BatchExecutor {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    #[instrument(
        skip(self, cases, options, cancel),
        fields(execution_id = %options.execution_id, cases = cases.len())
    )]
    pub async fn execute(
        &self,
        cases: &[TestCase],
        options: &BatchOptions,
        mut cancel: CancelSignal,
    ) -> Result<TestExecutionResult> {
        let started = Instant::now();
        let mut status = ExecutionStatus::Pending.transition(ExecutionStatus::Running)?;
        let started_at = Utc::now();
        let worker_count = options.concurrency.max(1).min(cases.len().max(1));
        info!(
            workers = worker_count,
            retries = options.retry_count,
            "Starting {} batch",
            options.execution_type.as_str()
        );

        let cases = Arc::new(cases.to_vec());
        let options_shared = Arc::new(options.clone());
        // Resubscribed copies start at the channel tail, so a cancel sent
        // before this point is only visible through the original signal.
        let cancelled = Arc::new(AtomicBool::new(cancel.is_cancelled()));
        let cursor = Arc::new(AtomicUsize::new(0));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, TestCaseResult)>();

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let transport = Arc::clone(&self.transport);
            let cases = Arc::clone(&cases);
            let options = Arc::clone(&options_shared);
            let cancelled = Arc::clone(&cancelled);
            let cursor = Arc::clone(&cursor);
            let result_tx = result_tx.clone();
            let mut worker_cancel = cancel.resubscribe();

            let handle = tokio::spawn(async move {
                loop {
                    if cancelled.load(Ordering::Relaxed) || worker_cancel.is_cancelled() {
                        cancelled.store(true, Ordering::Relaxed);
                        break;
                    }

                    let index = cursor.fetch_add(1, Ordering::Relaxed);
                    let Some(case) = cases.get(index) else {
                        break;
                    };

                    let result =
                        run_case(transport.as_ref(), case, &options, &mut worker_cancel).await;
                    let _ = result_tx.send((index, result));
                }
            });
            handles.push(handle);
        }
        drop(result_tx);

        for handle in handles {
            handle
                .await
                .map_err(|err| Error::Internal(format!("Batch worker crashed: {err}")))?;
        }

        let mut slots: Vec<Option<TestCaseResult>> = vec![None; cases.len()];
        while let Some((index, result)) = result_rx.recv().await {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(result);
            }
        }
        let results: Vec<TestCaseResult> = slots
            .into_iter()
            .zip(cases.iter())
            .map(|(slot, case)| {
                slot.unwrap_or_else(|| TestCaseResult::skipped(case, "Cancelled before dispatch"))
            })
            .collect();

        let was_cancelled = cancelled.load(Ordering::Relaxed);
        let summary = summarize(&results, started.elapsed().as_millis() as u64)?;
        let outcome = if summary.failed + summary.error > 0 {
            ExecutionStatus::Failed
        } else if was_cancelled {
            ExecutionStatus::Cancelled
        } else {
            ExecutionStatus::Passed
        };
        status = status.transition(outcome)?;

        info!(
            status = status.as_str(),
            passed = summary.passed,
            failed = summary.failed,
            error = summary.error,
            skipped = summary.skipped,
            pass_rate = summary.pass_rate,
            duration_ms = summary.duration_ms,
            "Batch finished"
        );

        Ok(TestExecutionResult {
            execution_id: options.execution_id.clone(),
            execution_type: options.execution_type,
            status,
            base_url: options.base_url.clone(),
            summary,
            results,
            started_at,
            completed_at: Some(Utc::now()),
        })
    }
}

async fn run_case(
    transport: &dyn HttpTransport,
    case: &TestCase,
    options: &BatchOptions,
    cancel: &mut CancelSignal,
) -> TestCaseResult {
    if !case.enabled {
        return TestCaseResult::skipped(case, "Test case is disabled");
    }

    let started = Instant::now();
    let mut result = TestCaseResult {
        case_id: case.id.clone(),
        name: case.name.clone(),
        status: StepStatus::Passed,
        attempts: 0,
        request: None,
        response: None,
        assertion_results: Vec::new(),
        error_message: None,
        error_type: None,
        duration_ms: 0,
    };

    let template = RequestTemplate {
        method: &case.method,
        url: &case.url,
        headers: &case.headers,
        query: &case.query,
        body: case.body.as_ref(),
        timeout_ms: case.timeout_ms,
    };
    let mut payload =
        match resolve_request(template, &options.variables, options.base_url.as_deref()) {
            Ok(payload) => payload,
            Err(err) => {
                result.status = StepStatus::Error;
                result.error_message = Some(err.to_string());
                return result;
            }
        };
    let timeout_ms = case
        .timeout_ms
        .filter(|ms| *ms > 0)
        .unwrap_or(options.timeout_ms);
    payload.timeout_ms = Some(timeout_ms);
    result.request = Some(RequestSnapshot::from(&payload));

    let response = loop {
        result.attempts += 1;
        match call_with_deadline(transport, &payload, timeout_ms).await {
            Ok(response) => break Some(response),
            Err(err) => {
                let retry = err.is_retryable()
                    && result.attempts <= options.retry_count
                    && !cancel.is_cancelled();
                if retry {
                    warn!(case_id = %case.id, attempt = result.attempts, error = %err, "Retrying test case");
                    let delay = tokio::time::sleep(Duration::from_millis(options.retry_delay_ms));
                    let interrupted = tokio::select! {
                        _ = delay => false,
                        _ = cancel.cancelled() => true,
                    };
                    if !interrupted {
                        continue;
                    }
                }
                result.status = StepStatus::Error;
                result.error_type = Some(err.code().to_string());
                result.error_message = Some(err.to_string());
                break None;
            }
        }
    };

    if let Some(response) = response {
        result.response = Some(ResponseSnapshot::from(&response));
        let view = ResponseView::new(response);
        match evaluate_all(&view, &implicit_assertions(case)) {
            Ok(outcomes) => {
                if !all_passed(&outcomes) {
                    result.status = StepStatus::Failed;
                }
                result.assertion_results = outcomes;
            }
            Err(err) => {
                result.status = StepStatus::Error;
                result.error_message = Some(err.to_string());
            }
        }
    }

    result.duration_ms = started.elapsed().as_millis() as u64;
    debug!(case_id = %case.id, status = result.status.as_str(), attempts = result.attempts, "Test case finished");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::cancel::CancelRegistry;
    use crate::engine::scripted::{ScriptedReply, ScriptedTransport};
    use crate::error::TransportError;
    use serde_json::json;

    fn case(id: &str, url: &str) -> TestCase {
        serde_json::from_value(json!({"id": id, "name": id, "url": url})).expect("test case")
    }

    fn options() -> BatchOptions {
        let mut options = BatchOptions::new("batch-test");
        options.base_url = Some("http://api.test".to_string());
        options.retry_delay_ms = 1;
        options
    }

    async fn run(
        transport: Arc<ScriptedTransport>,
        cases: &[TestCase],
        options: &BatchOptions,
    ) -> TestExecutionResult {
        BatchExecutor::new(transport)
            .execute(cases, options, CancelSignal::never())
            .await
            .expect("batch result")
    }

    #[tokio::test]
    async fn classifies_cases_and_aggregates() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route("GET", "/ok", ScriptedReply::json(200, json!({"state": "green"})))
                .route("GET", "/missing", ScriptedReply::json(404, json!({})))
                .route("GET", "/down", ScriptedReply::Fail(TransportError::Connect("refused".into()))),
        );
        let mut patterned = case("pattern", "/ok");
        patterned.expected_response_pattern = Some(r#""state":\s*"green""#.to_string());
        let mut disabled = case("disabled", "/ok");
        disabled.enabled = false;
        let cases = vec![
            case("ok", "/ok"),
            patterned,
            case("missing", "/missing"),
            case("down", "/down"),
            disabled,
        ];

        let result = run(transport.clone(), &cases, &options()).await;

        let statuses: Vec<StepStatus> = result.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::Passed,
                StepStatus::Passed,
                StepStatus::Failed,
                StepStatus::Error,
                StepStatus::Skipped
            ]
        );
        assert_eq!(result.results[3].error_type.as_deref(), Some("CONNECT_ERROR"));
        assert_eq!(result.summary.total, 5);
        assert_eq!(
            (result.summary.passed, result.summary.failed, result.summary.error, result.summary.skipped),
            (2, 1, 1, 1)
        );
        assert_eq!(result.summary.pass_rate, 40.0);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(transport.call_count(), 4);
    }

    #[tokio::test]
    async fn retries_transport_errors_but_not_assertion_failures() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route_sequence(
                    "GET",
                    "/flaky",
                    vec![
                        ScriptedReply::Fail(TransportError::Connect("refused".into())),
                        ScriptedReply::json(200, json!({})),
                    ],
                )
                .route("GET", "/wrong", ScriptedReply::json(500, json!({}))),
        );
        let mut options = options();
        options.retry_count = 2;

        let result = run(
            transport.clone(),
            &[case("flaky", "/flaky"), case("wrong", "/wrong")],
            &options,
        )
        .await;

        assert_eq!(result.results[0].status, StepStatus::Passed);
        assert_eq!(result.results[0].attempts, 2);
        assert_eq!(result.results[1].status, StepStatus::Failed);
        assert_eq!(result.results[1].attempts, 1);
        assert_eq!(transport.calls_to("/wrong"), 1);
    }

    #[tokio::test]
    async fn worker_pool_is_bounded_by_concurrency() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route("GET", "/slow", ScriptedReply::json(200, json!({})).delayed(20)),
        );
        let cases: Vec<TestCase> = (0..8).map(|i| case(&format!("c{i}"), "/slow")).collect();
        let mut options = options();
        options.concurrency = 2;

        let result = run(transport.clone(), &cases, &options).await;

        assert_eq!(result.summary.passed, 8);
        assert!(transport.peak_concurrency() <= 2);
        assert_eq!(result.status, ExecutionStatus::Passed);
        assert!(result.summary.latency.max_ms >= 20.0);
    }

    #[tokio::test]
    async fn max_response_time_is_enforced() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route("GET", "/slow", ScriptedReply::json(200, json!({})).delayed(40)),
        );
        let mut slow = case("slow", "/slow");
        slow.max_response_time_ms = Some(10);

        let result = run(transport, &[slow], &options()).await;

        assert_eq!(result.results[0].status, StepStatus::Failed);
        assert_eq!(result.results[0].assertion_results.len(), 2);
    }

    #[tokio::test]
    async fn cancelled_batch_skips_undispatched_cases() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .route("GET", "/slow", ScriptedReply::json(200, json!({})).delayed(50)),
        );
        let cases: Vec<TestCase> = (0..6).map(|i| case(&format!("c{i}"), "/slow")).collect();
        let mut options = options();
        options.concurrency = 1;

        let registry = Arc::new(CancelRegistry::new());
        let signal = registry.register("batch-test");
        let canceller = Arc::clone(&registry);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(70)).await;
            canceller.cancel("batch-test");
        });

        let result = BatchExecutor::new(transport.clone())
            .execute(&cases, &options, signal)
            .await
            .expect("batch result");

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(result.summary.skipped >= 3);
        assert_eq!(
            result.summary.passed + result.summary.skipped,
            result.summary.total
        );
        assert_eq!(transport.call_count() as u64, result.summary.passed);
    }

    #[tokio::test]
    async fn batch_cancelled_before_start_dispatches_nothing() {
        let transport = Arc::new(
            ScriptedTransport::new().route("GET", "/fast", ScriptedReply::json(200, json!({}))),
        );
        let cases: Vec<TestCase> = (0..4).map(|i| case(&format!("c{i}"), "/fast")).collect();

        let registry = CancelRegistry::new();
        let signal = registry.register("batch-test");
        assert!(registry.cancel("batch-test"));

        let result = BatchExecutor::new(transport.clone())
            .execute(&cases, &options(), signal)
            .await
            .expect("batch result");

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(result.summary.skipped, 4);
        assert_eq!(result.summary.passed, 0);
        assert_eq!(transport.call_count(), 0);
        assert!(result
            .results
            .iter()
            .all(|case| case.status == StepStatus::Skipped));
    }

    #[test]
    fn health_check_cases_expect_200() {
        let cases = health_check_cases(&["/health".to_string(), "/ready".to_string()]);
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[1].id, "health-2");
        assert!(cases.iter().all(|case| case.method == "GET" && case.expected_status == 200));
    }

    #[test]
    fn summary_of_nothing_is_zero() {
        let summary = summarize(&[], 0).expect("summary");
        assert_eq!(summary.total, 0);
        assert_eq!(summary.pass_rate, 0.0);
        assert_eq!(summary.latency, LatencyMetrics::default());
    }
}
