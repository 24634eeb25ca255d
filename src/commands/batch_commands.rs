use crate::commands::{generate_id, AppContext};
use crate::domain::{
    BatchSummary, ExecutionStatus, ExecutionType, TestCase, TestExecutionResult,
};
use crate::engine::{health_check_cases, BatchExecutor, BatchOptions};
use crate::error::{Error, Result};
use crate::store::sqlite;
use chrono::Utc;
use std::collections::HashSet;
use tracing::info;

/// Caller-side inputs for a batch run. Unset fields fall back to the config.
#[derive(Debug, Clone)]
pub struct BatchRunRequest {
    pub cases: Vec<TestCase>,
    pub execution_type: ExecutionType,
    pub base_url: Option<String>,
    pub environment: Option<String>,
    pub concurrency: Option<usize>,
    pub retry_count: Option<u32>,
    pub timeout_ms: Option<u64>,
}

impl BatchRunRequest {
    pub fn new(cases: Vec<TestCase>) -> Self {
        Self {
            cases,
            execution_type: ExecutionType::TestRun,
            base_url: None,
            environment: None,
            concurrency: None,
            retry_count: None,
            timeout_ms: None,
        }
    }
}

fn check_cases(cases: &[TestCase]) -> Result<()> {
    let mut ids = HashSet::new();
    for case in cases {
        if !ids.insert(case.id.as_str()) {
            return Err(Error::invalid(format!("duplicate test case id `{}`", case.id)));
        }
        if let Some(pattern) = &case.expected_response_pattern {
            regex::Regex::new(pattern).map_err(|err| {
                Error::invalid(format!("case `{}`: invalid response pattern: {err}", case.id))
            })?;
        }
    }
    Ok(())
}

pub async fn run_batch(ctx: &AppContext, request: BatchRunRequest) -> Result<TestExecutionResult> {
    check_cases(&request.cases)?;
    let concurrency = request.concurrency.unwrap_or(ctx.config.batch.concurrency);
    if concurrency == 0 {
        return Err(Error::InvalidConfig(
            "concurrency must be at least 1".to_string(),
        ));
    }

    let environment = request
        .environment
        .or_else(|| ctx.config.environment.clone());
    let options = BatchOptions {
        execution_id: generate_id(request.execution_type.as_str()),
        execution_type: request.execution_type,
        base_url: request.base_url.or_else(|| ctx.config.base_url.clone()),
        variables: ctx.config.global_variables(environment.as_deref())?,
        concurrency,
        timeout_ms: request
            .timeout_ms
            .unwrap_or(ctx.config.transport.default_timeout_ms),
        retry_count: request.retry_count.unwrap_or(ctx.config.batch.retry_count),
        retry_delay_ms: ctx.config.batch.retry_delay_ms,
    };

    let running = TestExecutionResult {
        execution_id: options.execution_id.clone(),
        execution_type: options.execution_type,
        status: ExecutionStatus::Pending.transition(ExecutionStatus::Running)?,
        base_url: options.base_url.clone(),
        summary: BatchSummary {
            total: request.cases.len() as u64,
            ..BatchSummary::default()
        },
        results: Vec::new(),
        started_at: Utc::now(),
        completed_at: None,
    };
    ctx.persist("batch start", |conn| sqlite::save_test_execution(conn, &running));

    let cancel = ctx.registry.register(&options.execution_id);
    let outcome = BatchExecutor::new(ctx.transport.clone())
        .execute(&request.cases, &options, cancel)
        .await;
    ctx.registry.remove(&options.execution_id);
    let result = outcome?;

    ctx.persist("batch result", |conn| sqlite::save_test_execution(conn, &result));
    info!(
        execution_id = %result.execution_id,
        status = result.status.as_str(),
        pass_rate = result.summary.pass_rate,
        "Batch execution recorded"
    );
    Ok(result)
}

/// GET every path and expect 200.
pub async fn run_health_check(
    ctx: &AppContext,
    paths: &[String],
    base_url: Option<String>,
    concurrency: Option<usize>,
) -> Result<TestExecutionResult> {
    if paths.is_empty() {
        return Err(Error::invalid("health check needs at least one path"));
    }
    let mut request = BatchRunRequest::new(health_check_cases(paths));
    request.execution_type = ExecutionType::HealthCheck;
    request.base_url = base_url;
    request.concurrency = concurrency;
    run_batch(ctx, request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::domain::StepStatus;
    use crate::engine::{ScriptedReply, ScriptedTransport};
    use serde_json::json;
    use std::sync::Arc;

    fn case(id: &str, url: &str) -> TestCase {
        serde_json::from_value(json!({"id": id, "url": url})).expect("case")
    }

    fn context(dir: &tempfile::TempDir, transport: Arc<ScriptedTransport>) -> AppContext {
        let mut config = RunnerConfig::default();
        config.database_path = dir.path().join("runner.db");
        config.base_url = Some("http://api.test".to_string());
        config.batch.retry_delay_ms = 1;
        AppContext::with_transport(config, transport)
    }

    #[tokio::test]
    async fn health_check_is_recorded_as_health_check() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(
            ScriptedTransport::new()
                .route("GET", "/health", ScriptedReply::text(200, "ok"))
                .route("GET", "/ready", ScriptedReply::text(503, "starting")),
        );
        let ctx = context(&dir, transport);

        let result = run_health_check(
            &ctx,
            &["/health".to_string(), "/ready".to_string()],
            None,
            Some(2),
        )
        .await
        .expect("health");

        assert_eq!(result.execution_type, ExecutionType::HealthCheck);
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.summary.passed, 1);
        assert_eq!(result.summary.failed, 1);

        let conn = ctx.open_db().expect("db");
        let stored = sqlite::load_test_execution(&conn, &result.execution_id)
            .expect("load")
            .expect("stored");
        assert_eq!(stored.execution_type, ExecutionType::HealthCheck);
        assert_eq!(stored.results.len(), 2);
        assert_eq!(stored.results[1].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn duplicate_case_ids_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = context(&dir, transport.clone()).without_store();

        let request = BatchRunRequest::new(vec![case("a", "/a"), case("a", "/b")]);
        let err = run_batch(&ctx, request).await.unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition(_)));
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn request_overrides_config_retries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(ScriptedTransport::new().route_sequence(
            "GET",
            "/flaky",
            vec![
                ScriptedReply::Fail(crate::error::TransportError::Connect("refused".into())),
                ScriptedReply::text(200, "ok"),
            ],
        ));
        let ctx = context(&dir, transport.clone()).without_store();

        let mut request = BatchRunRequest::new(vec![case("flaky", "/flaky")]);
        request.retry_count = Some(1);
        let result = run_batch(&ctx, request).await.expect("batch");

        assert_eq!(result.status, ExecutionStatus::Passed);
        assert_eq!(result.results[0].attempts, 2);
        assert_eq!(transport.calls_to("/flaky"), 2);
    }
}
