use crate::commands::{generate_id, AppContext};
use crate::domain::{ExecutionStatus, Scenario, ScenarioExecutionResult, VariableMap};
use crate::engine::{validate_scenario, ExecutionOptions, ScenarioExecutor};
use crate::error::Result;
use crate::store::sqlite;
use tracing::info;

/// Caller-side inputs for one scenario run.
#[derive(Debug, Clone)]
pub struct ScenarioRunRequest {
    pub scenario: Scenario,
    pub base_url: Option<String>,
    pub environment: Option<String>,
    pub overrides: VariableMap,
}

impl ScenarioRunRequest {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            base_url: None,
            environment: None,
            overrides: VariableMap::new(),
        }
    }
}

pub fn definition_hash(scenario: &Scenario) -> Result<String> {
    let definition_json = serde_json::to_string(scenario)?;
    Ok(format!("{:x}", md5::compute(definition_json.as_bytes())))
}

/// Validate, run and record one scenario execution.
pub async fn run_scenario(
    ctx: &AppContext,
    request: ScenarioRunRequest,
) -> Result<ScenarioExecutionResult> {
    let ScenarioRunRequest {
        scenario,
        base_url,
        environment,
        overrides,
    } = request;
    validate_scenario(&scenario)?;

    let environment = environment.or_else(|| ctx.config.environment.clone());
    let options = ExecutionOptions {
        execution_id: generate_id("scenario"),
        base_url: base_url.or_else(|| ctx.config.base_url.clone()),
        globals: ctx.config.global_variables(environment.as_deref())?,
        environment,
        overrides,
        default_timeout_ms: ctx.config.transport.default_timeout_ms,
    };
    let hash = definition_hash(&scenario)?;

    let mut record = ScenarioExecutionResult::pending(options.execution_id.clone(), &scenario);
    record.base_url = options.base_url.clone();
    record.environment = options.environment.clone();
    record.set_status(ExecutionStatus::Running)?;
    ctx.persist("scenario start", |conn| {
        sqlite::save_scenario_execution(conn, &record, Some(&hash))
    });

    let cancel = ctx.registry.register(&options.execution_id);
    let outcome = ScenarioExecutor::new(ctx.transport.clone())
        .execute(&scenario, &options, cancel)
        .await;
    ctx.registry.remove(&options.execution_id);

    let result = match outcome {
        Ok(result) => result,
        Err(err) => {
            record.set_status(ExecutionStatus::Failed)?;
            ctx.persist("scenario failure", |conn| {
                sqlite::save_scenario_execution(conn, &record, None)
            });
            return Err(err);
        }
    };

    ctx.persist("scenario result", |conn| {
        sqlite::save_scenario_execution(conn, &result, None)
    });
    info!(
        execution_id = %result.execution_id,
        status = result.status.as_str(),
        "Scenario execution recorded"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::domain::{EnvVariable, Environment};
    use crate::engine::{ScriptedReply, ScriptedTransport};
    use crate::error::Error;
    use serde_json::json;
    use std::sync::Arc;

    fn scenario(value: serde_json::Value) -> Scenario {
        serde_json::from_value(value).expect("scenario")
    }

    fn context(dir: &tempfile::TempDir, transport: Arc<ScriptedTransport>) -> AppContext {
        let mut config = RunnerConfig::default();
        config.database_path = dir.path().join("runner.db");
        config.base_url = Some("http://api.test".to_string());
        config.variables.push(EnvVariable {
            id: String::new(),
            key: "user".to_string(),
            value: "global".to_string(),
            enabled: true,
        });
        config.environments.push(Environment {
            id: String::new(),
            name: "staging".to_string(),
            variables: vec![EnvVariable {
                id: String::new(),
                key: "user".to_string(),
                value: "staging".to_string(),
                enabled: true,
            }],
        });
        AppContext::with_transport(config, transport)
    }

    #[tokio::test]
    async fn run_is_recorded_with_definition_hash() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(ScriptedTransport::new().route(
            "GET",
            "/users/staging",
            ScriptedReply::json(200, json!({"ok": true})),
        ));
        let ctx = context(&dir, transport.clone());
        let definition = scenario(json!({
            "id": "lookup",
            "name": "Lookup",
            "steps": [{
                "id": "get",
                "order": 1,
                "step_type": "request",
                "url": "/users/${user}",
                "assertions": [{"type": "equals", "source": "status", "expected": 200}]
            }]
        }));

        let mut request = ScenarioRunRequest::new(definition.clone());
        request.environment = Some("staging".to_string());
        let result = run_scenario(&ctx, request).await.expect("run");

        assert_eq!(result.status, ExecutionStatus::Passed);
        assert_eq!(transport.calls()[0].url, "http://api.test/users/staging");
        assert!(ctx.registry.active().is_empty());

        let conn = ctx.open_db().expect("db");
        let stored = sqlite::load_scenario_execution(&conn, &result.execution_id)
            .expect("load")
            .expect("stored");
        assert_eq!(stored.status, ExecutionStatus::Passed);
        assert_eq!(stored.environment.as_deref(), Some("staging"));
        let hash: String = conn
            .query_row(
                "SELECT definition_hash FROM scenario_executions WHERE execution_id = ?1",
                [&result.execution_id],
                |row| row.get(0),
            )
            .expect("hash");
        assert_eq!(hash, definition_hash(&definition).expect("hash"));
    }

    #[tokio::test]
    async fn invalid_definitions_are_rejected_before_any_call() {
        let dir = tempfile::tempdir().expect("tempdir");
        let transport = Arc::new(ScriptedTransport::new());
        let ctx = context(&dir, transport.clone()).without_store();
        let definition = scenario(json!({
            "id": "bad",
            "name": "Bad regex",
            "steps": [{
                "id": "get",
                "order": 1,
                "step_type": "request",
                "url": "/x",
                "extractions": [{"name": "id", "source": "regex", "expression": "(unclosed"}]
            }]
        }));

        let err = run_scenario(&ctx, ScenarioRunRequest::new(definition))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDefinition(_)));
        assert_eq!(transport.call_count(), 0);
        assert!(!dir.path().join("runner.db").exists());
    }
}
