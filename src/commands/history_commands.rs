use crate::commands::AppContext;
use crate::domain::{ScenarioExecutionResult, TestExecutionResult};
use crate::error::Result;
use crate::store::sqlite::{self, ExecutionSummaryRow};
use serde::Serialize;

/// Scenario and test runs together, newest first.
pub fn list_executions(
    ctx: &AppContext,
    scenario_id: Option<&str>,
    limit: usize,
) -> Result<Vec<ExecutionSummaryRow>> {
    let conn = ctx.open_db()?;
    let mut rows = sqlite::list_scenario_executions(&conn, scenario_id, limit)?;
    if scenario_id.is_none() {
        rows.extend(sqlite::list_test_executions(&conn, limit)?);
    }
    rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    rows.truncate(limit);
    Ok(rows)
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoredExecution {
    Scenario(ScenarioExecutionResult),
    Batch(TestExecutionResult),
}

pub fn get_execution(ctx: &AppContext, execution_id: &str) -> Result<Option<StoredExecution>> {
    let conn = ctx.open_db()?;
    if let Some(result) = sqlite::load_scenario_execution(&conn, execution_id)? {
        return Ok(Some(StoredExecution::Scenario(result)));
    }
    Ok(sqlite::load_test_execution(&conn, execution_id)?.map(StoredExecution::Batch))
}
