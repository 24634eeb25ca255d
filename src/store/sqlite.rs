use crate::domain::{
    execution_status_from_str, execution_type_from_str, step_status_from_str, AssertionResult,
    BatchSummary, ExecutionStatus, LatencyMetrics, RequestSnapshot, ResponseSnapshot,
    ScenarioExecutionResult, StepResult, TestCaseResult, TestExecutionResult, VariableMap,
};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub fn open_db(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    init_schema(&conn)?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS scenario_executions (
         execution_id TEXT PRIMARY KEY,
         scenario_id TEXT NOT NULL,
         scenario_name TEXT NOT NULL DEFAULT '',
         status TEXT NOT NULL,
         attempts INTEGER NOT NULL DEFAULT 0,
         base_url TEXT,
         environment TEXT,
         variables TEXT NOT NULL DEFAULT '{}',
         final_variables TEXT NOT NULL DEFAULT '{}',
         definition_hash TEXT,
         total_steps INTEGER NOT NULL DEFAULT 0,
         passed_steps INTEGER NOT NULL DEFAULT 0,
         failed_steps INTEGER NOT NULL DEFAULT 0,
         skipped_steps INTEGER NOT NULL DEFAULT 0,
         duration_ms INTEGER NOT NULL DEFAULT 0,
         started_at TEXT NOT NULL,
         completed_at TEXT
       );
       CREATE INDEX IF NOT EXISTS idx_scenario_executions_scenario
         ON scenario_executions (scenario_id, started_at);

       CREATE TABLE IF NOT EXISTS step_results (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         execution_id TEXT NOT NULL,
         position INTEGER NOT NULL,
         step_id TEXT NOT NULL,
         step_order INTEGER NOT NULL,
         step_name TEXT NOT NULL DEFAULT '',
         step_type TEXT NOT NULL,
         parent_step_id TEXT,
         iteration INTEGER,
         status TEXT NOT NULL,
         request_method TEXT,
         request_url TEXT,
         request_headers TEXT,
         request_query TEXT,
         request_body TEXT,
         response_status_code INTEGER,
         response_headers TEXT,
         response_body TEXT,
         response_time_ms INTEGER,
         extracted_variables TEXT NOT NULL DEFAULT '{}',
         assertion_results TEXT NOT NULL DEFAULT '[]',
         error_message TEXT,
         duration_ms INTEGER NOT NULL DEFAULT 0
       );
       CREATE INDEX IF NOT EXISTS idx_step_results_execution
         ON step_results (execution_id, position);

       CREATE TABLE IF NOT EXISTS test_executions (
         execution_id TEXT PRIMARY KEY,
         execution_type TEXT NOT NULL,
         status TEXT NOT NULL,
         base_url TEXT,
         total INTEGER NOT NULL DEFAULT 0,
         passed INTEGER NOT NULL DEFAULT 0,
         failed INTEGER NOT NULL DEFAULT 0,
         error INTEGER NOT NULL DEFAULT 0,
         skipped INTEGER NOT NULL DEFAULT 0,
         pass_rate REAL NOT NULL DEFAULT 0,
         duration_ms INTEGER NOT NULL DEFAULT 0,
         latency TEXT NOT NULL DEFAULT '{}',
         started_at TEXT NOT NULL,
         completed_at TEXT
       );

       CREATE TABLE IF NOT EXISTS test_results (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         execution_id TEXT NOT NULL,
         position INTEGER NOT NULL,
         case_id TEXT NOT NULL,
         case_name TEXT NOT NULL DEFAULT '',
         status TEXT NOT NULL,
         attempts INTEGER NOT NULL DEFAULT 0,
         request_method TEXT,
         request_url TEXT,
         request_headers TEXT,
         request_query TEXT,
         request_body TEXT,
         response_status_code INTEGER,
         response_headers TEXT,
         response_body TEXT,
         response_time_ms INTEGER,
         assertion_results TEXT NOT NULL DEFAULT '[]',
         error_message TEXT,
         error_type TEXT,
         duration_ms INTEGER NOT NULL DEFAULT 0
       );
       CREATE INDEX IF NOT EXISTS idx_test_results_execution
         ON test_results (execution_id, position);",
    )?;
    Ok(())
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|time| time.with_timezone(&Utc))
        .map_err(|err| Error::Internal(format!("Invalid stored timestamp `{value}`: {err}")))
}

fn parse_optional_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_time).transpose()
}

// ─── Snapshot columns ─────────────────────────────────────────────────────────

struct SnapshotColumns {
    request_method: Option<String>,
    request_url: Option<String>,
    request_headers: Option<String>,
    request_query: Option<String>,
    request_body: Option<String>,
    response_status_code: Option<u16>,
    response_headers: Option<String>,
    response_body: Option<String>,
    response_time_ms: Option<i64>,
}

impl SnapshotColumns {
    fn from_snapshots(
        request: Option<&RequestSnapshot>,
        response: Option<&ResponseSnapshot>,
    ) -> Result<Self> {
        Ok(Self {
            request_method: request.map(|request| request.method.clone()),
            request_url: request.map(|request| request.url.clone()),
            request_headers: request.map(|request| to_json(&request.headers)).transpose()?,
            request_query: request.map(|request| to_json(&request.query)).transpose()?,
            request_body: request.and_then(|request| request.body.clone()),
            response_status_code: response.map(|response| response.status_code),
            response_headers: response.map(|response| to_json(&response.headers)).transpose()?,
            response_body: response.map(|response| response.body.clone()),
            response_time_ms: response.map(|response| response.response_time_ms as i64),
        })
    }

    fn read(row: &Row<'_>, first: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            request_method: row.get(first)?,
            request_url: row.get(first + 1)?,
            request_headers: row.get(first + 2)?,
            request_query: row.get(first + 3)?,
            request_body: row.get(first + 4)?,
            response_status_code: row.get(first + 5)?,
            response_headers: row.get(first + 6)?,
            response_body: row.get(first + 7)?,
            response_time_ms: row.get(first + 8)?,
        })
    }

    fn request(&self) -> Result<Option<RequestSnapshot>> {
        let Some(url) = self.request_url.clone() else {
            return Ok(None);
        };
        Ok(Some(RequestSnapshot {
            method: self.request_method.clone().unwrap_or_default(),
            url,
            headers: decode_string_map(self.request_headers.as_deref())?,
            query: decode_string_map(self.request_query.as_deref())?,
            body: self.request_body.clone(),
        }))
    }

    fn response(&self) -> Result<Option<ResponseSnapshot>> {
        let Some(status_code) = self.response_status_code else {
            return Ok(None);
        };
        Ok(Some(ResponseSnapshot {
            status_code,
            headers: decode_string_map(self.response_headers.as_deref())?,
            body: self.response_body.clone().unwrap_or_default(),
            response_time_ms: self.response_time_ms.unwrap_or_default().max(0) as u64,
        }))
    }
}

fn decode_string_map(text: Option<&str>) -> Result<BTreeMap<String, String>> {
    text.map(from_json).transpose().map(Option::unwrap_or_default)
}

// ─── Scenario executions ──────────────────────────────────────────────────────

/// Insert or replace an execution row and all of its step results.
pub fn save_scenario_execution(
    conn: &mut Connection,
    result: &ScenarioExecutionResult,
    definition_hash: Option<&str>,
) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO scenario_executions (
           execution_id, scenario_id, scenario_name, status, attempts, base_url, environment,
           variables, final_variables, definition_hash, total_steps, passed_steps, failed_steps,
           skipped_steps, duration_ms, started_at, completed_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
         ON CONFLICT(execution_id) DO UPDATE SET
           status = excluded.status,
           attempts = excluded.attempts,
           variables = excluded.variables,
           final_variables = excluded.final_variables,
           definition_hash = COALESCE(excluded.definition_hash, scenario_executions.definition_hash),
           total_steps = excluded.total_steps,
           passed_steps = excluded.passed_steps,
           failed_steps = excluded.failed_steps,
           skipped_steps = excluded.skipped_steps,
           duration_ms = excluded.duration_ms,
           completed_at = excluded.completed_at;",
        params![
            result.execution_id,
            result.scenario_id,
            result.scenario_name,
            result.status.as_str(),
            result.attempts,
            result.base_url,
            result.environment,
            to_json(&result.variables)?,
            to_json(&result.final_variables)?,
            definition_hash,
            result.total_steps,
            result.passed_steps,
            result.failed_steps,
            result.skipped_steps,
            result.duration_ms as i64,
            result.started_at.to_rfc3339(),
            result.completed_at.map(|time| time.to_rfc3339()),
        ],
    )?;

    tx.execute(
        "DELETE FROM step_results WHERE execution_id = ?1;",
        params![result.execution_id],
    )?;
    for (position, step) in result.step_results.iter().enumerate() {
        let snapshot =
            SnapshotColumns::from_snapshots(step.request.as_ref(), step.response.as_ref())?;
        tx.execute(
            "INSERT INTO step_results (
               execution_id, position, step_id, step_order, step_name, step_type, parent_step_id,
               iteration, status, request_method, request_url, request_headers, request_query,
               request_body, response_status_code, response_headers, response_body,
               response_time_ms, extracted_variables, assertion_results, error_message, duration_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                       ?17, ?18, ?19, ?20, ?21, ?22);",
            params![
                result.execution_id,
                position as i64,
                step.step_id,
                step.step_order,
                step.name,
                step.step_type,
                step.parent_step_id,
                step.iteration,
                step.status.as_str(),
                snapshot.request_method,
                snapshot.request_url,
                snapshot.request_headers,
                snapshot.request_query,
                snapshot.request_body,
                snapshot.response_status_code,
                snapshot.response_headers,
                snapshot.response_body,
                snapshot.response_time_ms,
                to_json(&step.extracted_variables)?,
                to_json(&step.assertion_results)?,
                step.error_message,
                step.duration_ms as i64,
            ],
        )?;
    }

    tx.commit()?;
    Ok(())
}

struct StoredScenarioRow {
    execution_id: String,
    scenario_id: String,
    scenario_name: String,
    status: String,
    attempts: u32,
    base_url: Option<String>,
    environment: Option<String>,
    variables: String,
    final_variables: String,
    total_steps: u32,
    passed_steps: u32,
    failed_steps: u32,
    skipped_steps: u32,
    duration_ms: i64,
    started_at: String,
    completed_at: Option<String>,
}

const SCENARIO_COLUMNS: &str = "execution_id, scenario_id, scenario_name, status, attempts, \
     base_url, environment, variables, final_variables, total_steps, passed_steps, failed_steps, \
     skipped_steps, duration_ms, started_at, completed_at";

fn read_scenario_row(row: &Row<'_>) -> rusqlite::Result<StoredScenarioRow> {
    Ok(StoredScenarioRow {
        execution_id: row.get(0)?,
        scenario_id: row.get(1)?,
        scenario_name: row.get(2)?,
        status: row.get(3)?,
        attempts: row.get(4)?,
        base_url: row.get(5)?,
        environment: row.get(6)?,
        variables: row.get(7)?,
        final_variables: row.get(8)?,
        total_steps: row.get(9)?,
        passed_steps: row.get(10)?,
        failed_steps: row.get(11)?,
        skipped_steps: row.get(12)?,
        duration_ms: row.get(13)?,
        started_at: row.get(14)?,
        completed_at: row.get(15)?,
    })
}

struct StoredStepRow {
    step_id: String,
    step_order: i64,
    step_name: String,
    step_type: String,
    parent_step_id: Option<String>,
    iteration: Option<u32>,
    status: String,
    snapshot: SnapshotColumns,
    extracted_variables: String,
    assertion_results: String,
    error_message: Option<String>,
    duration_ms: i64,
}

fn load_step_results(conn: &Connection, execution_id: &str) -> Result<Vec<StepResult>> {
    let mut stmt = conn.prepare(
        "SELECT step_id, step_order, step_name, step_type, parent_step_id, iteration, status,
                request_method, request_url, request_headers, request_query, request_body,
                response_status_code, response_headers, response_body, response_time_ms,
                extracted_variables, assertion_results, error_message, duration_ms
         FROM step_results WHERE execution_id = ?1 ORDER BY position ASC;",
    )?;
    let rows = stmt
        .query_map(params![execution_id], |row| {
            Ok(StoredStepRow {
                step_id: row.get(0)?,
                step_order: row.get(1)?,
                step_name: row.get(2)?,
                step_type: row.get(3)?,
                parent_step_id: row.get(4)?,
                iteration: row.get(5)?,
                status: row.get(6)?,
                snapshot: SnapshotColumns::read(row, 7)?,
                extracted_variables: row.get(16)?,
                assertion_results: row.get(17)?,
                error_message: row.get(18)?,
                duration_ms: row.get(19)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|row| {
            Ok(StepResult {
                request: row.snapshot.request()?,
                response: row.snapshot.response()?,
                step_id: row.step_id,
                step_order: row.step_order,
                name: row.step_name,
                step_type: row.step_type,
                status: step_status_from_str(&row.status),
                extracted_variables: from_json(&row.extracted_variables)?,
                assertion_results: from_json::<Vec<AssertionResult>>(&row.assertion_results)?,
                error_message: row.error_message,
                duration_ms: row.duration_ms.max(0) as u64,
                parent_step_id: row.parent_step_id,
                iteration: row.iteration,
            })
        })
        .collect()
}

pub fn load_scenario_execution(
    conn: &Connection,
    execution_id: &str,
) -> Result<Option<ScenarioExecutionResult>> {
    let row = conn
        .query_row(
            &format!(
                "SELECT {SCENARIO_COLUMNS} FROM scenario_executions WHERE execution_id = ?1 LIMIT 1;"
            ),
            params![execution_id],
            read_scenario_row,
        )
        .optional()?;
    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(ScenarioExecutionResult {
        step_results: load_step_results(conn, &row.execution_id)?,
        status: execution_status_from_str(&row.status),
        variables: from_json::<VariableMap>(&row.variables)?,
        final_variables: from_json::<VariableMap>(&row.final_variables)?,
        started_at: parse_time(&row.started_at)?,
        completed_at: parse_optional_time(row.completed_at)?,
        execution_id: row.execution_id,
        scenario_id: row.scenario_id,
        scenario_name: row.scenario_name,
        attempts: row.attempts,
        base_url: row.base_url,
        environment: row.environment,
        total_steps: row.total_steps,
        passed_steps: row.passed_steps,
        failed_steps: row.failed_steps,
        skipped_steps: row.skipped_steps,
        duration_ms: row.duration_ms.max(0) as u64,
    }))
}

// ─── Test executions ──────────────────────────────────────────────────────────

pub fn save_test_execution(conn: &mut Connection, result: &TestExecutionResult) -> Result<()> {
    let summary = &result.summary;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO test_executions (
           execution_id, execution_type, status, base_url, total, passed, failed, error, skipped,
           pass_rate, duration_ms, latency, started_at, completed_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(execution_id) DO UPDATE SET
           status = excluded.status,
           total = excluded.total,
           passed = excluded.passed,
           failed = excluded.failed,
           error = excluded.error,
           skipped = excluded.skipped,
           pass_rate = excluded.pass_rate,
           duration_ms = excluded.duration_ms,
           latency = excluded.latency,
           completed_at = excluded.completed_at;",
        params![
            result.execution_id,
            result.execution_type.as_str(),
            result.status.as_str(),
            result.base_url,
            summary.total as i64,
            summary.passed as i64,
            summary.failed as i64,
            summary.error as i64,
            summary.skipped as i64,
            summary.pass_rate,
            summary.duration_ms as i64,
            to_json(&summary.latency)?,
            result.started_at.to_rfc3339(),
            result.completed_at.map(|time| time.to_rfc3339()),
        ],
    )?;

    tx.execute(
        "DELETE FROM test_results WHERE execution_id = ?1;",
        params![result.execution_id],
    )?;
    for (position, case) in result.results.iter().enumerate() {
        let snapshot =
            SnapshotColumns::from_snapshots(case.request.as_ref(), case.response.as_ref())?;
        tx.execute(
            "INSERT INTO test_results (
               execution_id, position, case_id, case_name, status, attempts, request_method,
               request_url, request_headers, request_query, request_body, response_status_code,
               response_headers, response_body, response_time_ms, assertion_results,
               error_message, error_type, duration_ms
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                       ?17, ?18, ?19);",
            params![
                result.execution_id,
                position as i64,
                case.case_id,
                case.name,
                case.status.as_str(),
                case.attempts,
                snapshot.request_method,
                snapshot.request_url,
                snapshot.request_headers,
                snapshot.request_query,
                snapshot.request_body,
                snapshot.response_status_code,
                snapshot.response_headers,
                snapshot.response_body,
                snapshot.response_time_ms,
                to_json(&case.assertion_results)?,
                case.error_message,
                case.error_type,
                case.duration_ms as i64,
            ],
        )?;
    }

    tx.commit()?;
    Ok(())
}

struct StoredCaseRow {
    case_id: String,
    case_name: String,
    status: String,
    attempts: u32,
    snapshot: SnapshotColumns,
    assertion_results: String,
    error_message: Option<String>,
    error_type: Option<String>,
    duration_ms: i64,
}

fn load_test_results(conn: &Connection, execution_id: &str) -> Result<Vec<TestCaseResult>> {
    let mut stmt = conn.prepare(
        "SELECT case_id, case_name, status, attempts,
                request_method, request_url, request_headers, request_query, request_body,
                response_status_code, response_headers, response_body, response_time_ms,
                assertion_results, error_message, error_type, duration_ms
         FROM test_results WHERE execution_id = ?1 ORDER BY position ASC;",
    )?;
    let rows = stmt
        .query_map(params![execution_id], |row| {
            Ok(StoredCaseRow {
                case_id: row.get(0)?,
                case_name: row.get(1)?,
                status: row.get(2)?,
                attempts: row.get(3)?,
                snapshot: SnapshotColumns::read(row, 4)?,
                assertion_results: row.get(13)?,
                error_message: row.get(14)?,
                error_type: row.get(15)?,
                duration_ms: row.get(16)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|row| {
            Ok(TestCaseResult {
                request: row.snapshot.request()?,
                response: row.snapshot.response()?,
                case_id: row.case_id,
                name: row.case_name,
                status: step_status_from_str(&row.status),
                attempts: row.attempts,
                assertion_results: from_json(&row.assertion_results)?,
                error_message: row.error_message,
                error_type: row.error_type,
                duration_ms: row.duration_ms.max(0) as u64,
            })
        })
        .collect()
}

pub fn load_test_execution(
    conn: &Connection,
    execution_id: &str,
) -> Result<Option<TestExecutionResult>> {
    let row = conn
        .query_row(
            "SELECT execution_id, execution_type, status, base_url, total, passed, failed, error,
                    skipped, pass_rate, duration_ms, latency, started_at, completed_at
             FROM test_executions WHERE execution_id = ?1 LIMIT 1;",
            params![execution_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    [
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ],
                    row.get::<_, f64>(9)?,
                    row.get::<_, i64>(10)?,
                    row.get::<_, String>(11)?,
                    row.get::<_, String>(12)?,
                    row.get::<_, Option<String>>(13)?,
                ))
            },
        )
        .optional()?;
    let Some((
        id,
        execution_type,
        status,
        base_url,
        [total, passed, failed, error, skipped],
        pass_rate,
        duration_ms,
        latency,
        started_at,
        completed_at,
    )) = row
    else {
        return Ok(None);
    };

    Ok(Some(TestExecutionResult {
        results: load_test_results(conn, &id)?,
        execution_id: id,
        execution_type: execution_type_from_str(&execution_type),
        status: execution_status_from_str(&status),
        base_url,
        summary: BatchSummary {
            total: total.max(0) as u64,
            passed: passed.max(0) as u64,
            failed: failed.max(0) as u64,
            error: error.max(0) as u64,
            skipped: skipped.max(0) as u64,
            pass_rate,
            duration_ms: duration_ms.max(0) as u64,
            latency: from_json::<LatencyMetrics>(&latency)?,
        },
        started_at: parse_time(&started_at)?,
        completed_at: parse_optional_time(completed_at)?,
    }))
}

// ─── History ──────────────────────────────────────────────────────────────────

/// One line of execution history, across scenario and test runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionSummaryRow {
    pub execution_id: String,
    pub kind: String,
    pub subject: String,
    pub status: ExecutionStatus,
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
    pub duration_ms: u64,
    pub started_at: String,
}

pub fn list_scenario_executions(
    conn: &Connection,
    scenario_id: Option<&str>,
    limit: usize,
) -> Result<Vec<ExecutionSummaryRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SCENARIO_COLUMNS} FROM scenario_executions
         WHERE (?1 IS NULL OR scenario_id = ?1)
         ORDER BY started_at DESC LIMIT ?2;"
    ))?;
    let rows = stmt
        .query_map(params![scenario_id, limit as i64], read_scenario_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(rows
        .into_iter()
        .map(|row| ExecutionSummaryRow {
            execution_id: row.execution_id,
            kind: "scenario".to_string(),
            subject: if row.scenario_name.is_empty() {
                row.scenario_id
            } else {
                row.scenario_name
            },
            status: execution_status_from_str(&row.status),
            total: u64::from(row.total_steps),
            passed: u64::from(row.passed_steps),
            failed: u64::from(row.failed_steps),
            skipped: u64::from(row.skipped_steps),
            duration_ms: row.duration_ms.max(0) as u64,
            started_at: row.started_at,
        })
        .collect())
}

pub fn list_test_executions(conn: &Connection, limit: usize) -> Result<Vec<ExecutionSummaryRow>> {
    let mut stmt = conn.prepare(
        "SELECT execution_id, execution_type, status, base_url, total, passed, failed, error,
                skipped, duration_ms, started_at
         FROM test_executions ORDER BY started_at DESC LIMIT ?1;",
    )?;
    let rows = stmt
        .query_map(params![limit as i64], |row| {
            let failed: i64 = row.get(6)?;
            let error: i64 = row.get(7)?;
            Ok(ExecutionSummaryRow {
                execution_id: row.get(0)?,
                kind: row.get(1)?,
                subject: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                status: execution_status_from_str(&row.get::<_, String>(2)?),
                total: row.get::<_, i64>(4)?.max(0) as u64,
                passed: row.get::<_, i64>(5)?.max(0) as u64,
                failed: (failed + error).max(0) as u64,
                skipped: row.get::<_, i64>(8)?.max(0) as u64,
                duration_ms: row.get::<_, i64>(9)?.max(0) as u64,
                started_at: row.get(10)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AssertionSource, AssertionType, ExecutionType, Scenario, StepStatus};
    use serde_json::json;

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().expect("in-memory db");
        init_schema(&conn).expect("schema");
        conn
    }

    fn scenario_result(id: &str, status: ExecutionStatus) -> ScenarioExecutionResult {
        let scenario: Scenario =
            serde_json::from_value(json!({"id": "login-flow", "name": "Login flow"}))
                .expect("scenario");
        let mut result = ScenarioExecutionResult::pending(id, &scenario);
        result.status = status;
        result.attempts = 1;
        result.base_url = Some("http://api.test".to_string());
        result.variables.insert("username".to_string(), json!("alice"));
        result.final_variables = result.variables.clone();
        result.final_variables.insert("token".to_string(), json!("abc123"));

        let step = |id: &str, order: i64, status: StepStatus| StepResult {
            step_id: id.to_string(),
            step_order: order,
            name: id.to_string(),
            step_type: "request".to_string(),
            status,
            request: None,
            response: None,
            extracted_variables: VariableMap::new(),
            assertion_results: Vec::new(),
            error_message: None,
            duration_ms: 3,
            parent_step_id: None,
            iteration: None,
        };

        let mut login = step("login", 1, StepStatus::Passed);
        login.request = Some(RequestSnapshot {
            method: "POST".to_string(),
            url: "http://api.test/login".to_string(),
            headers: BTreeMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            query: BTreeMap::new(),
            body: Some(r#"{"user":"alice"}"#.to_string()),
        });
        login.response = Some(ResponseSnapshot {
            status_code: 200,
            headers: BTreeMap::new(),
            body: r#"{"data":{"token":"abc123"}}"#.to_string(),
            response_time_ms: 12,
        });
        login
            .extracted_variables
            .insert("token".to_string(), json!("abc123"));
        login.assertion_results.push(AssertionResult {
            assertion_type: AssertionType::Equals,
            source: AssertionSource::Status,
            expression: None,
            expected: json!(200),
            actual: Some(json!(200)),
            passed: true,
            message: None,
        });

        let mut profile = step("profile", 2, StepStatus::Error);
        profile.error_message = Some("Connection failed: refused".to_string());
        let skipped = step("logout", 3, StepStatus::Skipped);

        result.step_results = vec![login, profile, skipped];
        result.tally();
        result
    }

    #[test]
    fn scenario_execution_round_trips() {
        let mut conn = memory_db();
        let mut result = scenario_result("exec-1", ExecutionStatus::Failed);
        result.completed_at = Some(Utc::now());

        save_scenario_execution(&mut conn, &result, Some("abc")).expect("saved");
        let loaded = load_scenario_execution(&conn, "exec-1")
            .expect("loaded")
            .expect("present");

        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.step_results, result.step_results);
        assert_eq!(loaded.final_variables["token"], json!("abc123"));
        assert_eq!(
            (loaded.total_steps, loaded.passed_steps, loaded.failed_steps, loaded.skipped_steps),
            (3, 1, 1, 1)
        );
        assert!(loaded.completed_at.is_some());
        assert!(load_scenario_execution(&conn, "nope").expect("query").is_none());
    }

    #[test]
    fn saving_again_replaces_status_and_steps() {
        let mut conn = memory_db();
        let mut running = scenario_result("exec-2", ExecutionStatus::Running);
        running.step_results.clear();
        running.tally();
        save_scenario_execution(&mut conn, &running, Some("hash-1")).expect("running row");

        let finished = scenario_result("exec-2", ExecutionStatus::Failed);
        save_scenario_execution(&mut conn, &finished, None).expect("final row");

        let loaded = load_scenario_execution(&conn, "exec-2")
            .expect("loaded")
            .expect("present");
        assert_eq!(loaded.status, ExecutionStatus::Failed);
        assert_eq!(loaded.step_results.len(), 3);

        let hash: Option<String> = conn
            .query_row(
                "SELECT definition_hash FROM scenario_executions WHERE execution_id = 'exec-2'",
                [],
                |row| row.get(0),
            )
            .expect("hash");
        assert_eq!(hash.as_deref(), Some("hash-1"));
    }

    #[test]
    fn test_execution_round_trips_and_lists() {
        let mut conn = memory_db();
        let result = TestExecutionResult {
            execution_id: "batch-1".to_string(),
            execution_type: ExecutionType::HealthCheck,
            status: ExecutionStatus::Passed,
            base_url: Some("http://api.test".to_string()),
            summary: BatchSummary {
                total: 1,
                passed: 1,
                pass_rate: 100.0,
                duration_ms: 15,
                ..BatchSummary::default()
            },
            results: vec![TestCaseResult {
                case_id: "health-1".to_string(),
                name: "/health".to_string(),
                status: StepStatus::Passed,
                attempts: 1,
                request: None,
                response: Some(ResponseSnapshot {
                    status_code: 200,
                    headers: BTreeMap::new(),
                    body: "ok".to_string(),
                    response_time_ms: 4,
                }),
                assertion_results: Vec::new(),
                error_message: None,
                error_type: None,
                duration_ms: 5,
            }],
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
        };

        save_test_execution(&mut conn, &result).expect("saved");
        let loaded = load_test_execution(&conn, "batch-1")
            .expect("loaded")
            .expect("present");
        assert_eq!(loaded.execution_type, ExecutionType::HealthCheck);
        assert_eq!(loaded.summary, result.summary);
        assert_eq!(loaded.results, result.results);

        let history = list_test_executions(&conn, 10).expect("history");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].kind, "health_check");
        assert_eq!(history[0].subject, "http://api.test");
    }

    #[test]
    fn scenario_history_filters_by_scenario() {
        let mut conn = memory_db();
        save_scenario_execution(&mut conn, &scenario_result("a", ExecutionStatus::Passed), None)
            .expect("saved");
        save_scenario_execution(&mut conn, &scenario_result("b", ExecutionStatus::Failed), None)
            .expect("saved");

        let all = list_scenario_executions(&conn, None, 10).expect("list");
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|row| row.subject == "Login flow"));

        let none = list_scenario_executions(&conn, Some("other"), 10).expect("list");
        assert!(none.is_empty());

        let limited = list_scenario_executions(&conn, Some("login-flow"), 1).expect("list");
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn open_db_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("runner.db");
        let conn = open_db(&path).expect("opened");
        let mode: String = conn
            .query_row("PRAGMA journal_mode;", [], |row| row.get(0))
            .expect("journal mode");
        assert_eq!(mode.to_ascii_lowercase(), "wal");
    }
}
