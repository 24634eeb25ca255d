pub mod batch_commands;
pub mod history_commands;
pub mod scenario_commands;

use crate::config::RunnerConfig;
use crate::engine::{CancelRegistry, HttpTransport, ReqwestTransport};
use crate::error::Result;
use crate::store::sqlite;
use rusqlite::Connection;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

static EXECUTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or_default()
}

pub(crate) fn generate_id(prefix: &str) -> String {
    let counter = EXECUTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{}-{counter}", now_ms())
}

/// Shared state behind every command: config, the HTTP pool and live cancel handles.
#[derive(Clone)]
pub struct AppContext {
    pub config: RunnerConfig,
    pub transport: Arc<dyn HttpTransport>,
    pub registry: Arc<CancelRegistry>,
    store_enabled: bool,
}

impl AppContext {
    pub fn new(config: RunnerConfig) -> Result<Self> {
        let transport = ReqwestTransport::new(&config.transport)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    pub fn with_transport(config: RunnerConfig, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            config,
            transport,
            registry: Arc::new(CancelRegistry::default()),
            store_enabled: true,
        }
    }

    /// Skip writing execution records.
    pub fn without_store(mut self) -> Self {
        self.store_enabled = false;
        self
    }

    pub fn open_db(&self) -> Result<Connection> {
        sqlite::open_db(&self.config.database_path)
    }

    /// Write a record. Storage failures are logged and never fail the run.
    pub(crate) fn persist<F>(&self, what: &str, write: F)
    where
        F: FnOnce(&mut Connection) -> Result<()>,
    {
        if !self.store_enabled {
            return;
        }
        if let Err(err) = self.open_db().and_then(|mut conn| write(&mut conn)) {
            warn!(error = %err, "Failed to persist {what}");
        }
    }

    /// Cancel every execution currently registered.
    pub fn cancel_all(&self) -> usize {
        self.registry
            .active()
            .iter()
            .filter(|id| self.registry.cancel(id))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique_and_prefixed() {
        let first = generate_id("scenario");
        let second = generate_id("scenario");
        assert!(first.starts_with("scenario-"));
        assert_ne!(first, second);
    }
}
