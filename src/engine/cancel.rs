use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::debug;

/// Cancel senders keyed by execution id.
#[derive(Default)]
pub struct CancelRegistry {
    senders: Mutex<HashMap<String, broadcast::Sender<()>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str) -> CancelSignal {
        let (tx, rx) = broadcast::channel(1);
        self.senders.lock().insert(id.to_string(), tx);
        CancelSignal::from_receiver(rx)
    }

    pub fn cancel(&self, id: &str) -> bool {
        if let Some(tx) = self.senders.lock().remove(id) {
            debug!(execution_id = id, "Cancelling execution");
            let _ = tx.send(());
            return true;
        }
        false
    }

    pub fn remove(&self, id: &str) {
        self.senders.lock().remove(id);
    }

    /// Ids of executions that can still be cancelled.
    pub fn active(&self) -> Vec<String> {
        self.senders.lock().keys().cloned().collect()
    }
}

/// Receiving end of a cancellation. Once observed, it stays cancelled and
/// the flag is shared with every [`CancelSignal::resubscribe`] copy.
///
/// A dropped sender (execution finished and was removed) is not a cancel.
#[derive(Debug)]
pub struct CancelSignal {
    rx: broadcast::Receiver<()>,
    fired: Arc<AtomicBool>,
    _keep_open: Option<broadcast::Sender<()>>,
}

impl CancelSignal {
    pub fn from_receiver(rx: broadcast::Receiver<()>) -> Self {
        Self {
            rx,
            fired: Arc::new(AtomicBool::new(false)),
            _keep_open: None,
        }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (tx, rx) = broadcast::channel(1);
        Self {
            rx,
            fired: Arc::new(AtomicBool::new(false)),
            _keep_open: Some(tx),
        }
    }

    pub fn resubscribe(&self) -> Self {
        Self {
            rx: self.rx.resubscribe(),
            fired: Arc::clone(&self.fired),
            _keep_open: self._keep_open.clone(),
        }
    }

    fn mark(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&mut self) -> bool {
        if self.fired.load(Ordering::SeqCst) {
            return true;
        }
        match self.rx.try_recv() {
            Ok(()) | Err(TryRecvError::Lagged(_)) => {
                self.mark();
                true
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => false,
        }
    }

    /// Resolves when cancellation is requested; pends forever otherwise.
    pub async fn cancelled(&mut self) {
        if self.is_cancelled() {
            return;
        }
        match self.rx.recv().await {
            Ok(()) | Err(RecvError::Lagged(_)) => self.mark(),
            Err(RecvError::Closed) => std::future::pending::<()>().await,
        }
    }
}
