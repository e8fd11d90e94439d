//! Application state.

use std::sync::Arc;

use rmerge_ledger::{AssetScanner, DedupLedger, DocumentStore, MergeLedger, StatusStore};
use rmerge_queue::JobDispatcher;

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub dedup: DedupLedger,
    pub merges: MergeLedger,
    pub status: StatusStore,
    pub dispatcher: Arc<dyn JobDispatcher>,
}

impl AppState {
    /// Ledgers share one document store, as the worker's do.
    pub fn new(
        config: ApiConfig,
        store: Arc<dyn DocumentStore>,
        scanner: AssetScanner,
        dispatcher: Arc<dyn JobDispatcher>,
    ) -> Self {
        Self {
            config,
            dedup: DedupLedger::new(Arc::clone(&store), scanner),
            merges: MergeLedger::new(Arc::clone(&store)),
            status: StatusStore::new(store),
            dispatcher,
        }
    }
}
