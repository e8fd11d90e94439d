//! Shared handles for job processing.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use rmerge_ledger::{
    AssetScanner, DedupLedger, DocumentStore, JsonFileStore, LedgerConfig, MergeLedger,
    StatusStore,
};
use rmerge_media::{
    Concatenator, FfmpegConcatenator, FfmpegStandardizer, FfprobeProbe, MediaConfig, MediaProbe,
    Standardizer,
};
use rmerge_queue::{BatchLock, JobDispatcher};

use crate::config::WorkerConfig;

/// Everything a standardize job or a merge batch needs.
pub struct WorkerContext {
    pub config: WorkerConfig,
    pub media: MediaConfig,
    pub dedup: DedupLedger,
    pub merges: MergeLedger,
    pub status: StatusStore,
    pub dispatcher: Arc<dyn JobDispatcher>,
    pub lock: Arc<dyn BatchLock>,
    pub probe: Arc<dyn MediaProbe>,
    pub standardizer: Arc<dyn Standardizer>,
    pub concatenator: Arc<dyn Concatenator>,
}

impl WorkerContext {
    /// Context backed by the JSON ledger and the FFmpeg binaries.
    ///
    /// `cancel` kills any running FFmpeg process when it fires.
    pub fn ffmpeg(
        config: WorkerConfig,
        media: MediaConfig,
        ledger: &LedgerConfig,
        dispatcher: Arc<dyn JobDispatcher>,
        lock: Arc<dyn BatchLock>,
        cancel: CancellationToken,
    ) -> Self {
        let store: Arc<dyn DocumentStore> = Arc::new(JsonFileStore::from_config(ledger));
        let probe: Arc<dyn MediaProbe> = Arc::new(FfprobeProbe::new());

        let standardizer = FfmpegStandardizer::new(Arc::clone(&probe))
            .with_timeout(media.ffmpeg_timeout_secs)
            .with_cancel(cancel.clone())
            .with_verification(config.verify_standardized);
        let concatenator = FfmpegConcatenator::new()
            .with_timeout(media.ffmpeg_timeout_secs)
            .with_cancel(cancel);

        Self {
            dedup: DedupLedger::new(Arc::clone(&store), AssetScanner::from_config(ledger)),
            merges: MergeLedger::new(Arc::clone(&store)),
            status: StatusStore::new(store),
            dispatcher,
            lock,
            probe,
            standardizer: Arc::new(standardizer),
            concatenator: Arc::new(concatenator),
            config,
            media,
        }
    }
}
