//! Structured job logging.
//!
//! Every line carries the job (or batch) id, the operation and the owning
//! account so a batch can be followed across workers.

use tracing::{error, info, warn, Span};

use rmerge_models::{BatchId, JobId};

#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    operation: &'static str,
    account: String,
}

impl JobLogger {
    pub fn new(job_id: &JobId, operation: &'static str, account: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operation,
            account: account.to_string(),
        }
    }

    /// Logger for a merge batch, keyed by its batch id.
    pub fn for_batch(batch_id: &BatchId, account: &str) -> Self {
        Self {
            job_id: batch_id.to_string(),
            operation: "merge_batch",
            account: account.to_string(),
        }
    }

    pub fn log_start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = self.operation,
            account = %self.account,
            "Job started: {}", message
        );
    }

    pub fn log_progress(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = self.operation,
            account = %self.account,
            "Job progress: {}", message
        );
    }

    pub fn log_warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            operation = self.operation,
            account = %self.account,
            "Job warning: {}", message
        );
    }

    pub fn log_error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            operation = self.operation,
            account = %self.account,
            "Job error: {}", message
        );
    }

    pub fn log_completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = self.operation,
            account = %self.account,
            "Job completed: {}", message
        );
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn operation(&self) -> &str {
        self.operation
    }

    /// Span to instrument the job's future with.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            operation = self.operation,
            account = %self.account
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_logger_fields() {
        let job_id = JobId::new();
        let logger = JobLogger::new(&job_id, "standardize", "acct");
        assert_eq!(logger.job_id(), job_id.to_string());
        assert_eq!(logger.operation(), "standardize");
    }

    #[test]
    fn test_batch_logger() {
        let batch_id = BatchId::new();
        let logger = JobLogger::for_batch(&batch_id, "acct");
        assert_eq!(logger.job_id(), batch_id.as_str());
        assert_eq!(logger.operation(), "merge_batch");
    }
}
