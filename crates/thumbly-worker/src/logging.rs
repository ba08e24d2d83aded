//! Structured job logging utilities.

use tracing::{error, info, warn, Span};

use thumbly_models::JobId;

/// Job logger with consistent contextual fields.
#[derive(Debug, Clone)]
pub struct JobLogger {
    job_id: String,
    operation: String,
}

impl JobLogger {
    /// Create a new job logger for a specific job and operation.
    pub fn new(job_id: &JobId, operation: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Log the start of a job operation.
    pub fn start(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "job started: {}", message
        );
    }

    /// Log a warning during job execution.
    pub fn warning(&self, message: &str) {
        warn!(
            job_id = %self.job_id,
            operation = %self.operation,
            "job warning: {}", message
        );
    }

    /// Log an error during job execution.
    pub fn error(&self, message: &str) {
        error!(
            job_id = %self.job_id,
            operation = %self.operation,
            "job error: {}", message
        );
    }

    /// Log the completion of a job operation.
    pub fn completion(&self, message: &str) {
        info!(
            job_id = %self.job_id,
            operation = %self.operation,
            "job completed: {}", message
        );
    }

    /// Create a tracing span for this job.
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "job",
            job_id = %self.job_id,
            operation = %self.operation
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_holds_context() {
        let job_id = JobId::new();
        let logger = JobLogger::new(&job_id, "thumbnail");
        assert_eq!(logger.job_id, job_id.to_string());
        assert_eq!(logger.operation, "thumbnail");
    }
}
