// ABOUTME: Error taxonomy for the extraction and replication pipeline
// ABOUTME: Each variant maps to one failure class with its own recovery policy

use thiserror::Error;

/// Failures raised at the pipeline's component seams.
///
/// The orchestrator decides what each class means for a cycle:
/// configuration errors are fatal before any I/O, transport and parse
/// errors cost a single table, and counter-read errors push the tracker
/// toward a cold start instead of skipping work.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed table descriptor or settings. Raised before any network call.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// ERP listener unreachable or returned a non-success status.
    #[error("ERP transport error: {0}")]
    Transport(String),

    /// Remote store unreachable, rejected the call, or sent an unusable body.
    #[error("remote store error: {0}")]
    Remote(String),

    /// A call exceeded its bounded timeout.
    #[error("{target} timed out after {seconds}s")]
    Timeout { target: String, seconds: u64 },

    /// The ERP answered with something the extractor could not use.
    #[error("failed to parse ERP response for '{table}': {message}")]
    Parse { table: String, message: String },

    /// The remote store rejected or failed a bulk-sync call.
    #[error("replication of '{table}' failed: {message}")]
    Replication { table: String, message: String },

    /// Remote metadata could not be read.
    #[error("failed to read remote counters: {0}")]
    CounterRead(String),

    /// The remote store reported an in-progress bulk load.
    #[error("remote store is busy: {0}")]
    Busy(String),
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn configuration(message: impl Into<String>) -> Self {
        SyncError::Configuration(message.into())
    }

    pub fn parse(table: &str, message: impl Into<String>) -> Self {
        SyncError::Parse {
            table: table.to_string(),
            message: message.into(),
        }
    }

    pub fn replication(table: &str, message: impl Into<String>) -> Self {
        SyncError::Replication {
            table: table.to_string(),
            message: message.into(),
        }
    }

    /// Whether the error came from a timeout, on either side of the pipeline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SyncError::Timeout { .. })
    }

    /// Map a reqwest failure into the taxonomy, keeping timeouts distinct.
    pub(crate) fn from_http(target: &str, timeout_secs: u64, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout {
                target: target.to_string(),
                seconds: timeout_secs,
            }
        } else {
            SyncError::Transport(format!("{}: {}", target, err))
        }
    }

    /// Attribute a transport failure to the remote store instead of the ERP.
    pub(crate) fn into_remote(self) -> Self {
        match self {
            SyncError::Transport(message) => SyncError::Remote(message),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SyncError::configuration("collection path is missing");
        assert_eq!(
            err.to_string(),
            "configuration error: collection path is missing"
        );

        let err = SyncError::Timeout {
            target: "ERP".to_string(),
            seconds: 30,
        };
        assert_eq!(err.to_string(), "ERP timed out after 30s");
        assert!(err.is_timeout());

        let err = SyncError::Transport("connection refused".to_string()).into_remote();
        assert_eq!(err.to_string(), "remote store error: connection refused");

        let err = SyncError::Timeout {
            target: "metadata".to_string(),
            seconds: 60,
        }
        .into_remote();
        assert!(err.is_timeout());

        let err = SyncError::parse("ledgers", "unexpected envelope");
        assert!(err.to_string().contains("ledgers"));
        assert!(!err.is_timeout());
    }
}
