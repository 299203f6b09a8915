//! Error types for the StorageVolume operator
//!
//! Provides structured error types for all operator components and the
//! retryable/terminal classification consumed by the reconciler.

use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal / Setup Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    // =========================================================================
    // Spec Validation Errors
    // =========================================================================
    #[error("Invalid spec for volume {key}: {reason}")]
    InvalidSpec { key: String, reason: String },

    #[error("Capacity parse error: {0}")]
    CapacityParse(String),

    // =========================================================================
    // Partition Tool Errors
    // =========================================================================
    #[error("Partition tool failed: {operation} on {device}: {message}")]
    PartitionTool {
        operation: String,
        device: String,
        message: String,
    },

    #[error("Unreadable partition table on {device}: {message}")]
    PartitionTableParse { device: String, message: String },

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether retrying this error without an object change can ever succeed.
    ///
    /// Terminal errors put the volume into Failed phase and halt automatic
    /// redelivery; everything else goes back through the work queue with
    /// backoff.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::InvalidSpec { .. } | Error::CapacityParse(_) | Error::Configuration(_)
        )
    }

    /// Check if this error should be retried with backoff
    pub fn is_retryable(&self) -> bool {
        !self.is_terminal()
    }

    /// Wrap a partition tool failure with operation and device context
    pub fn partition_op(operation: &str, device: &str, message: impl Into<String>) -> Self {
        Error::PartitionTool {
            operation: operation.to_string(),
            device: device.to_string(),
            message: message.into(),
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_classification() {
        let invalid = Error::InvalidSpec {
            key: "scp/v1".into(),
            reason: "bad capacity".into(),
        };
        assert!(invalid.is_terminal());
        assert!(!invalid.is_retryable());

        let tool = Error::partition_op("mkpart", "/dev/sdb", "device busy");
        assert!(!tool.is_terminal());
        assert!(tool.is_retryable());
    }

    #[test]
    fn test_partition_op_context() {
        let err = Error::partition_op("rm", "/dev/sdc", "exit status 1");
        let text = err.to_string();
        assert!(text.contains("rm"));
        assert!(text.contains("/dev/sdc"));
        assert!(text.contains("exit status 1"));
    }
}
