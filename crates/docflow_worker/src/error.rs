//! Repair engine errors.

use thiserror::Error;

/// Maximum stderr bytes kept in an error message.
const STDERR_LIMIT: usize = 500;

/// Repair engine result type.
pub type Result<T> = std::result::Result<T, RepairError>;

/// Errors raised by repair engines.
///
/// The error policy keys off [`RepairError::is_transient`] and
/// [`RepairError::is_anomaly`]; engines pick the variant, not the policy.
#[derive(Error, Debug)]
pub enum RepairError {
    /// Permanent error - retrying will not help (unsupported format, corrupt input)
    #[error("Permanent error (no retry): {message}")]
    Permanent { message: String },

    /// Transient error - may succeed on retry (tool crash, resource busy)
    #[error("Transient error (retry eligible): {message}")]
    Transient { message: String },

    /// External tool exceeded its time budget
    #[error("Timed out after {after_secs}s: {what}")]
    Timeout { what: String, after_secs: u64 },

    /// Cancellation was requested
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Input is hostile or structurally impossible (archive bomb, path escape)
    #[error("Anomaly detected: {reason}")]
    Anomaly { reason: String },

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RepairError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn anomaly(reason: impl Into<String>) -> Self {
        Self::Anomaly {
            reason: reason.into(),
        }
    }

    /// Check if this error is transient (eligible for retry)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RepairError::Transient { .. } | RepairError::Timeout { .. } | RepairError::Io(_)
        )
    }

    /// Check if this error must quarantine the unit without retry
    pub fn is_anomaly(&self) -> bool {
        matches!(self, RepairError::Anomaly { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RepairError::Cancelled(_))
    }

    /// Short machine-readable tag for manifests and metrics.
    pub fn kind_str(&self) -> &'static str {
        match self {
            RepairError::Permanent { .. } => "permanent",
            RepairError::Transient { .. } => "transient",
            RepairError::Timeout { .. } => "timeout",
            RepairError::Cancelled(_) => "cancelled",
            RepairError::Anomaly { .. } => "anomaly",
            RepairError::Io(_) => "io",
        }
    }

    /// Failure of an external tool that exited non-zero.
    ///
    /// Converter crashes are usually environmental, so they are retried.
    pub fn tool_exit(tool: &str, code: Option<i32>, stderr: &str) -> Self {
        let code = code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let message = if stderr.is_empty() {
            format!("{} exited with code {}", tool, code)
        } else {
            format!("{} exited with code {}: {}", tool, code, truncate(stderr))
        };
        RepairError::Transient { message }
    }
}

fn truncate(text: &str) -> String {
    if text.len() <= STDERR_LIMIT {
        return text.to_string();
    }
    let mut end = STDERR_LIMIT;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(RepairError::transient("x").is_transient());
        assert!(RepairError::Timeout {
            what: "soffice".into(),
            after_secs: 1
        }
        .is_transient());
        assert!(!RepairError::permanent("x").is_transient());
        assert!(RepairError::anomaly("bomb").is_anomaly());
        assert!(!RepairError::anomaly("bomb").is_transient());
    }

    #[test]
    fn test_tool_exit_truncates() {
        let long = "e".repeat(2000);
        let err = RepairError::tool_exit("soffice", Some(81), &long);
        let msg = err.to_string();
        assert!(msg.contains("code 81"));
        assert!(msg.contains("(truncated)"));
        assert!(msg.len() < 700);
        assert!(err.is_transient());
    }
}
