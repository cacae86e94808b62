//! Error types for neuropipe.
//!
//! Every variant maps to a stable code so wrappers and scripts driving the
//! engine can react to failures without parsing messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for neuropipe operations.
pub type Result<T> = std::result::Result<T, Error>;

/// neuropipe error types.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Node error: {0}")]
    Node(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// An external tool exited unsuccessfully.
    #[error("Command `{command}` exited with code {code}: {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    /// A tool finished but an output it promised is not on disk.
    #[error("Node '{node}' did not produce expected output '{path}'")]
    MissingOutput { node: String, path: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Workflow(_) => "WORKFLOW_ERROR",
            Error::Node(_) => "NODE_ERROR",
            Error::Execution(_) => "EXECUTION_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Parse(_) => "PARSE_ERROR",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Command { .. } => "COMMAND_FAILED",
            Error::MissingOutput { .. } => "MISSING_OUTPUT",
            Error::Database(_) => "DATABASE_ERROR",
            Error::Yaml(_) => "YAML_ERROR",
            Error::Json(_) => "JSON_ERROR",
            Error::Io(_) => "IO_ERROR",
        }
    }

    /// Whether retrying the same node could plausibly succeed.
    ///
    /// Definition problems never fix themselves; tool failures and I/O might.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Command { .. } | Error::MissingOutput { .. } | Error::Io(_) | Error::Execution(_)
        )
    }

    /// Convert to a JSON error envelope.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        })
    }
}

/// Error details attached to a failed node in an execution report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: &str, message: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.to_string(),
            node_id: None,
        }
    }

    pub fn with_node(mut self, node_id: &str) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        ErrorResponse::new(err.code(), &err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_code_and_message() {
        let err = Error::Command {
            command: "3dTshift -prefix out in.nii".to_string(),
            code: 2,
            stderr: "** FATAL ERROR".to_string(),
        };
        assert_eq!(err.code(), "COMMAND_FAILED");
        assert!(err.to_string().contains("exited with code 2"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_validation_not_retryable() {
        let err = Error::Validation("bad".into());
        assert!(!err.is_retryable());
        assert_eq!(err.to_json()["error"]["code"], "VALIDATION_ERROR");
    }

    #[test]
    fn test_error_response_from_error() {
        let err = Error::MissingOutput {
            node: "smooth".into(),
            path: "/tmp/out.nii".into(),
        };
        let resp = ErrorResponse::from(&err).with_node("smooth");
        assert_eq!(resp.code, "MISSING_OUTPUT");
        assert_eq!(resp.node_id.as_deref(), Some("smooth"));
    }
}
