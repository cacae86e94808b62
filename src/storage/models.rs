//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a workflow execution or of one node instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Never started because an upstream node failed
    Skipped,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Unknown status: {}", s)),
        }
    }
}

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    /// Root of the working directories used by this run
    pub base_dir: String,
    /// Number of expanded node instances
    pub node_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// One node instance within an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: String,
    pub execution_id: String,
    /// Expanded instance id, e.g. `preproc.smooth[iter_fwhm=1]`
    pub node_id: String,
    pub interface: String,
    pub status: ExecutionStatus,
    /// Outputs were taken from a previous run
    pub cached: bool,
    pub hash: Option<String>,
    pub node_dir: Option<String>,
    pub inputs: Value,
    pub outputs: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// An execution with all its node records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub execution: Execution,
    pub nodes: Vec<NodeExecution>,
}

/// Database health summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub foreign_keys_enabled: bool,
    pub integrity_check: String,
    pub journal_mode: String,
    pub busy_timeout_ms: i64,
    pub orphaned_node_executions: u64,
}

/// Query filters for execution history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionQuery {
    pub workflow_name: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub search: Option<String>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            workflow_name: None,
            status: None,
            search: None,
            started_after: None,
            started_before: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Per-status node counts for a finished execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub nodes_total: u32,
    pub nodes_completed: u32,
    pub nodes_cached: u32,
    pub nodes_failed: u32,
    pub nodes_skipped: u32,
    pub duration_ms: u64,
}

impl ExecutionSummary {
    pub fn from_nodes(nodes: &[NodeExecution], duration_ms: u64) -> Self {
        let mut summary = Self {
            nodes_total: nodes.len() as u32,
            duration_ms,
            ..Self::default()
        };
        for node in nodes {
            match node.status {
                ExecutionStatus::Completed if node.cached => summary.nodes_cached += 1,
                ExecutionStatus::Completed => summary.nodes_completed += 1,
                ExecutionStatus::Failed => summary.nodes_failed += 1,
                ExecutionStatus::Skipped | ExecutionStatus::Cancelled => {
                    summary.nodes_skipped += 1
                }
                _ => {}
            }
        }
        summary
    }
}
