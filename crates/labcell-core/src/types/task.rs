//! Task records and the scan-session state machine vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ObjectType;

/// Type alias for task IDs.
pub type TaskId = String;

/// Lifecycle of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Running,
    /// Parked on an external input (ENTER_ID rendezvous).
    Waiting,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal records are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// Steps of the SCAN_QRCODE workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScanStep {
    NavigatingToScan,
    GrabScanGun,
    CvDetecting,
    GrabbingBottle,
    Scanning,
    WaitingIdInput,
    PuttingToBack,
    TurningBackFront,
    NavigatingToSplit,
    PuttingDown,
    Completed,
    Error,
    Cancelled,
}

/// Audit-trail entry for a finished state-machine step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedStep {
    pub step: ScanStep,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A bottle bound into the inventory during a scan session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannedBottle {
    pub bottle_id: String,
    #[serde(rename = "type")]
    pub object_type: ObjectType,
    pub slot: String,
    pub timestamp: DateTime<Utc>,
}

/// A cv_detect hit: where the bottle sits on the scan table and what family
/// the vision stack classified it as.
///
/// The wire reply spells the family `bottle_type`; status snapshots expose it
/// as `type` like every other bottle payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub target_pose: String,
    #[serde(rename = "type", alias = "bottle_type")]
    pub bottle_type: ObjectType,
}

/// The authoritative record of one submitted task.
///
/// Created on HTTP submission, advanced by the worker, immutable once the
/// status turns terminal. Status queries hand out clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub cmd_id: String,
    pub cmd_type: String,
    pub status: TaskStatus,
    pub submit_time: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub current_step: Option<ScanStep>,
    #[serde(default)]
    pub completed_steps: Vec<CompletedStep>,
    #[serde(default)]
    pub scanned_bottles: Vec<ScannedBottle>,
    #[serde(default)]
    pub current_bottle_info: Option<Detection>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl TaskRecord {
    pub fn new(cmd_id: impl Into<String>, cmd_type: impl Into<String>) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            cmd_id: cmd_id.into(),
            cmd_type: cmd_type.into(),
            status: TaskStatus::Pending,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            result: None,
            current_step: None,
            completed_steps: Vec::new(),
            scanned_bottles: Vec::new(),
            current_bottle_info: None,
            error_message: None,
        }
    }

    /// Transition PENDING -> RUNNING when the worker dequeues the task.
    pub fn start(&mut self) {
        self.status = TaskStatus::Running;
        self.start_time = Some(Utc::now());
    }

    /// Record the previous step in the audit trail and enter the next one.
    pub fn advance_step(&mut self, step: ScanStep, message: impl Into<String>) {
        if let Some(previous) = self.current_step {
            self.completed_steps.push(CompletedStep {
                step: previous,
                message: message.into(),
                timestamp: Utc::now(),
            });
        }
        self.current_step = Some(step);
        self.status = match step {
            ScanStep::WaitingIdInput => TaskStatus::Waiting,
            _ => TaskStatus::Running,
        };
    }

    pub fn finish(&mut self, status: TaskStatus, result: Option<Value>, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.result = result;
        self.error_message = error;
        self.end_time = Some(Utc::now());
        self.current_step = match status {
            TaskStatus::Completed => self.current_step.map(|_| ScanStep::Completed),
            TaskStatus::Failed => self.current_step.map(|_| ScanStep::Error),
            TaskStatus::Cancelled => self.current_step.map(|_| ScanStep::Cancelled),
            _ => self.current_step,
        };
    }
}
