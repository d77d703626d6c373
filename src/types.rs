use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// State of one remote task as reported by the task service.
///
/// Older servers report numeric codes (`0x10`..`0x70`); newer ones report
/// upper-case names. Both deserialize into the same variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "RawTaskState", into = "String")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Expired,
    TimedOut,
    BotDied,
    Canceled,
    Killed,
    NoResource,
}

impl TaskState {
    /// Still waiting for a bot or still executing.
    pub fn is_running(self) -> bool {
        matches!(self, TaskState::Pending | TaskState::Running)
    }

    /// Reached a final state; results can be collected.
    pub fn is_terminal(self) -> bool {
        !self.is_running()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Running => "RUNNING",
            TaskState::Completed => "COMPLETED",
            TaskState::Expired => "EXPIRED",
            TaskState::TimedOut => "TIMED_OUT",
            TaskState::BotDied => "BOT_DIED",
            TaskState::Canceled => "CANCELED",
            TaskState::Killed => "KILLED",
            TaskState::NoResource => "NO_RESOURCE",
        }
    }

    fn from_code(code: u64) -> Option<Self> {
        match code {
            0x10 => Some(TaskState::Running),
            0x20 => Some(TaskState::Pending),
            0x30 => Some(TaskState::Expired),
            0x40 => Some(TaskState::TimedOut),
            0x50 => Some(TaskState::BotDied),
            0x60 => Some(TaskState::Canceled),
            0x70 => Some(TaskState::Completed),
            0x80 => Some(TaskState::Killed),
            0x100 => Some(TaskState::NoResource),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "PENDING" => Ok(TaskState::Pending),
            "RUNNING" => Ok(TaskState::Running),
            "COMPLETED" => Ok(TaskState::Completed),
            "EXPIRED" => Ok(TaskState::Expired),
            "TIMED_OUT" => Ok(TaskState::TimedOut),
            "BOT_DIED" => Ok(TaskState::BotDied),
            "CANCELED" | "CANCELLED" => Ok(TaskState::Canceled),
            "KILLED" => Ok(TaskState::Killed),
            "NO_RESOURCE" => Ok(TaskState::NoResource),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTaskState {
    Name(String),
    Code(u64),
}

impl TryFrom<RawTaskState> for TaskState {
    type Error = String;

    fn try_from(raw: RawTaskState) -> Result<Self, Self::Error> {
        match raw {
            RawTaskState::Name(name) => name.parse(),
            RawTaskState::Code(code) => {
                TaskState::from_code(code).ok_or_else(|| format!("unknown task state code: {code:#x}"))
            }
        }
    }
}

impl From<TaskState> for String {
    fn from(state: TaskState) -> Self {
        state.as_str().to_string()
    }
}

/// Presentation status of a collect step.
///
/// `Exception` (purple) marks infra problems; `Failure` (red) marks
/// legitimate test failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    Success,
    Failure,
    Exception,
}

impl Default for StepStatus {
    fn default() -> Self {
        StepStatus::Success
    }
}

impl StepStatus {
    /// Combine two statuses, keeping the more severe one.
    pub fn worst(self, other: StepStatus) -> StepStatus {
        self.max(other)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Success => "SUCCESS",
            StepStatus::Failure => "FAILURE",
            StepStatus::Exception => "EXCEPTION",
        };
        f.write_str(s)
    }
}
