use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::phase::Phase;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StepStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum FailureReason {
    Timeout { after: Duration },
    CommandFailed { exit_code: i32, stderr: String },
    PostConditionUnsatisfied,
    /// Membership marker present after a failed join; needs a reset pass.
    PartialMembership,
    Remote { message: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Timeout { after } => write!(f, "timed out after {}s", after.as_secs()),
            FailureReason::CommandFailed { exit_code, stderr } => {
                let last = stderr.lines().last().unwrap_or("no output");
                write!(f, "exit {exit_code}: {last}")
            }
            FailureReason::PostConditionUnsatisfied => {
                f.write_str("post-condition still unsatisfied after action")
            }
            FailureReason::PartialMembership => {
                f.write_str("partial membership state from a failed join; run reset")
            }
            FailureReason::Remote { message } => f.write_str(message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", content = "detail", rename_all = "camelCase")]
pub enum Outcome {
    Success,
    Failed(FailureReason),
    SkippedAlreadySatisfied,
    SkippedDueToDependency(String),
    /// Never issued because the run was cancelled or aborted.
    Cancelled,
}

impl Outcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Success | Outcome::SkippedAlreadySatisfied)
    }

    /// Status persisted for this outcome; `None` when nothing is recorded.
    pub fn status(&self) -> Option<StepStatus> {
        match self {
            Outcome::Success | Outcome::SkippedAlreadySatisfied => Some(StepStatus::Success),
            Outcome::Failed(_) => Some(StepStatus::Failed),
            Outcome::SkippedDueToDependency(_) => Some(StepStatus::Skipped),
            Outcome::Cancelled => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Failed(_) => "failed",
            Outcome::SkippedAlreadySatisfied => "satisfied",
            Outcome::SkippedDueToDependency(_) => "skipped",
            Outcome::Cancelled => "cancelled",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            Outcome::Failed(reason) => Some(reason.to_string()),
            Outcome::SkippedDueToDependency(why) => Some(why.clone()),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{} ({detail})", self.label()),
            None => f.write_str(self.label()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub host: String,
    pub step: String,
    pub phase: Phase,
    pub status: StepStatus,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl ExecutionRecord {
    pub fn pending(host: &str, step: &str, phase: Phase) -> Self {
        Self {
            host: host.to_string(),
            step: step.to_string(),
            phase,
            status: StepStatus::Pending,
            updated_at: Utc::now(),
            last_error: None,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfied_and_success_record_the_same_status() {
        assert_eq!(Outcome::Success.status(), Outcome::SkippedAlreadySatisfied.status());
        assert_eq!(
            Outcome::SkippedDueToDependency("x".into()).status(),
            Some(StepStatus::Skipped)
        );
        assert_eq!(Outcome::Cancelled.status(), None);
    }

    #[test]
    fn failure_display_uses_last_stderr_line() {
        let outcome = Outcome::Failed(FailureReason::CommandFailed {
            exit_code: 100,
            stderr: "Reading package lists...\nE: Unable to locate package kubelet".into(),
        });
        assert_eq!(
            outcome.to_string(),
            "failed (exit 100: E: Unable to locate package kubelet)"
        );
    }
}
