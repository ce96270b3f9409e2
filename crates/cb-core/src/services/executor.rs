use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::models::{FailureReason, Host, Outcome, Step};

use super::join::{failure, JoinCoordinator};
use super::remote::RemoteChannel;
use super::state::StateTracker;

/// Applies one step to one host: check, act, verify, record.
pub struct StepExecutor {
    channel: Arc<dyn RemoteChannel>,
    tracker: Arc<StateTracker>,
    join: Option<Arc<JoinCoordinator>>,
    default_timeout: Duration,
}

impl StepExecutor {
    pub fn new(
        channel: Arc<dyn RemoteChannel>,
        tracker: Arc<StateTracker>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            tracker,
            join: None,
            default_timeout,
        }
    }

    pub fn with_join_coordinator(mut self, join: Arc<JoinCoordinator>) -> Self {
        self.join = Some(join);
        self
    }

    pub fn timeout_for(&self, step: &Step) -> Duration {
        step.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Apply `step` to `host` and write exactly one record for the attempt.
    ///
    /// Step-level failures are returned as `Ok(Outcome::Failed(..))`. An
    /// `Err` means the run cannot continue; a failed record is still written
    /// for the pair before it is returned.
    pub async fn apply(&self, host: &Host, step: &Step) -> Result<Outcome> {
        let timeout = self.timeout_for(step);
        tracing::debug!(host = %host.id(), step = %step.id, "step_started");

        let result = if step.is_join() {
            match &self.join {
                Some(join) => join.admit(host, step, timeout).await,
                None => Ok(Outcome::Failed(FailureReason::Remote {
                    message: "no join coordinator configured".into(),
                })),
            }
        } else {
            Ok(self.apply_action(host, step, timeout).await)
        };

        match result {
            Ok(outcome) => {
                self.tracker.record_outcome(host.id(), step, &outcome).await?;
                match &outcome {
                    Outcome::Failed(reason) => {
                        tracing::warn!(host = %host.id(), step = %step.id, %reason, "step_failed")
                    }
                    other => {
                        tracing::info!(host = %host.id(), step = %step.id, outcome = other.label(), "step_finished")
                    }
                }
                Ok(outcome)
            }
            Err(fatal) => {
                let recorded = Outcome::Failed(FailureReason::Remote {
                    message: fatal.to_string(),
                });
                self.tracker.record_outcome(host.id(), step, &recorded).await?;
                tracing::error!(host = %host.id(), step = %step.id, error = %fatal, "step_aborted");
                Err(fatal)
            }
        }
    }

    async fn apply_action(&self, host: &Host, step: &Step, timeout: Duration) -> Outcome {
        let (Some(condition), Some(command)) = (step.post_condition(), step.command()) else {
            return Outcome::Failed(FailureReason::Remote {
                message: format!("step '{}' has no command or post-condition", step.id),
            });
        };

        match self.channel.check(host, &condition, timeout).await {
            Ok(true) => return Outcome::SkippedAlreadySatisfied,
            Ok(false) => {}
            Err(e) => return failure(e),
        }

        if let Some(block) = step.rendered_block() {
            let contents = format!("{block}\n");
            if let Err(e) = self
                .channel
                .upload(host, contents.as_bytes(), &step.staging_path(), timeout)
                .await
            {
                return failure(e);
            }
        }

        let output = match self.channel.run(host, &command, timeout).await {
            Ok(output) => output,
            Err(e) => return failure(e),
        };
        if !output.success() {
            return Outcome::Failed(FailureReason::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }

        match self.channel.check(host, &condition, timeout).await {
            Ok(true) => Outcome::Success,
            Ok(false) => Outcome::Failed(FailureReason::PostConditionUnsatisfied),
            Err(e) => failure(e),
        }
    }
}
