use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use crate::error::{BootstrapError, Result};
use crate::models::step::shell_quote;
use crate::models::{
    ClusterConfig, FailureReason, Host, JoinToken, Outcome, PostCondition, Step, StepStatus,
    MEMBERSHIP_MARKER,
};

use super::remote::RemoteChannel;
use super::state::StateTracker;

const KUBECTL: &str = "kubectl --kubeconfig /etc/kubernetes/admin.conf";
const RESET_LOCAL_STATE: &str = "kubeadm reset -f && rm -rf /etc/cni/net.d";

/// What a worker's local state and its join record say about membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    Absent,
    Joined,
    /// The marker exists but the last join never finished (`pending` or
    /// `failed` record). The marker cannot be trusted.
    Partial,
}

/// Admits workers into the cluster initialized on the control-plane host.
///
/// One coordinator lives for one orchestrator run: the join token it fetches
/// is shared by every worker task and never persisted.
pub struct JoinCoordinator {
    channel: Arc<dyn RemoteChannel>,
    tracker: Arc<StateTracker>,
    control_plane: Host,
    cluster: ClusterConfig,
    /// Reset workers left in a partial join instead of failing them.
    reset_partial: bool,
    token: Mutex<Option<Arc<JoinToken>>>,
    token_requests: AtomicUsize,
    api_reachable: OnceCell<bool>,
}

impl JoinCoordinator {
    pub fn new(
        channel: Arc<dyn RemoteChannel>,
        tracker: Arc<StateTracker>,
        control_plane: Host,
        cluster: ClusterConfig,
    ) -> Self {
        Self {
            channel,
            tracker,
            control_plane,
            cluster,
            reset_partial: false,
            token: Mutex::new(None),
            token_requests: AtomicUsize::new(0),
            api_reachable: OnceCell::new(),
        }
    }

    pub fn with_reset_partial(mut self, reset_partial: bool) -> Self {
        self.reset_partial = reset_partial;
        self
    }

    /// How many times a token was requested from the control plane.
    pub fn token_requests(&self) -> usize {
        self.token_requests.load(Ordering::SeqCst)
    }

    pub fn api_endpoint(&self) -> String {
        format!("{}:{}", self.control_plane.address, self.cluster.api_port)
    }

    /// Run the join handshake for one worker.
    ///
    /// Per-worker problems come back as `Ok(Outcome::Failed(..))`. Only an
    /// unreachable control-plane API or a failed state write is returned as
    /// an error. The join record is marked `pending` right before `kubeadm
    /// join` runs.
    pub async fn admit(&self, worker: &Host, step: &Step, timeout: Duration) -> Result<Outcome> {
        let membership = match self.membership(worker, step, timeout).await {
            Ok(membership) => membership,
            Err(e) => return Ok(failure(e)),
        };
        match membership {
            Membership::Joined => {
                tracing::info!(worker = %worker.id(), "worker_already_joined");
                return Ok(Outcome::SkippedAlreadySatisfied);
            }
            Membership::Partial if !self.reset_partial => {
                tracing::warn!(
                    worker = %worker.id(),
                    "membership state left by an unfinished join; reset required"
                );
                return Ok(Outcome::Failed(FailureReason::PartialMembership));
            }
            Membership::Partial | Membership::Absent => {}
        }
        let partial = membership == Membership::Partial;

        let token = match self.token(timeout).await {
            Ok(token) => token,
            Err(BootstrapError::Timeout(after)) => {
                return Ok(Outcome::Failed(FailureReason::Timeout { after }))
            }
            Err(e) => return Ok(failure(e)),
        };
        self.wait_for_api().await?;

        if partial {
            if let Err(e) = self.reset_local_state(worker, timeout).await {
                tracing::warn!(worker = %worker.id(), error = %e, "local_reset_failed");
            }
        }
        self.remove_stale_node(worker, timeout).await;

        self.tracker.mark_pending(worker.id(), step).await?;
        tracing::info!(worker = %worker.id(), endpoint = %token.endpoint, "joining_worker");
        let output = match self
            .channel
            .run(worker, &token.join_command(worker.node_name()), timeout)
            .await
        {
            Ok(output) => output,
            Err(e) => return Ok(failure(e)),
        };
        if !output.success() {
            return Ok(Outcome::Failed(FailureReason::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            }));
        }

        match self.channel.check(worker, &marker(), timeout).await {
            Ok(true) => {
                token.mark_consumed(worker.id());
                Ok(Outcome::Success)
            }
            Ok(false) => Ok(Outcome::Failed(FailureReason::PostConditionUnsatisfied)),
            Err(e) => Ok(failure(e)),
        }
    }

    /// Current join token, requesting a fresh one when none exists yet or the
    /// previous one expired. Concurrent callers share a single request.
    pub async fn token(&self, timeout: Duration) -> Result<Arc<JoinToken>> {
        let mut slot = self.token.lock().await;
        if let Some(token) = slot.as_ref() {
            if !token.is_expired() {
                return Ok(token.clone());
            }
            tracing::info!("join_token_expired");
        }

        let ttl = self.cluster.token_ttl();
        if ttl.is_zero() {
            tracing::warn!("requesting a join token that never expires");
        }
        self.token_requests.fetch_add(1, Ordering::SeqCst);
        let command = format!(
            "kubeadm token create --print-join-command --ttl {}s",
            ttl.as_secs()
        );
        let output = self.channel.run(&self.control_plane, &command, timeout).await?;
        if !output.success() {
            return Err(BootstrapError::JoinToken(format!(
                "exit {}: {}",
                output.exit_code,
                output.stderr.lines().last().unwrap_or("no output")
            )));
        }

        let token = Arc::new(JoinToken::parse(
            &output.stdout,
            self.control_plane.id(),
            ttl,
        )?);
        tracing::info!(issuer = %token.issuer, ttl_secs = ttl.as_secs(), "join_token_issued");
        *slot = Some(token.clone());
        Ok(token)
    }

    /// Classify a worker from its membership marker and its join record.
    pub async fn membership(&self, worker: &Host, step: &Step, timeout: Duration) -> Result<Membership> {
        if !self.channel.check(worker, &marker(), timeout).await? {
            return Ok(Membership::Absent);
        }
        match self.tracker.status(worker.id(), &step.id).await {
            Some(StepStatus::Pending | StepStatus::Failed) => Ok(Membership::Partial),
            _ => Ok(Membership::Joined),
        }
    }

    /// Poll the API port until it accepts connections or the wait runs out.
    /// The first answer holds for the rest of the run, so only one caller
    /// ever waits.
    pub async fn wait_for_api(&self) -> Result<()> {
        let reachable = *self.api_reachable.get_or_init(|| self.poll_api()).await;
        if reachable {
            Ok(())
        } else {
            Err(BootstrapError::UnreachableControlPlane {
                endpoint: self.api_endpoint(),
                waited: self.cluster.api_wait(),
            })
        }
    }

    async fn poll_api(&self) -> bool {
        let wait = self.cluster.api_wait();
        let interval = self.cluster.api_poll_interval();
        let deadline = Instant::now() + wait;
        loop {
            let attempt = interval.min(deadline.saturating_duration_since(Instant::now()));
            if self
                .channel
                .probe(&self.control_plane.address, self.cluster.api_port, attempt)
                .await
            {
                return true;
            }
            if Instant::now() >= deadline {
                tracing::warn!(endpoint = %self.api_endpoint(), wait_secs = wait.as_secs(), "api_unreachable");
                return false;
            }
            tracing::debug!(endpoint = %self.api_endpoint(), "api_not_ready");
            tokio::time::sleep(interval.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }

    async fn reset_local_state(&self, worker: &Host, timeout: Duration) -> Result<()> {
        tracing::info!(worker = %worker.id(), "resetting_local_membership");
        let output = self.channel.run(worker, RESET_LOCAL_STATE, timeout).await?;
        if !output.success() {
            return Err(BootstrapError::Remote(format!(
                "kubeadm reset exited {}: {}",
                output.exit_code, output.stderr
            )));
        }
        Ok(())
    }

    /// Delete a leftover node object for this worker. Best effort: the entry
    /// may legitimately not exist.
    async fn remove_stale_node(&self, worker: &Host, timeout: Duration) {
        let node = shell_quote(worker.node_name());
        let lookup = format!("{KUBECTL} get node {node}");
        match self.channel.run(&self.control_plane, &lookup, timeout).await {
            Ok(output) if output.success() => {}
            Ok(_) => return,
            Err(e) => {
                tracing::warn!(worker = %worker.id(), error = %e, "stale_node_lookup_failed");
                return;
            }
        }

        tracing::info!(worker = %worker.id(), "removing_stale_node");
        let delete = format!("{KUBECTL} delete node {node} --ignore-not-found");
        match self.channel.run(&self.control_plane, &delete, timeout).await {
            Ok(output) if output.success() => {}
            Ok(output) => {
                tracing::warn!(worker = %worker.id(), stderr = %output.stderr, "stale_node_removal_failed")
            }
            Err(e) => tracing::warn!(worker = %worker.id(), error = %e, "stale_node_removal_failed"),
        }
    }

    /// Reset pass for a worker: wipe its local membership and drop its node
    /// object from the control plane.
    pub async fn reset_worker(&self, worker: &Host, timeout: Duration) -> Result<()> {
        self.reset_local_state(worker, timeout).await?;
        self.remove_stale_node(worker, timeout).await;
        Ok(())
    }
}

fn marker() -> PostCondition {
    PostCondition::PathExists(MEMBERSHIP_MARKER.to_string())
}

/// Map a channel error to a per-step failure.
pub(crate) fn failure(error: BootstrapError) -> Outcome {
    match error {
        BootstrapError::Timeout(after) => Outcome::Failed(FailureReason::Timeout { after }),
        other => Outcome::Failed(FailureReason::Remote {
            message: other.to_string(),
        }),
    }
}
