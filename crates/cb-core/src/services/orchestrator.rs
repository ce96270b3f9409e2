use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};

use crate::error::{BootstrapError, Result};
use crate::models::{
    ClusterConfig, FailureReason, Host, Outcome, Phase, ReportEntry, Role, RunOptions, RunReport,
    Step, StepStatus,
};

use super::executor::StepExecutor;
use super::join::{JoinCoordinator, Membership};
use super::planner::PhasePlanner;
use super::registry::HostRegistry;
use super::remote::RemoteChannel;
use super::state::StateTracker;

/// Requests cancellation of an in-flight run. Work already issued finishes;
/// nothing new starts.
#[derive(Clone)]
pub struct CancelHandle {
    sender: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.sender.borrow()
    }
}

/// One (phase, host, step) triple a run would visit.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlannedStep {
    pub phase: Phase,
    pub host: String,
    pub step: String,
    /// Already recorded as successful; a run without `force` skips it.
    pub satisfied: bool,
}

/// Result of a reset pass.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    /// Records removed across every host.
    pub removed: usize,
    /// Hosts whose join record was kept, with the reason.
    pub failed: Vec<ResetFailure>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResetFailure {
    pub host: String,
    pub error: String,
}

impl ResetReport {
    pub fn succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            20
        }
    }
}

/// Shared state of one run, borrowed by every host task.
struct RunContext<'a> {
    executor: StepExecutor,
    options: &'a RunOptions,
    semaphore: Semaphore,
    aborted: AtomicBool,
    fatal: Mutex<Option<BootstrapError>>,
}

impl RunContext<'_> {
    fn abort(&self, error: BootstrapError) {
        self.aborted.store(true, Ordering::SeqCst);
        let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if fatal.is_none() {
            *fatal = Some(error);
        }
    }
}

/// Top-level entry point: runs the selected phases across the selected hosts.
pub struct Orchestrator {
    registry: HostRegistry,
    planner: PhasePlanner,
    cluster: ClusterConfig,
    channel: Arc<dyn RemoteChannel>,
    tracker: Arc<StateTracker>,
    cancel: Arc<watch::Sender<bool>>,
}

impl Orchestrator {
    pub fn new(
        registry: HostRegistry,
        planner: PhasePlanner,
        cluster: ClusterConfig,
        channel: Arc<dyn RemoteChannel>,
        tracker: Arc<StateTracker>,
    ) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            registry,
            planner,
            cluster,
            channel,
            tracker,
            cancel: Arc::new(sender),
        }
    }

    pub fn registry(&self) -> &HostRegistry {
        &self.registry
    }

    pub fn planner(&self) -> &PhasePlanner {
        &self.planner
    }

    pub fn tracker(&self) -> &Arc<StateTracker> {
        &self.tracker
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            sender: self.cancel.clone(),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn join_coordinator(&self, options: &RunOptions) -> JoinCoordinator {
        JoinCoordinator::new(
            self.channel.clone(),
            self.tracker.clone(),
            self.registry.control_plane().clone(),
            self.cluster.clone(),
        )
        .with_reset_partial(options.reset_partial_joins)
    }

    /// What a run with the same selection would visit, in execution order.
    pub async fn plan(&self, phase_names: &[String], host_filter: &[String]) -> Result<Vec<PlannedStep>> {
        let phases = Phase::parse_selection(phase_names)?;
        let hosts = self.registry.select(host_filter)?;
        let mut planned = Vec::new();
        for phase in phases {
            for (host, steps) in self.host_batches(phase, &hosts) {
                for step in steps {
                    planned.push(PlannedStep {
                        phase,
                        host: host.id().to_string(),
                        satisfied: self.tracker.is_satisfied(host.id(), &step.id).await,
                        step: step.id,
                    });
                }
            }
        }
        Ok(planned)
    }

    /// Execute the selected phases in order.
    ///
    /// Pre-flight problems (unknown phase or host, unsatisfied prerequisite
    /// phases) return `Err` before any remote call. Everything after that is
    /// reported through the returned [`RunReport`].
    pub async fn run(
        &self,
        phase_names: &[String],
        host_filter: &[String],
        options: &RunOptions,
    ) -> Result<RunReport> {
        let phases = Phase::parse_selection(phase_names)?;
        let hosts = self.registry.select(host_filter)?;
        self.check_prerequisites(&phases, &hosts).await?;

        let join = Arc::new(self.join_coordinator(options));
        let executor = StepExecutor::new(self.channel.clone(), self.tracker.clone(), options.step_timeout)
            .with_join_coordinator(join.clone());
        let parallel = options.max_parallel.unwrap_or(hosts.len()).max(1);
        let ctx = RunContext {
            executor,
            options,
            semaphore: Semaphore::new(parallel),
            aborted: AtomicBool::new(false),
            fatal: Mutex::new(None),
        };

        tracing::info!(
            phases = ?phases.iter().map(Phase::as_str).collect::<Vec<_>>(),
            hosts = hosts.len(),
            parallel,
            "run_started"
        );

        let mut report = RunReport::default();
        for phase in phases {
            let batches = self.host_batches(phase, &hosts);
            tracing::info!(%phase, hosts = batches.len(), "phase_started");

            let tasks = batches
                .into_iter()
                .map(|(host, steps)| self.run_host(&ctx, phase, host, steps));
            for entries in join_all(tasks).await {
                report.entries.extend(entries);
            }

            let failed = report
                .entries_for(phase)
                .filter(|e| !e.outcome.is_ok())
                .count();
            tracing::info!(%phase, failed, "phase_finished");
        }

        let fatal = ctx.fatal.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(error) = fatal {
            report.first_fatal = Some(error.to_string());
            report.fatal_exit_code = Some(error.exit_code());
        }
        report.cancelled = self.is_cancelled();
        tracing::info!(
            token_requests = join.token_requests(),
            exit_code = report.exit_code(),
            "run_finished"
        );
        Ok(report)
    }

    /// Steps of `phase` grouped per host, hosts in registry order.
    fn host_batches(&self, phase: Phase, hosts: &[Host]) -> Vec<(Host, Vec<Step>)> {
        hosts
            .iter()
            .filter_map(|host| {
                let steps: Vec<Step> = self
                    .planner
                    .phase_steps(phase)
                    .filter(|s| s.target.matches(host.role))
                    .cloned()
                    .collect();
                (!steps.is_empty()).then(|| (host.clone(), steps))
            })
            .collect()
    }

    /// The selected hosts that have work in `phase`, plus the control plane
    /// every other host depends on.
    fn relevant_hosts(&self, phase: Phase, hosts: &[Host]) -> Vec<Host> {
        let mut relevant: Vec<Host> = self
            .host_batches(phase, hosts)
            .into_iter()
            .map(|(host, _)| host)
            .collect();
        if relevant.is_empty() {
            return relevant;
        }
        let control_plane = self.registry.control_plane();
        if !relevant.iter().any(|h| h.id() == control_plane.id()) {
            relevant.insert(0, control_plane.clone());
        }
        relevant
    }

    /// Prerequisite phases left out of the selection must already be recorded
    /// as complete on every relevant host.
    async fn check_prerequisites(&self, selected: &[Phase], hosts: &[Host]) -> Result<()> {
        for &phase in selected {
            let relevant = self.relevant_hosts(phase, hosts);
            for &prerequisite in phase.prerequisites() {
                if selected.contains(&prerequisite) {
                    continue;
                }
                for (host, step) in self.planner.resolve_phase(prerequisite, &relevant) {
                    if !self.tracker.is_satisfied(host.id(), &step.id).await {
                        tracing::warn!(
                            %phase,
                            %prerequisite,
                            host = %host.id(),
                            step = %step.id,
                            "prerequisite_unsatisfied"
                        );
                        return Err(BootstrapError::PrerequisitePhaseNotSatisfied {
                            phase: phase.to_string(),
                            prerequisite: prerequisite.to_string(),
                            host: host.id().to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// First incomplete prerequisite step on `host` or on the control plane.
    async fn blocking_prerequisite(&self, phase: Phase, host: &Host) -> Option<String> {
        let control_plane = self.registry.control_plane();
        let mut scope = vec![control_plane.clone()];
        if host.id() != control_plane.id() {
            scope.push(host.clone());
        }
        for &prerequisite in phase.prerequisites() {
            for (target, step) in self.planner.resolve_phase(prerequisite, &scope) {
                if !self.tracker.is_satisfied(target.id(), &step.id).await {
                    return Some(format!(
                        "{prerequisite} incomplete: {} on {}",
                        step.id,
                        target.id()
                    ));
                }
            }
        }
        None
    }

    /// First `requires` entry of `step` that has not succeeded on `host`.
    async fn failed_requirement(&self, host: &Host, step: &Step) -> Option<String> {
        for dependency in &step.requires {
            let applies = self
                .planner
                .step(dependency)
                .is_some_and(|d| d.target.matches(host.role));
            if applies && !self.tracker.is_satisfied(host.id(), dependency).await {
                return Some(format!("requires {dependency}"));
            }
        }
        None
    }

    /// Run one host's steps of a phase strictly in order.
    async fn run_host(
        &self,
        ctx: &RunContext<'_>,
        phase: Phase,
        host: Host,
        steps: Vec<Step>,
    ) -> Vec<ReportEntry> {
        let _permit = ctx.semaphore.acquire().await.ok();
        let blocker = self.blocking_prerequisite(phase, &host).await;
        let mut entries = Vec::with_capacity(steps.len());

        for step in steps {
            let outcome = self.run_step(ctx, &host, &step, blocker.as_deref()).await;
            entries.push(ReportEntry {
                phase,
                host: host.id().to_string(),
                step: step.id.clone(),
                outcome,
            });
        }
        entries
    }

    async fn run_step(
        &self,
        ctx: &RunContext<'_>,
        host: &Host,
        step: &Step,
        blocker: Option<&str>,
    ) -> Outcome {
        if self.is_cancelled() || ctx.aborted.load(Ordering::SeqCst) {
            return Outcome::Cancelled;
        }
        if !ctx.options.force && self.tracker.is_satisfied(host.id(), &step.id).await {
            tracing::debug!(host = %host.id(), step = %step.id, "step_already_recorded");
            return Outcome::SkippedAlreadySatisfied;
        }

        let skip_reason = match blocker {
            Some(reason) => Some(reason.to_string()),
            None => self.failed_requirement(host, step).await,
        };
        if let Some(reason) = skip_reason {
            tracing::info!(host = %host.id(), step = %step.id, %reason, "step_skipped");
            let outcome = Outcome::SkippedDueToDependency(reason);
            if let Err(e) = self.tracker.record_outcome(host.id(), step, &outcome).await {
                ctx.abort(e);
            }
            return outcome;
        }

        let mut attempt = 0;
        loop {
            match ctx.executor.apply(host, step).await {
                Ok(Outcome::Failed(reason)) if attempt < ctx.options.retries && !self.is_cancelled() => {
                    attempt += 1;
                    tracing::info!(
                        host = %host.id(),
                        step = %step.id,
                        %reason,
                        attempt,
                        "step_retrying"
                    );
                    self.pause(ctx.options.retry_delay).await;
                }
                Ok(outcome) => return outcome,
                Err(fatal) => {
                    let outcome = Outcome::Failed(FailureReason::Remote {
                        message: fatal.to_string(),
                    });
                    ctx.abort(fatal);
                    return outcome;
                }
            }
        }
    }

    /// Sleep that ends early on cancellation.
    async fn pause(&self, delay: Duration) {
        let mut cancelled = self.cancel.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancelled.wait_for(|c| *c) => {}
        }
    }

    /// Forget recorded progress for the selected hosts, optionally one step.
    ///
    /// With `remote`, workers also get their cluster membership wiped so the
    /// next run rejoins them. Without it, a worker still holding membership
    /// state from an unfinished join keeps its join record, since dropping it
    /// would make the next run trust the marker. A host that cannot be reset
    /// keeps its join record and is listed in the report; the others are
    /// reset regardless.
    pub async fn reset(
        &self,
        host_filter: &[String],
        step: Option<&str>,
        remote: bool,
        timeout: Duration,
    ) -> Result<ResetReport> {
        if let Some(id) = step {
            if self.planner.step(id).is_none() {
                return Err(BootstrapError::Config(format!("unknown step '{id}'")));
            }
        }
        let hosts = self.registry.select(host_filter)?;
        let join_step = self
            .planner
            .steps()
            .iter()
            .find(|s| s.is_join() && step.map_or(true, |id| id == s.id));
        let join = self.join_coordinator(&RunOptions::default());

        let mut report = ResetReport::default();
        for host in &hosts {
            let mut kept_join = None;
            if let Some(join_step) = join_step.filter(|_| host.role == Role::Worker) {
                let cleared = if remote {
                    join.reset_worker(host, timeout).await
                } else {
                    self.check_no_partial_join(&join, host, join_step, timeout).await
                };
                if let Err(e) = cleared {
                    tracing::warn!(host = %host.id(), error = %e, "reset_failed");
                    report.failed.push(ResetFailure {
                        host: host.id().to_string(),
                        error: e.to_string(),
                    });
                    kept_join = Some(join_step.id.as_str());
                }
            }
            report.removed += self
                .tracker
                .reset_matching(host.id(), |s| {
                    step.map_or(true, |id| id == s) && kept_join != Some(s)
                })
                .await?;
        }
        tracing::info!(
            hosts = hosts.len(),
            removed = report.removed,
            failed = report.failed.len(),
            remote,
            "state_reset"
        );
        Ok(report)
    }

    /// Refuse a local reset of a join that never finished while the worker
    /// still carries the membership marker.
    async fn check_no_partial_join(
        &self,
        join: &JoinCoordinator,
        worker: &Host,
        step: &Step,
        timeout: Duration,
    ) -> Result<()> {
        let unfinished = matches!(
            self.tracker.status(worker.id(), &step.id).await,
            Some(StepStatus::Pending | StepStatus::Failed)
        );
        if unfinished && join.membership(worker, step, timeout).await? == Membership::Partial {
            return Err(BootstrapError::PartialMembership(worker.id().to_string()));
        }
        Ok(())
    }
}
