// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use cb_core::error::Result;
use cb_core::models::{
    ClusterConfig, Host, PostCondition, Role, RunOptions, Step, MEMBERSHIP_MARKER,
};
use cb_core::services::orchestrator::Orchestrator;
use cb_core::services::planner::PhasePlanner;
use cb_core::services::registry::HostRegistry;
use cb_core::services::remote::{CommandOutput, RemoteChannel};
use cb_core::services::state::StateTracker;

pub const JOIN_OUTPUT: &str = "kubeadm join 10.0.0.1:6443 --token abcdef.0123456789abcdef \
--discovery-token-ca-cert-hash sha256:8cb2de97839780a412b93877f8507ad6c94f73add17d5d7058e91741c9d5ec78\n";

/// In-memory stand-in for a fleet of hosts.
///
/// Every known post-condition probe answers from a per-host set of satisfied
/// probes. Running a step's action command satisfies its probe, and
/// `kubeadm join` creates the membership marker.
pub struct MockChannel {
    /// action command -> probe command it satisfies
    effects: HashMap<String, String>,
    probes: HashSet<String>,
    satisfied: Mutex<HashSet<(String, String)>>,
    failing: Mutex<HashSet<(String, String)>>,
    nodes: Mutex<HashSet<String>>,
    calls: Mutex<Vec<(String, String)>>,
    uploads: Mutex<Vec<(String, String)>>,
    api_up: AtomicBool,
    api_probes: AtomicUsize,
    /// State file read back whenever a `kubeadm join` starts.
    state_file: Mutex<Option<PathBuf>>,
    state_at_join: Mutex<Vec<String>>,
}

impl MockChannel {
    pub fn new(steps: &[Step]) -> Self {
        let mut effects = HashMap::new();
        let mut probes = HashSet::new();
        for step in steps {
            if let Some(condition) = step.post_condition() {
                let probe = condition.probe_command();
                if let Some(command) = step.command() {
                    effects.insert(command, probe.clone());
                }
                probes.insert(probe);
            }
        }
        probes.insert(membership_probe());
        Self {
            effects,
            probes,
            satisfied: Mutex::new(HashSet::new()),
            failing: Mutex::new(HashSet::new()),
            nodes: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            api_up: AtomicBool::new(true),
            api_probes: AtomicUsize::new(0),
            state_file: Mutex::new(None),
            state_at_join: Mutex::new(Vec::new()),
        }
    }

    /// Make `command` exit non-zero on `host`.
    pub fn fail(&self, host: &str, command: &str) {
        self.failing
            .lock()
            .unwrap()
            .insert((host.to_string(), command.to_string()));
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn satisfy(&self, host: &str, probe: &str) {
        self.satisfied
            .lock()
            .unwrap()
            .insert((host.to_string(), probe.to_string()));
    }

    /// Pretend the control plane already lists a node with this name.
    pub fn add_node(&self, name: &str) {
        self.nodes.lock().unwrap().insert(name.to_string());
    }

    pub fn set_api_up(&self, up: bool) {
        self.api_up.store(up, Ordering::SeqCst);
    }

    pub fn api_probes(&self) -> usize {
        self.api_probes.load(Ordering::SeqCst)
    }

    /// Capture the on-disk state every time a join command starts.
    pub fn watch_state_file(&self, path: PathBuf) {
        *self.state_file.lock().unwrap() = Some(path);
    }

    pub fn state_at_join(&self) -> Vec<String> {
        self.state_at_join.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
        self.uploads.lock().unwrap().clear();
    }

    pub fn calls_on(&self, host: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c)
            .collect()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|(_, c)| c.contains(needle)).count()
    }

    pub fn token_requests(&self) -> usize {
        self.count("kubeadm token create")
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn is_member(&self, host: &str) -> bool {
        self.satisfied
            .lock()
            .unwrap()
            .contains(&(host.to_string(), membership_probe()))
    }
}

#[async_trait]
impl RemoteChannel for MockChannel {
    async fn run(&self, host: &Host, command: &str, _timeout: Duration) -> Result<CommandOutput> {
        let id = host.id().to_string();
        self.calls
            .lock()
            .unwrap()
            .push((id.clone(), command.to_string()));

        if self.probes.contains(command) {
            let present = self
                .satisfied
                .lock()
                .unwrap()
                .contains(&(id, command.to_string()));
            return Ok(exit(if present { 0 } else { 1 }));
        }
        if self
            .failing
            .lock()
            .unwrap()
            .contains(&(id.clone(), command.to_string()))
        {
            return Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: format!("simulated failure of {command}"),
            });
        }
        if command.starts_with("kubeadm token create") {
            return Ok(CommandOutput {
                exit_code: 0,
                stdout: JOIN_OUTPUT.to_string(),
                stderr: String::new(),
            });
        }
        if command.starts_with("kubeadm join") {
            let watched = self.state_file.lock().unwrap().clone();
            if let Some(path) = watched {
                let state = std::fs::read_to_string(path).unwrap_or_default();
                self.state_at_join.lock().unwrap().push(state);
            }
            self.satisfy(&id, &membership_probe());
            return Ok(exit(0));
        }
        if command.starts_with("kubeadm reset") {
            self.satisfied
                .lock()
                .unwrap()
                .remove(&(id, membership_probe()));
            return Ok(exit(0));
        }
        if let Some(node) = command
            .split(" get node ")
            .nth(1)
            .filter(|_| command.starts_with("kubectl"))
        {
            let known = self.nodes.lock().unwrap().contains(node.trim());
            return Ok(exit(if known { 0 } else { 1 }));
        }
        if let Some(probe) = self.effects.get(command) {
            self.satisfy(&id, probe);
        }
        Ok(exit(0))
    }

    async fn upload(
        &self,
        host: &Host,
        _contents: &[u8],
        remote_path: &str,
        _timeout: Duration,
    ) -> Result<()> {
        self.uploads
            .lock()
            .unwrap()
            .push((host.id().to_string(), remote_path.to_string()));
        Ok(())
    }

    async fn probe(&self, _address: &str, _port: u16, _timeout: Duration) -> bool {
        self.api_probes.fetch_add(1, Ordering::SeqCst);
        self.api_up.load(Ordering::SeqCst)
    }
}

fn exit(code: i32) -> CommandOutput {
    CommandOutput {
        exit_code: code,
        ..Default::default()
    }
}

pub fn membership_probe() -> String {
    PostCondition::PathExists(MEMBERSHIP_MARKER.to_string()).probe_command()
}

/// One control plane named `cp` and `workers` workers named `worker-N`.
pub fn hosts(workers: usize) -> Vec<Host> {
    let mut control_plane = Host::new("10.0.0.1", Role::ControlPlane);
    control_plane.name = Some("cp".into());
    let mut hosts = vec![control_plane];
    for i in 1..=workers {
        let mut worker = Host::new(format!("10.0.0.{}", i + 1), Role::Worker);
        worker.name = Some(format!("worker-{i}"));
        hosts.push(worker);
    }
    hosts
}

pub fn fast_cluster() -> ClusterConfig {
    ClusterConfig {
        api_wait_secs: 1,
        api_poll_interval_secs: 1,
        ..Default::default()
    }
}

pub fn fast_options() -> RunOptions {
    RunOptions {
        step_timeout: Duration::from_secs(5),
        retry_delay: Duration::from_millis(10),
        ..Default::default()
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub channel: Arc<MockChannel>,
    pub tracker: Arc<StateTracker>,
}

pub fn harness(workers: usize) -> Harness {
    harness_with(workers, fast_cluster(), Arc::new(StateTracker::in_memory()))
}

pub fn harness_with(workers: usize, cluster: ClusterConfig, tracker: Arc<StateTracker>) -> Harness {
    let planner = PhasePlanner::bootstrap(&cluster).unwrap();
    let channel = Arc::new(MockChannel::new(planner.steps()));
    let registry = HostRegistry::new(hosts(workers)).unwrap();
    let orchestrator = Orchestrator::new(
        registry,
        planner,
        cluster,
        channel.clone(),
        tracker.clone(),
    );
    Harness {
        orchestrator,
        channel,
        tracker,
    }
}

/// Reuse an existing channel, e.g. to simulate a second process resuming.
pub fn harness_on(
    workers: usize,
    channel: Arc<MockChannel>,
    tracker: Arc<StateTracker>,
) -> Orchestrator {
    let cluster = fast_cluster();
    let planner = PhasePlanner::bootstrap(&cluster).unwrap();
    let registry = HostRegistry::new(hosts(workers)).unwrap();
    Orchestrator::new(registry, planner, cluster, channel, tracker)
}

pub fn phases(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// A built-in step by id.
pub fn step_of(step_id: &str) -> Step {
    PhasePlanner::bootstrap(&fast_cluster())
        .unwrap()
        .step(step_id)
        .cloned()
        .unwrap()
}

/// Action command of a built-in step.
pub fn command_of(step_id: &str) -> String {
    PhasePlanner::bootstrap(&fast_cluster())
        .unwrap()
        .step(step_id)
        .and_then(|s| s.command())
        .unwrap()
}
