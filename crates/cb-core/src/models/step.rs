use serde::{Deserialize, Serialize};

use super::host::Role;
use super::phase::Phase;

/// Marker file whose presence means the kubelet has joined a cluster.
pub const MEMBERSHIP_MARKER: &str = "/etc/kubernetes/kubelet.conf";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoleFilter {
    ControlPlane,
    Worker,
    #[default]
    All,
}

impl RoleFilter {
    pub fn matches(&self, role: Role) -> bool {
        match self {
            RoleFilter::All => true,
            RoleFilter::ControlPlane => role == Role::ControlPlane,
            RoleFilter::Worker => role == Role::Worker,
        }
    }
}

fn yes() -> bool {
    true
}

/// The closed set of provisioning actions a step can perform.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StepAction {
    PackagePresent {
        packages: Vec<String>,
        /// Pin the packages with `apt-mark hold` once installed.
        #[serde(default)]
        hold: bool,
    },
    FileBlockPresent {
        path: String,
        block: String,
    },
    ServiceActive {
        service: String,
        #[serde(default = "yes")]
        enabled: bool,
        #[serde(default = "yes")]
        running: bool,
    },
    CommandWithGuard {
        command: String,
        /// Satisfied once this path exists.
        #[serde(default)]
        creates: Option<String>,
        /// Satisfied once this command exits zero.
        #[serde(default)]
        unless: Option<String>,
    },
    /// Admit a worker using a token issued by the control plane.
    JoinCluster,
}

/// Observable host state proving a step is already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostCondition {
    PackagesInstalled { packages: Vec<String>, held: bool },
    FileContainsBlock { path: String, rendered: String },
    ServiceState { service: String, enabled: bool, running: bool },
    PathExists(String),
    CommandSucceeds(String),
    All(Vec<PostCondition>),
}

impl PostCondition {
    /// Shell command that exits zero when the condition holds.
    pub fn probe_command(&self) -> String {
        match self {
            PostCondition::PackagesInstalled { packages, held } => {
                let mut checks: Vec<String> = packages
                    .iter()
                    .map(|p| {
                        format!(
                            "dpkg-query -W -f='${{Status}}' {} 2>/dev/null | grep -q 'ok installed'",
                            shell_quote(p)
                        )
                    })
                    .collect();
                if *held {
                    checks.extend(
                        packages
                            .iter()
                            .map(|p| format!("apt-mark showhold | grep -qx {}", shell_quote(p))),
                    );
                }
                checks.join(" && ")
            }
            PostCondition::FileContainsBlock { path, rendered } => {
                let (begin, end) = match (rendered.lines().next(), rendered.lines().last()) {
                    (Some(b), Some(e)) => (b, e),
                    _ => ("", ""),
                };
                format!(
                    "[ \"$(sed -n '/^{begin}$/,/^{end}$/p' {path} 2>/dev/null)\" = {expected} ]",
                    path = shell_quote(path),
                    expected = shell_quote(rendered),
                )
            }
            PostCondition::ServiceState {
                service,
                enabled,
                running,
            } => {
                let service = shell_quote(service);
                let mut checks = Vec::new();
                if *running {
                    checks.push(format!("systemctl is-active --quiet {service}"));
                }
                if *enabled {
                    checks.push(format!("systemctl is-enabled --quiet {service}"));
                }
                if checks.is_empty() {
                    checks.push(format!("systemctl cat {service} >/dev/null 2>&1"));
                }
                checks.join(" && ")
            }
            PostCondition::PathExists(path) => format!("test -e {}", shell_quote(path)),
            PostCondition::CommandSucceeds(command) => format!("( {command} )"),
            PostCondition::All(conditions) => conditions
                .iter()
                .map(|c| format!("( {} )", c.probe_command()))
                .collect::<Vec<_>>()
                .join(" && "),
        }
    }
}

/// One idempotent provisioning action bound to a phase and a role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub id: String,
    pub phase: Phase,
    #[serde(default)]
    pub target: RoleFilter,
    pub action: StepAction,
    /// Earlier steps on the same host that must not have failed.
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Position within its phase, in declaration order; assigned by the planner.
    #[serde(skip)]
    pub order: usize,
}

impl Step {
    pub fn new(id: impl Into<String>, phase: Phase, target: RoleFilter, action: StepAction) -> Self {
        Self {
            id: id.into(),
            phase,
            target,
            action,
            requires: Vec::new(),
            timeout_secs: None,
            order: 0,
        }
    }

    pub fn requires(mut self, ids: &[&str]) -> Self {
        self.requires = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn is_join(&self) -> bool {
        matches!(self.action, StepAction::JoinCluster)
    }

    fn block_markers(&self) -> (String, String) {
        (
            format!("# BEGIN clusterboot {}", self.id),
            format!("# END clusterboot {}", self.id),
        )
    }

    /// File block wrapped in its begin/end markers.
    pub fn rendered_block(&self) -> Option<String> {
        match &self.action {
            StepAction::FileBlockPresent { block, .. } => {
                let (begin, end) = self.block_markers();
                Some(format!("{begin}\n{}\n{end}", block.trim_end_matches('\n')))
            }
            _ => None,
        }
    }

    /// Remote path the rendered block is uploaded to before it is spliced in.
    pub fn staging_path(&self) -> String {
        format!("/tmp/clusterboot-{}.block", self.id)
    }

    pub fn post_condition(&self) -> Option<PostCondition> {
        match &self.action {
            StepAction::PackagePresent { packages, hold } => Some(PostCondition::PackagesInstalled {
                packages: packages.clone(),
                held: *hold,
            }),
            StepAction::FileBlockPresent { path, .. } => Some(PostCondition::FileContainsBlock {
                path: path.clone(),
                rendered: self.rendered_block().unwrap_or_default(),
            }),
            StepAction::ServiceActive {
                service,
                enabled,
                running,
            } => Some(PostCondition::ServiceState {
                service: service.clone(),
                enabled: *enabled,
                running: *running,
            }),
            StepAction::CommandWithGuard {
                creates, unless, ..
            } => match (creates, unless) {
                (Some(path), None) => Some(PostCondition::PathExists(path.clone())),
                (None, Some(cmd)) => Some(PostCondition::CommandSucceeds(cmd.clone())),
                (Some(path), Some(cmd)) => Some(PostCondition::All(vec![
                    PostCondition::PathExists(path.clone()),
                    PostCondition::CommandSucceeds(cmd.clone()),
                ])),
                (None, None) => None,
            },
            StepAction::JoinCluster => {
                Some(PostCondition::PathExists(MEMBERSHIP_MARKER.to_string()))
            }
        }
    }

    /// Remote command performing the action. `None` for the join step,
    /// which the join coordinator drives.
    pub fn command(&self) -> Option<String> {
        match &self.action {
            StepAction::PackagePresent { packages, hold } => {
                let list = packages
                    .iter()
                    .map(|p| shell_quote(p))
                    .collect::<Vec<_>>()
                    .join(" ");
                let mut command = format!(
                    "export DEBIAN_FRONTEND=noninteractive && apt-get update -q && apt-get install -y -q {list}"
                );
                if *hold {
                    command.push_str(&format!(" && apt-mark hold {list}"));
                }
                Some(command)
            }
            StepAction::FileBlockPresent { path, .. } => {
                let (begin, end) = self.block_markers();
                let target = shell_quote(path);
                let staged = shell_quote(&self.staging_path());
                Some(format!(
                    "mkdir -p \"$(dirname {target})\" && touch {target} \
                     && sed -i '/^{begin}$/,/^{end}$/d' {target} \
                     && cat {staged} >> {target} && rm -f {staged}"
                ))
            }
            StepAction::ServiceActive {
                service,
                enabled,
                running,
            } => {
                let service = shell_quote(service);
                let verb = match (enabled, running) {
                    (true, true) => format!("systemctl enable --now {service}"),
                    (true, false) => format!("systemctl enable {service}"),
                    (false, true) => format!("systemctl start {service}"),
                    (false, false) => format!("systemctl cat {service} >/dev/null"),
                };
                Some(format!("systemctl daemon-reload && {verb}"))
            }
            StepAction::CommandWithGuard { command, .. } => Some(command.clone()),
            StepAction::JoinCluster => None,
        }
    }
}

/// Quote a string for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}
