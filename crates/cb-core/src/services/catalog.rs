//! Built-in kubeadm bootstrap workflow.
//!
//! Every step carries its own post-condition so that re-running the catalog
//! against an already provisioned host performs no remote mutations.

use crate::models::{ClusterConfig, Phase, RoleFilter, Step, StepAction};

const KERNEL_MODULES: &str = "overlay\nbr_netfilter\n";

const SYSCTL_SETTINGS: &str = "net.bridge.bridge-nf-call-iptables  = 1\n\
net.bridge.bridge-nf-call-ip6tables = 1\n\
net.ipv4.ip_forward                 = 1\n";

fn guarded(command: impl Into<String>, unless: impl Into<String>) -> StepAction {
    StepAction::CommandWithGuard {
        command: command.into(),
        creates: None,
        unless: Some(unless.into()),
    }
}

fn creates(command: impl Into<String>, path: impl Into<String>) -> StepAction {
    StepAction::CommandWithGuard {
        command: command.into(),
        creates: Some(path.into()),
        unless: None,
    }
}

fn packages(names: &[&str], hold: bool) -> StepAction {
    StepAction::PackagePresent {
        packages: names.iter().map(|s| s.to_string()).collect(),
        hold,
    }
}

pub fn bootstrap_steps(cluster: &ClusterConfig) -> Vec<Step> {
    let mut steps = dependency_steps(cluster);
    steps.extend(control_plane_steps(cluster));
    steps.extend(network_steps(cluster));
    steps.push(Step::new(
        "join-cluster",
        Phase::WorkerJoin,
        RoleFilter::Worker,
        StepAction::JoinCluster,
    ));
    steps
}

fn dependency_steps(cluster: &ClusterConfig) -> Vec<Step> {
    use Phase::Dependencies as D;
    use RoleFilter::All;

    let version = &cluster.kubernetes_version;
    let repo_line = format!(
        "deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] \
         https://pkgs.k8s.io/core:/stable:/v{version}/deb/ /"
    );

    vec![
        Step::new(
            "swap-off",
            D,
            All,
            guarded("swapoff -a", "test -z \"$(swapon --noheadings --show)\""),
        ),
        Step::new(
            "swap-fstab",
            D,
            All,
            guarded(
                "sed -i.bak -E '/^[^#].*[[:space:]]swap[[:space:]]/ s/^/#/' /etc/fstab",
                "! grep -Eq '^[^#].*[[:space:]]swap[[:space:]]' /etc/fstab",
            ),
        ),
        Step::new(
            "kernel-modules-file",
            D,
            All,
            StepAction::FileBlockPresent {
                path: "/etc/modules-load.d/k8s.conf".into(),
                block: KERNEL_MODULES.into(),
            },
        ),
        Step::new(
            "kernel-modules-loaded",
            D,
            All,
            guarded(
                "modprobe overlay && modprobe br_netfilter",
                "lsmod | grep -q '^overlay ' && lsmod | grep -q '^br_netfilter '",
            ),
        )
        .requires(&["kernel-modules-file"]),
        Step::new(
            "sysctl-file",
            D,
            All,
            StepAction::FileBlockPresent {
                path: "/etc/sysctl.d/k8s.conf".into(),
                block: SYSCTL_SETTINGS.into(),
            },
        ),
        Step::new(
            "sysctl-applied",
            D,
            All,
            guarded(
                "sysctl --system",
                "[ \"$(sysctl -n net.ipv4.ip_forward)\" = 1 ] \
                 && [ \"$(sysctl -n net.bridge.bridge-nf-call-iptables)\" = 1 ]",
            ),
        )
        .requires(&["sysctl-file", "kernel-modules-loaded"]),
        Step::new(
            "base-packages",
            D,
            All,
            packages(
                &["apt-transport-https", "ca-certificates", "curl", "gpg"],
                false,
            ),
        ),
        Step::new("containerd-package", D, All, packages(&["containerd"], false)),
        Step::new(
            "containerd-config",
            D,
            All,
            guarded(
                "mkdir -p /etc/containerd && containerd config default \
                 | sed 's/SystemdCgroup = false/SystemdCgroup = true/' > /etc/containerd/config.toml \
                 && systemctl restart containerd",
                "grep -q 'SystemdCgroup = true' /etc/containerd/config.toml",
            ),
        )
        .requires(&["containerd-package"]),
        Step::new(
            "containerd-service",
            D,
            All,
            StepAction::ServiceActive {
                service: "containerd".into(),
                enabled: true,
                running: true,
            },
        )
        .requires(&["containerd-config"]),
        Step::new(
            "kubernetes-apt-key",
            D,
            All,
            creates(
                format!(
                    "mkdir -p -m 755 /etc/apt/keyrings && curl -fsSL \
                     https://pkgs.k8s.io/core:/stable:/v{version}/deb/Release.key \
                     | gpg --dearmor -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg"
                ),
                "/etc/apt/keyrings/kubernetes-apt-keyring.gpg",
            ),
        )
        .requires(&["base-packages"]),
        Step::new(
            "kubernetes-apt-repo",
            D,
            All,
            StepAction::FileBlockPresent {
                path: "/etc/apt/sources.list.d/kubernetes.list".into(),
                block: repo_line,
            },
        )
        .requires(&["kubernetes-apt-key"]),
        Step::new(
            "kubernetes-packages",
            D,
            All,
            packages(&["kubelet", "kubeadm", "kubectl"], true),
        )
        .requires(&["kubernetes-apt-repo"])
        .with_timeout_secs(900),
        // kubelet restarts in a loop until kubeadm hands it a config, so only
        // enablement is checked here
        Step::new(
            "kubelet-service",
            D,
            All,
            StepAction::ServiceActive {
                service: "kubelet".into(),
                enabled: true,
                running: false,
            },
        )
        .requires(&["kubernetes-packages"]),
    ]
}

fn control_plane_steps(cluster: &ClusterConfig) -> Vec<Step> {
    let mut steps = vec![Step::new(
        "kubeadm-init",
        Phase::ControlPlaneInit,
        RoleFilter::ControlPlane,
        creates(
            format!(
                "kubeadm init --pod-network-cidr={} --apiserver-bind-port={}",
                cluster.pod_network_cidr, cluster.api_port
            ),
            "/etc/kubernetes/admin.conf",
        ),
    )
    .with_timeout_secs(900)];

    if let Some(user) = &cluster.kubeconfig_user {
        steps.push(
            Step::new(
                "user-kubeconfig",
                Phase::ControlPlaneInit,
                RoleFilter::ControlPlane,
                creates(
                    format!(
                        "install -d -o {user} -g {user} ~{user}/.kube \
                         && install -o {user} -g {user} -m 600 /etc/kubernetes/admin.conf ~{user}/.kube/config"
                    ),
                    format!("/home/{user}/.kube/config"),
                ),
            )
            .requires(&["kubeadm-init"]),
        );
    }
    steps
}

fn network_steps(cluster: &ClusterConfig) -> Vec<Step> {
    let (namespace, daemonset) = cluster
        .network_daemonset
        .split_once('/')
        .unwrap_or(("kube-system", cluster.network_daemonset.as_str()));
    let kubectl = "kubectl --kubeconfig /etc/kubernetes/admin.conf";

    vec![
        Step::new(
            "network-plugin",
            Phase::Network,
            RoleFilter::ControlPlane,
            guarded(
                format!("{kubectl} apply -f {}", cluster.network_manifest),
                format!("{kubectl} -n {namespace} get daemonset {daemonset}"),
            ),
        ),
        Step::new(
            "control-plane-ready",
            Phase::Network,
            RoleFilter::ControlPlane,
            guarded(
                format!("{kubectl} wait --for=condition=Ready node --all --timeout=300s"),
                format!(
                    "{kubectl} get nodes --no-headers | awk '{{print $2}}' | grep -qx Ready"
                ),
            ),
        )
        .requires(&["network-plugin"])
        .with_timeout_secs(360),
    ]
}
