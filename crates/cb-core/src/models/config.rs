use std::time::Duration;

use serde::Deserialize;

/// Cluster-wide settings from the `cluster:` section of the inventory.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ClusterConfig {
    pub api_port: u16,
    pub pod_network_cidr: String,
    /// Minor version used for the package repository, e.g. "1.29".
    pub kubernetes_version: String,
    pub network_manifest: String,
    /// Namespace and daemonset the network manifest creates.
    pub network_daemonset: String,
    /// Zero means the join token never expires.
    pub token_ttl_secs: u64,
    pub api_wait_secs: u64,
    pub api_poll_interval_secs: u64,
    /// Login user that receives a copy of the admin kubeconfig.
    pub kubeconfig_user: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            api_port: 6443,
            pod_network_cidr: "10.244.0.0/16".into(),
            kubernetes_version: "1.29".into(),
            network_manifest:
                "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml"
                    .into(),
            network_daemonset: "kube-flannel/kube-flannel-ds".into(),
            token_ttl_secs: 7200,
            api_wait_secs: 60,
            api_poll_interval_secs: 2,
            kubeconfig_user: None,
        }
    }
}

impl ClusterConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn api_wait(&self) -> Duration {
        Duration::from_secs(self.api_wait_secs)
    }

    pub fn api_poll_interval(&self) -> Duration {
        Duration::from_secs(self.api_poll_interval_secs.max(1))
    }
}

/// Knobs for one orchestrator run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Re-apply steps already recorded as successful.
    pub force: bool,
    /// Cap on hosts processed concurrently; defaults to the host count.
    pub max_parallel: Option<usize>,
    pub step_timeout: Duration,
    /// Extra attempts for a failed step before it is reported.
    pub retries: u32,
    pub retry_delay: Duration,
    /// Reset workers left with partial membership state, then rejoin them.
    pub reset_partial_joins: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            force: false,
            max_parallel: None,
            step_timeout: Duration::from_secs(600),
            retries: 0,
            retry_delay: Duration::from_secs(5),
            reset_partial_joins: false,
        }
    }
}
