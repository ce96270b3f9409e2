use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("inventory file not found at {0}")]
    InventoryNotFound(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid topology: {0}")]
    Topology(String),

    #[error("unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("phase '{phase}' requires '{prerequisite}' to have succeeded on {host}")]
    PrerequisitePhaseNotSatisfied {
        phase: String,
        prerequisite: String,
        host: String,
    },

    #[error("remote action timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("control-plane API at {endpoint} unreachable after {}s", .waited.as_secs())]
    UnreachableControlPlane { endpoint: String, waited: Duration },

    #[error("remote channel failed: {0}")]
    Remote(String),

    #[error("join token request failed: {0}")]
    JoinToken(String),

    #[error("{0} carries membership state from an unfinished join; reset it with --remote")]
    PartialMembership(String),

    #[error("state persistence failed: {0}")]
    State(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl BootstrapError {
    /// Errors raised before any remote action runs.
    pub fn is_preflight(&self) -> bool {
        matches!(
            self,
            BootstrapError::InventoryNotFound(_)
                | BootstrapError::Config(_)
                | BootstrapError::Topology(_)
                | BootstrapError::UnknownPhase(_)
                | BootstrapError::PrerequisitePhaseNotSatisfied { .. }
        )
    }

    /// Process exit code. Pre-flight errors use 10-19, in-run failures 20-29
    /// and internal failures 30.
    pub fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::InventoryNotFound(_) | BootstrapError::Config(_) => 10,
            BootstrapError::Topology(_) => 11,
            BootstrapError::UnknownPhase(_) => 12,
            BootstrapError::PrerequisitePhaseNotSatisfied { .. } => 13,
            BootstrapError::Timeout(_)
            | BootstrapError::Remote(_)
            | BootstrapError::JoinToken(_)
            | BootstrapError::PartialMembership(_) => 20,
            BootstrapError::UnreachableControlPlane { .. } => 21,
            BootstrapError::State(_)
            | BootstrapError::Io(_)
            | BootstrapError::Json(_)
            | BootstrapError::Yaml(_) => 30,
        }
    }
}

pub type Result<T> = std::result::Result<T, BootstrapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preflight_errors_use_their_own_range() {
        let errors = [
            BootstrapError::Config("dup".into()),
            BootstrapError::Topology("two control planes".into()),
            BootstrapError::UnknownPhase("deploy".into()),
            BootstrapError::PrerequisitePhaseNotSatisfied {
                phase: "worker-join".into(),
                prerequisite: "control-plane-init".into(),
                host: "10.0.0.1".into(),
            },
        ];
        for error in &errors {
            assert!(error.is_preflight());
            assert!((10..20).contains(&error.exit_code()), "{error}");
        }
    }

    #[test]
    fn in_run_errors_are_not_preflight() {
        let error = BootstrapError::UnreachableControlPlane {
            endpoint: "10.0.0.1:6443".into(),
            waited: Duration::from_secs(60),
        };
        assert!(!error.is_preflight());
        assert_eq!(error.exit_code(), 21);
        assert_eq!(
            error.to_string(),
            "control-plane API at 10.0.0.1:6443 unreachable after 60s"
        );
    }
}
