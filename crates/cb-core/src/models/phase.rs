use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::BootstrapError;

/// Bootstrap phases in their fixed global execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Dependencies,
    ControlPlaneInit,
    Network,
    WorkerJoin,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Dependencies,
        Phase::ControlPlaneInit,
        Phase::Network,
        Phase::WorkerJoin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Dependencies => "dependencies",
            Phase::ControlPlaneInit => "control-plane-init",
            Phase::Network => "network",
            Phase::WorkerJoin => "worker-join",
        }
    }

    /// Phases that must have a recorded success before this one may run.
    pub fn prerequisites(&self) -> &'static [Phase] {
        match self {
            Phase::Dependencies => &[],
            Phase::ControlPlaneInit => &[Phase::Dependencies],
            Phase::Network => &[Phase::Dependencies, Phase::ControlPlaneInit],
            Phase::WorkerJoin => &[
                Phase::Dependencies,
                Phase::ControlPlaneInit,
                Phase::Network,
            ],
        }
    }

    /// Parse a phase selection, returning it deduplicated in global order.
    pub fn parse_selection<S: AsRef<str>>(names: &[S]) -> Result<Vec<Phase>, BootstrapError> {
        if names.is_empty() {
            return Ok(Phase::ALL.to_vec());
        }
        let mut phases = names
            .iter()
            .map(|n| n.as_ref().parse::<Phase>())
            .collect::<Result<Vec<_>, _>>()?;
        phases.sort();
        phases.dedup();
        Ok(phases)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = BootstrapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim())
            .ok_or_else(|| BootstrapError::UnknownPhase(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_is_sorted_into_global_order() {
        let phases = Phase::parse_selection(&["worker-join", "dependencies", "worker-join"]).unwrap();
        assert_eq!(phases, vec![Phase::Dependencies, Phase::WorkerJoin]);
    }

    #[test]
    fn empty_selection_means_every_phase() {
        let phases = Phase::parse_selection::<&str>(&[]).unwrap();
        assert_eq!(phases, Phase::ALL.to_vec());
    }

    #[test]
    fn unknown_phase_is_rejected() {
        assert!(matches!(
            Phase::parse_selection(&["deploy"]),
            Err(BootstrapError::UnknownPhase(name)) if name == "deploy"
        ));
    }

    #[test]
    fn prerequisites_only_point_backwards() {
        for phase in Phase::ALL {
            assert!(phase.prerequisites().iter().all(|p| *p < phase));
        }
    }
}
