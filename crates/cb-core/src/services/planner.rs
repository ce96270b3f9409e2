use std::collections::HashMap;

use crate::error::{BootstrapError, Result};
use crate::models::{ClusterConfig, Host, Phase, Step};

use super::catalog;

/// Orders the step catalog into phases and expands it over hosts.
#[derive(Debug, Clone)]
pub struct PhasePlanner {
    steps: Vec<Step>,
}

impl PhasePlanner {
    /// Validate a step catalog. Ids must be unique, lowercase kebab-case, and
    /// `requires` may only name earlier steps.
    pub fn new(mut steps: Vec<Step>) -> Result<Self> {
        let mut seen: HashMap<String, Phase> = HashMap::new();
        for step in &steps {
            if step.id.is_empty()
                || !step
                    .id
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
            {
                return Err(BootstrapError::Config(format!(
                    "step id '{}' must be lowercase kebab-case",
                    step.id
                )));
            }
            if seen.contains_key(&step.id) {
                return Err(BootstrapError::Config(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            for dependency in &step.requires {
                match seen.get(dependency) {
                    Some(phase) if *phase <= step.phase => {}
                    Some(phase) => {
                        return Err(BootstrapError::Config(format!(
                            "step '{}' requires '{dependency}' from the later phase '{phase}'",
                            step.id
                        )));
                    }
                    None => {
                        return Err(BootstrapError::Config(format!(
                            "step '{}' requires '{dependency}', which is not declared before it",
                            step.id
                        )));
                    }
                }
            }
            if step.post_condition().is_none() {
                return Err(BootstrapError::Config(format!(
                    "step '{}' needs a `creates` or `unless` guard",
                    step.id
                )));
            }
            seen.insert(step.id.clone(), step.phase);
        }
        // stable sort keeps declaration order inside each phase
        steps.sort_by_key(|s| s.phase);
        let mut next: HashMap<Phase, usize> = HashMap::new();
        for step in &mut steps {
            let order = next.entry(step.phase).or_default();
            step.order = *order;
            *order += 1;
        }
        Ok(Self { steps })
    }

    pub fn bootstrap(cluster: &ClusterConfig) -> Result<Self> {
        Self::new(catalog::bootstrap_steps(cluster))
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn phase_steps(&self, phase: Phase) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(move |s| s.phase == phase)
    }

    /// Resolve a phase by name; see [`PhasePlanner::resolve_phase`].
    pub fn resolve(&self, phase_name: &str, hosts: &[Host]) -> Result<Vec<(Host, Step)>> {
        let phase: Phase = phase_name.parse()?;
        Ok(self.resolve_phase(phase, hosts))
    }

    /// Cross product of the phase's steps and the hosts each step targets:
    /// step declaration order first, then host order.
    pub fn resolve_phase(&self, phase: Phase, hosts: &[Host]) -> Vec<(Host, Step)> {
        self.phase_steps(phase)
            .flat_map(|step| {
                hosts
                    .iter()
                    .filter(move |h| step.target.matches(h.role))
                    .map(move |h| (h.clone(), step.clone()))
            })
            .collect()
    }
}
