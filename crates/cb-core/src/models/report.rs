use serde::Serialize;

use super::phase::Phase;
use super::record::Outcome;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReportEntry {
    pub phase: Phase,
    pub host: String,
    pub step: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeCounts {
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub skipped_dependency: usize,
    pub cancelled: usize,
}

/// Every (host, step) outcome of one orchestrator run.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub entries: Vec<ReportEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_fatal: Option<String>,
    #[serde(skip)]
    pub fatal_exit_code: Option<i32>,
    pub cancelled: bool,
}

impl RunReport {
    pub fn push(&mut self, phase: Phase, host: &str, step: &str, outcome: Outcome) {
        self.entries.push(ReportEntry {
            phase,
            host: host.to_string(),
            step: step.to_string(),
            outcome,
        });
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for entry in &self.entries {
            match entry.outcome {
                Outcome::Success => counts.success += 1,
                Outcome::Failed(_) => counts.failed += 1,
                Outcome::SkippedAlreadySatisfied => counts.skipped += 1,
                Outcome::SkippedDueToDependency(_) => counts.skipped_dependency += 1,
                Outcome::Cancelled => counts.cancelled += 1,
            }
        }
        counts
    }

    pub fn entries_for(&self, phase: Phase) -> impl Iterator<Item = &ReportEntry> {
        self.entries.iter().filter(move |e| e.phase == phase)
    }

    pub fn outcome(&self, host: &str, step: &str) -> Option<&Outcome> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.host == host && e.step == step)
            .map(|e| &e.outcome)
    }

    pub fn succeeded(&self) -> bool {
        self.first_fatal.is_none() && self.entries.iter().all(|e| e.outcome.is_ok())
    }

    pub fn exit_code(&self) -> i32 {
        if let Some(code) = self.fatal_exit_code {
            return code;
        }
        if self.succeeded() {
            return 0;
        }
        if self.cancelled {
            return 22;
        }
        20
    }
}
