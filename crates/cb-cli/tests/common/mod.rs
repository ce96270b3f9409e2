// Each test binary compiles this module independently and uses a different
// subset of helpers, so unused-function warnings are expected.
#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};

use cb_core::models::{
    ExecutionRecord, FailureReason, Host, Outcome, Phase, Reachability, Role, RunReport,
    StepStatus,
};

/// Fixed timestamp for deterministic snapshots.
pub fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, hour, minute, second).unwrap()
}

/// A run where one worker failed a dependency and could not join.
pub fn mixed_report() -> RunReport {
    let mut report = RunReport::default();
    report.push(Phase::Dependencies, "cp", "swap-off", Outcome::Success);
    report.push(
        Phase::Dependencies,
        "worker-1",
        "swap-off",
        Outcome::SkippedAlreadySatisfied,
    );
    report.push(
        Phase::Dependencies,
        "worker-1",
        "containerd-config",
        Outcome::Failed(FailureReason::CommandFailed {
            exit_code: 1,
            stderr: "E: boom".into(),
        }),
    );
    report.push(
        Phase::WorkerJoin,
        "worker-1",
        "join-cluster",
        Outcome::SkippedDueToDependency("requires containerd-config".into()),
    );
    report
}

pub fn make_record(
    host: &str,
    step: &str,
    phase: Phase,
    status: StepStatus,
    attempts: u32,
    updated_at: DateTime<Utc>,
) -> ExecutionRecord {
    let mut record = ExecutionRecord::pending(host, step, phase);
    record.status = status;
    record.attempts = attempts;
    record.updated_at = updated_at;
    record
}

pub fn make_host(name: Option<&str>, address: &str, role: Role, reachability: Reachability) -> Host {
    let mut host = Host::new(address, role);
    host.name = name.map(str::to_string);
    host.reachability = reachability;
    host
}
