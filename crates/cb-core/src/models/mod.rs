pub mod config;
pub mod host;
pub mod phase;
pub mod record;
pub mod report;
pub mod step;
pub mod token;

pub use config::{ClusterConfig, RunOptions};
pub use host::{Connection, Host, Reachability, Role};
pub use phase::Phase;
pub use record::{ExecutionRecord, FailureReason, Outcome, StepStatus};
pub use report::{OutcomeCounts, ReportEntry, RunReport};
pub use step::{PostCondition, RoleFilter, Step, StepAction, MEMBERSHIP_MARKER};
pub use token::JoinToken;
