use crate::model::{StackId, UnitId};
use jiff::Timestamp;
use serde::Serialize;
use std::fmt;

pub mod registry;
pub mod scheduler;

pub use registry::JobRegistry;
pub use scheduler::{JobHandler, JobScheduler, JobSubmitter};

/// The closed set of work the scheduler knows how to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// `pinned` targets were named explicitly and skip the pending-candidate check.
    Update {
        unit_id: UnitId,
        version: String,
        pinned: bool,
    },
    ResetAll,
    CheckAllForUpdates,
    RestartStack { stack_id: StackId },
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Update {
                unit_id,
                version,
                pinned,
            } => {
                write!(f, "update unit {unit_id} to {version}")?;
                if *pinned {
                    f.write_str(" (pinned)")?;
                }
                Ok(())
            }
            JobKind::ResetAll => f.write_str("reset all"),
            JobKind::CheckAllForUpdates => f.write_str("check all for updates"),
            JobKind::RestartStack { stack_id } => write!(f, "restart stack {stack_id}"),
        }
    }
}

/// A queued or running job. Jobs leave the registry once finished, whatever the
/// outcome; the output log is the only record of a failure.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub seq: u64,
    pub kind: JobKind,
    pub processing: bool,
    pub output: Vec<String>,
    pub created_at: Timestamp,
}
