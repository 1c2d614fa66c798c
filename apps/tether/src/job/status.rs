use std::fmt;

use serde::{Deserialize, Serialize};

use crate::protocol::TermSize;
use crate::version::VersionTs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneReason {
    Terminated,
    Gone,
    StartupError,
}

impl DoneReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DoneReason::Terminated => "terminated",
            DoneReason::Gone => "gone",
            DoneReason::StartupError => "startuperror",
        }
    }
}

impl fmt::Display for DoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Init,
    Connected,
    Disconnected,
    Done(DoneReason),
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Init => "init",
            JobStatus::Connected => "connected",
            JobStatus::Disconnected => "disconnected",
            JobStatus::Done(_) => "done",
        }
    }

    pub fn is_done(self) -> bool {
        matches!(self, JobStatus::Done(_))
    }

    pub fn done_reason(self) -> Option<DoneReason> {
        match self {
            JobStatus::Done(reason) => Some(reason),
            _ => None,
        }
    }

    /// Nothing leaves `done`, and `disconnected` is only reachable from a
    /// job that was connected.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Done(_), _) => false,
            (Init, Connected) | (Init, Done(_)) => true,
            (Connected, Disconnected) | (Connected, Done(_)) => true,
            (Disconnected, Connected) | (Disconnected, Done(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Done(reason) => write!(f, "done({reason})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Snapshot published on every transition and returned by status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusEvent {
    pub jobid: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub donereason: Option<DoneReason>,
    pub termsize: TermSize,
    pub version: VersionTs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exitcode: Option<i32>,
}

impl JobStatusEvent {
    pub fn is_done(&self) -> bool {
        self.status == "done"
    }
}
