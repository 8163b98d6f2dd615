//! Host interfaces
//!
//! The observer reads through `HostQuery`; the executor acts through
//! `ProcessControl`. Both are blocking and are called off the runtime.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{HostError, ProcessDescriptor, ProcessProbe, SubjectId};

pub trait HostQuery: Send + Sync {
    /// Every live process on the host
    fn enumerate(&self) -> Result<Vec<ProcessDescriptor>, HostError>;

    /// Resources, handles, file activity and children of one process
    fn probe(&self, id: &SubjectId) -> Result<ProcessProbe, HostError>;

    /// Hash of the process image, if readable
    fn image_hash(&self, id: &SubjectId) -> Result<Option<String>, HostError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlSignal {
    Terminate,
    Kill,
    Suspend,
    Resume,
}

impl fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlSignal::Terminate => "SIGTERM",
            ControlSignal::Kill => "SIGKILL",
            ControlSignal::Suspend => "SIGSTOP",
            ControlSignal::Resume => "SIGCONT",
        };
        f.write_str(name)
    }
}

pub trait ProcessControl: Send + Sync {
    fn signal(&self, id: &SubjectId, signal: ControlSignal) -> Result<(), HostError>;

    /// True while the same process (pid and start time) is alive
    fn is_running(&self, id: &SubjectId) -> bool;
}
