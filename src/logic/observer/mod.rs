//! Process Observer - Periodic sampling of watched processes
//!
//! # Components
//! - `types.rs`: subject identity, observations, config
//! - `host.rs`: host query and process control interfaces
//! - `sysinfo_host.rs`: live backend (sysinfo + /proc)
//! - `sampler.rs`: the sampling cycle

pub mod host;
pub mod sampler;
pub mod sysinfo_host;
pub mod types;


pub use host::{ControlSignal, HostQuery, ProcessControl};
pub use sampler::{Observer, ObserverError, SubjectFilter};
pub use sysinfo_host::{calculate_file_hash, SysinfoHost};
pub use types::{
    ChildSpawn, Discovery, FileActivity, FileOp, Handle, HashDelta, HostError, Observation,
    ObservationStatus, ObserverConfig, ProcessDescriptor, ProcessProbe, ResourceUsage, SampleReport,
    SubjectId,
};
