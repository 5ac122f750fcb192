//! Local resource sampling and admission control.

pub mod admission;
pub mod sampler;

pub use admission::{
    AdmissionDecision, AdmissionGate, ResourceAdmissionController, ResourceSnapshot, RunningJobs,
};
pub use sampler::{CpuSample, DiskSample, LinuxResourceSampler, MemorySample, ResourceSampler};
