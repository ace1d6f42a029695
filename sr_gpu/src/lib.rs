//! Admission control for the single large model a stage may hold.
//!
//! Every stage normally runs as its own process, so process exit is what
//! frees accelerator memory. This crate covers the case where one process
//! hosts two models in sequence: the first has to be proven evicted, using
//! live memory telemetry, before the second is loaded.

mod manager;
mod telemetry;

use thiserror::Error;

pub use manager::{
    CleanupReport, ModelHandle, ResourceManager, ResourcePolicy, ResourceSlot,
    SlotRequest,
};
pub use telemetry::{MemorySnapshot, MemoryTelemetry, NvidiaSmi, parse_nvidia_smi};

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

// takes a reference because error format arguments borrow their fields
#[allow(clippy::cast_precision_loss, clippy::trivially_copy_pass_by_ref)]
fn gib(bytes: &u64) -> f64 {
    *bytes as f64 / GIB as f64
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error(
        "insufficient accelerator memory for {name}: {:.1} GiB required, {:.1} GiB available",
        gib(.required),
        gib(.available)
    )]
    InsufficientResource {
        name: String,
        required: u64,
        available: u64,
    },
    #[error("no accelerator detected and one is required")]
    NoAccelerator,
    #[error("model slot is held by {occupant}; release it before loading {requested}")]
    SlotOccupied { occupant: String, requested: String },
    #[error(
        "memory held by {name} was not reclaimed within {timeout:?}: {:.1} GiB in use, {:.1} GiB before load",
        gib(.used),
        gib(.baseline)
    )]
    CleanupTimeout {
        name: String,
        timeout: std::time::Duration,
        used: u64,
        baseline: u64,
    },
    #[error("failed to release {name}: {reason}")]
    Release { name: String, reason: String },
    #[error("memory telemetry failed: {0}")]
    Telemetry(String),
}
