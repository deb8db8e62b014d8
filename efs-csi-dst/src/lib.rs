//! Deterministic simulation testing for efs-csi.
//!
//! Kept apart from the driver crate so the oracles and fault-injecting
//! harnesses never reach a production binary.
//!
//! - `harness`: oracles, action generators and invariant checks
//! - `simulation`: seeded runtime and simulation runners
//!
//! ```bash
//! # quick runs
//! cargo test -p efs-csi-dst simulation
//!
//! # long runs, reproducible with DST_SEED
//! DST_SEED=42 cargo test -p efs-csi-dst simulation -- --ignored
//! ```

pub mod harness;
pub mod simulation;

pub use harness::{
    AllocatorAction, AllocatorHarness, AllocatorOracle, AllocatorStats, ProvisioningAction,
    ProvisioningHarness, ProvisioningOracle, ProvisioningStats, SimulationError,
};
pub use simulation::{
    build_runtime, get_seed, run_allocator_simulation, run_provisioning_simulation,
};
