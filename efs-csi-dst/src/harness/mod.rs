//! Simulation harnesses for efs-csi.
//!
//! Each harness pairs the real component with an oracle, samples random
//! actions from a seeded rng and checks state after every step.

pub mod allocator;
pub mod provisioning;

pub use allocator::{
    AllocateOutcome, AllocatorAction, AllocatorHarness, AllocatorOracle, AllocatorStats,
};
pub use provisioning::{
    Fault, ProvisioningAction, ProvisioningHarness, ProvisioningOracle, ProvisioningStats,
};

/// Error type for simulation failures.
#[derive(Debug)]
pub enum SimulationError {
    /// The component disagreed with its oracle.
    Mismatch { context: String },
    Unexpected(String),
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mismatch { context } => write!(f, "oracle mismatch: {context}"),
            Self::Unexpected(msg) => write!(f, "unexpected error: {msg}"),
        }
    }
}

impl std::error::Error for SimulationError {}
