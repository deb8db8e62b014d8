//! Simulation runners.
//!
//! Everything runs on a single-threaded runtime, so for a given seed the
//! sampled actions and the interleaving of concurrent creates repeat.

use crate::harness::{AllocatorHarness, ProvisioningHarness, SimulationError};

/// Build a single-threaded tokio runtime for simulation.
pub fn build_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

/// Run the gid allocator against its oracle for `operations` steps.
pub fn run_allocator_simulation(seed: u64, operations: u64) -> Result<(), SimulationError> {
    eprintln!("allocator simulation: seed={seed}, ops={operations}");

    let mut harness = AllocatorHarness::new(seed);
    harness.run(operations)?;

    eprintln!("allocator simulation complete: {:?}", harness.stats());
    Ok(())
}

/// Run volume provisioning against its oracle for `operations` steps.
pub async fn run_provisioning_simulation(
    seed: u64,
    operations: u64,
) -> Result<(), SimulationError> {
    let mut harness = ProvisioningHarness::new(seed)?;
    eprintln!(
        "provisioning simulation: seed={seed}, ops={operations}, delete_root_dir={}",
        harness.delete_root_dir()
    );

    harness.run(operations).await?;

    eprintln!("provisioning simulation complete: {:?}", harness.stats());
    Ok(())
}

/// Get the seed from environment or generate a random one.
pub fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}
