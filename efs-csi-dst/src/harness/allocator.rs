//! Gid allocator simulation harness.

use std::collections::{BTreeSet, HashMap};

use efs_csi::{Error, GidAllocator, GidRange};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::SimulationError;

const FILE_SYSTEMS: [&str; 3] = ["fs-a", "fs-b", "fs-c"];
/// Small, overlapping ranges so exhaustion and conflicts are common.
const RANGES: [(u32, u32); 3] = [(1, 8), (1, 16), (5, 12)];

#[derive(Debug, Clone)]
pub enum AllocatorAction {
    Allocate {
        file_system_id: String,
        range: GidRange,
    },
    Release {
        file_system_id: String,
        gid: u32,
    },
}

/// Result the oracle predicts for an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocateOutcome {
    Allocated(u32),
    Exhausted,
    Conflict,
}

#[derive(Debug)]
struct Table {
    range: GidRange,
    held: BTreeSet<u32>,
}

/// Reference model of [`GidAllocator`].
#[derive(Debug, Default)]
pub struct AllocatorOracle {
    tables: HashMap<String, Table>,
}

impl AllocatorOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self, file_system_id: &str, range: GidRange) -> AllocateOutcome {
        let table = self
            .tables
            .entry(file_system_id.to_string())
            .or_insert_with(|| Table {
                range,
                held: BTreeSet::new(),
            });

        if table.range != range {
            if !table.held.is_empty() {
                return AllocateOutcome::Conflict;
            }
            table.range = range;
        }

        match (range.min()..=range.max()).find(|gid| !table.held.contains(gid)) {
            Some(gid) => {
                table.held.insert(gid);
                AllocateOutcome::Allocated(gid)
            }
            None => AllocateOutcome::Exhausted,
        }
    }

    pub fn release(&mut self, file_system_id: &str, gid: u32) {
        if let Some(table) = self.tables.get_mut(file_system_id) {
            table.held.remove(&gid);
        }
    }

    pub fn held(&self, file_system_id: &str) -> Vec<u32> {
        self.tables
            .get(file_system_id)
            .map(|t| t.held.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn range(&self, file_system_id: &str) -> Option<GidRange> {
        self.tables.get(file_system_id).map(|t| t.range)
    }
}

#[derive(Debug, Default, Clone)]
pub struct AllocatorStats {
    pub operations: u64,
    pub allocated: u64,
    pub exhausted: u64,
    pub conflicts: u64,
    pub released: u64,
}

pub struct AllocatorHarness {
    rng: SmallRng,
    allocator: GidAllocator,
    oracle: AllocatorOracle,
    stats: AllocatorStats,
}

impl AllocatorHarness {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            allocator: GidAllocator::new(),
            oracle: AllocatorOracle::new(),
            stats: AllocatorStats::default(),
        }
    }

    pub fn run(&mut self, operations: u64) -> Result<(), SimulationError> {
        for _ in 0..operations {
            let action = self.sample_action();
            self.execute(action)?;
            self.stats.operations += 1;
            self.validate_invariants()?;
        }
        Ok(())
    }

    fn sample_action(&mut self) -> AllocatorAction {
        let file_system_id =
            FILE_SYSTEMS[self.rng.random_range(0..FILE_SYSTEMS.len())].to_string();

        if self.rng.random_range(0..100) < 60 {
            // Mostly stick to the established range, sometimes switch.
            let range = match self.oracle.range(&file_system_id) {
                Some(range) if self.rng.random_range(0..100) < 85 => range,
                _ => {
                    let (min, max) = RANGES[self.rng.random_range(0..RANGES.len())];
                    GidRange::new(min, max).unwrap_or_default()
                }
            };
            return AllocatorAction::Allocate {
                file_system_id,
                range,
            };
        }

        let held = self.oracle.held(&file_system_id);
        let gid = if !held.is_empty() && self.rng.random_range(0..100) < 80 {
            held[self.rng.random_range(0..held.len())]
        } else {
            self.rng.random_range(1..=16)
        };
        AllocatorAction::Release {
            file_system_id,
            gid,
        }
    }

    pub fn execute(&mut self, action: AllocatorAction) -> Result<(), SimulationError> {
        match action {
            AllocatorAction::Allocate {
                file_system_id,
                range,
            } => {
                let expected = self.oracle.allocate(&file_system_id, range);
                let actual = self.allocator.allocate(&file_system_id, range);
                match (expected, actual) {
                    (AllocateOutcome::Allocated(want), Ok(got)) if want == got => {
                        self.stats.allocated += 1;
                    }
                    (AllocateOutcome::Exhausted, Err(Error::GidRangeExhausted { .. })) => {
                        self.stats.exhausted += 1;
                    }
                    (AllocateOutcome::Conflict, Err(Error::GidRangeConflict { .. })) => {
                        self.stats.conflicts += 1;
                    }
                    (expected, actual) => {
                        return Err(SimulationError::Mismatch {
                            context: format!(
                                "allocate({file_system_id}, {range}): expected {expected:?}, got {actual:?}"
                            ),
                        });
                    }
                }
            }
            AllocatorAction::Release {
                file_system_id,
                gid,
            } => {
                self.stats.released += 1;
                self.oracle.release(&file_system_id, gid);
                self.allocator.release(&file_system_id, gid);
            }
        }
        Ok(())
    }

    fn validate_invariants(&self) -> Result<(), SimulationError> {
        for file_system_id in FILE_SYSTEMS {
            let expected = self.oracle.held(file_system_id);
            let actual = self.allocator.in_use(file_system_id);
            if expected != actual {
                return Err(SimulationError::Mismatch {
                    context: format!(
                        "{file_system_id} held gids: expected {expected:?}, got {actual:?}"
                    ),
                });
            }
            let expected = self.oracle.range(file_system_id);
            let actual = self.allocator.range(file_system_id);
            if expected != actual {
                return Err(SimulationError::Mismatch {
                    context: format!(
                        "{file_system_id} range: expected {expected:?}, got {actual:?}"
                    ),
                });
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> &AllocatorStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(min: u32, max: u32) -> GidRange {
        GidRange::new(min, max).unwrap()
    }

    #[test]
    fn oracle_allocates_lowest_free() {
        let mut oracle = AllocatorOracle::new();
        assert_eq!(oracle.allocate("fs", range(1, 3)), AllocateOutcome::Allocated(1));
        assert_eq!(oracle.allocate("fs", range(1, 3)), AllocateOutcome::Allocated(2));
        oracle.release("fs", 1);
        assert_eq!(oracle.allocate("fs", range(1, 3)), AllocateOutcome::Allocated(1));
        assert_eq!(oracle.allocate("fs", range(1, 3)), AllocateOutcome::Allocated(3));
        assert_eq!(oracle.allocate("fs", range(1, 3)), AllocateOutcome::Exhausted);
    }

    #[test]
    fn oracle_rejects_conflicting_range_while_held() {
        let mut oracle = AllocatorOracle::new();
        assert_eq!(oracle.allocate("fs", range(1, 3)), AllocateOutcome::Allocated(1));
        assert_eq!(oracle.allocate("fs", range(5, 9)), AllocateOutcome::Conflict);
        oracle.release("fs", 1);
        assert_eq!(oracle.allocate("fs", range(5, 9)), AllocateOutcome::Allocated(5));
        assert_eq!(oracle.range("fs"), Some(range(5, 9)));
    }

    #[test]
    fn harness_matches_oracle_for_fixed_seed() {
        let mut harness = AllocatorHarness::new(7);
        harness.run(500).unwrap();
        assert_eq!(harness.stats().operations, 500);
    }
}
