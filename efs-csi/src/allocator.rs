//! Owner identity (gid) allocation.
//!
//! Every access point on a file system is owned by a unique uid/gid pair
//! drawn from a bounded range. [`GidAllocator`] tracks which gids are held
//! per file system and hands out the lowest free one. Each file system has
//! its own lock, so allocations on unrelated file systems never contend.
//!
//! State is memory-only: after a restart the allocator starts empty.
//!
//! Only a failed create gives a gid back; deleting a volume does not. A
//! file system's range therefore stays fixed from its first successful
//! create until the process restarts, and a small explicit range runs dry
//! after as many creates as it has gids, however many volumes were deleted
//! in between.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{Error, Result};

/// Lowest gid handed out when a request does not specify a range.
pub const DEFAULT_GID_MIN: u32 = 50_000;
/// Highest gid handed out when a request does not specify a range.
pub const DEFAULT_GID_MAX: u32 = 7_000_000;

const _: () = {
    assert!(DEFAULT_GID_MIN > 0);
    assert!(DEFAULT_GID_MAX > DEFAULT_GID_MIN);
};

/// An inclusive gid interval `[min, max]` with `0 < min < max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GidRange {
    min: u32,
    max: u32,
}

impl GidRange {
    pub const DEFAULT: Self = Self {
        min: DEFAULT_GID_MIN,
        max: DEFAULT_GID_MAX,
    };

    pub fn new(min: u32, max: u32) -> Result<Self> {
        if min == 0 {
            return Err(Error::InvalidGidRange {
                min: min.into(),
                max: max.into(),
                reason: "start must be greater than 0",
            });
        }
        if max <= min {
            return Err(Error::InvalidGidRange {
                min: min.into(),
                max: max.into(),
                reason: "end must be greater than start",
            });
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> u32 {
        self.min
    }

    pub fn max(&self) -> u32 {
        self.max
    }

    /// Number of gids in the range.
    pub fn size(&self) -> u64 {
        u64::from(self.max - self.min) + 1
    }

    pub fn contains(&self, gid: u32) -> bool {
        (self.min..=self.max).contains(&gid)
    }
}

impl Default for GidRange {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for GidRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// Allocation table for a single file system.
#[derive(Debug)]
struct FileSystemGids {
    range: GidRange,
    in_use: BTreeSet<u32>,
}

impl FileSystemGids {
    fn new(range: GidRange) -> Self {
        Self {
            range,
            in_use: BTreeSet::new(),
        }
    }

    /// Walk the held gids in order until the first gap.
    fn lowest_free(&self) -> Option<u32> {
        let mut candidate = self.range.min;
        for &gid in self.in_use.range(self.range.min..=self.range.max) {
            if gid != candidate {
                break;
            }
            if candidate == self.range.max {
                return None;
            }
            candidate += 1;
        }
        Some(candidate)
    }
}

/// Thread-safe gid allocator keyed by file system ID.
#[derive(Debug, Default)]
pub struct GidAllocator {
    /// Registry of per-file-system tables. Held only long enough to look up
    /// or insert an entry; allocation itself locks the entry.
    file_systems: Mutex<HashMap<String, Arc<Mutex<FileSystemGids>>>>,
}

impl GidAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, file_system_id: &str, range: GidRange) -> Arc<Mutex<FileSystemGids>> {
        let mut file_systems = self.file_systems.lock();
        Arc::clone(
            file_systems
                .entry(file_system_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(FileSystemGids::new(range)))),
        )
    }

    fn existing_table(&self, file_system_id: &str) -> Option<Arc<Mutex<FileSystemGids>>> {
        self.file_systems.lock().get(file_system_id).cloned()
    }

    /// Allocate the lowest free gid in `range` on `file_system_id`.
    ///
    /// The first range used on a file system is authoritative. A different
    /// range is rejected while any gid on that file system is held, and
    /// adopted once none are.
    pub fn allocate(&self, file_system_id: &str, range: GidRange) -> Result<u32> {
        debug_assert!(!file_system_id.is_empty(), "file_system_id must not be empty");

        let table = self.table(file_system_id, range);
        let mut gids = table.lock();

        if gids.range != range {
            if !gids.in_use.is_empty() {
                return Err(Error::GidRangeConflict {
                    file_system_id: file_system_id.to_string(),
                    requested: range,
                    established: gids.range,
                });
            }
            debug!(
                file_system_id,
                old = %gids.range,
                new = %range,
                "adopting new gid range"
            );
            gids.range = range;
        }

        let gid = gids
            .lowest_free()
            .ok_or_else(|| Error::GidRangeExhausted {
                file_system_id: file_system_id.to_string(),
                range,
            })?;
        gids.in_use.insert(gid);

        debug_assert!(range.contains(gid));
        debug!(file_system_id, gid, "allocated gid");
        Ok(gid)
    }

    /// Like [`GidAllocator::allocate`], but the gid goes back to the pool if
    /// the returned lease is dropped before [`GidLease::keep`]. A request
    /// future cancelled mid-flight therefore leaks nothing.
    pub fn lease(&self, file_system_id: &str, range: GidRange) -> Result<GidLease<'_>> {
        let gid = self.allocate(file_system_id, range)?;
        Ok(GidLease {
            allocator: self,
            file_system_id: file_system_id.to_string(),
            gid,
            kept: false,
        })
    }

    /// Return `gid` to the pool. Releasing a gid that is not held is a no-op.
    pub fn release(&self, file_system_id: &str, gid: u32) {
        let Some(table) = self.existing_table(file_system_id) else {
            return;
        };
        if table.lock().in_use.remove(&gid) {
            debug!(file_system_id, gid, "released gid");
        }
    }

    /// The range currently authoritative for `file_system_id`, if any.
    pub fn range(&self, file_system_id: &str) -> Option<GidRange> {
        self.existing_table(file_system_id)
            .map(|table| table.lock().range)
    }

    /// Gids currently held on `file_system_id`, in ascending order.
    pub fn in_use(&self, file_system_id: &str) -> Vec<u32> {
        self.existing_table(file_system_id)
            .map(|table| table.lock().in_use.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// A gid held on behalf of an in-flight request.
#[must_use = "dropping a lease releases the gid"]
#[derive(Debug)]
pub struct GidLease<'a> {
    allocator: &'a GidAllocator,
    file_system_id: String,
    gid: u32,
    kept: bool,
}

impl GidLease<'_> {
    pub fn gid(&self) -> u32 {
        self.gid
    }

    /// Keep the gid allocated past the lease.
    pub fn keep(mut self) -> u32 {
        self.kept = true;
        self.gid
    }

    /// Return the gid to the pool now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GidLease<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.allocator.release(&self.file_system_id, self.gid);
        }
    }
}
