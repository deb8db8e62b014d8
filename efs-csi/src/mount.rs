//! Host mount operations.
//!
//! Deleting an access point's root directory requires mounting the file
//! system on the controller host. [`Mounter`] abstracts the host calls
//! involved; [`ScopedMount`] ties a mount to a scope so the mount point is
//! unmounted and removed on every exit path.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::driver::log_cleanup_error;
use crate::error::{Error, Result};

/// Maximum number of mount options accepted. Prevents argv overflow.
const MOUNT_OPTIONS_MAX: usize = 64;

/// Blocking host mount calls. Callers run these off the async runtime.
pub trait Mounter: Send + Sync {
    fn make_dir(&self, path: &Path) -> io::Result<()>;

    fn mount(&self, source: &str, target: &Path, fs_type: &str, options: &[String])
    -> io::Result<()>;

    fn unmount(&self, target: &Path) -> io::Result<()>;

    /// Remove the empty directory `path`. A missing path is not an error.
    fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Remove `path` and everything under it. A missing path is not an error.
    fn remove_all(&self, path: &Path) -> io::Result<()>;
}

/// [`Mounter`] backed by the host's `mount` and `umount` binaries.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

fn run(cmd: &mut Command) -> io::Result<()> {
    let output = cmd.output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(io::Error::other(stderr));
    }
    Ok(())
}

impl Mounter for SystemMounter {
    fn make_dir(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> io::Result<()> {
        if options.len() > MOUNT_OPTIONS_MAX {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("too many mount options: {}", options.len()),
            ));
        }

        let mut cmd = Command::new("mount");
        if !fs_type.is_empty() {
            cmd.args(["-t", fs_type]);
        }
        if !options.is_empty() {
            cmd.args(["-o", &options.join(",")]);
        }
        cmd.arg(source).arg(target);
        run(&mut cmd)
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        run(Command::new("umount").arg(target))
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_dir(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        match std::fs::remove_dir_all(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}

/// A mounted file system that is torn down when the guard goes away.
///
/// [`ScopedMount::release`] unmounts and removes the mount point, reporting
/// failures. Dropping the guard without releasing does the same on a best
/// effort basis and only logs. Mount points are only ever removed with
/// [`Mounter::remove_dir`], so a directory that is still mounted, or holds
/// data, survives cleanup.
pub struct ScopedMount {
    mounter: Arc<dyn Mounter>,
    target: PathBuf,
    armed: bool,
}

impl ScopedMount {
    /// Create `target` and mount `source` on it.
    ///
    /// If the mount fails the directory is removed again when empty.
    pub fn mount(
        mounter: Arc<dyn Mounter>,
        source: &str,
        target: PathBuf,
        fs_type: &str,
        options: &[String],
    ) -> Result<Self> {
        mounter.make_dir(&target).map_err(|source| Error::MakeDir {
            path: target.clone(),
            source,
        })?;

        if let Err(source_err) = mounter.mount(source, &target, fs_type, options) {
            log_cleanup_error("remove mount point after failed mount", || {
                mounter.remove_dir(&target)
            });
            return Err(Error::Mount {
                mount_source: source.to_string(),
                target,
                source: source_err,
            });
        }

        debug!(source, target = %target.display(), fs_type, "mounted");
        Ok(Self {
            mounter,
            target,
            armed: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.target
    }

    /// Unmount and remove the mount point.
    pub fn release(mut self) -> Result<()> {
        self.armed = false;
        self.mounter
            .unmount(&self.target)
            .map_err(|source| Error::Unmount {
                target: self.target.clone(),
                source,
            })?;
        self.mounter
            .remove_dir(&self.target)
            .map_err(|source| Error::RemoveMountDir {
                path: self.target.clone(),
                source,
            })?;
        debug!(target = %self.target.display(), "unmounted");
        Ok(())
    }
}

impl Drop for ScopedMount {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.mounter.unmount(&self.target) {
            Ok(()) => log_cleanup_error("remove mount point", || {
                self.mounter.remove_dir(&self.target)
            }),
            Err(e) => warn!(
                target = %self.target.display(),
                error = %e,
                "unmount failed, leaving mount point in place"
            ),
        }
    }
}

/// Host call recorded by [`FakeMounter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    MakeDir(PathBuf),
    Mount {
        source: String,
        target: PathBuf,
        fs_type: String,
        options: Vec<String>,
    },
    Unmount(PathBuf),
    RemoveDir(PathBuf),
    RemoveAll(PathBuf),
}

/// Kind of [`MountCall`], used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MountOp {
    MakeDir,
    Mount,
    Unmount,
    RemoveDir,
    RemoveAll,
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<MountCall>,
    mounted: HashSet<PathBuf>,
    failures: HashMap<MountOp, VecDeque<String>>,
}

impl FakeState {
    fn record(&mut self, op: MountOp, call: MountCall) -> io::Result<()> {
        self.calls.push(call);
        match self.failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(msg) => Err(io::Error::other(msg)),
            None => Ok(()),
        }
    }
}

/// In-memory [`Mounter`] that records calls and never touches the host.
#[derive(Debug, Default)]
pub struct FakeMounter {
    state: Mutex<FakeState>,
}

impl FakeMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `op` call fail with `message`.
    pub fn fail_next(&self, op: MountOp, message: impl Into<String>) {
        self.state
            .lock()
            .failures
            .entry(op)
            .or_default()
            .push_back(message.into());
    }

    pub fn calls(&self) -> Vec<MountCall> {
        self.state.lock().calls.clone()
    }

    /// Paths currently mounted.
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.state.lock().mounted.iter().cloned().collect()
    }
}

impl Mounter for FakeMounter {
    fn make_dir(&self, path: &Path) -> io::Result<()> {
        self.state
            .lock()
            .record(MountOp::MakeDir, MountCall::MakeDir(path.to_path_buf()))
    }

    fn mount(
        &self,
        source: &str,
        target: &Path,
        fs_type: &str,
        options: &[String],
    ) -> io::Result<()> {
        let mut state = self.state.lock();
        state.record(
            MountOp::Mount,
            MountCall::Mount {
                source: source.to_string(),
                target: target.to_path_buf(),
                fs_type: fs_type.to_string(),
                options: options.to_vec(),
            },
        )?;
        state.mounted.insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        state.record(MountOp::Unmount, MountCall::Unmount(target.to_path_buf()))?;
        state.mounted.remove(target);
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> io::Result<()> {
        let mut state = self.state.lock();
        state.record(MountOp::RemoveDir, MountCall::RemoveDir(path.to_path_buf()))?;
        if state.mounted.contains(path) {
            return Err(io::Error::other("device or resource busy"));
        }
        Ok(())
    }

    fn remove_all(&self, path: &Path) -> io::Result<()> {
        self.state
            .lock()
            .record(MountOp::RemoveAll, MountCall::RemoveAll(path.to_path_buf()))
    }
}
