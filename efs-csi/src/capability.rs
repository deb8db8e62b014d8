//! Volume capability checks.

use crate::csi;
use crate::csi::volume_capability::access_mode::Mode;
use crate::error::{Error, Result};

/// Access modes a shared file system can serve.
pub const SUPPORTED_ACCESS_MODES: [Mode; 5] = [
    Mode::SingleNodeWriter,
    Mode::SingleNodeReaderOnly,
    Mode::MultiNodeReaderOnly,
    Mode::MultiNodeSingleWriter,
    Mode::MultiNodeMultiWriter,
];

/// Whether `cap` requests a supported access mode. A missing or unknown
/// mode is unsupported.
pub fn is_supported(cap: &csi::VolumeCapability) -> bool {
    let Some(access_mode) = &cap.access_mode else {
        return false;
    };
    Mode::try_from(access_mode.mode).is_ok_and(|mode| SUPPORTED_ACCESS_MODES.contains(&mode))
}

/// Require at least one capability, all of them supported.
pub fn validate_volume_capabilities(caps: &[csi::VolumeCapability]) -> Result<()> {
    if caps.is_empty() {
        return Err(Error::MissingCapabilities);
    }
    if !caps.iter().all(is_supported) {
        return Err(Error::UnsupportedCapabilities);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn capability(mode: Mode) -> csi::VolumeCapability {
    csi::VolumeCapability {
        access_type: Some(csi::volume_capability::AccessType::Mount(
            csi::volume_capability::MountVolume::default(),
        )),
        access_mode: Some(csi::volume_capability::AccessMode { mode: mode.into() }),
    }
}
