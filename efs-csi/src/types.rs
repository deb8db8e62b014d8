//! Type-safe wrappers for CSI driver domain types.

use std::fmt;

use crate::error::Error;

/// Separator between the segments of an encoded [`VolumeId`].
pub const VOLUME_ID_DELIMITER: char = ':';

/// The opaque volume ID handed to the container orchestrator.
///
/// Encoded as `fileSystemId:subPath:accessPointId`. The sub path is empty
/// for every volume this driver creates, so a fresh ID reads
/// `fs-1234::fsap-5678`. The file system and access point IDs never contain
/// the delimiter; the sub path may, because decoding takes the first and
/// last segments and leaves everything in between to the sub path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeId {
    file_system_id: String,
    sub_path: String,
    access_point_id: String,
}

impl VolumeId {
    pub fn new(
        file_system_id: impl Into<String>,
        sub_path: impl Into<String>,
        access_point_id: impl Into<String>,
    ) -> Self {
        let file_system_id = file_system_id.into();
        let access_point_id = access_point_id.into();
        debug_assert!(
            !file_system_id.contains(VOLUME_ID_DELIMITER),
            "file system ID must not contain the delimiter"
        );
        debug_assert!(
            !access_point_id.contains(VOLUME_ID_DELIMITER),
            "access point ID must not contain the delimiter"
        );
        Self {
            file_system_id,
            sub_path: sub_path.into(),
            access_point_id,
        }
    }

    /// Decode a volume ID produced by [`VolumeId::encode`].
    ///
    /// Fails with [`Error::InvalidVolumeId`] when fewer than three segments
    /// are present or the file system ID is empty, and with
    /// [`Error::MissingAccessPoint`] when the ID is otherwise well formed but
    /// names no access point.
    pub fn decode(volume_id: &str) -> Result<Self, Error> {
        let invalid = |reason| Error::InvalidVolumeId {
            volume_id: volume_id.to_string(),
            reason,
        };

        let (file_system_id, rest) = volume_id
            .split_once(VOLUME_ID_DELIMITER)
            .ok_or_else(|| invalid("expected fileSystemId:subPath:accessPointId"))?;
        let (sub_path, access_point_id) = rest
            .rsplit_once(VOLUME_ID_DELIMITER)
            .ok_or_else(|| invalid("expected fileSystemId:subPath:accessPointId"))?;

        if file_system_id.is_empty() {
            return Err(invalid("file system ID is empty"));
        }
        if access_point_id.is_empty() {
            return Err(Error::MissingAccessPoint {
                volume_id: volume_id.to_string(),
            });
        }

        Ok(Self {
            file_system_id: file_system_id.to_string(),
            sub_path: sub_path.to_string(),
            access_point_id: access_point_id.to_string(),
        })
    }

    pub fn encode(&self) -> String {
        self.to_string()
    }

    pub fn file_system_id(&self) -> &str {
        &self.file_system_id
    }

    pub fn sub_path(&self) -> &str {
        &self.sub_path
    }

    pub fn access_point_id(&self) -> &str {
        &self.access_point_id
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{VOLUME_ID_DELIMITER}{}{VOLUME_ID_DELIMITER}{}",
            self.file_system_id, self.sub_path, self.access_point_id
        )
    }
}
