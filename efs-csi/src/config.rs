//! Driver configuration.
//!
//! Settings come from an optional TOML file; command-line flags override
//! individual values in `main`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::allocator::{DEFAULT_GID_MAX, DEFAULT_GID_MIN, GidRange};
use crate::driver::{DRIVER_NAME, DRIVER_VERSION};
use crate::error::ConfigError;

/// Default CSI endpoint.
pub const DEFAULT_ENDPOINT: &str = "unix:///var/run/csi/csi.sock";
/// Where file systems are temporarily mounted to delete root directories.
pub const DEFAULT_TEMP_MOUNT_PATH_PREFIX: &str = "/var/lib/csi/pv";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip)]
    pub name: String,
    #[serde(skip)]
    pub version: String,
    pub endpoint: String,
    /// Extra tags applied to every access point.
    pub tags: BTreeMap<String, String>,
    /// Remove an access point's root directory before deleting it.
    pub delete_access_point_root_dir: bool,
    /// Default gid range when a request names none.
    pub gid_range_start: u32,
    pub gid_range_end: u32,
    pub temp_mount_path_prefix: PathBuf,
    /// Server-wide deadline for a single request. Unset means none.
    pub request_timeout_secs: Option<u64>,
    /// File systems known to the in-process cloud.
    pub file_systems: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: DRIVER_NAME.to_string(),
            version: DRIVER_VERSION.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            tags: BTreeMap::new(),
            delete_access_point_root_dir: false,
            gid_range_start: DEFAULT_GID_MIN,
            gid_range_end: DEFAULT_GID_MAX,
            temp_mount_path_prefix: PathBuf::from(DEFAULT_TEMP_MOUNT_PATH_PREFIX),
            request_timeout_secs: None,
            file_systems: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_gid_range()?;
        if !self.endpoint.starts_with("unix://") && !self.endpoint.starts_with("tcp://") {
            return Err(ConfigError::InvalidValue {
                field: "endpoint",
                reason: "must start with unix:// or tcp://",
            });
        }
        if !self.temp_mount_path_prefix.is_absolute() {
            return Err(ConfigError::InvalidValue {
                field: "temp_mount_path_prefix",
                reason: "must be an absolute path",
            });
        }
        if self.request_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "request_timeout_secs",
                reason: "must be > 0",
            });
        }
        Ok(())
    }

    pub fn default_gid_range(&self) -> Result<GidRange, ConfigError> {
        GidRange::new(self.gid_range_start, self.gid_range_end).map_err(|_| {
            ConfigError::InvalidValue {
                field: "gid_range_start",
                reason: "must be > 0 and less than gid_range_end",
            }
        })
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Parse space separated `key:value` pairs, e.g. `"env:prod team:storage"`.
///
/// The value may contain further colons; the key may not be empty.
pub fn parse_tags(input: &str) -> Result<BTreeMap<String, String>, ConfigError> {
    input
        .split_whitespace()
        .map(|pair| match pair.split_once(':') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(ConfigError::InvalidTag {
                tag: pair.to_string(),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.default_gid_range().unwrap(), GidRange::DEFAULT);
        assert_eq!(config.name, "efs.csi.aws.com");
        assert_eq!(config.request_timeout(), None);
    }

    #[test]
    fn toml_overrides_defaults() {
        let config = Config::from_toml(
            r#"
            endpoint = "tcp://127.0.0.1:10000"
            delete_access_point_root_dir = true
            gid_range_start = 1000
            gid_range_end = 2000
            request_timeout_secs = 30
            file_systems = ["fs-1", "fs-2"]

            [tags]
            env = "prod"
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint, "tcp://127.0.0.1:10000");
        assert!(config.delete_access_point_root_dir);
        assert_eq!(
            config.default_gid_range().unwrap(),
            GidRange::new(1000, 2000).unwrap()
        );
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.file_systems, vec!["fs-1", "fs-2"]);
        assert_eq!(config.tags.get("env").map(String::as_str), Some("prod"));
        assert_eq!(config.name, DRIVER_NAME);
        assert_eq!(config.temp_mount_path_prefix, Path::new("/var/lib/csi/pv"));
    }

    #[test]
    fn invalid_gid_range_rejected() {
        let result = Config::from_toml("gid_range_start = 10\ngid_range_end = 5\n");
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn invalid_endpoint_rejected() {
        let config = Config {
            endpoint: "http://localhost".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "endpoint",
                ..
            })
        ));
    }

    #[test]
    fn malformed_toml_rejected() {
        assert!(matches!(
            Config::from_toml("endpoint = "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn parse_tags_accepts_pairs() {
        let tags = parse_tags("env:prod  team:storage url:http://x").unwrap();
        assert_eq!(tags.len(), 3);
        assert_eq!(tags["env"], "prod");
        assert_eq!(tags["url"], "http://x");
        assert!(parse_tags("").unwrap().is_empty());
    }

    #[test]
    fn parse_tags_rejects_malformed() {
        assert!(matches!(
            parse_tags("env:prod broken"),
            Err(ConfigError::InvalidTag { tag }) if tag == "broken"
        ));
        assert!(parse_tags(":value").is_err());
    }
}
