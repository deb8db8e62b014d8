//! efs-csi: CSI controller for access-point backed file systems.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use efs_csi::config::parse_tags;
use efs_csi::{Config, Driver, InMemoryCloud, SystemMounter};

#[derive(Parser, Debug)]
#[command(name = "efs-csi")]
#[command(about = "CSI controller provisioning access points on a shared file system")]
struct Args {
    /// CSI endpoint (unix:// or tcp://).
    #[arg(long)]
    endpoint: Option<String>,

    /// TOML configuration file. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Space separated key:value tags added to every access point.
    #[arg(long)]
    tags: Option<String>,

    /// Remove an access point's root directory when deleting its volume.
    #[arg(long)]
    delete_access_point_root_dir: bool,

    /// Lowest gid handed out when a request names no range.
    #[arg(long)]
    gid_range_start: Option<u32>,

    /// Highest gid handed out when a request names no range.
    #[arg(long)]
    gid_range_end: Option<u32>,

    /// File system known to the in-process cloud. Repeatable.
    #[arg(long = "file-system")]
    file_systems: Vec<String>,

    /// Verbosity level (0-4).
    #[arg(short, default_value = "0")]
    v: u8,
}

impl Args {
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };

        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(tags) = &self.tags {
            config.tags.extend(parse_tags(tags)?);
        }
        if self.delete_access_point_root_dir {
            config.delete_access_point_root_dir = true;
        }
        if let Some(start) = self.gid_range_start {
            config.gid_range_start = start;
        }
        if let Some(end) = self.gid_range_end {
            config.gid_range_end = end;
        }
        config.file_systems.extend(self.file_systems);

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Use targeted filters to avoid verbose logs from dependencies (h2, tonic, hyper).
    let filter = match args.v {
        0 => "warn".to_string(),
        1 => "efs_csi=info,warn".to_string(),
        2 => "efs_csi=debug,warn".to_string(),
        3 => "efs_csi=trace,warn".to_string(),
        _ => "efs_csi=trace,info".to_string(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let config = args.into_config()?;

    let cloud = InMemoryCloud::new();
    for file_system_id in &config.file_systems {
        cloud.add_file_system(file_system_id.clone());
    }

    info!(
        name = %config.name,
        version = %config.version,
        endpoint = %config.endpoint,
        file_systems = config.file_systems.len(),
        delete_access_point_root_dir = config.delete_access_point_root_dir,
        "starting efs CSI controller"
    );

    let driver = Driver::new(config, Arc::new(cloud), Arc::new(SystemMounter))?;
    driver.run().await?;

    Ok(())
}
