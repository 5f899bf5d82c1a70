//! Volume mounter for the local driver (spec §4.9 step c, §6's
//! `<volumeRoot>/volumes/<volumeID>/` layout).
//!
//! Unlike secrets, volumes are plain host-path directories: no tmpfs, no
//! cleanup on container stop (spec §4.9 shutdown: "leave volume directories
//! intact").

use std::path::PathBuf;

use warren_proto::pb::{Volume, VolumeDriver};
use warren_proto::WarrenError;

pub struct VolumeMounter {
    root: PathBuf,
}

impl VolumeMounter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Ensures the host-path directory for `volume` exists, creating it on
    /// first use for this host. Returns the absolute host path to bind-mount.
    pub fn materialize(&self, volume: &Volume) -> Result<PathBuf, WarrenError> {
        if volume.driver != VolumeDriver::Local as i32 {
            return Err(WarrenError::InvalidArgument(format!(
                "volume {} uses an unsupported driver",
                volume.name
            )));
        }
        let path = self.root.join("volumes").join(&volume.id);
        std::fs::create_dir_all(&path)
            .map_err(|e| WarrenError::internal(format!("materialize volume {}: {e}", volume.name)))?;
        Ok(path)
    }
}
