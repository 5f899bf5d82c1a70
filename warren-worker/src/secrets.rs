//! Per-container secret mounter (spec §4.9 step b, §6's
//! `/run/secrets/<containerID>/<secretName>` layout).
//!
//! Grounded on the teacher's use of `nix::mount` for tmpfs/bind mounts
//! (`container/src/node/main.rs`, `container/src/runtime/child.rs`): mount a
//! fresh tmpfs per container so secret plaintext never touches disk, write
//! files with 0400, and roll back the whole directory on any failure.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount, MsFlags};
use tracing::warn;

use warren_proto::WarrenError;

pub struct SecretMounter {
    root: PathBuf,
}

impl SecretMounter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn container_dir(&self, container_id: &str) -> PathBuf {
        self.root.join(container_id)
    }

    /// Mounts a tmpfs at `/run/secrets/<containerID>` and writes one 0400
    /// file per `(name, plaintext)` pair. On any failure, unmounts and
    /// removes whatever was created so no partial secret is left behind.
    pub fn mount(&self, container_id: &str, secrets: &[(String, Vec<u8>)]) -> Result<PathBuf, WarrenError> {
        let dir = self.container_dir(container_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| WarrenError::internal(format!("create secret mount dir: {e}")))?;

        if let Err(e) = mount(
            Some("tmpfs"),
            &dir,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=0700,size=1m"),
        ) {
            let _ = std::fs::remove_dir(&dir);
            return Err(WarrenError::internal(format!("mount tmpfs for secrets: {e}")));
        }

        for (name, plaintext) in secrets {
            if let Err(e) = write_secret_file(&dir, name, plaintext) {
                self.unmount(container_id);
                return Err(e);
            }
        }
        Ok(dir)
    }

    /// Unmounts the tmpfs (which drops every secret page) and removes the
    /// now-empty directory. Called on shutdown and on mount failure.
    pub fn unmount(&self, container_id: &str) {
        let dir = self.container_dir(container_id);
        if let Err(e) = umount(&dir) {
            warn!(container_id, error = %e, "failed to unmount secret tmpfs");
        }
        if let Err(e) = std::fs::remove_dir(&dir) {
            warn!(container_id, error = %e, "failed to remove secret mount dir");
        }
    }
}

fn write_secret_file(dir: &Path, name: &str, plaintext: &[u8]) -> Result<(), WarrenError> {
    let path = dir.join(name);
    std::fs::write(&path, plaintext).map_err(|e| WarrenError::internal(format!("write secret {name}: {e}")))?;
    let mut perms = std::fs::metadata(&path)
        .map_err(|e| WarrenError::internal(format!("stat secret {name}: {e}")))?
        .permissions();
    perms.set_mode(0o400);
    std::fs::set_permissions(&path, perms)
        .map_err(|e| WarrenError::internal(format!("chmod secret {name}: {e}")))?;
    Ok(())
}
