//! On-disk home for machine descriptors and their key pairs.
//!
//! ```text
//! <root>/machines/<name>/config.json
//! <root>/machines/<name>/id_rsa
//! <root>/machines/<name>/id_rsa.pub
//! ```

use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::types::InstanceDescriptor;
use crate::{Error, Result};

const CONFIG_FILE: &str = "config.json";
const KEY_FILE: &str = "id_rsa";

pub struct MachineStore {
    root: PathBuf,
}

impl MachineStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `~/.aliyun-machine`
    pub fn default_root() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".aliyun-machine"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn machine_dir(&self, name: &str) -> PathBuf {
        self.root.join("machines").join(name)
    }

    pub fn key_path(&self, name: &str) -> PathBuf {
        self.machine_dir(name).join(KEY_FILE)
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.machine_dir(name).join(CONFIG_FILE)
    }

    fn check_name(&self, name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !name.starts_with('.');
        if valid {
            return Ok(());
        }
        Err(Error::Store {
            path: self.machine_dir(name),
            source: io::Error::new(io::ErrorKind::InvalidInput, "invalid machine name"),
        })
    }

    /// The stored descriptor, or `None` if the machine is unknown.
    pub async fn load(&self, name: &str) -> Result<Option<InstanceDescriptor>> {
        self.check_name(name)?;
        let path = self.config_path(name);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(Error::Store { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| Error::StoreFormat { path, source })
    }

    /// Write the descriptor atomically (temp file, then rename).
    pub async fn save(&self, descriptor: &InstanceDescriptor) -> Result<()> {
        self.check_name(&descriptor.name)?;
        let dir = self.machine_dir(&descriptor.name);
        let store_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| Error::Store { path, source }
        };

        tokio::fs::create_dir_all(&dir).await.map_err(store_err(&dir))?;

        let path = dir.join(CONFIG_FILE);
        let tmp = dir.join(format!("{CONFIG_FILE}.tmp"));
        let json = serde_json::to_vec_pretty(descriptor).map_err(|source| Error::StoreFormat {
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&tmp, json).await.map_err(store_err(&tmp))?;

        // The descriptor carries the root password.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(store_err(&tmp))?;
        }

        tokio::fs::rename(&tmp, &path).await.map_err(store_err(&path))?;
        debug!(path = %path.display(), "descriptor saved");
        Ok(())
    }

    /// Forget a machine, key pair included. Unknown machines are fine.
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.check_name(name)?;
        let dir = self.machine_dir(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(Error::Store { path: dir, source }),
        }
    }
}
