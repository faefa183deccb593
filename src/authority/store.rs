//! Two-file durable store for the CA root.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{Error, Result};

/// Root private key file name.
pub const KEY_FILE: &str = "ca-key.pem";
/// Root certificate file name.
pub const CERT_FILE: &str = "ca-cert.pem";

/// Root material as stored on disk.
#[derive(Clone, PartialEq, Eq)]
pub struct StoredRoot {
    /// PKCS#8 PEM private key.
    pub key_pem: String,
    /// PEM certificate, byte-exact.
    pub cert_pem: String,
}

impl std::fmt::Debug for StoredRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredRoot")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

/// A directory holding `ca-key.pem` and `ca-cert.pem`.
#[derive(Debug, Clone)]
pub struct CaStore {
    dir: PathBuf,
}

impl CaStore {
    /// A store rooted at `dir`. Nothing is touched until load/save.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load the root if both files exist.
    ///
    /// # Errors
    ///
    /// `Error::Config` when exactly one of the files exists (a corrupted
    /// store is never repaired by regeneration), `Error::Io` on read errors.
    pub fn load(&self) -> Result<Option<StoredRoot>> {
        let key_path = self.dir.join(KEY_FILE);
        let cert_path = self.dir.join(CERT_FILE);

        match (key_path.exists(), cert_path.exists()) {
            (false, false) => {
                debug!(dir = %self.dir.display(), "CA store is empty");
                Ok(None)
            }
            (true, true) => Ok(Some(StoredRoot {
                key_pem: fs::read_to_string(&key_path)?,
                cert_pem: fs::read_to_string(&cert_path)?,
            })),
            (key, _) => {
                let (present, missing) = if key {
                    (KEY_FILE, CERT_FILE)
                } else {
                    (CERT_FILE, KEY_FILE)
                };
                Err(Error::Config(format!(
                    "Corrupted CA store at '{}': {present} exists but {missing} is missing",
                    self.dir.display()
                )))
            }
        }
    }

    /// Persist the root, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// `Error::Io` if the directory or files cannot be written.
    pub fn save(&self, root: &StoredRoot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let key_path = self.dir.join(KEY_FILE);
        fs::write(&key_path, &root.key_pem)?;
        restrict_permissions(&key_path)?;
        fs::write(self.dir.join(CERT_FILE), &root.cert_pem)?;
        info!(dir = %self.dir.display(), "Persisted CA root");
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
