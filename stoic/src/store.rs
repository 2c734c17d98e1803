//! Content-addressed storage for uploaded plugin code.
//!
//! Layout: `<root>/plugin-by-sha/<sha>/<name>`. Storing a hash again wipes
//! its directory first, so the store always reflects the latest upload.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result};

const STOIC_DIR: &str = "stoic";
const PLUGINS_DIR: &str = "plugin-by-sha";
/// File name used when an upload carries no plugin name.
const UNNAMED_PLUGIN: &str = "plugin";

/// Plugin code keyed by content hash, shared by every session of a server.
#[derive(Debug)]
pub struct PluginStore {
    root: PathBuf,
    /// Per-hash locks serializing wipe-and-rewrite of one directory.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PluginStore {
    /// Opens (or creates) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(PLUGINS_DIR))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Opens the default store: `$STOIC_HOME` or `<platform_data_dir>/stoic`.
    pub fn open_default() -> Result<Self> {
        let root = if let Ok(home) = std::env::var("STOIC_HOME") {
            PathBuf::from(home)
        } else {
            dirs::data_local_dir()
                .ok_or_else(|| Error::Config("cannot determine platform data directory".into()))?
                .join(STOIC_DIR)
        };
        Self::open(root)
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the artifact for `(name, sha)`.
    ///
    /// Both parts must be plain path components.
    pub fn path(&self, name: Option<&str>, sha: &str) -> Result<PathBuf> {
        let name = name.unwrap_or(UNNAMED_PLUGIN);
        check_component("plugin sha", sha)?;
        check_component("plugin name", name)?;
        Ok(self.sha_dir(sha).join(name))
    }

    /// Returns `true` if code for `(name, sha)` has been stored.
    pub fn exists(&self, name: Option<&str>, sha: &str) -> bool {
        self.path(name, sha).is_ok_and(|p| p.is_file())
    }

    /// Stores `bytes` as the code for `(name, sha)` and seals it read-only.
    ///
    /// Anything previously stored under `sha` is removed first.
    pub fn store(&self, name: Option<&str>, sha: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path(name, sha)?;
        let lock = self.lock_for(sha);
        let written = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.rewrite(sha, &path, bytes)
        };
        self.release_lock(sha, lock);
        written.map(|()| path)
    }

    fn rewrite(&self, sha: &str, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = self.sha_dir(sha);
        if dir.exists() {
            debug!(sha, "replacing stored plugin");
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        fs::write(path, bytes)?;
        seal(path)
    }

    fn sha_dir(&self, sha: &str) -> PathBuf {
        self.root.join(PLUGINS_DIR).join(sha)
    }

    fn lock_for(&self, sha: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(sha.to_owned()).or_default())
    }

    /// Drops the lock for `sha` once no other upload holds or waits on it.
    fn release_lock(&self, sha: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        if locks.get(sha).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(sha);
        }
    }
}

/// Lowercase hex SHA-256 of `bytes`, the hash format used as a store key.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Rejects anything that would escape or alias a store directory.
fn check_component(what: &str, value: &str) -> Result<()> {
    let bad = value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0']);
    if bad {
        return Err(Error::InvalidIdentity(format!("{what} {value:?}")));
    }
    Ok(())
}

/// Marks a stored artifact non-writable; on Unix it stays executable.
#[cfg(unix)]
fn seal(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o555))?;
    Ok(())
}

#[cfg(not(unix))]
fn seal(path: &Path) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)?;
    Ok(())
}
