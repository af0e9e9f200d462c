use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tempfile::TempDir;

static ENV_LOCK: Mutex<()> = Mutex::new(());

const LOCATION_VARS: [&str; 2] = ["AIFABRIX_HOME", "AIFABRIX_CONFIG"];

/// Points `AIFABRIX_HOME` at a fresh temp dir and clears `AIFABRIX_CONFIG`
/// for the lifetime of the guard. Holds a process-wide lock so location
/// lookups in parallel tests never see each other's overrides.
pub struct IsolatedHome {
    dir: TempDir,
    saved: Vec<(&'static str, Option<OsString>)>,
    _lock: MutexGuard<'static, ()>,
}

impl IsolatedHome {
    pub fn new() -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let saved = LOCATION_VARS
            .iter()
            .map(|var| (*var, std::env::var_os(var)))
            .collect();
        std::env::set_var("AIFABRIX_HOME", dir.path());
        std::env::remove_var("AIFABRIX_CONFIG");
        Self {
            dir,
            saved,
            _lock: lock,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Override `AIFABRIX_CONFIG` until the guard drops.
    pub fn with_config_file(self, path: &Path) -> Self {
        std::env::set_var("AIFABRIX_CONFIG", path);
        self
    }
}

impl Drop for IsolatedHome {
    fn drop(&mut self) {
        for (var, old) in &self.saved {
            match old {
                Some(value) => std::env::set_var(var, value),
                None => std::env::remove_var(var),
            }
        }
    }
}

/// Write a YAML secrets file under `dir` and return its path.
pub fn write_secrets_file(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}
