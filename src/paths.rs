use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "config.yaml";
pub const USER_SECRETS_FILE_NAME: &str = "secrets.local.yaml";
pub const LEGACY_SECRETS_FILE_NAME: &str = "secrets.yaml";

/// Best-effort home directory resolution.
///
/// We prefer `dirs::home_dir()`, but that can return `None` in some service/test
/// environments. In those cases, fall back to common environment variables.
pub fn user_home_dir() -> Option<PathBuf> {
    dirs::home_dir()
        .or_else(|| std::env::var_os("HOME").map(PathBuf::from))
        .or_else(|| std::env::var_os("USERPROFILE").map(PathBuf::from))
}

/// Return the default `.aifabrix` directory.
///
/// If the user's home directory can't be resolved, we fall back to an absolute
/// temp directory to avoid writing into the current working directory.
pub fn default_aifabrix_dir(home: Option<&Path>) -> PathBuf {
    match home {
        Some(home) => home.join(".aifabrix"),
        None => std::env::temp_dir().join("aifabrix-no-home"),
    }
}

/// Resolve the config file location.
///
/// Order: explicit file path, then `<override_dir>/config.yaml`, then
/// `<home>/.aifabrix/config.yaml`.
pub fn resolve_config_path(
    explicit: Option<&Path>,
    override_dir: Option<&Path>,
    home: Option<&Path>,
) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(dir) = override_dir {
        return dir.join(CONFIG_FILE_NAME);
    }
    default_aifabrix_dir(home).join(CONFIG_FILE_NAME)
}

fn env_path_override(var: &str) -> Option<PathBuf> {
    let value = std::env::var(var).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(PathBuf::from(trimmed))
}

/// Filesystem layout of a local install.
#[derive(Debug, Clone)]
pub struct AifabrixPaths {
    pub root_dir: PathBuf,
    pub config_path: PathBuf,
}

impl AifabrixPaths {
    /// Resolve from `AIFABRIX_CONFIG` / `AIFABRIX_HOME`, falling back to `~/.aifabrix`.
    pub fn discover() -> Self {
        let explicit = env_path_override("AIFABRIX_CONFIG");
        let home_override = env_path_override("AIFABRIX_HOME");
        let home = user_home_dir();

        let config_path =
            resolve_config_path(explicit.as_deref(), home_override.as_deref(), home.as_deref());
        let root_dir = match home_override {
            Some(dir) => dir,
            None => default_aifabrix_dir(home.as_deref()),
        };
        Self {
            root_dir,
            config_path,
        }
    }

    /// Layout rooted at `root_dir`, used by tests and embedders.
    pub fn under(root_dir: &Path) -> Self {
        Self {
            root_dir: root_dir.to_path_buf(),
            config_path: root_dir.join(CONFIG_FILE_NAME),
        }
    }

    pub fn config_dir(&self) -> &Path {
        self.config_path.parent().unwrap_or(self.root_dir.as_path())
    }

    pub fn user_secrets_path(&self) -> PathBuf {
        self.root_dir.join(USER_SECRETS_FILE_NAME)
    }

    pub fn legacy_secrets_path(&self) -> PathBuf {
        self.root_dir.join(LEGACY_SECRETS_FILE_NAME)
    }

    /// Absolute paths pass through; relative ones resolve against the config directory.
    pub fn resolve_relative(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw.trim());
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config_dir().join(path)
        }
    }

    /// Client certificate directory for a developer identity.
    pub fn cert_dir(&self, developer_id: &str) -> PathBuf {
        self.root_dir.join("certs").join(developer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::IsolatedHome;

    #[test]
    fn explicit_path_wins_over_override_dir_and_home() {
        let path = resolve_config_path(
            Some(Path::new("/tmp/custom.yaml")),
            Some(Path::new("/opt/aifabrix")),
            Some(Path::new("/home/dev")),
        );
        assert_eq!(path, PathBuf::from("/tmp/custom.yaml"));
    }

    #[test]
    fn override_dir_wins_over_home() {
        let path = resolve_config_path(
            None,
            Some(Path::new("/opt/aifabrix")),
            Some(Path::new("/home/dev")),
        );
        assert_eq!(path, PathBuf::from("/opt/aifabrix/config.yaml"));
    }

    #[test]
    fn home_default_is_dot_aifabrix() {
        let path = resolve_config_path(None, None, Some(Path::new("/home/dev")));
        assert_eq!(path, PathBuf::from("/home/dev/.aifabrix/config.yaml"));
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let paths = AifabrixPaths::under(Path::new("/home/dev/.aifabrix"));
        assert_eq!(
            paths.resolve_relative(" team/secrets.yaml "),
            PathBuf::from("/home/dev/.aifabrix/team/secrets.yaml")
        );
        assert_eq!(
            paths.resolve_relative("/srv/shared.yaml"),
            PathBuf::from("/srv/shared.yaml")
        );
    }

    #[test]
    fn discover_honors_home_override() {
        let home = IsolatedHome::new();

        let paths = AifabrixPaths::discover();
        assert_eq!(paths.root_dir, home.path());
        assert_eq!(paths.config_path, home.path().join("config.yaml"));
        assert_eq!(
            paths.user_secrets_path(),
            home.path().join("secrets.local.yaml")
        );
        assert_eq!(paths.cert_dir("07"), home.path().join("certs").join("07"));
    }

    #[test]
    fn discover_prefers_explicit_config_file() {
        let scratch = tempfile::tempdir().unwrap();
        let explicit = scratch.path().join("alt").join("custom.yaml");
        let home = IsolatedHome::new().with_config_file(&explicit);

        let paths = AifabrixPaths::discover();
        assert_eq!(paths.config_path, explicit);
        assert_eq!(paths.root_dir, home.path());
        assert_eq!(paths.config_dir(), scratch.path().join("alt"));
    }
}
