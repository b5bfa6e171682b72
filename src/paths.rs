//! Per-user application directory layout.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

/// Environment variable overriding the application directory.
pub const HOME_ENV: &str = "SCRIPT_RUNNER_HOME";

const APP_DIR_NAME: &str = ".script_runner";
const CONFIG_FILE: &str = "config.json";
const LOG_DIR: &str = "logs";

/// Where config and logs live for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    root: PathBuf,
}

impl AppPaths {
    /// Use `root` as the application directory.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the application directory, in order:
    /// 1. `explicit` (the `--home` flag),
    /// 2. `SCRIPT_RUNNER_HOME`,
    /// 3. `~/.script_runner`,
    /// 4. `./.script_runner` when no home directory can be determined.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            return Self::at(path);
        }
        if let Some(path) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
            return Self::at(PathBuf::from(path));
        }
        match dirs::home_dir() {
            Some(home) => Self::at(home.join(APP_DIR_NAME)),
            None => {
                debug!("no home directory found, using working directory");
                Self::at(APP_DIR_NAME)
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    /// Create the application and log directories if missing.
    pub fn ensure(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.log_dir())
    }
}

/// Anchor a relative path at the current directory and drop `.` components.
/// Falls back to the path as given when the current directory is unknown.
pub fn absolutize(path: &Path) -> PathBuf {
    let anchored = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no current directory, keeping relative path");
                return path.to_path_buf();
            }
        }
    };
    anchored
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}
