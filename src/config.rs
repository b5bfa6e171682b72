//! JSON config document: theme, interpreter profiles, classification
//! policy and run history.
//!
//! Loading never fails: a missing file gives defaults, and so does a file
//! that cannot be parsed. Unknown keys are carried through to the next save.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classify::ClassificationPolicy;
use crate::error::{MalformedConfigError, PersistenceError};
use crate::history::{History, DEFAULT_HISTORY_LIMIT};
use crate::interpreter::InterpreterProfile;

/// Number of distinct arguments remembered for suggestions.
pub const ARGUMENT_SUGGESTION_LIMIT: usize = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

impl From<String> for Theme {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "light" => Theme::Light,
            _ => Theme::Dark,
        }
    }
}

impl From<Theme> for String {
    fn from(theme: Theme) -> Self {
        theme.to_string()
    }
}

impl std::fmt::Display for Theme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Theme::Dark => write!(f, "dark"),
            Theme::Light => write!(f, "light"),
        }
    }
}

impl std::str::FromStr for Theme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dark" => Ok(Theme::Dark),
            "light" => Ok(Theme::Light),
            other => Err(other.to_string()),
        }
    }
}

/// Root config document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub theme: Theme,
    #[serde(alias = "interpreter_profiles")]
    pub profiles: Vec<InterpreterProfile>,
    /// Profile used when a run names neither a profile nor an interpreter.
    #[serde(alias = "active_profile", skip_serializing_if = "Option::is_none")]
    pub active_profile: Option<String>,
    /// Python executable used instead of the platform default.
    #[serde(alias = "fallback_python", skip_serializing_if = "Option::is_none")]
    pub fallback_python: Option<String>,
    pub classification: ClassificationPolicy,
    pub history_limit: usize,
    #[serde(alias = "argument_suggestions")]
    pub argument_suggestions: Vec<String>,
    pub history: History,
    /// Keys this version does not know about, written back unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            theme: Theme::Dark,
            profiles: Vec::new(),
            active_profile: None,
            fallback_python: None,
            classification: ClassificationPolicy::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            argument_suggestions: Vec::new(),
            history: History::default(),
            extra: serde_json::Map::new(),
        }
    }
}

impl Config {
    pub fn profile(&self, name: &str) -> Option<&InterpreterProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    /// Insert or replace (by name). Returns true when it replaced one.
    pub fn upsert_profile(&mut self, profile: InterpreterProfile) -> bool {
        match self.profiles.iter_mut().find(|p| p.name == profile.name) {
            Some(existing) => {
                *existing = profile;
                true
            }
            None => {
                self.profiles.push(profile);
                false
            }
        }
    }

    /// Remove a profile by name; clears the active profile if it pointed at
    /// it.
    pub fn remove_profile(&mut self, name: &str) -> Option<InterpreterProfile> {
        let index = self.profiles.iter().position(|p| p.name == name)?;
        if self.active_profile.as_deref() == Some(name) {
            self.active_profile = None;
        }
        Some(self.profiles.remove(index))
    }

    /// Remember arguments for completion, newest last, bounded.
    pub fn remember_arguments(&mut self, args: &[String]) {
        for arg in args.iter().filter(|a| !a.is_empty()) {
            self.argument_suggestions.retain(|a| a != arg);
            self.argument_suggestions.push(arg.clone());
        }
        let len = self.argument_suggestions.len();
        if len > ARGUMENT_SUGGESTION_LIMIT {
            self.argument_suggestions.drain(..len - ARGUMENT_SUGGESTION_LIMIT);
        }
    }
}

/// Reads and writes the config file at a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config, falling back to defaults when the file is missing,
    /// unreadable or malformed.
    pub fn load(&self) -> Config {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no config file, using defaults");
                return Config::default();
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "config file unreadable, using defaults");
                return Config::default();
            }
        };
        match self.parse(&content) {
            Ok(config) => {
                info!(
                    path = %self.path.display(),
                    profiles = config.profiles.len(),
                    history = config.history.len(),
                    "loaded config"
                );
                config
            }
            Err(e) => {
                warn!(error = %e, "using default config");
                Config::default()
            }
        }
    }

    fn parse(&self, content: &str) -> Result<Config, MalformedConfigError> {
        serde_json::from_str(content).map_err(|source| MalformedConfigError {
            path: self.path.clone(),
            source,
        })
    }

    /// Serialize and replace the config file. The document is written to a
    /// sibling temp file first and renamed over the target.
    pub fn save(&self, config: &Config) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| PersistenceError::write(parent, e))?;
        }
        let mut json = serde_json::to_string_pretty(config)?;
        json.push('\n');

        let tmp = self.path.with_extension("json.tmp");
        if let Err(e) = std::fs::write(&tmp, json) {
            let _ = std::fs::remove_file(&tmp);
            return Err(PersistenceError::write(&tmp, e));
        }
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(PersistenceError::write(&self.path, e));
        }
        debug!(path = %self.path.display(), "saved config");
        Ok(())
    }
}
