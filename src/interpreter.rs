//! Interpreter kinds, named profiles and command resolution.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Environment variable overriding the Python executable.
pub const PYTHON_ENV: &str = "SCRIPT_RUNNER_PYTHON";

const VENV_DIRS: [&str; 3] = [".venv", "venv", "env"];
const SNIFF_BYTES: u64 = 512;

/// The interpreters the runner knows how to drive without a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interpreter {
    Python,
    Bash,
    #[serde(rename = "powershell")]
    PowerShell,
    Node,
}

impl Interpreter {
    pub const ALL: [Interpreter; 4] = [
        Interpreter::Python,
        Interpreter::Bash,
        Interpreter::PowerShell,
        Interpreter::Node,
    ];

    /// Built-in command template. Python is special-cased by
    /// [`resolve_python`] before this is consulted.
    pub fn default_command(self) -> ResolvedCommand {
        match self {
            Interpreter::Python => ResolvedCommand::new(default_python(), Vec::new()),
            Interpreter::Bash => ResolvedCommand::new("bash", Vec::new()),
            Interpreter::PowerShell => ResolvedCommand::new(
                "powershell",
                vec![
                    "-ExecutionPolicy".to_string(),
                    "Bypass".to_string(),
                    "-File".to_string(),
                ],
            ),
            Interpreter::Node => ResolvedCommand::new("node", Vec::new()),
        }
    }

    /// Map a file extension (with or without the dot) to an interpreter.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "py" | "pyw" => Some(Interpreter::Python),
            "sh" | "bash" => Some(Interpreter::Bash),
            "ps1" => Some(Interpreter::PowerShell),
            "js" | "mjs" | "cjs" => Some(Interpreter::Node),
            _ => None,
        }
    }

    /// Guess from a shebang or first line.
    fn from_first_line(line: &str) -> Option<Self> {
        let line = line.to_ascii_lowercase();
        if line.contains("python") {
            Some(Interpreter::Python)
        } else if line.contains("node") {
            Some(Interpreter::Node)
        } else if line.contains("pwsh") || line.contains("powershell") {
            Some(Interpreter::PowerShell)
        } else if line.starts_with("#!") && (line.contains("bash") || line.contains("sh")) {
            Some(Interpreter::Bash)
        } else {
            None
        }
    }
}

impl std::fmt::Display for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Interpreter::Python => write!(f, "python"),
            Interpreter::Bash => write!(f, "bash"),
            Interpreter::PowerShell => write!(f, "powershell"),
            Interpreter::Node => write!(f, "node"),
        }
    }
}

impl std::str::FromStr for Interpreter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "py" => Ok(Interpreter::Python),
            "bash" | "sh" => Ok(Interpreter::Bash),
            "powershell" | "pwsh" | "ps" => Ok(Interpreter::PowerShell),
            "node" | "nodejs" | "node.js" | "js" => Ok(Interpreter::Node),
            other => Err(format!(
                "unknown interpreter '{}' (expected python, bash, powershell or node)",
                other
            )),
        }
    }
}

/// A named (executable + default arguments) pairing, optionally tied to a
/// script extension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterProfile {
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default, alias = "arguments")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

impl InterpreterProfile {
    pub fn command(&self) -> ResolvedCommand {
        ResolvedCommand::new(self.command.clone(), self.args.clone())
    }

    /// Whether this profile is associated with `script`'s extension.
    pub fn matches_script(&self, script: &Path) -> bool {
        let Some(wanted) = self.extension.as_deref() else {
            return false;
        };
        script
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(wanted.trim_start_matches('.')))
    }
}

/// The program to spawn and the arguments placed before the script path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ResolvedCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Full argv: program, prefix args, script, user args.
    pub fn argv(&self, script: &Path, user_args: &[String]) -> Vec<String> {
        let mut argv = Vec::with_capacity(2 + self.args.len() + user_args.len());
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv.push(script.display().to_string());
        argv.extend(user_args.iter().cloned());
        argv
    }
}

impl std::fmt::Display for ResolvedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = vec![self.program.as_str()];
        parts.extend(self.args.iter().map(String::as_str));
        write!(f, "{}", shell_words::join(parts))
    }
}

/// Detect the interpreter for a script from its extension, falling back to
/// sniffing the first line.
pub fn detect(script: &Path) -> Option<Interpreter> {
    if let Some(kind) = script
        .extension()
        .and_then(|e| e.to_str())
        .and_then(Interpreter::from_extension)
    {
        return Some(kind);
    }
    let mut head = Vec::new();
    File::open(script)
        .and_then(|f| f.take(SNIFF_BYTES).read_to_end(&mut head))
        .ok()?;
    let head = String::from_utf8_lossy(&head);
    head.lines().next().and_then(Interpreter::from_first_line)
}

/// Pick the Python executable, in order: a virtualenv above the script,
/// `SCRIPT_RUNNER_PYTHON`, the configured fallback, the platform default.
pub fn resolve_python(script: &Path, fallback: Option<&str>) -> ResolvedCommand {
    if let Some(venv) = locate_local_python(script) {
        return ResolvedCommand::new(venv.display().to_string(), Vec::new());
    }
    if let Some(env) = std::env::var(PYTHON_ENV).ok().filter(|v| !v.is_empty()) {
        return ResolvedCommand::new(env, Vec::new());
    }
    if let Some(fallback) = fallback.filter(|v| !v.is_empty()) {
        return ResolvedCommand::new(fallback, Vec::new());
    }
    Interpreter::Python.default_command()
}

/// Walk up from the script's directory looking for a virtualenv.
pub fn locate_local_python(script: &Path) -> Option<PathBuf> {
    let start = crate::paths::absolutize(script);
    let mut dir = start.parent();
    while let Some(current) = dir {
        for name in VENV_DIRS {
            let candidate = venv_python(&current.join(name));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        dir = current.parent();
    }
    None
}

fn venv_python(venv: &Path) -> PathBuf {
    if cfg!(windows) {
        venv.join("Scripts").join("python.exe")
    } else {
        venv.join("bin").join("python")
    }
}

fn default_python() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}
