use std::io::{BufRead, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use uuid::Uuid;

use scriptrunner::classify::Classification;
use scriptrunner::config::Theme;
use scriptrunner::history::RunRecord;
use scriptrunner::interpreter::{Interpreter, InterpreterProfile};
use scriptrunner::logwriter::{self, LogCategory};
use scriptrunner::paths::{AppPaths, HOME_ENV};
use scriptrunner::runner::LogLine;
use scriptrunner::{AppEvent, RunRequest, Session};

#[derive(Parser)]
#[command(
    name = "scriptrunner",
    about = "Launch Python, Bash, PowerShell and Node.js scripts and watch their output live",
    version,
    long_about = None
)]
struct Cli {
    /// Application directory (config.json and logs/)
    #[arg(long, global = true, env = HOME_ENV)]
    home: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script and stream its output
    Run {
        /// Script to run
        script: PathBuf,

        /// Interpreter: python, bash, powershell or node
        #[arg(long, conflicts_with = "profile")]
        interpreter: Option<Interpreter>,

        /// Named interpreter profile
        #[arg(long)]
        profile: Option<String>,

        /// Forward this terminal's stdin to the script
        #[arg(long)]
        stdin: bool,

        /// Arguments passed to the script (after `--`)
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Run a history entry again with the same command and arguments
    Rerun {
        /// History entry id
        id: Uuid,
    },

    /// Inspect and edit run history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Manage interpreter profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },

    /// Browse and clean up run logs
    Logs {
        #[command(subcommand)]
        action: LogsAction,
    },

    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// List runs, oldest first
    List {
        /// Only runs whose script path or arguments contain this text
        #[arg(long)]
        query: Option<String>,
    },

    /// Show one run
    Show { id: Uuid },

    /// Remove one run
    Remove {
        id: Uuid,

        /// Delete the run's log file too
        #[arg(long)]
        delete_log: bool,
    },

    /// Remove every run (log files are kept)
    Clear,
}

#[derive(Subcommand)]
enum ProfileAction {
    /// List profiles
    List,

    /// Add or replace a profile
    Add {
        /// Profile name
        #[arg(long)]
        name: String,

        /// Executable (path or name on PATH)
        #[arg(long)]
        command: String,

        /// Arguments placed before the script, shell-quoted
        #[arg(long, allow_hyphen_values = true)]
        args: Option<String>,

        /// Use this profile by default for scripts with this extension
        #[arg(long)]
        extension: Option<String>,
    },

    /// Remove a profile
    Remove { name: String },

    /// Make a profile the default (no name clears it)
    Use { name: Option<String> },
}

#[derive(Subcommand)]
enum LogsAction {
    /// List log files, newest first
    List {
        /// error, warning, success or other
        #[arg(long)]
        filter: Option<LogCategory>,
    },

    /// Delete one log file
    Delete { path: PathBuf },

    /// Delete every log file
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the current config
    Show,

    /// Set the color theme (dark or light)
    Theme { theme: String },

    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr so script output on stdout stays clean.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    let paths = AppPaths::resolve(cli.home.as_deref());
    let mut session = Session::open(paths);
    let json = cli.json;

    match cli.command {
        Commands::Run {
            script,
            interpreter,
            profile,
            stdin,
            args,
        } => {
            let mut req = RunRequest::new(script).args(args).stdin(stdin);
            if let Some(kind) = interpreter {
                req = req.interpreter(kind);
            }
            if let Some(name) = profile {
                req = req.profile(name);
            }
            return run_to_completion(&mut session, req, json).await;
        }
        Commands::Rerun { id } => {
            let req = session.rerun_request(id)?;
            return run_to_completion(&mut session, req, json).await;
        }
        Commands::History { action } => match action {
            HistoryAction::List { query } => {
                let records = session.history().search(query.as_deref().unwrap_or(""));
                if json {
                    println!("{}", serde_json::to_string_pretty(&records)?);
                } else if records.is_empty() {
                    println!("No runs found.");
                } else {
                    println!("{:<36} | {:<19} | {:>4} | Script", "Id", "Started", "Exit");
                    println!("{:-<36}-|-{:-<19}-|-{:->4}-|-{:-<30}", "", "", "", "");
                    for record in records {
                        println!(
                            "{:<36} | {:<19} | {:>4} | {}",
                            record.id,
                            record.start.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
                            status_cell(record),
                            record.script.display()
                        );
                    }
                }
            }
            HistoryAction::Show { id } => {
                let record = session
                    .history()
                    .get(id)
                    .with_context(|| format!("no history entry with id {}", id))?;
                if json {
                    println!("{}", serde_json::to_string_pretty(record)?);
                } else {
                    print_record(record);
                }
            }
            HistoryAction::Remove { id, delete_log } => {
                let removed = session.remove_history(id, delete_log)?;
                println!("Removed run of {}.", removed.script.display());
            }
            HistoryAction::Clear => {
                let count = session.clear_history()?;
                println!("Removed {} run(s).", count);
            }
        },
        Commands::Profile { action } => match action {
            ProfileAction::List => {
                let config = session.config();
                if json {
                    println!("{}", serde_json::to_string_pretty(&config.profiles)?);
                } else if config.profiles.is_empty() {
                    println!("No profiles defined.");
                } else {
                    println!("{:<1} {:<16} | {:<10} | Command", "", "Name", "Extension");
                    println!("{:-<18}-|-{:-<10}-|-{:-<30}", "", "", "");
                    for profile in &config.profiles {
                        let active = config.active_profile.as_deref() == Some(profile.name.as_str());
                        println!(
                            "{:<1} {:<16} | {:<10} | {}",
                            if active { "*" } else { "" },
                            profile.name,
                            profile.extension.as_deref().unwrap_or("-"),
                            profile.command()
                        );
                    }
                }
            }
            ProfileAction::Add {
                name,
                command,
                args,
                extension,
            } => {
                let args = match args.as_deref() {
                    Some(raw) => shell_words::split(raw).context("could not parse --args")?,
                    None => Vec::new(),
                };
                session.upsert_profile(InterpreterProfile {
                    name: name.clone(),
                    command,
                    args,
                    extension,
                })?;
                println!("Profile '{}' saved.", name);
            }
            ProfileAction::Remove { name } => match session.remove_profile(&name)? {
                Some(_) => println!("Profile '{}' removed.", name),
                None => anyhow::bail!("profile '{}' does not exist", name),
            },
            ProfileAction::Use { name } => {
                session.set_active_profile(name.as_deref())?;
                match name {
                    Some(name) => println!("Default profile is now '{}'.", name),
                    None => println!("Default profile cleared."),
                }
            }
        },
        Commands::Logs { action } => {
            let dir = session.paths().log_dir();
            match action {
                LogsAction::List { filter } => {
                    let entries: Vec<_> = logwriter::list_logs(&dir)
                        .into_iter()
                        .filter(|e| filter.map_or(true, |f| e.category == f))
                        .collect();
                    if json {
                        println!("{}", serde_json::to_string_pretty(&entries)?);
                    } else if entries.is_empty() {
                        println!("No logs found in {}.", dir.display());
                    } else {
                        for entry in entries {
                            let modified = entry
                                .modified
                                .map(|m| m.format("%Y-%m-%d %H:%M:%S").to_string())
                                .unwrap_or_default();
                            println!("{:<19} | {:<7} | {}", modified, entry.category, entry.path.display());
                        }
                    }
                }
                LogsAction::Delete { path } => {
                    logwriter::delete_log(&path)?;
                    println!("Deleted {}.", path.display());
                }
                LogsAction::Clear => {
                    let count = logwriter::clear_logs(&dir);
                    println!("Deleted {} log file(s).", count);
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", serde_json::to_string_pretty(session.config())?);
            }
            ConfigAction::Theme { theme } => {
                let theme = session.set_theme(&theme)?;
                println!("Theme set to {}.", theme);
            }
            ConfigAction::Path => {
                println!("{}", session.paths().config_file().display());
            }
        },
    }

    Ok(ExitCode::SUCCESS)
}

/// Start a run, stream it to the terminal and mirror its exit code.
async fn run_to_completion(session: &mut Session, req: RunRequest, json: bool) -> Result<ExitCode> {
    let forward_stdin = req.stdin;
    let palette = Palette::new(session.config().theme, !json && std::io::stdout().is_terminal());
    let events = session.subscribe();
    let printer = tokio::spawn(print_events(events, palette, json));

    let active = match session.start(req) {
        Ok(active) => active,
        Err(e) => {
            session.unsubscribe();
            let _ = printer.await;
            return Err(e.into());
        }
    };

    let stopper = active.stopper();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Stopping... (press Ctrl-C again to quit)");
            stopper.stop();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });

    if forward_stdin {
        if let Some(tx) = active.stdin() {
            spawn_stdin_forwarder(tx);
        }
    }

    let record = session.finish(active).await;
    interrupt.abort();
    session.unsubscribe();
    let _ = printer.await;

    if !json {
        eprintln!("{} ({})", summary(&record), record.log_path.display());
    }
    Ok(match record.exit_code {
        Some(0) => ExitCode::SUCCESS,
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1).max(1)),
        None => ExitCode::from(130),
    })
}

fn spawn_stdin_forwarder(tx: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
}

async fn print_events(mut events: mpsc::UnboundedReceiver<AppEvent>, palette: Palette, json: bool) {
    while let Some(event) = events.recv().await {
        match event {
            AppEvent::LineReceived(line) => {
                if json {
                    if let Ok(out) = serde_json::to_string(&line) {
                        println!("{}", out);
                    }
                } else {
                    println!("{}", palette.paint(&line));
                }
            }
            AppEvent::RunStarted(record) if !json => {
                eprintln!("Running {} {}", record.command(), record.script.display());
            }
            AppEvent::RunFinished(record) if json => {
                if let Ok(out) = serde_json::to_string(&record) {
                    println!("{}", out);
                }
            }
            AppEvent::Notice(message) => eprintln!("warning: {}", message),
            _ => {}
        }
    }
}

/// ANSI colors per classification, tuned for the configured theme.
#[derive(Debug, Clone, Copy)]
struct Palette {
    theme: Theme,
    enabled: bool,
}

impl Palette {
    fn new(theme: Theme, enabled: bool) -> Self {
        Self { theme, enabled }
    }

    fn code(&self, classification: Classification) -> Option<&'static str> {
        match (classification, self.theme) {
            (Classification::Plain, _) => None,
            (Classification::Error, Theme::Dark) => Some("91"),
            (Classification::Error, Theme::Light) => Some("31"),
            (Classification::Warning, Theme::Dark) => Some("93"),
            (Classification::Warning, Theme::Light) => Some("33"),
            (Classification::Info, Theme::Dark) => Some("96"),
            (Classification::Info, Theme::Light) => Some("34"),
        }
    }

    fn paint(&self, line: &LogLine) -> String {
        match self.code(line.classification).filter(|_| self.enabled) {
            Some(code) => format!("\x1b[{}m{}\x1b[0m", code, line.text),
            None => line.text.clone(),
        }
    }
}

fn status_cell(record: &RunRecord) -> String {
    match (record.exit_code, record.is_finished()) {
        (Some(code), _) => code.to_string(),
        (None, true) => "-".to_string(),
        (None, false) => "...".to_string(),
    }
}

fn summary(record: &RunRecord) -> String {
    match (record.exit_code, record.error.as_deref()) {
        (Some(code), _) => format!("Exited with code {}", code),
        (None, Some(error)) => format!("Ended: {}", error),
        (None, None) => "Ended".to_string(),
    }
}

fn print_record(record: &RunRecord) {
    println!("Id:          {}", record.id);
    println!("Script:      {}", record.script.display());
    println!("Command:     {}", record.command());
    if !record.args.is_empty() {
        println!("Arguments:   {}", shell_words::join(&record.args));
    }
    println!("Started:     {}", record.start.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"));
    if let Some(end) = record.end {
        println!("Ended:       {}", end.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"));
    }
    println!("Status:      {}", if record.is_finished() { summary(record) } else { "running".to_string() });
    println!("Log:         {}", record.log_path.display());
}
