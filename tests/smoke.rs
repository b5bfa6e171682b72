//! Smoke tests -- verify the binary runs and the subcommands are wired up.

use assert_cmd::Command;

fn cli(home: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("scriptrunner").unwrap();
    cmd.arg("--home").arg(home);
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("scriptrunner")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("watch their output live"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("scriptrunner")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("scriptrunner"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        &["run", "--help"][..],
        &["rerun", "--help"],
        &["history", "list", "--help"],
        &["profile", "add", "--help"],
        &["logs", "list", "--help"],
        &["config", "theme", "--help"],
    ] {
        Command::cargo_bin("scriptrunner").unwrap().args(args).assert().success();
    }
}

#[test]
fn test_config_path_honors_home() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicates::str::contains("config.json"));
}

#[test]
fn test_unknown_theme_fails() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .args(["config", "theme", "neon"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("unknown theme"));
}

#[test]
fn test_profile_add_and_list() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .args(["profile", "add", "--name", "py-u", "--command", "python3", "--args", "-u -X dev", "--extension", ".py"])
        .assert()
        .success();
    cli(dir.path())
        .args(["profile", "list"])
        .assert()
        .success()
        .stdout(predicates::str::contains("py-u"))
        .stdout(predicates::str::contains("python3 -u -X dev"));
}

#[test]
fn test_missing_script_fails() {
    let dir = tempfile::tempdir().unwrap();
    cli(dir.path())
        .args(["run", "does-not-exist.sh"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("script not found"));
}

#[cfg(unix)]
#[test]
fn test_run_mirrors_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("fail.sh");
    std::fs::write(&script, "echo hello\necho 'ERROR: disk full' >&2\nexit 3\n").unwrap();

    cli(&dir.path().join("home"))
        .arg("run")
        .arg(&script)
        .args(["--interpreter", "bash"])
        .assert()
        .code(3)
        .stdout(predicates::str::contains("hello"))
        .stdout(predicates::str::contains("ERROR: disk full"));

    cli(&dir.path().join("home"))
        .args(["history", "list", "--query", "FAIL"])
        .assert()
        .success()
        .stdout(predicates::str::contains("fail.sh"));
}
