//! End-to-end CLI runs with no privileged service reachable.

use std::fs;
use std::path::Path;

use assert_cmd::Command;

/// Client config pointing every device path into `dir` and the socket at
/// a path nothing listens on.
fn write_config(dir: &Path) -> std::path::PathBuf {
    let body = format!(
        "[service]\nsocket = \"{root}/absent.sock\"\ntimeout_secs = 1\n\n\
         [paths]\nengine_config = \"{root}/hymo/config.toml\"\n\
         module_modes = \"{root}/hymo/module_mode.toml\"\n\
         mountinfo = \"{root}/mountinfo\"\n",
        root = dir.display()
    );
    let path = dir.join("client.toml");
    if let Err(e) = fs::write(&path, body) {
        panic!("write client config: {e}");
    }
    path
}

fn hymoctl(config: &Path) -> Command {
    let mut cmd = match Command::cargo_bin("hymoctl") {
        Ok(cmd) => cmd,
        Err(e) => panic!("binary should build: {e}"),
    };
    for var in [
        "HYMOCTL_CONFIG",
        "HYMOCTL_TRANSPORT",
        "HYMOCTL_SOCKET",
        "HYMOCTL_ENGINE_CONFIG",
    ] {
        cmd.env_remove(var);
    }
    cmd.env("RUST_LOG", "warn").arg("--config").arg(config);
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8_lossy(&output).into_owned()
}

fn tempdir() -> tempfile::TempDir {
    match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(e) => panic!("tempdir: {e}"),
    }
}

#[test]
fn help_lists_subcommands() {
    let dir = tempdir();
    let config = write_config(dir.path());
    let out = stdout_of(hymoctl(&config).arg("--help"));
    for sub in ["status", "rules", "stealth", "config", "modules", "mounts"] {
        assert!(out.contains(sub), "missing {sub} in help:\n{out}");
    }
}

#[test]
fn config_show_prints_defaults_as_json() {
    let dir = tempdir();
    let config = write_config(dir.path());
    let out = stdout_of(hymoctl(&config).args(["--json", "config", "show"]));
    assert!(out.contains("\"verbose\": false"), "{out}");
    assert!(out.contains("\"enable_stealth\": false"), "{out}");
}

#[test]
fn config_set_persists_plain_toggle() {
    let dir = tempdir();
    let config = write_config(dir.path());
    let out = stdout_of(hymoctl(&config).args(["config", "set", "verbose", "on"]));
    assert!(out.starts_with("saved"), "{out}");

    let saved = match fs::read_to_string(dir.path().join("hymo/config.toml")) {
        Ok(s) => s,
        Err(e) => panic!("engine config should exist: {e}"),
    };
    assert!(saved.contains("verbose = true"), "{saved}");
}

#[test]
fn gated_toggle_offline_is_saved_with_notice() {
    let dir = tempdir();
    let config = write_config(dir.path());
    let out = stdout_of(hymoctl(&config).args(["config", "set", "stealth", "on"]));
    assert!(out.contains("saved;"), "{out}");
    assert!(out.contains("enable_stealth"), "{out}");

    let saved = match fs::read_to_string(dir.path().join("hymo/config.toml")) {
        Ok(s) => s,
        Err(e) => panic!("engine config should exist: {e}"),
    };
    assert!(saved.contains("enable_stealth = true"), "{saved}");
}

#[test]
fn unknown_toggle_fails() {
    let dir = tempdir();
    let config = write_config(dir.path());
    hymoctl(&config)
        .args(["config", "set", "turbo", "on"])
        .assert()
        .failure();
}

#[test]
fn status_reports_missing_service() {
    let dir = tempdir();
    let config = write_config(dir.path());
    let out = stdout_of(hymoctl(&config).args(["status", "--json"]));
    assert!(out.contains("\"connection\": null"), "{out}");
    assert!(out.contains("\"kernel_mode\": false"), "{out}");
    assert!(out.contains("\"transport\": \"socket\""), "{out}");
}

#[test]
fn rule_commands_fail_without_service() {
    let dir = tempdir();
    let config = write_config(dir.path());
    hymoctl(&config).args(["rules", "list"]).assert().failure();
    hymoctl(&config)
        .args(["rules", "add", "hide", "/system/app/Foo"])
        .assert()
        .failure();
}

#[test]
fn bad_rule_kind_is_a_usage_error() {
    let dir = tempdir();
    let config = write_config(dir.path());
    hymoctl(&config)
        .args(["rules", "add", "teleport", "/x"])
        .assert()
        .failure()
        .code(2);
}

#[test]
fn module_strategy_offline() {
    let dir = tempdir();
    let config = write_config(dir.path());
    let out = stdout_of(hymoctl(&config).args(["modules", "set", "fonts", "magic"]));
    assert!(out.contains("fonts set to magic"), "{out}");

    let saved = match fs::read_to_string(dir.path().join("hymo/module_mode.toml")) {
        Ok(s) => s,
        Err(e) => panic!("module modes should exist: {e}"),
    };
    assert!(saved.contains("fonts = \"magic\""), "{saved}");

    // hymofs needs the overlay engine, which is not reachable.
    hymoctl(&config)
        .args(["modules", "set", "fonts", "hymofs"])
        .assert()
        .failure();
}
