use assert_cmd::prelude::*;
use predicates::prelude::*;
use serde_json::Value;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn handshake_subcommand_prints_parsed_record() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("etxe")?;
    cmd.args(["handshake", "1|2|tcp|127.0.0.1:10000|grpc"]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Handshake OK"))
        .stdout(predicate::str::contains("127.0.0.1:10000"))
        .stdout(predicate::str::contains("grpc"));

    Ok(())
}

#[test]
fn handshake_subcommand_emits_json() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("etxe")?;
    cmd.args(["handshake", "--json", "1|3|unix|/tmp/plugin/plugin.sock|grpc"]);

    let output = cmd.assert().success().get_output().stdout.clone();
    let record: Value = serde_json::from_slice(&output)?;

    assert_eq!(record["core_protocol"], 1);
    assert_eq!(record["app_protocol"], 3);
    assert_eq!(record["network"], "unix");
    assert_eq!(record["address"], "/tmp/plugin/plugin.sock");
    assert_eq!(record["rpc_protocol"], "grpc");
    assert!(record["server_cert"].is_null());

    Ok(())
}

#[test]
fn handshake_subcommand_rejects_core_mismatch() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("etxe")?;
    cmd.args(["handshake", "7|1|tcp|127.0.0.1:10000|grpc"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Incompatible core API version"))
        .stderr(predicate::str::contains("recompiled"));

    Ok(())
}

#[test]
fn handshake_subcommand_rejects_malformed_line() -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = Command::cargo_bin("etxe")?;
    cmd.args(["handshake", "not a handshake"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Unrecognized remote plugin message"));

    Ok(())
}

#[test]
fn launch_reports_missing_manifest() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;

    let mut cmd = Command::cargo_bin("etxe")?;
    cmd.current_dir(dir.path()).args(["launch", "missing.yaml"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read missing.yaml"));

    Ok(())
}

#[test]
fn launch_reports_unknown_plugin_command() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    std::fs::write(
        dir.path().join("plugin.yaml"),
        r#"
command: etxe-plugin-that-does-not-exist
handshake:
  protocol_version: 1
  magic_cookie_key: ETXE_PLUGIN
  magic_cookie_value: d2a1c5e0
"#,
    )?;

    let mut cmd = Command::cargo_bin("etxe")?;
    cmd.current_dir(dir.path()).args(["launch", "plugin.yaml"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Plugin command not found"));

    Ok(())
}
