//! End-to-end checks of the `elastic-socks` binary

use std::process::Command;

fn binary() -> Command {
    Command::new(env!("CARGO_BIN_EXE_elastic-socks"))
}

#[test]
fn test_init_config_writes_loadable_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("relay.toml");

    let output = binary()
        .args(["init-config", "--output"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("[server.socks]"));
    assert!(content.contains("[worker]"));
}

#[test]
fn test_worker_rejects_malformed_server() {
    let output = binary()
        .args(["worker", "--server", "no-port-here"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("HOST:PORT"));
}

#[test]
fn test_missing_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = binary()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("server")
        .output()
        .unwrap();
    assert!(!output.status.success());
}
