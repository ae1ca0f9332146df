use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;

fn lupa() -> Command {
    Command::cargo_bin("lupa").unwrap()
}

#[test]
fn test_shipped_config_is_valid() {
    lupa()
        .args(["check-config", "--file", "config.toml"])
        .assert()
        .success();
}

#[test]
fn test_bad_cache_ordering_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    let shipped = fs::read_to_string("config.toml").unwrap();
    // Short TTL longer than the medium one breaks the class ordering.
    let broken = shipped.replace("ttl-short-secs = 300", "ttl-short-secs = 999999");
    fs::write(&path, broken).unwrap();

    lupa()
        .args(["check-config", "--file", path.to_str().unwrap()])
        .assert()
        .failure();
}

#[test]
fn test_missing_config_fails() {
    lupa()
        .args(["check-config", "--file", "/does/not/exist.toml"])
        .assert()
        .failure();
}

#[test]
fn test_help_lists_subcommands() {
    lupa()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("server")
                .and(predicate::str::contains("investigate"))
                .and(predicate::str::contains("clean-cache")),
        );
}
