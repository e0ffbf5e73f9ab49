//! CLI integration tests for rostersync.
//!
//! Each test uses an isolated temp directory, so tests can run in parallel.
//! None of these commands reach the network.

#![allow(deprecated)] // Command::cargo_bin deprecation only affects custom build dirs

use std::path::Path;

use assert_cmd::Command;
use assert_fs::TempDir;
use predicates::prelude::*;
use serde_json::Value;

struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    fn new() -> Self {
        Self {
            temp_dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    fn data_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    fn data_dir_str(&self) -> String {
        self.data_dir().to_string_lossy().to_string()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("rostersync").expect("failed to find binary");
        cmd.env("NO_COLOR", "1");
        cmd.env_remove("ROSTERSYNC_API_KEY");
        cmd.env_remove("ROSTERSYNC_BASE_URL");
        cmd
    }

    fn init(&self) -> assert_cmd::assert::Assert {
        self.cmd()
            .args([
                "init",
                "--data-dir",
                &self.data_dir_str(),
                "--principal-id",
                "p1",
            ])
            .assert()
    }

    fn run(&self, args: &[&str]) -> assert_cmd::assert::Assert {
        let data_dir = self.data_dir_str();
        let mut full: Vec<&str> = args.to_vec();
        full.extend(["--data-dir", &data_dir]);
        self.cmd().args(&full).assert()
    }
}

#[test]
fn test_init_writes_config_and_key() {
    let ctx = TestContext::new();
    ctx.init()
        .success()
        .stdout(predicate::str::contains("Config written to"));

    let config = std::fs::read_to_string(ctx.data_dir().join("config.toml")).unwrap();
    assert!(config.contains("principal_id = \"p1\""));
    assert!(config.contains("encrypt_cache = true"));

    let key = ctx.data_dir().join(".cache_key");
    assert!(key.exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn test_init_twice_requires_force() {
    let ctx = TestContext::new();
    ctx.init().success();
    let key_before = std::fs::read_to_string(ctx.data_dir().join(".cache_key")).unwrap();

    ctx.init()
        .failure()
        .stderr(predicate::str::contains("Already initialized"));

    ctx.cmd()
        .args([
            "init",
            "--data-dir",
            &ctx.data_dir_str(),
            "--principal-id",
            "p2",
            "--force",
        ])
        .assert()
        .success();

    // The key is never rotated by init.
    let key_after = std::fs::read_to_string(ctx.data_dir().join(".cache_key")).unwrap();
    assert_eq!(key_before, key_after);
}

#[test]
fn test_init_without_encryption_skips_key() {
    let ctx = TestContext::new();
    ctx.cmd()
        .args(["init", "--data-dir", &ctx.data_dir_str(), "--no-encrypt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Set principal_id"));
    assert!(!ctx.data_dir().join(".cache_key").exists());
}

#[test]
fn test_commands_require_init() {
    let ctx = TestContext::new();
    ctx.run(&["status"])
        .failure()
        .stderr(predicate::str::contains("rostersync init"));
}

#[test]
fn test_check_denies_with_empty_cache() {
    let ctx = TestContext::new();
    ctx.init().success();

    ctx.run(&["check", "can_view", "--city", "CityA", "--institution", "DeptX"])
        .success()
        .stdout(predicate::str::diff("denied\n"));
}

#[test]
fn test_institution_requires_city() {
    let ctx = TestContext::new();
    ctx.init().success();

    ctx.run(&["check", "can_view", "--institution", "DeptX"])
        .failure();
}

#[test]
fn test_status_json() {
    let ctx = TestContext::new();
    ctx.init().success();

    let output = ctx
        .cmd()
        .args(["status", "--data-dir", &ctx.data_dir_str(), "--json"])
        .output()
        .expect("failed to run command");
    assert!(output.status.success());

    let status: Value = serde_json::from_slice(&output.stdout).expect("failed to parse JSON");
    assert_eq!(status["principal_id"], "p1");
    assert_eq!(status["local_version"], 0);
    assert_eq!(status["cached_records"], 0);
    assert_eq!(status["needs_rebuild"], false);
}

#[test]
fn test_audit_commands_on_empty_log() {
    let ctx = TestContext::new();
    ctx.init().success();

    ctx.run(&["audit", "list"])
        .success()
        .stdout(predicate::str::contains("No audit entries found."));

    ctx.run(&["audit", "rebuild-summary"])
        .success()
        .stdout(predicate::str::contains("0 actions"));

    ctx.run(&["audit", "summary"])
        .success()
        .stdout(predicate::str::contains("\"total_actions\": 0"));
}

#[test]
fn test_audit_list_rejects_unknown_action() {
    let ctx = TestContext::new();
    ctx.init().success();

    ctx.run(&["audit", "list", "--action", "promote"])
        .failure()
        .stderr(predicate::str::contains("Unknown audit action"));
}
