//! End-to-end tests driving the `bsync` binary against the embedded
//! snapshot backend.

use assert_cmd::Command;
use serde_json::Value;
use tempfile::TempDir;

struct Sandbox {
    home: TempDir,
    repo: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let sandbox = Self {
            home: TempDir::new().unwrap(),
            repo: TempDir::new().unwrap(),
        };
        sandbox.ok(&["init"]);
        sandbox
    }

    fn cmd(&self, args: &[&str]) -> Command {
        let mut cmd = Command::cargo_bin("bsync").unwrap();
        for var in [
            "BSYNC_REPO",
            "BSYNC_DOCSTORE",
            "BSYNC_DOLT",
            "BSYNC_TIMEOUT_SECS",
            "BSYNC_CHECKOUT_POLICY",
            "BSYNC_MERGE_RESOLUTION",
            "BSYNC_BACKEND",
            "RUST_LOG",
        ] {
            cmd.env_remove(var);
        }
        cmd.env("HOME", self.home.path())
            .env("BSYNC_STATE_DB", self.home.path().join("state.db"))
            .arg("--repo")
            .arg(self.repo.path())
            .args(["--backend", "snapshot", "--json"])
            .args(args);
        cmd
    }

    /// Run a command that must succeed and parse its JSON output.
    fn ok(&self, args: &[&str]) -> Value {
        let output = self.cmd(args).output().unwrap();
        assert!(
            output.status.success(),
            "bsync {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }
}

#[test]
fn test_version_needs_no_repository() {
    let output = Command::cargo_bin("bsync")
        .unwrap()
        .args(["version", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let value: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["name"], "bsync");
}

#[test]
fn test_init_and_status() {
    let sandbox = Sandbox::new();
    let status = sandbox.ok(&["status"]);
    assert_eq!(status["branch"], "main");
    assert_eq!(status["collections"].as_array().unwrap().len(), 0);
}

#[test]
fn test_commit_without_changes_reports_no_changes() {
    let sandbox = Sandbox::new();
    let outcome = sandbox.ok(&["commit", "-m", "nothing"]);
    assert_eq!(outcome["status"], "no_changes");
}

#[test]
fn test_branch_round_trip_restores_content() {
    let sandbox = Sandbox::new();
    sandbox.ok(&["doc", "add", "notes", "d1", "Original"]);
    let committed = sandbox.ok(&["commit", "-m", "main"]);
    assert_eq!(committed["status"], "committed");

    sandbox.ok(&["checkout", "-b", "feature"]);
    sandbox.ok(&["doc", "update", "notes", "d1", "Modified"]);
    sandbox.ok(&["commit", "-m", "feature"]);

    let checkout = sandbox.ok(&["checkout", "main"]);
    assert_eq!(checkout["status"], "completed");
    let docs = sandbox.ok(&["doc", "list", "notes"]);
    assert_eq!(docs[0]["content_hash"], bsync::sync::content_hash("Original"));

    sandbox.ok(&["checkout", "feature"]);
    let docs = sandbox.ok(&["doc", "list", "notes"]);
    assert_eq!(docs[0]["content_hash"], bsync::sync::content_hash("Modified"));
}

#[test]
fn test_checkout_with_local_changes_aborts() {
    let sandbox = Sandbox::new();
    sandbox.ok(&["doc", "add", "notes", "d1", "one"]);
    sandbox.ok(&["commit", "-m", "seed"]);
    sandbox.ok(&["branch", "create", "other"]);
    sandbox.ok(&["doc", "update", "notes", "d1", "edited"]);

    let output = sandbox.cmd(&["checkout", "other"]).output().unwrap();
    assert_eq!(output.status.code(), Some(5));
    let stderr = String::from_utf8_lossy(&output.stderr);
    let error: Value = serde_json::from_str(stderr.lines().last().unwrap()).unwrap();
    assert_eq!(error["error"]["code"], "LOCAL_CHANGES_EXIST");

    let status = sandbox.ok(&["status"]);
    assert_eq!(status["branch"], "main");
}

#[test]
fn test_invalid_policy_is_a_validation_error() {
    let sandbox = Sandbox::new();
    let output = sandbox
        .cmd(&["checkout", "main", "--policy", "yolo"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(4));
}
