//! Process wrapper around the `dolt` executable.
//!
//! Every call is a fresh `dolt` process run inside the repository directory.
//! Failures are translated into the crate error taxonomy:
//!
//! - missing binary → [`Error::ExecutableNotFound`]
//! - non-zero exit → [`Error::VersionedStore`] with stderr as the message
//! - deadline exceeded → [`Error::VersionedStoreTimeout`] (the child is killed,
//!   nothing is retried)

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, trace};

use super::{CommitResult, MergeOutcome, RepoStatus, Row, SqlDialect, VersionedStore};
use crate::error::{Error, Result};
use crate::model::row_string;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A Dolt repository reached through its CLI.
#[derive(Debug, Clone)]
pub struct DoltCli {
    executable: String,
    repo_path: PathBuf,
    timeout: Duration,
}

impl DoltCli {
    #[must_use]
    pub fn new(executable: impl Into<String>, repo_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            repo_path: repo_path.into(),
            timeout,
        }
    }

    #[must_use]
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Run `dolt <args>` and return stdout.
    fn run(&self, op: &str, args: &[&str]) -> Result<String> {
        trace!(op, ?args, "dolt");
        let child = Command::new(&self.executable)
            .args(args)
            .current_dir(&self.repo_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ExecutableNotFound {
                        executable: self.executable.clone(),
                    }
                } else {
                    Error::Io(e)
                }
            })?;
        self.wait(op, child)
    }

    fn wait(&self, op: &str, mut child: Child) -> Result<String> {
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::VersionedStoreTimeout {
                    op: op.to_string(),
                    seconds: self.timeout.as_secs(),
                });
            }
            thread::sleep(POLL_INTERVAL);
        };

        let out = stdout.map(|h| h.join().unwrap_or_default()).unwrap_or_default();
        let err = stderr.map(|h| h.join().unwrap_or_default()).unwrap_or_default();

        if status.success() {
            Ok(out)
        } else {
            let message = if err.trim().is_empty() { out } else { err };
            Err(Error::versioned(op, message.trim()))
        }
    }

    fn sql_json(&self, op: &str, sql: &str) -> Result<Vec<Row>> {
        let out = self.run(op, &["sql", "-q", sql, "-r", "json"])?;
        parse_json_rows(&out).map_err(|e| Error::versioned(op, format!("unparseable result: {e}")))
    }

    fn scalar(&self, op: &str, sql: &str, column: &str) -> Result<Option<String>> {
        Ok(self
            .sql_json(op, sql)?
            .first()
            .and_then(|row| row_string(row, column))
            .filter(|s| !s.is_empty()))
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = reader.read_to_string(&mut buf);
        buf
    })
}

/// Parse `dolt sql -r json` output. Empty output means no rows.
fn parse_json_rows(output: &str) -> std::result::Result<Vec<Row>, serde_json::Error> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(trimmed)?;
    Ok(value
        .get("rows")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(|r| r.as_object().cloned()).collect())
        .unwrap_or_default())
}

/// Sum the counts of every `Query OK, N rows affected` line.
fn parse_rows_affected(output: &str) -> usize {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix("Query OK, ")?;
            rest.split_whitespace().next()?.parse::<usize>().ok()
        })
        .sum()
}

fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().is_some_and(|v| v != 0),
        Some(Value::String(s)) => matches!(s.as_str(), "1" | "true" | "TRUE"),
        _ => false,
    }
}

fn sql_quote(s: &str) -> String {
    SqlDialect::MySql.quote(s)
}

impl VersionedStore for DoltCli {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::MySql
    }

    fn init(&mut self) -> Result<()> {
        if self.repo_path.join(".dolt").is_dir() {
            return Ok(());
        }
        std::fs::create_dir_all(&self.repo_path)?;
        self.run("init", &["init"])?;
        debug!(repo = %self.repo_path.display(), "Initialized dolt repository");
        Ok(())
    }

    fn current_branch(&self) -> Result<String> {
        self.scalar("current_branch", "SELECT active_branch() AS branch", "branch")?
            .ok_or_else(|| Error::versioned("current_branch", "no active branch"))
    }

    fn resolve_ref(&self, reference: &str) -> Result<String> {
        let sql = format!("SELECT HASHOF({}) AS hash", sql_quote(reference));
        self.scalar("resolve", &sql, "hash")?
            .ok_or_else(|| Error::versioned("resolve", format!("unknown ref '{reference}'")))
    }

    fn list_branches(&self) -> Result<Vec<String>> {
        Ok(self
            .sql_json("list_branches", "SELECT name FROM dolt_branches ORDER BY name")?
            .iter()
            .filter_map(|row| row_string(row, "name"))
            .collect())
    }

    fn create_branch(&mut self, name: &str, start_point: Option<&str>) -> Result<()> {
        let mut args = vec!["branch", name];
        args.extend(start_point);
        self.run("branch", &args).map(|_| ())
    }

    fn delete_branch(&mut self, name: &str, force: bool) -> Result<()> {
        let flag = if force { "-D" } else { "-d" };
        self.run("branch", &["branch", flag, name]).map(|_| ())
    }

    fn checkout(&mut self, branch: &str, create_new: bool) -> Result<()> {
        let args: &[&str] = if create_new {
            &["checkout", "-b", branch]
        } else {
            &["checkout", branch]
        };
        self.run("checkout", args).map(|_| ())
    }

    fn execute(&mut self, sql: &str) -> Result<usize> {
        let out = self.run("execute", &["sql", "-q", sql])?;
        Ok(parse_rows_affected(&out))
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.sql_json("query", sql)
    }

    fn table_rows_at(&self, table: &str, reference: &str) -> Result<Vec<Row>> {
        let sql = if reference == "WORKING" {
            format!("SELECT * FROM `{table}`")
        } else {
            format!("SELECT * FROM `{table}` AS OF {}", sql_quote(reference))
        };
        self.sql_json("table_rows_at", &sql)
    }

    fn add_all(&mut self) -> Result<()> {
        self.run("add", &["add", "-A"]).map(|_| ())
    }

    fn commit(&mut self, message: &str) -> Result<CommitResult> {
        self.run("commit", &["commit", "-m", message])?;
        let hash = self.head_commit_hash()?;
        Ok(CommitResult { success: true, hash })
    }

    fn reset_hard(&mut self, reference: &str) -> Result<()> {
        self.run("reset", &["reset", "--hard", reference]).map(|_| ())
    }

    fn reset_soft(&mut self, reference: &str) -> Result<()> {
        self.run("reset", &["reset", "--soft", reference]).map(|_| ())
    }

    fn status(&self) -> Result<RepoStatus> {
        let rows = self.sql_json("status", "SELECT staged FROM dolt_status")?;
        let mut status = RepoStatus::default();
        for row in &rows {
            if is_truthy(row.get("staged")) {
                status.has_staged = true;
            } else {
                status.has_unstaged = true;
            }
        }
        Ok(status)
    }

    fn merge_base(&self, left: &str, right: &str) -> Result<Option<String>> {
        let sql = format!(
            "SELECT DOLT_MERGE_BASE({}, {}) AS base",
            sql_quote(left),
            sql_quote(right)
        );
        match self.scalar("merge_base", &sql, "base") {
            Ok(base) => Ok(base),
            Err(Error::VersionedStore { message, .. }) if message.contains("no common ancestor") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn merge(&mut self, source: &str, message: &str, no_commit: bool) -> Result<MergeOutcome> {
        let before = self.head_commit_hash()?;
        let mut args = vec!["merge"];
        if no_commit {
            args.push("--no-commit");
        }
        args.extend(["-m", message, source]);

        let out = match self.run("merge", &args) {
            Ok(out) => out,
            // Dolt exits non-zero when the merge leaves conflicts behind.
            Err(Error::VersionedStore { message, .. }) if message.contains("CONFLICT") => message,
            Err(e) => return Err(e),
        };

        if out.contains("Already up to date") {
            return Ok(MergeOutcome {
                up_to_date: true,
                hash: Some(before),
                ..MergeOutcome::default()
            });
        }

        let conflicted_tables: Vec<String> = self
            .sql_json("merge", "SELECT `table` FROM dolt_conflicts")?
            .iter()
            .filter_map(|row| row_string(row, "table"))
            .collect();
        let after = self.head_commit_hash()?;
        let fast_forward = out.contains("Fast-forward");
        let committed = after != before && conflicted_tables.is_empty();

        Ok(MergeOutcome {
            up_to_date: false,
            fast_forward,
            pending_commit: !committed,
            hash: committed.then_some(after),
            conflicted_tables,
        })
    }

    fn mark_resolved(&mut self, table: &str) -> Result<()> {
        self.run("conflicts", &["conflicts", "resolve", "--ours", table])
            .map(|_| ())
    }
}
