//! Embedded branchable store backed by SQLite.
//!
//! The working set lives in a SQLite connection. Commits are full table
//! snapshots kept in an in-process commit graph, optionally persisted as
//! `graph.json` next to `working.db`. Branches, staging, hard/soft reset and
//! three-way row merges follow the same rules the sync core expects from Dolt.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{CommitResult, MergeOutcome, RepoStatus, Row, SqlDialect, VersionedStore};
use crate::error::{Error, Result};

/// Rows of one table keyed by their primary key.
type TableRows = BTreeMap<String, Row>;

/// Contents of every non-empty table.
type Snapshot = BTreeMap<String, TableRows>;

const DEFAULT_BRANCH: &str = "main";
const WORKING_REF: &str = "WORKING";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommitNode {
    parents: Vec<String>,
    message: String,
    timestamp: i64,
    snapshot: Snapshot,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Graph {
    commits: BTreeMap<String, CommitNode>,
    branches: BTreeMap<String, String>,
    current: String,
    staged: Snapshot,
    merge_parent: Option<String>,
    conflicts: BTreeSet<String>,
    sequence: u64,
}

/// SQLite-backed versioned store with an in-process commit graph.
#[derive(Debug)]
pub struct SnapshotStore {
    conn: Connection,
    graph: Graph,
    graph_path: Option<PathBuf>,
}

impl SnapshotStore {
    /// Open (or create) a store persisted under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory, database, or graph file cannot be read.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join("working.db"))?;
        let graph_path = dir.join("graph.json");
        let graph = if graph_path.exists() {
            serde_json::from_str(&fs::read_to_string(&graph_path)?)?
        } else {
            Graph::default()
        };
        Ok(Self {
            conn,
            graph,
            graph_path: Some(graph_path),
        })
    }

    /// Open a store that lives only in memory (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub fn open_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            graph: Graph::default(),
            graph_path: None,
        })
    }

    fn ensure_initialized(&self, op: &str) -> Result<()> {
        if self.graph.branches.is_empty() {
            return Err(Error::versioned(op, "repository is not initialized"));
        }
        Ok(())
    }

    fn save(&self) -> Result<()> {
        let Some(path) = &self.graph_path else {
            return Ok(());
        };
        let temp_path = path.with_extension("json.tmp");
        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &self.graph)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    fn head(&self) -> Result<String> {
        self.graph
            .branches
            .get(&self.graph.current)
            .cloned()
            .ok_or_else(|| Error::versioned("resolve", "current branch has no head"))
    }

    fn snapshot_of(&self, hash: &str) -> Result<&Snapshot> {
        self.graph
            .commits
            .get(hash)
            .map(|c| &c.snapshot)
            .ok_or_else(|| Error::versioned("resolve", format!("unknown commit {hash}")))
    }

    fn tables(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )?;
        let tables = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(tables)
    }

    fn primary_key(&self, table: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")?;
        let cols = stmt
            .query_map([table], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(cols)
    }

    fn read_rows(&self, sql: &str) -> Result<Vec<Row>> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| (*c).to_string()).collect();
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut map = Row::new();
            for (i, name) in columns.iter().enumerate() {
                map.insert(name.clone(), to_json(row.get_ref(i)?));
            }
            out.push(map);
        }
        Ok(out)
    }

    /// Capture the working set.
    fn capture(&self) -> Result<Snapshot> {
        let mut snapshot = Snapshot::new();
        for table in self.tables()? {
            let key_cols = self.primary_key(&table)?;
            let rows = self.read_rows(&format!("SELECT * FROM \"{table}\""))?;
            if rows.is_empty() {
                continue;
            }
            let keyed: TableRows = rows
                .into_iter()
                .map(|row| (row_key(&row, &key_cols), row))
                .collect();
            snapshot.insert(table, keyed);
        }
        Ok(snapshot)
    }

    /// Replace the working set with `snapshot`.
    fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        let tables = self.tables()?;
        let tx = self.conn.transaction()?;
        for table in &tables {
            tx.execute(&format!("DELETE FROM \"{table}\""), [])?;
        }
        for (table, rows) in snapshot {
            if !tables.contains(table) {
                continue;
            }
            for row in rows.values() {
                let columns: Vec<String> = row.keys().map(|c| format!("\"{c}\"")).collect();
                let placeholders: Vec<String> = (1..=row.len()).map(|i| format!("?{i}")).collect();
                let sql = format!(
                    "INSERT INTO \"{table}\" ({}) VALUES ({})",
                    columns.join(", "),
                    placeholders.join(", ")
                );
                tx.execute(&sql, rusqlite::params_from_iter(row.values().map(to_sql)))?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn ancestors(&self, hash: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![hash.to_string()];
        while let Some(h) = stack.pop() {
            if !seen.insert(h.clone()) {
                continue;
            }
            if let Some(node) = self.graph.commits.get(&h) {
                stack.extend(node.parents.iter().cloned());
            }
        }
        seen
    }

    fn next_hash(&mut self, parents: &[String], message: &str, snapshot: &Snapshot) -> String {
        self.graph.sequence += 1;
        let mut hasher = Sha256::new();
        hasher.update(parents.join(",").as_bytes());
        hasher.update(message.as_bytes());
        hasher.update(self.graph.sequence.to_le_bytes());
        hasher.update(serde_json::to_string(snapshot).unwrap_or_default().as_bytes());
        let digest = format!("{:x}", hasher.finalize());
        digest[..32].to_string()
    }

    fn record_commit(&mut self, parents: Vec<String>, message: &str, snapshot: Snapshot) -> String {
        let hash = self.next_hash(&parents, message, &snapshot);
        self.graph.commits.insert(
            hash.clone(),
            CommitNode {
                parents,
                message: message.to_string(),
                timestamp: chrono::Utc::now().timestamp_millis(),
                snapshot,
            },
        );
        hash
    }
}

impl VersionedStore for SnapshotStore {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    fn init(&mut self) -> Result<()> {
        if !self.graph.branches.is_empty() {
            return Ok(());
        }
        let snapshot = self.capture()?;
        let hash = self.record_commit(Vec::new(), "Initialize data repository", snapshot.clone());
        self.graph.branches.insert(DEFAULT_BRANCH.to_string(), hash);
        self.graph.current = DEFAULT_BRANCH.to_string();
        self.graph.staged = snapshot;
        self.save()
    }

    fn current_branch(&self) -> Result<String> {
        self.ensure_initialized("current_branch")?;
        Ok(self.graph.current.clone())
    }

    fn resolve_ref(&self, reference: &str) -> Result<String> {
        self.ensure_initialized("resolve")?;
        if reference == "HEAD" {
            return self.head();
        }
        if let Some(hash) = self.graph.branches.get(reference) {
            return Ok(hash.clone());
        }
        if self.graph.commits.contains_key(reference) {
            return Ok(reference.to_string());
        }
        if reference.len() >= 4 {
            let matches: Vec<&String> = self
                .graph
                .commits
                .keys()
                .filter(|h| h.starts_with(reference))
                .collect();
            if let [only] = matches.as_slice() {
                return Ok((*only).clone());
            }
        }
        Err(Error::versioned("resolve", format!("unknown ref '{reference}'")))
    }

    fn list_branches(&self) -> Result<Vec<String>> {
        Ok(self.graph.branches.keys().cloned().collect())
    }

    fn create_branch(&mut self, name: &str, start_point: Option<&str>) -> Result<()> {
        self.ensure_initialized("branch")?;
        if self.graph.branches.contains_key(name) {
            return Err(Error::versioned("branch", format!("branch '{name}' already exists")));
        }
        let hash = self.resolve_ref(start_point.unwrap_or("HEAD"))?;
        self.graph.branches.insert(name.to_string(), hash);
        self.save()
    }

    fn delete_branch(&mut self, name: &str, _force: bool) -> Result<()> {
        self.ensure_initialized("branch")?;
        if name == self.graph.current {
            return Err(Error::versioned("branch", format!("cannot delete checked out branch '{name}'")));
        }
        if self.graph.branches.remove(name).is_none() {
            return Err(Error::versioned("branch", format!("branch '{name}' not found")));
        }
        self.save()
    }

    fn checkout(&mut self, branch: &str, create_new: bool) -> Result<()> {
        self.ensure_initialized("checkout")?;
        if create_new {
            self.create_branch(branch, None)?;
            self.graph.current = branch.to_string();
            return self.save();
        }

        let target = self
            .graph
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| Error::versioned("checkout", format!("branch '{branch}' not found")))?;
        if branch == self.graph.current {
            return Ok(());
        }

        let head = self.head()?;
        if target != head {
            let head_snapshot = self.snapshot_of(&head)?.clone();
            if self.capture()? != head_snapshot || self.graph.staged != head_snapshot {
                return Err(Error::versioned(
                    "checkout",
                    "local changes would be overwritten by checkout",
                ));
            }
            let snapshot = self.snapshot_of(&target)?.clone();
            self.restore(&snapshot)?;
            self.graph.staged = snapshot;
        }
        self.graph.current = branch.to_string();
        self.graph.merge_parent = None;
        self.graph.conflicts.clear();
        debug!(branch, "Checked out");
        self.save()
    }

    fn execute(&mut self, sql: &str) -> Result<usize> {
        Ok(self.conn.execute(sql, [])?)
    }

    fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.read_rows(sql)
    }

    fn table_rows_at(&self, table: &str, reference: &str) -> Result<Vec<Row>> {
        let snapshot = if reference == WORKING_REF {
            self.capture()?
        } else {
            self.snapshot_of(&self.resolve_ref(reference)?)?.clone()
        };
        Ok(snapshot
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }

    fn add_all(&mut self) -> Result<()> {
        self.ensure_initialized("add")?;
        self.graph.staged = self.capture()?;
        self.save()
    }

    fn commit(&mut self, message: &str) -> Result<CommitResult> {
        self.ensure_initialized("commit")?;
        if !self.graph.conflicts.is_empty() {
            return Err(Error::versioned(
                "commit",
                format!(
                    "unresolved conflicts in: {}",
                    self.graph.conflicts.iter().cloned().collect::<Vec<_>>().join(", ")
                ),
            ));
        }
        let head = self.head()?;
        if self.graph.merge_parent.is_none() && &self.graph.staged == self.snapshot_of(&head)? {
            return Err(Error::versioned("commit", "nothing to commit, working tree clean"));
        }

        let mut parents = vec![head];
        parents.extend(self.graph.merge_parent.take());
        let snapshot = self.graph.staged.clone();
        let hash = self.record_commit(parents, message, snapshot);
        let current = self.graph.current.clone();
        self.graph.branches.insert(current, hash.clone());
        self.save()?;
        debug!(hash = %hash, "Committed");
        Ok(CommitResult { success: true, hash })
    }

    fn reset_hard(&mut self, reference: &str) -> Result<()> {
        let hash = self.resolve_ref(reference)?;
        let snapshot = self.snapshot_of(&hash)?.clone();
        self.restore(&snapshot)?;
        self.graph.staged = snapshot;
        let current = self.graph.current.clone();
        self.graph.branches.insert(current, hash);
        self.graph.merge_parent = None;
        self.graph.conflicts.clear();
        self.save()
    }

    fn reset_soft(&mut self, reference: &str) -> Result<()> {
        let hash = self.resolve_ref(reference)?;
        self.graph.staged = self.snapshot_of(&hash)?.clone();
        let current = self.graph.current.clone();
        self.graph.branches.insert(current, hash);
        self.save()
    }

    fn status(&self) -> Result<RepoStatus> {
        self.ensure_initialized("status")?;
        let head_snapshot = self.snapshot_of(&self.head()?)?;
        let working = self.capture()?;
        Ok(RepoStatus {
            has_staged: &self.graph.staged != head_snapshot,
            has_unstaged: working != self.graph.staged,
        })
    }

    fn merge_base(&self, left: &str, right: &str) -> Result<Option<String>> {
        let left = self.resolve_ref(left)?;
        let right = self.resolve_ref(right)?;
        let left_ancestors = self.ancestors(&left);

        let mut queue = VecDeque::from([right]);
        let mut seen = HashSet::new();
        while let Some(hash) = queue.pop_front() {
            if left_ancestors.contains(&hash) {
                return Ok(Some(hash));
            }
            if !seen.insert(hash.clone()) {
                continue;
            }
            if let Some(node) = self.graph.commits.get(&hash) {
                queue.extend(node.parents.iter().cloned());
            }
        }
        Ok(None)
    }

    fn merge(&mut self, source: &str, message: &str, no_commit: bool) -> Result<MergeOutcome> {
        self.ensure_initialized("merge")?;
        if self.graph.merge_parent.is_some() || !self.graph.conflicts.is_empty() {
            return Err(Error::versioned("merge", "a merge is already in progress"));
        }
        if !self.status()?.is_clean() {
            return Err(Error::versioned("merge", "working set has uncommitted changes"));
        }

        let ours = self.head()?;
        let theirs = self.resolve_ref(source)?;

        if ours == theirs || self.ancestors(&ours).contains(&theirs) {
            return Ok(MergeOutcome {
                up_to_date: true,
                hash: Some(ours),
                ..MergeOutcome::default()
            });
        }

        if self.ancestors(&theirs).contains(&ours) {
            let snapshot = self.snapshot_of(&theirs)?.clone();
            self.restore(&snapshot)?;
            self.graph.staged = snapshot;
            let current = self.graph.current.clone();
            self.graph.branches.insert(current, theirs.clone());
            self.save()?;
            return Ok(MergeOutcome {
                fast_forward: true,
                hash: Some(theirs),
                ..MergeOutcome::default()
            });
        }

        let base = match self.merge_base(&ours, &theirs)? {
            Some(hash) => self.snapshot_of(&hash)?.clone(),
            None => Snapshot::new(),
        };
        let (merged, conflicted) = three_way(
            &base,
            self.snapshot_of(&ours)?,
            self.snapshot_of(&theirs)?,
        );
        self.restore(&merged)?;
        self.graph.staged = merged;
        self.graph.merge_parent = Some(theirs);
        self.graph.conflicts = conflicted.iter().cloned().collect();
        self.save()?;

        let mut outcome = MergeOutcome {
            conflicted_tables: conflicted,
            ..MergeOutcome::default()
        };
        if outcome.conflicted_tables.is_empty() && !no_commit {
            outcome.hash = Some(self.commit(message)?.hash);
        } else {
            outcome.pending_commit = true;
        }
        Ok(outcome)
    }

    fn mark_resolved(&mut self, table: &str) -> Result<()> {
        self.graph.conflicts.remove(table);
        self.save()
    }
}

/// Row-level three-way merge. Both-sides-changed rows keep `ours` and mark
/// the table conflicted.
fn three_way(base: &Snapshot, ours: &Snapshot, theirs: &Snapshot) -> (Snapshot, Vec<String>) {
    let empty = TableRows::new();
    let mut merged = Snapshot::new();
    let mut conflicted = Vec::new();

    let tables: BTreeSet<&String> = ours.keys().chain(theirs.keys()).chain(base.keys()).collect();
    for table in tables {
        let b = base.get(table).unwrap_or(&empty);
        let o = ours.get(table).unwrap_or(&empty);
        let t = theirs.get(table).unwrap_or(&empty);

        let mut rows = TableRows::new();
        let mut table_conflict = false;
        let keys: BTreeSet<&String> = o.keys().chain(t.keys()).chain(b.keys()).collect();
        for key in keys {
            let (bv, ov, tv) = (b.get(key), o.get(key), t.get(key));
            let chosen = if ov == tv || tv == bv {
                ov
            } else if ov == bv {
                tv
            } else {
                table_conflict = true;
                ov
            };
            if let Some(row) = chosen {
                rows.insert(key.clone(), row.clone());
            }
        }
        if table_conflict {
            conflicted.push(table.clone());
        }
        if !rows.is_empty() {
            merged.insert(table.clone(), rows);
        }
    }
    (merged, conflicted)
}

fn row_key(row: &Row, key_cols: &[String]) -> String {
    if key_cols.is_empty() {
        return Value::Object(row.clone()).to_string();
    }
    let parts: Vec<Value> = key_cols
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect();
    Value::Array(parts).to_string()
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(b.iter().map(|byte| format!("{byte:02x}")).collect()),
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .unwrap_or(SqlValue::Null),
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}
