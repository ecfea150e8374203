//! Merge preview and conflict resolution.
//!
//! The analyzer compares the `documents` table at the merge base, the target
//! (ours) and the source (theirs). Every row changed on either side lands in
//! one of three buckets:
//!
//! - one side changed: the versioned store merges it cleanly
//! - both sides changed disjoint fields: auto-mergeable, field by field
//! - both sides changed the same field, or one side deleted what the other
//!   edited: hard conflict, needs a resolution
//!
//! Bookkeeping columns (`created_at`, `updated_at`, `content_hash`) never
//! take part in the comparison. Metadata is compared key by key.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::checkout::{CheckoutReconciler, ReconcilePass};
use super::hash::content_hash;
use crate::docstore::DocumentStore;
use crate::error::{Error, Result, Step};
use crate::model::{row_metadata, row_string};
use crate::storage::StateStore;
use crate::versioned::sql::{self, BOOKKEEPING_COLUMNS, DOCUMENTS_TABLE};
use crate::versioned::{Row, VersionedStore};

/// How a hard conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionType {
    KeepOurs,
    KeepTheirs,
    /// Start from ours (or theirs if ours deleted the row) and overlay the
    /// caller's values.
    Custom,
}

impl ResolutionType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::KeepOurs => "keep_ours",
            Self::KeepTheirs => "keep_theirs",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for ResolutionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A caller's decision for one conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict_id: String,
    pub resolution: ResolutionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_values: Option<Row>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    AutoMergeable,
    Hard,
}

/// A row changed on both sides of a merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeConflict {
    pub conflict_id: String,
    pub collection_name: String,
    pub doc_id: String,
    pub kind: ConflictKind,
    /// Fields changed differently on both sides (`metadata.<key>` for
    /// metadata entries, `<row>` for delete-versus-edit).
    pub fields: Vec<String>,
    pub base: Option<Row>,
    pub ours: Option<Row>,
    pub theirs: Option<Row>,
    /// Field-wise merge result for auto-mergeable rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<Row>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_type: Option<ResolutionType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub custom_values: Option<Row>,
}

/// Dry-run view of merging `source` into `target`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergePreview {
    pub source: String,
    pub target: String,
    pub merge_base: Option<String>,
    /// Rows changed only on the source branch.
    pub source_changes: usize,
    /// Rows changed only on the target branch.
    pub target_changes: usize,
    pub auto_mergeable: Vec<MergeConflict>,
    pub conflicts: Vec<MergeConflict>,
    pub can_auto_merge: bool,
}

/// Result of an executed merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub source: String,
    pub target: String,
    pub up_to_date: bool,
    pub fast_forward: bool,
    pub hash: Option<String>,
    pub auto_merged: usize,
    /// Applied resolutions by conflict id.
    pub resolved: Vec<(String, ResolutionType)>,
    pub reconcile: ReconcilePass,
}

/// Deterministic id of the conflict on `(collection, doc_id)`.
#[must_use]
pub fn conflict_id(collection: &str, doc_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(collection.as_bytes());
    hasher.update([0u8]);
    hasher.update(doc_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("conflict_{}", &digest[..12])
}

type DocKey = (String, String);

fn normalize(row: &Row) -> Row {
    let mut out = Row::new();
    for (column, value) in row {
        if BOOKKEEPING_COLUMNS.contains(&column.as_str()) {
            continue;
        }
        if column == "metadata" {
            out.insert(column.clone(), Value::Object(row_metadata(row, "metadata")));
        } else {
            out.insert(column.clone(), value.clone());
        }
    }
    out
}

fn index_rows(rows: &[Row]) -> BTreeMap<DocKey, Row> {
    rows.iter()
        .map(|row| {
            let key = (
                row_string(row, "collection_name").unwrap_or_default(),
                row_string(row, "doc_id").unwrap_or_default(),
            );
            (key, normalize(row))
        })
        .collect()
}

/// Three-way pick of one value. `None` means both sides changed it differently.
fn pick<'v>(base: Option<&'v Value>, ours: Option<&'v Value>, theirs: Option<&'v Value>) -> Option<Option<&'v Value>> {
    if ours == theirs || theirs == base {
        Some(ours)
    } else if ours == base {
        Some(theirs)
    } else {
        None
    }
}

fn as_object(value: Option<&Value>) -> Row {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => Row::new(),
    }
}

fn merge_fields(base: &Row, ours: &Row, theirs: &Row, prefix: &str, merged: &mut Row, conflicts: &mut Vec<String>) {
    let columns: BTreeSet<&String> = ours.keys().chain(theirs.keys()).chain(base.keys()).collect();
    for column in columns {
        if prefix.is_empty() && column == "metadata" {
            let mut metadata = Row::new();
            merge_fields(
                &as_object(base.get(column)),
                &as_object(ours.get(column)),
                &as_object(theirs.get(column)),
                "metadata.",
                &mut metadata,
                conflicts,
            );
            merged.insert(column.clone(), Value::Object(metadata));
            continue;
        }
        match pick(base.get(column), ours.get(column), theirs.get(column)) {
            Some(Some(value)) => {
                merged.insert(column.clone(), value.clone());
            }
            Some(None) => {}
            None => conflicts.push(format!("{prefix}{column}")),
        }
    }
}

enum Classification {
    Unchanged,
    SourceOnly,
    TargetOnly,
    AutoMergeable(Row),
    Hard(Vec<String>),
}

fn classify(base: Option<&Row>, ours: Option<&Row>, theirs: Option<&Row>) -> Classification {
    if ours == theirs {
        return Classification::Unchanged;
    }
    if ours == base {
        return Classification::SourceOnly;
    }
    if theirs == base {
        return Classification::TargetOnly;
    }
    let (Some(ours), Some(theirs)) = (ours, theirs) else {
        return Classification::Hard(vec!["<row>".to_string()]);
    };
    let empty = Row::new();
    let mut merged = Row::new();
    let mut fields = Vec::new();
    merge_fields(base.unwrap_or(&empty), ours, theirs, "", &mut merged, &mut fields);
    if fields.is_empty() {
        Classification::AutoMergeable(merged)
    } else {
        Classification::Hard(fields)
    }
}

/// Read-only merge analysis.
pub struct ConflictAnalyzer<'a> {
    versioned: &'a dyn VersionedStore,
}

impl<'a> ConflictAnalyzer<'a> {
    #[must_use]
    pub fn new(versioned: &'a dyn VersionedStore) -> Self {
        Self { versioned }
    }

    /// Classify every row that differs between `target` and `source`.
    ///
    /// # Errors
    ///
    /// Returns an error if either ref cannot be read.
    pub fn preview(&self, source: &str, target: &str) -> Result<MergePreview> {
        let merge_base = self.versioned.merge_base(target, source)?;
        let base = match &merge_base {
            Some(hash) => index_rows(&self.versioned.table_rows_at(DOCUMENTS_TABLE, hash)?),
            None => BTreeMap::new(),
        };
        let ours = index_rows(&self.versioned.table_rows_at(DOCUMENTS_TABLE, target)?);
        let theirs = index_rows(&self.versioned.table_rows_at(DOCUMENTS_TABLE, source)?);

        let mut preview = MergePreview {
            source: source.to_string(),
            target: target.to_string(),
            merge_base,
            source_changes: 0,
            target_changes: 0,
            auto_mergeable: Vec::new(),
            conflicts: Vec::new(),
            can_auto_merge: true,
        };

        let keys: BTreeSet<&DocKey> = base.keys().chain(ours.keys()).chain(theirs.keys()).collect();
        for key in keys {
            let (b, o, t) = (base.get(key), ours.get(key), theirs.get(key));
            let (kind, fields, merged) = match classify(b, o, t) {
                Classification::Unchanged => continue,
                Classification::SourceOnly => {
                    preview.source_changes += 1;
                    continue;
                }
                Classification::TargetOnly => {
                    preview.target_changes += 1;
                    continue;
                }
                Classification::AutoMergeable(row) => (ConflictKind::AutoMergeable, Vec::new(), Some(row)),
                Classification::Hard(fields) => (ConflictKind::Hard, fields, None),
            };
            let conflict = MergeConflict {
                conflict_id: conflict_id(&key.0, &key.1),
                collection_name: key.0.clone(),
                doc_id: key.1.clone(),
                kind,
                fields,
                base: b.cloned(),
                ours: o.cloned(),
                theirs: t.cloned(),
                merged,
                resolution_type: None,
                custom_values: None,
            };
            match kind {
                ConflictKind::AutoMergeable => preview.auto_mergeable.push(conflict),
                ConflictKind::Hard => preview.conflicts.push(conflict),
            }
        }
        preview.can_auto_merge = preview.conflicts.is_empty();

        debug!(
            source,
            target,
            source_changes = preview.source_changes,
            target_changes = preview.target_changes,
            auto = preview.auto_mergeable.len(),
            hard = preview.conflicts.len(),
            "Merge preview"
        );
        Ok(preview)
    }
}

/// Attach caller resolutions to the hard conflicts of `preview`.
///
/// With `auto_resolve`, conflicts left without a resolution get `default`.
///
/// # Errors
///
/// - [`Error::Validation`] for an unknown conflict id, a custom resolution
///   without values, or a custom default
/// - [`Error::UnresolvedConflicts`] if conflicts remain unresolved
pub fn apply_resolutions(
    preview: &mut MergePreview,
    resolutions: &[ConflictResolution],
    auto_resolve: bool,
    default: ResolutionType,
) -> Result<()> {
    let mut by_id: HashMap<&str, &ConflictResolution> = HashMap::new();
    for resolution in resolutions {
        if !preview.conflicts.iter().any(|c| c.conflict_id == resolution.conflict_id) {
            return Err(Error::Validation(format!(
                "unknown conflict id '{}'",
                resolution.conflict_id
            )));
        }
        if resolution.resolution == ResolutionType::Custom && resolution.custom_values.is_none() {
            return Err(Error::Validation(format!(
                "custom resolution for '{}' has no values",
                resolution.conflict_id
            )));
        }
        by_id.insert(resolution.conflict_id.as_str(), resolution);
    }
    if auto_resolve && default == ResolutionType::Custom {
        return Err(Error::Validation(
            "default resolution cannot be custom".to_string(),
        ));
    }

    let mut unresolved = Vec::new();
    for conflict in &mut preview.conflicts {
        if let Some(resolution) = by_id.get(conflict.conflict_id.as_str()) {
            conflict.resolution_type = Some(resolution.resolution);
            conflict.custom_values.clone_from(&resolution.custom_values);
        } else if auto_resolve {
            conflict.resolution_type = Some(default);
        } else {
            unresolved.push(conflict.conflict_id.clone());
        }
    }
    if !unresolved.is_empty() {
        return Err(Error::UnresolvedConflicts {
            count: unresolved.len(),
            conflict_ids: unresolved,
        });
    }
    Ok(())
}

/// Final row for a resolved conflict, `None` meaning the row is deleted.
fn resolved_row(conflict: &MergeConflict) -> Option<Row> {
    match conflict.resolution_type {
        Some(ResolutionType::KeepTheirs) => conflict.theirs.clone(),
        Some(ResolutionType::Custom) => {
            let mut row = conflict
                .ours
                .clone()
                .or_else(|| conflict.theirs.clone())
                .or_else(|| conflict.base.clone())
                .unwrap_or_default();
            if let Some(values) = &conflict.custom_values {
                for (column, value) in values {
                    row.insert(column.clone(), value.clone());
                }
            }
            Some(row)
        }
        Some(ResolutionType::KeepOurs) | None => conflict.ours.clone(),
    }
}

/// Storage shape of a normalized row: metadata as JSON text, fresh
/// content hash and timestamps.
fn storage_row(collection: &str, doc_id: &str, mut row: Row) -> Row {
    row.insert("collection_name".to_string(), Value::String(collection.to_string()));
    row.insert("doc_id".to_string(), Value::String(doc_id.to_string()));
    if let Some(Value::Object(metadata)) = row.get("metadata") {
        let text = Value::Object(metadata.clone()).to_string();
        row.insert("metadata".to_string(), Value::String(text));
    }
    let content = row_string(&row, "content").unwrap_or_default();
    row.insert("content_hash".to_string(), Value::String(content_hash(&content)));
    let now = chrono::Utc::now().to_rfc3339();
    row.insert("created_at".to_string(), Value::String(now.clone()));
    row.insert("updated_at".to_string(), Value::String(now));
    row
}

/// Executes merges through the versioned store and reconciles afterwards.
pub struct MergeResolver<'a> {
    versioned: &'a mut dyn VersionedStore,
    documents: &'a mut dyn DocumentStore,
    state: &'a mut StateStore,
    repo_path: &'a str,
    embedding_model: Option<&'a str>,
    batch_size: usize,
}

impl<'a> MergeResolver<'a> {
    #[must_use]
    pub fn new(
        versioned: &'a mut dyn VersionedStore,
        documents: &'a mut dyn DocumentStore,
        state: &'a mut StateStore,
        repo_path: &'a str,
    ) -> Self {
        Self {
            versioned,
            documents,
            state,
            repo_path,
            embedding_model: None,
            batch_size: super::full_sync::DEFAULT_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_embedding_model(mut self, model: Option<&'a str>) -> Self {
        self.embedding_model = model;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Merge `source` into `target` and reconcile the document store.
    ///
    /// The target is checked out first if needed. Resolutions are validated
    /// before anything is written.
    ///
    /// # Errors
    ///
    /// - [`Error::UnresolvedConflicts`] when hard conflicts lack a resolution
    ///   and `auto_resolve` is off; nothing is changed in that case
    /// - [`Error::Validation`] for malformed resolutions
    /// - versioned-store failures tagged with the merge or switch step
    pub fn execute(
        &mut self,
        source: &str,
        target: &str,
        resolutions: &[ConflictResolution],
        auto_resolve: bool,
        default: ResolutionType,
    ) -> Result<MergeReport> {
        let mut preview = ConflictAnalyzer::new(&*self.versioned)
            .preview(source, target)
            .map_err(|e| e.at(Step::Merge))?;
        apply_resolutions(&mut preview, resolutions, auto_resolve, default)?;

        if self.versioned.current_branch().map_err(|e| e.at(Step::Check))? != target {
            self.versioned
                .checkout(target, false)
                .map_err(|e| e.at(Step::Switch))?;
        }

        let message = format!("Merge branch '{source}' into {target}");
        let outcome = self
            .versioned
            .merge(source, &message, true)
            .map_err(|e| e.at(Step::Merge))?;

        let mut hash = outcome.hash.clone();
        let mut resolved = Vec::new();
        if !outcome.up_to_date && !outcome.fast_forward {
            self.write_merge_result(&outcome.conflicted_tables, &preview)
                .map_err(|e| e.at(Step::Merge))?;
            resolved = preview
                .conflicts
                .iter()
                .filter_map(|c| c.resolution_type.map(|r| (c.conflict_id.clone(), r)))
                .collect();

            let status = self.versioned.status().map_err(|e| e.at(Step::Merge))?;
            if outcome.pending_commit || !status.is_clean() {
                self.versioned.add_all().map_err(|e| e.at(Step::Commit))?;
                hash = Some(
                    self.versioned
                        .commit(&message)
                        .map_err(|e| e.at(Step::Commit))?
                        .hash,
                );
            }
        }

        let reconcile = CheckoutReconciler::new(
            &mut *self.versioned,
            &mut *self.documents,
            &mut *self.state,
            self.repo_path,
        )
        .with_embedding_model(self.embedding_model)
        .with_batch_size(self.batch_size)
        .reconcile(target, false, true)?;

        info!(
            source,
            target,
            hash = hash.as_deref().unwrap_or(""),
            auto_merged = preview.auto_mergeable.len(),
            resolved = resolved.len(),
            "Merge executed"
        );
        Ok(MergeReport {
            source: source.to_string(),
            target: target.to_string(),
            up_to_date: outcome.up_to_date,
            fast_forward: outcome.fast_forward,
            hash,
            auto_merged: preview.auto_mergeable.len(),
            resolved,
            reconcile,
        })
    }

    fn write_merge_result(&mut self, conflicted_tables: &[String], preview: &MergePreview) -> Result<()> {
        for table in conflicted_tables {
            self.versioned.mark_resolved(table)?;
        }
        let dialect = self.versioned.dialect();
        let finals = preview
            .auto_mergeable
            .iter()
            .map(|c| (c, c.merged.clone()))
            .chain(preview.conflicts.iter().map(|c| (c, resolved_row(c))));
        for (conflict, row) in finals {
            let statement = match row {
                Some(row) => sql::replace_row(
                    dialect,
                    DOCUMENTS_TABLE,
                    &storage_row(&conflict.collection_name, &conflict.doc_id, row),
                ),
                None => {
                    let mut key = Row::new();
                    key.insert("doc_id".to_string(), Value::String(conflict.doc_id.clone()));
                    key.insert(
                        "collection_name".to_string(),
                        Value::String(conflict.collection_name.clone()),
                    );
                    sql::delete_row(dialect, DOCUMENTS_TABLE, &key)
                }
            };
            self.versioned.execute(&statement)?;
        }
        Ok(())
    }
}
