//! Document command implementations.
//!
//! Writes go through the manager so they are flagged (or tracked) as local
//! changes for the next commit.

use colored::Colorize;
use serde::Serialize;

use super::{parse_metadata, print_json, Manager};
use crate::cli::DocCommands;
use crate::docstore::{load_records, DocumentStore};
use crate::error::Result;
use crate::sync::NewDocument;

#[derive(Serialize)]
struct DocWriteOutput<'a> {
    collection: &'a str,
    ids: &'a [String],
    action: &'static str,
}

#[derive(Serialize)]
struct DocListItem {
    id: String,
    title: Option<String>,
    content_hash: String,
    chunks: usize,
    local_change: bool,
}

/// Execute document commands.
///
/// # Errors
///
/// Returns an error for invalid input or a failing document store.
pub fn execute(manager: &mut Manager, command: &DocCommands, json: bool) -> Result<()> {
    match command {
        DocCommands::Add {
            collection,
            id,
            content,
            metadata,
        } => {
            let doc = NewDocument {
                id: id.clone(),
                content: content.clone(),
                metadata: parse_metadata(metadata.as_deref())?,
            };
            manager.add_documents(collection, &[doc])?;
            report(collection, std::slice::from_ref(id), "added", json)
        }
        DocCommands::Update {
            collection,
            id,
            content,
        } => {
            let ids = std::slice::from_ref(id);
            manager.update_documents(collection, ids, Some(std::slice::from_ref(content)), None)?;
            report(collection, ids, "updated", json)
        }
        DocCommands::Delete { collection, ids } => {
            manager.delete_documents(collection, ids)?;
            report(collection, ids, "deleted", json)
        }
        DocCommands::List { collection } => list(manager, collection, json),
        DocCommands::Search {
            collection,
            query,
            limit,
        } => search(manager, collection, query, *limit, json),
    }
}

fn report(collection: &str, ids: &[String], action: &'static str, json: bool) -> Result<()> {
    if json {
        return print_json(&DocWriteOutput {
            collection,
            ids,
            action,
        });
    }
    for id in ids {
        println!("{action} {collection}/{id}");
    }
    Ok(())
}

fn list(manager: &Manager, collection: &str, json: bool) -> Result<()> {
    let items: Vec<DocListItem> = load_records(manager.documents(), collection)?
        .into_iter()
        .map(|r| DocListItem {
            local_change: r.change_flag.is_dirty(),
            id: r.id,
            title: r.title,
            content_hash: r.content_hash,
            chunks: r.chunk_count,
        })
        .collect();
    if json {
        return print_json(&items);
    }
    if items.is_empty() {
        println!("{}", format!("No documents in {collection}.").as_str().dimmed());
        return Ok(());
    }
    for item in &items {
        let marker = if item.local_change { "*".yellow() } else { " ".normal() };
        println!(
            "{marker} {:<32} {}  {}",
            item.id,
            &item.content_hash[..item.content_hash.len().min(12)],
            item.title.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn search(manager: &Manager, collection: &str, query: &str, limit: usize, json: bool) -> Result<()> {
    let hits = manager.documents().query_documents(collection, query, limit)?;
    if json {
        return print_json(&hits);
    }
    for hit in &hits {
        let preview: String = hit.entry.content.chars().take(60).collect();
        println!("{:.2}  {:<32} {}", hit.score, hit.entry.id, preview.dimmed());
    }
    Ok(())
}
