//! Collection command implementations.

use serde::Serialize;

use super::{parse_metadata, print_json, Manager};
use crate::cli::CollectionCommands;
use crate::docstore::DocumentStore;
use crate::error::Result;
use crate::model::Metadata;

#[derive(Serialize)]
struct CollectionListItem {
    name: String,
    entries: usize,
    metadata: Metadata,
}

/// Execute collection commands.
///
/// # Errors
///
/// Returns an error for invalid names or a failing document store.
pub fn execute(manager: &mut Manager, command: &CollectionCommands, json: bool) -> Result<()> {
    let (action, name) = match command {
        CollectionCommands::List => return list(manager, json),
        CollectionCommands::Create { name, metadata } => {
            manager.create_collection(name, &parse_metadata(metadata.as_deref())?)?;
            ("created", name.clone())
        }
        CollectionCommands::Delete { name } => {
            manager.delete_collection(name)?;
            ("deleted", name.clone())
        }
        CollectionCommands::Rename { old_name, new_name } => {
            manager.rename_collection(old_name, new_name)?;
            ("renamed", format!("{old_name} -> {new_name}"))
        }
        CollectionCommands::SetMetadata { name, metadata } => {
            manager.update_collection_metadata(name, &parse_metadata(Some(metadata))?)?;
            ("updated", name.clone())
        }
    };

    if json {
        return print_json(&serde_json::json!({ "action": action, "collection": name }));
    }
    println!("{action} collection {name}");
    Ok(())
}

fn list(manager: &Manager, json: bool) -> Result<()> {
    let documents = manager.documents();
    let mut items = Vec::new();
    for info in documents.list_collections()? {
        items.push(CollectionListItem {
            entries: documents.get_document_count(&info.name)?,
            name: info.name,
            metadata: info.metadata,
        });
    }
    if json {
        return print_json(&items);
    }
    for item in &items {
        println!("{:<32} {:>6} entries", item.name, item.entries);
    }
    Ok(())
}
