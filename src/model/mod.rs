//! Data model types.
//!
//! These are the typed records the sync core manipulates. Raw store rows and
//! entries are converted into these at the store boundary.

pub mod collection;
pub mod document;

pub use collection::{CollectionInfo, VersionedCollection};
pub use document::{
    document_id_of, group_entries, row_count, row_metadata, row_string, user_metadata,
    ChangeFlag, DocumentRecord, Metadata, StoreEntry, VersionedDocument,
};
