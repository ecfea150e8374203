//! branchsync - branch-aware sync between a document store and a versioned
//! SQL store.
//!
//! This crate provides the core functionality for the `bsync` CLI tool.
//!
//! # Architecture
//!
//! - [`cli`] - Command-line interface using clap
//! - [`config`] - Configuration resolution (flags, env, config files)
//! - [`docstore`] - Document store trait and embedded SQLite implementation
//! - [`versioned`] - Versioned store trait, Dolt CLI wrapper and embedded snapshot store
//! - [`storage`] - Local sync state database (baselines, tracked deletions, events)
//! - [`sync`] - Change detection, commit, checkout reconciliation and merge
//! - [`model`] - Typed records for documents and collections
//! - [`validate`] - Input validation and synonym normalization
//! - [`error`] - Error types and handling

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod docstore;
pub mod error;
pub mod model;
pub mod storage;
pub mod sync;
pub mod validate;
pub mod versioned;

pub use error::{Error, Result};
