//! Core functionality module
//!
//! Configuration, errors, local storage, the export ledger and the poll
//! loop that moves files from the camera to disk.
//!
//! # Submodules
//!
//! - `config` - Configuration loading, saving, and management
//! - `error` - Error types and result aliases
//! - `exporter` - Poll loop and per-file commit/rollback
//! - `sink` - Local destination storage
//! - `tracking` - Export ledger (cycle history and committed files)

pub mod config;
pub mod error;
pub mod exporter;
pub mod sink;
pub mod tracking;
