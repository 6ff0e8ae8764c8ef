//! # signalk-core
//!
//! Core SignalK data model and full-model aggregator.
//!
//! This crate provides:
//! - Data model types (Delta, Update, Source, Meta, etc.)
//! - Path parsing and wildcard matching
//! - Source ids and the source registry
//! - The full-model aggregator ([`FullSignalK`])
//! - Settings storage
//!
//! This crate is intentionally runtime-agnostic and contains no async code.

pub mod config;
pub mod meta;
pub mod model;
pub mod path;
pub mod sources;
pub mod store;

pub use model::*;
pub use path::{Path, PathError, PathPattern};
pub use sources::{get_source_id, SourceRegistry, NO_SOURCE};
pub use store::{FullSignalK, SignalKStore};
