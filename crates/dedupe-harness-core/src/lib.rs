//! # Dedupe Harness Core
//!
//! Shared, I/O-free logic for Dedupe Harness: the document and merge
//! data model, the similarity engine, relationship planning, undo
//! validation, and the storage traits the application implements.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Everything that touches a network or a disk
//! lives in the `dedupe-harness` app crate.

pub mod embedding;
pub mod error;
pub mod models;
pub mod relationships;
pub mod similarity;
pub mod store;
pub mod undo;
