//! Core engine for the Simple Data Transfer Protocol table server.
//!
//! This crate provides the pieces needed to expose heterogeneous tabular data
//! behind one query surface:
//!
//! - A typed column schema shared by every table (`schema` module) and the
//!   scalar `Value` model rows are made of (`value` module).
//! - A small, closed filter language with six constructors, a parser that
//!   accepts the JSON form and the constructor-call form, a validator and a
//!   pure evaluator (`filter` module).
//! - The `Table` trait and its backends: in-memory rows, Arrow-backed
//!   columnar frames, remote SQL warehouse tables and lazily loaded blob
//!   tables (`table` module).
//! - A registry mapping descriptor type tags to factories and table names to
//!   live tables, safe for concurrent readers (`registry` module).
//! - Descriptor persistence to a blob store with a typed naming convention,
//!   startup loading and the upload flow (`blob`, `sync`, `loader`, `upload`
//!   modules).
//!
//! Front ends (HTTP servers, the `sdtp` CLI) depend on this crate and pass an
//! explicitly constructed [`registry::TableRegistry`] to their handlers.
#![deny(missing_docs)]

pub mod blob;
pub mod config;
pub mod descriptor;
pub mod filter;
pub mod loader;
pub mod query;
pub mod registry;
pub mod retry;
pub mod schema;
pub mod storage;
pub mod sync;
pub mod table;
pub mod upload;
pub mod value;

pub use descriptor::{TableBody, TableDescriptor};
pub use filter::{FilterResolution, FilterSpec};
pub use registry::{RegistryError, TableRegistry};
pub use schema::{ColumnDescriptor, ColumnType, Schema, SchemaError};
pub use table::{Row, Table, TableError};
pub use value::Value;
