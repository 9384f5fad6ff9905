//! Core types shared by every stage of the pipeline.
//!
//! - [`schema`]: table identifiers, column metadata, identifier quoting
//! - [`value`]: typed cell values and row batches

pub mod schema;
pub mod value;

pub use schema::{quote_mssql, quote_pg, validate_identifier, Column, TableRef, TargetColumn};
pub use value::{Batch, SqlNullType, SqlValue};
