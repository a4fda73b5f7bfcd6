//! Plinth SQL - structured statement model, driver seam, and reference driver.
//!
//! This crate defines the relational surface the Plinth engine talks to:
//! runtime values and rows, filter trees, select/insert/update/delete
//! statements with projection expressions, table DDL, the
//! [`Driver`]/[`DriverTransaction`] traits, and an in-memory driver that
//! implements the whole seam for tests and embedded use.

pub mod driver;
pub mod error;
pub mod filter;
pub mod memory;
pub mod statement;
pub mod value;

pub use driver::{Driver, DriverTransaction};
pub use error::{Error, Result};
pub use filter::{like_match, Filter};
pub use memory::MemoryDriver;
pub use statement::{
    AggregateFunc, ColumnDef, ColumnRef, ColumnType, ConflictAction, Delete, Direction, Expr,
    IndexDef, Insert, Join, JoinKind, JoinOn, OnConflict, OrderSpec, Reference, Select,
    SelectColumn, TableDef, Update,
};
pub use value::{Row, Value};
