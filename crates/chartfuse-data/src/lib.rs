//! chartfuse-data: tabular data layer for chartfuse
//!
//! This crate owns everything the evaluator needs to know about data:
//! table values, their schemas and Arrow encodings, the relational query
//! plans transforms compile to, and the `Connection` abstraction queries
//! run against.
//!
//! ## Layer 0 - Data
//!
//! Focus: schema fidelity, backend capability reporting, and a default
//! engine for everything a backend cannot do itself.
//!
//! ## Key Components
//!
//! - `Table` / `Schema`: materialized data and its column types
//! - `Query` / `QueryOp` / `ScalarExpr`: backend-neutral query plans
//! - `exec`: the default engine, ordering rows with Arrow sort kernels
//! - `Connection`: async interface with `fallback` and `main_thread` flags
//! - `MemoryConnection`, `SqlConnection`, `SerializedConnection`: the
//!   concrete implementations

mod columnar;
pub mod connection;
mod error;
pub mod exec;
mod ipc;
pub mod memory;
pub mod query;
mod schema;
pub mod serialized;
pub mod sql;
mod table;
pub mod timeunit;
pub mod value;

pub use connection::Connection;
pub use error::{DataError, DataResult};
pub use memory::MemoryConnection;
pub use query::{
    Aggregate, AggregateOp, BinaryOp, Projection, Query, QueryOp, ScalarExpr, ScalarFn, SortKey,
    SortOrder, StackOffset, UnaryOp, WindowColumn, WindowOp,
};
pub use schema::{DataType, Field, Schema};
pub use serialized::SerializedConnection;
pub use sql::{SqlConnection, SqlDialect, SqlExecutor};
pub use table::{Row, Table};
pub use timeunit::TimeUnit;
