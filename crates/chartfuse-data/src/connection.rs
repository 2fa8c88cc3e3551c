//! The `Connection` trait: uniform access to named tabular sources.
//!
//! The evaluator only ever talks to a `dyn Connection`. Optional capabilities
//! (registering in-memory data) default to `OperationNotSupported`, which the
//! evaluator treats as a signal to use its default engine when
//! [`Connection::fallback`] allows it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{DataError, DataResult};
use crate::query::{Query, QueryOp};
use crate::schema::Schema;
use crate::table::Table;

#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Stable identifier for logs and diagnostics.
    fn id(&self) -> String;

    /// Whether the evaluator may substitute its default engine for
    /// operations this backend cannot express.
    fn fallback(&self) -> bool {
        true
    }

    /// Whether every call must run on one dedicated execution context.
    fn main_thread(&self) -> bool {
        false
    }

    /// Whether `op` can be pushed into a query against this backend.
    fn supports(&self, _op: &QueryOp) -> bool {
        true
    }

    /// Enumerate queryable tables and their schemas.
    async fn tables(&self) -> DataResult<HashMap<String, Schema>>;

    /// Run `query`; the result must be compatible with `expected`.
    async fn fetch_query(&self, query: &Query, expected: &Schema) -> DataResult<Table>;

    async fn register_table(&self, _name: &str, _table: Table, _temporary: bool) -> DataResult<()> {
        Err(DataError::not_supported(format!(
            "{} cannot register arrow tables",
            self.id()
        )))
    }

    async fn register_csv(&self, _name: &str, _csv: &str, _temporary: bool) -> DataResult<()> {
        Err(DataError::not_supported(format!(
            "{} cannot register csv data",
            self.id()
        )))
    }

    async fn register_json(&self, _name: &str, _json: &Value, _temporary: bool) -> DataResult<()> {
        Err(DataError::not_supported(format!(
            "{} cannot register json data",
            self.id()
        )))
    }

    async fn register_parquet(&self, _name: &str, _bytes: &[u8], _temporary: bool) -> DataResult<()> {
        Err(DataError::not_supported(format!(
            "{} cannot register parquet data",
            self.id()
        )))
    }

    /// Remove a registered table. No-op if absent.
    async fn unregister(&self, _name: &str) -> DataResult<()> {
        Ok(())
    }
}
