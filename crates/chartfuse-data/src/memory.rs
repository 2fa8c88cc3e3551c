//! In-memory connection backed by the default engine.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::connection::Connection;
use crate::error::{DataError, DataResult};
use crate::exec;
use crate::query::Query;
use crate::schema::Schema;
use crate::table::Table;

struct Registered {
    table: Table,
    temporary: bool,
}

/// Connection over tables held in process memory.
///
/// Supports every [`crate::QueryOp`]; Parquet registration is not supported.
pub struct MemoryConnection {
    tables: RwLock<HashMap<String, Registered>>,
    main_thread: bool,
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            main_thread: false,
        }
    }

    /// Report the `main_thread` capability, forcing callers to serialize access.
    pub fn with_main_thread(mut self, main_thread: bool) -> Self {
        self.main_thread = main_thread;
        self
    }

    /// Register a permanent table, replacing any table of the same name.
    pub async fn insert(&self, name: impl Into<String>, table: Table) {
        self.tables.write().await.insert(
            name.into(),
            Registered {
                table,
                temporary: false,
            },
        );
    }

    /// Drop every table registered as temporary.
    pub async fn drop_temporary(&self) {
        self.tables.write().await.retain(|_, r| !r.temporary);
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tables.read().await.is_empty()
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn id(&self) -> String {
        "memory".to_string()
    }

    fn main_thread(&self) -> bool {
        self.main_thread
    }

    async fn tables(&self) -> DataResult<HashMap<String, Schema>> {
        Ok(self
            .tables
            .read()
            .await
            .iter()
            .map(|(name, r)| (name.clone(), r.table.schema().clone()))
            .collect())
    }

    async fn fetch_query(&self, query: &Query, expected: &Schema) -> DataResult<Table> {
        let source = {
            let tables = self.tables.read().await;
            tables
                .get(&query.table)
                .map(|r| r.table.clone())
                .ok_or_else(|| DataError::TableNotFound(query.table.clone()))?
        };
        let result = exec::execute(&source, &query.ops)?;
        expected.check_compatible(result.schema())?;
        tracing::debug!(table = %query.table, ops = query.ops.len(), rows = result.num_rows(), "memory query");
        Ok(result)
    }

    async fn register_table(&self, name: &str, table: Table, temporary: bool) -> DataResult<()> {
        self.tables
            .write()
            .await
            .insert(name.to_string(), Registered { table, temporary });
        Ok(())
    }

    async fn register_csv(&self, name: &str, csv: &str, temporary: bool) -> DataResult<()> {
        let table = Table::from_csv_str(csv)?;
        self.register_table(name, table, temporary).await
    }

    async fn register_json(&self, name: &str, json: &Value, temporary: bool) -> DataResult<()> {
        let table = Table::from_json(json)?;
        self.register_table(name, table, temporary).await
    }

    async fn unregister(&self, name: &str) -> DataResult<()> {
        self.tables.write().await.remove(name);
        Ok(())
    }
}
