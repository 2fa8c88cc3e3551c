//! Dataset pipelines.
//!
//! Consecutive relational steps are collected and sent to the connection
//! as one query. Local steps (extent, sequence, pivot) force the pending
//! query to run first. Materialized inputs reach the connection as
//! temporary tables.

use std::collections::HashMap;
use std::sync::Arc;

use chartfuse_data::{exec, Connection, DataError, Query, QueryOp, Schema, Table};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{ChartError, Result};
use crate::expr::ExprEnv;
use crate::graph::{DataSource, DatasetTask};
use crate::metrics::METRICS;
use crate::spec::TransformSpec;
use crate::transform::{field_extent, Step};
use crate::value::{NodeValue, TaskValue};
use crate::warning::Warning;

use super::EvalSettings;

/// Where the rows of the pipeline currently live.
enum Base {
    Table(Table),
    /// A connection table not yet read.
    Remote { table: String, schema: Schema },
}

struct Pipeline<'a> {
    dataset: &'a str,
    connection: &'a Arc<dyn Connection>,
    base: Base,
    pending: Vec<QueryOp>,
    warnings: Vec<Warning>,
}

pub(super) async fn evaluate(
    dataset: &str,
    task: &DatasetTask,
    mut signals: HashMap<String, Value>,
    datasets: HashMap<String, Table>,
    parent: Option<Table>,
    connection: &Arc<dyn Connection>,
    settings: &EvalSettings,
) -> Result<NodeValue> {
    let base = match &task.source {
        DataSource::Values { values, format } => Base::Table(values_table(values, format.as_ref())?),
        DataSource::Inline(name) => Base::Table(settings.inline.get(name).cloned().ok_or_else(|| {
            ChartError::invalid_spec(format!(
                "inline dataset '{name}' referenced by '{dataset}' was not provided"
            ))
        })?),
        DataSource::Url(table) => {
            let schema = connection
                .tables()
                .await?
                .remove(table)
                .ok_or_else(|| DataError::TableNotFound(table.clone()))?;
            Base::Remote {
                table: table.clone(),
                schema,
            }
        }
        DataSource::Parent => Base::Table(parent.ok_or_else(|| {
            ChartError::internal(format!("dataset '{dataset}' has no evaluated parent"))
        })?),
        DataSource::Empty => Base::Table(Table::from_rows(Vec::new())),
    };

    let mut pipeline = Pipeline {
        dataset,
        connection,
        base,
        pending: Vec::new(),
        warnings: Vec::new(),
    };
    let mut outputs = Vec::new();

    for tx in &task.transforms {
        let TransformSpec::Supported(tx) = tx else {
            return Err(ChartError::UnsupportedTransform {
                dataset: dataset.to_string(),
                transform: tx.kind().to_string(),
            });
        };
        let plan = {
            let env = ExprEnv {
                signals: &signals,
                datasets: &datasets,
                local_tz: &settings.local_tz,
                default_input_tz: &settings.default_input_tz,
            };
            tx.plan(&env)?
        };
        for (name, value) in plan.signals {
            outputs.push(TaskValue::Scalar(value.clone()));
            signals.insert(name, value);
        }
        match plan.step {
            Step::Ops(ops) => pipeline.pending.extend(ops),
            Step::Extent { field, signal } => {
                let table = pipeline.flush().await?;
                let extent = field_extent(&table, &field);
                if let Some(name) = signal {
                    outputs.push(TaskValue::Scalar(extent.clone()));
                    signals.insert(name, extent);
                }
                pipeline.base = Base::Table(table);
            }
            Step::Generate(table) => {
                pipeline.pending.clear();
                pipeline.base = Base::Table(table);
            }
            Step::Local(op) => {
                let table = pipeline.flush().await?;
                pipeline.base = Base::Table(exec::apply(&table, &op)?);
            }
        }
    }

    let table = pipeline.flush().await?;
    debug!(dataset, rows = table.num_rows(), "dataset evaluated");
    Ok(NodeValue {
        value: TaskValue::Table(table),
        outputs,
        warnings: pipeline.warnings,
    })
}

/// Literal `values`, honoring a `csv` or `json` format for string payloads.
fn values_table(values: &Value, format: Option<&Value>) -> Result<Table> {
    let format_type = format
        .and_then(|f| f.get("type"))
        .and_then(Value::as_str)
        .unwrap_or("json");
    let table = match (values, format_type) {
        (Value::String(text), "csv") => Table::from_csv_str(text)?,
        (Value::String(text), _) => Table::from_json(&serde_json::from_str(text)?)?,
        (Value::Array(_), _) => Table::from_json(values)?,
        (Value::Object(_), _) => Table::from_json(&Value::Array(vec![values.clone()]))?,
        (other, _) => {
            return Err(ChartError::invalid_spec(format!(
                "dataset values must be rows, found {other}"
            )))
        }
    };
    Ok(table)
}

impl Pipeline<'_> {
    /// Run the pending ops and return the resulting table.
    async fn flush(&mut self) -> Result<Table> {
        let ops = std::mem::take(&mut self.pending);
        let base = std::mem::replace(&mut self.base, Base::Table(Table::from_rows(Vec::new())));

        if let Some(op) = ops.iter().find(|op| !self.connection.supports(op)) {
            let reason = format!("{} cannot run '{}'", self.connection.id(), op.name());
            let table = self.materialize(base).await?;
            return self.fallback(&table, &ops, reason);
        }

        match base {
            Base::Table(table) if ops.is_empty() => Ok(table),
            Base::Remote { table, schema } => {
                let query = Query { table, ops };
                match self.fetch(&query, &schema).await {
                    Err(ChartError::Connection(e)) if e.is_not_supported() => {
                        let input = self.fetch(&Query::scan(query.table.clone()), &schema).await?;
                        self.fallback(&input, &query.ops, e)
                    }
                    other => other,
                }
            }
            Base::Table(table) => {
                let name = format!("_cf_tmp_{}", Uuid::new_v4().simple());
                if let Err(e) = self
                    .connection
                    .register_table(&name, table.clone(), true)
                    .await
                {
                    if e.is_not_supported() {
                        return self.fallback(&table, &ops, e);
                    }
                    return Err(e.into());
                }
                let query = Query { table: name.clone(), ops };
                let result = self.fetch(&query, table.schema()).await;
                if let Err(e) = self.connection.unregister(&name).await {
                    warn!(table = %name, error = %e, "failed to unregister temporary table");
                }
                match result {
                    Err(ChartError::Connection(e)) if e.is_not_supported() => {
                        self.fallback(&table, &query.ops, e)
                    }
                    other => other,
                }
            }
        }
    }

    async fn fetch(&self, query: &Query, input: &Schema) -> Result<Table> {
        let expected = query.output_schema(input)?;
        METRICS.inc_connection_queries();
        Ok(self.connection.fetch_query(query, &expected).await?)
    }

    async fn materialize(&self, base: Base) -> Result<Table> {
        match base {
            Base::Table(table) => Ok(table),
            Base::Remote { table, schema } => self.fetch(&Query::scan(table), &schema).await,
        }
    }

    fn fallback(
        &mut self,
        table: &Table,
        ops: &[QueryOp],
        reason: impl std::fmt::Display,
    ) -> Result<Table> {
        if !self.connection.fallback() {
            return Err(ChartError::UnsupportedTransform {
                dataset: self.dataset.to_string(),
                transform: ops.first().map_or("query", QueryOp::name).to_string(),
            });
        }
        warn!(dataset = %self.dataset, %reason, "evaluating with the default engine");
        METRICS.inc_fallback_evaluations();
        self.warnings.push(Warning::fallback(self.dataset, &reason));
        Ok(exec::execute(table, ops)?)
    }
}
