//! SQL-engine connections.
//!
//! [`SqlConnection`] renders a [`Query`] as generic SQL using a
//! [`SqlDialect`] capability table and hands the text to a [`SqlExecutor`]
//! supplied by the embedding application (a database client, an embedded
//! engine, ...). Operators the dialect cannot express are reported through
//! [`Connection::supports`] and rejected with `OperationNotSupported`.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde_json::Value;

use crate::connection::Connection;
use crate::error::{DataError, DataResult};
use crate::query::{
    Aggregate, AggregateOp, BinaryOp, Query, QueryOp, ScalarExpr, ScalarFn, SortOrder, UnaryOp,
};
use crate::schema::{DataType, Schema};
use crate::table::Table;

/// What a SQL engine can express.
#[derive(Debug, Clone)]
pub struct SqlDialect {
    pub name: String,
    pub quote: char,
    pub functions: BTreeSet<ScalarFn>,
    pub aggregates: BTreeSet<AggregateOp>,
    pub window_functions: bool,
}

impl SqlDialect {
    /// ANSI-flavoured dialect with the common numeric and string functions.
    pub fn generic() -> Self {
        use ScalarFn::*;
        Self {
            name: "generic".to_string(),
            quote: '"',
            functions: [
                IsValid, IsFinite, IsNaN, Abs, Ceil, Floor, Round, Sqrt, Log, Exp, Pow, Min, Max,
                Length, Lower, Upper,
            ]
            .into_iter()
            .collect(),
            aggregates: [
                AggregateOp::Count,
                AggregateOp::Valid,
                AggregateOp::Missing,
                AggregateOp::Distinct,
                AggregateOp::Sum,
                AggregateOp::Mean,
                AggregateOp::Average,
                AggregateOp::Min,
                AggregateOp::Max,
            ]
            .into_iter()
            .collect(),
            window_functions: true,
        }
    }

    /// Enable date functions (`toDate` and the date parts).
    pub fn with_date_functions(mut self) -> Self {
        use ScalarFn::*;
        self.functions
            .extend([ToDate, Year, Month, Date, Day, Hours, Minutes, Seconds]);
        self
    }

    pub fn quote_ident(&self, ident: &str) -> String {
        let q = self.quote;
        let escaped = ident.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    fn supports_expr(&self, expr: &ScalarExpr) -> bool {
        fn literals_ok(expr: &ScalarExpr) -> bool {
            match expr {
                ScalarExpr::Literal(v) => !matches!(v, Value::Array(_) | Value::Object(_)),
                ScalarExpr::Column(_) => true,
                ScalarExpr::Unary { expr, .. } => literals_ok(expr),
                ScalarExpr::Binary { left, right, .. } => literals_ok(left) && literals_ok(right),
                ScalarExpr::Conditional {
                    test,
                    consequent,
                    alternate,
                } => literals_ok(test) && literals_ok(consequent) && literals_ok(alternate),
                ScalarExpr::Call { args, .. } => args.iter().all(literals_ok),
            }
        }
        expr.functions().iter().all(|f| self.functions.contains(f)) && literals_ok(expr)
    }

    fn supports_aggregates(&self, aggregates: &[Aggregate]) -> bool {
        aggregates.iter().all(|a| self.aggregates.contains(&a.op))
    }

    /// Whether `op` can be rendered in this dialect.
    pub fn supports(&self, op: &QueryOp) -> bool {
        match op {
            QueryOp::Filter(expr) | QueryOp::Formula { expr, .. } => self.supports_expr(expr),
            QueryOp::Aggregate { aggregates, .. } => self.supports_aggregates(aggregates),
            QueryOp::JoinAggregate { aggregates, .. } => {
                self.window_functions && self.supports_aggregates(aggregates)
            }
            QueryOp::Sort(_) | QueryOp::Project(_) | QueryOp::Limit(_) => true,
            // reshaping and calendar ops run in the default engine
            QueryOp::Window { .. }
            | QueryOp::Stack { .. }
            | QueryOp::Pivot { .. }
            | QueryOp::Fold { .. }
            | QueryOp::Impute { .. }
            | QueryOp::TimeUnit { .. } => false,
        }
    }
}

impl Query {
    /// Render as a single SQL statement of nested sub-selects.
    pub fn to_sql(&self, dialect: &SqlDialect, input: &Schema) -> DataResult<String> {
        let mut sql = format!("SELECT * FROM {}", dialect.quote_ident(&self.table));
        let mut schema = input.clone();
        for (i, op) in self.ops.iter().enumerate() {
            if !dialect.supports(op) {
                return Err(DataError::not_supported(format!(
                    "{} cannot be expressed in the {} dialect",
                    op.name(),
                    dialect.name
                )));
            }
            let from = format!("({sql}) AS _t{i}");
            sql = render_op(op, &from, &schema, dialect)?;
            schema = op.output_schema(&schema);
        }
        Ok(sql)
    }
}

fn render_op(op: &QueryOp, from: &str, schema: &Schema, d: &SqlDialect) -> DataResult<String> {
    let q = |s: &str| d.quote_ident(s);
    Ok(match op {
        QueryOp::Filter(expr) => {
            format!("SELECT * FROM {from} WHERE {}", render_expr(expr, schema, d)?)
        }
        QueryOp::Formula { expr, alias } => {
            let mut cols: Vec<String> = schema
                .names()
                .filter(|n| n != alias)
                .map(|n| q(n))
                .collect();
            cols.push(format!("{} AS {}", render_expr(expr, schema, d)?, q(alias)));
            format!("SELECT {} FROM {from}", cols.join(", "))
        }
        QueryOp::Aggregate {
            groupby,
            aggregates,
        } => {
            let mut cols: Vec<String> = groupby.iter().map(|g| q(g)).collect();
            for agg in aggregates {
                cols.push(format!("{} AS {}", render_aggregate(agg, d), q(&agg.alias)));
            }
            let mut sql = format!("SELECT {} FROM {from}", cols.join(", "));
            if !groupby.is_empty() {
                let keys: Vec<String> = groupby.iter().map(|g| q(g)).collect();
                sql.push_str(&format!(" GROUP BY {}", keys.join(", ")));
            }
            sql
        }
        QueryOp::JoinAggregate {
            groupby,
            aggregates,
        } => {
            let aliases: BTreeSet<&str> = aggregates.iter().map(|a| a.alias.as_str()).collect();
            let mut cols: Vec<String> = schema
                .names()
                .filter(|n| !aliases.contains(n))
                .map(|n| q(n))
                .collect();
            let window = if groupby.is_empty() {
                "OVER ()".to_string()
            } else {
                let keys: Vec<String> = groupby.iter().map(|g| q(g)).collect();
                format!("OVER (PARTITION BY {})", keys.join(", "))
            };
            for agg in aggregates {
                cols.push(format!(
                    "{} {window} AS {}",
                    render_aggregate(agg, d),
                    q(&agg.alias)
                ));
            }
            format!("SELECT {} FROM {from}", cols.join(", "))
        }
        QueryOp::Sort(keys) => {
            let keys: Vec<String> = keys
                .iter()
                .map(|k| match k.order {
                    SortOrder::Ascending => format!("{} ASC NULLS LAST", q(&k.field)),
                    SortOrder::Descending => format!("{} DESC NULLS FIRST", q(&k.field)),
                })
                .collect();
            format!("SELECT * FROM {from} ORDER BY {}", keys.join(", "))
        }
        QueryOp::Project(projections) => {
            let cols: Vec<String> = projections
                .iter()
                .map(|p| {
                    if schema.field(&p.field).is_some() {
                        format!("{} AS {}", q(&p.field), q(&p.alias))
                    } else {
                        format!("NULL AS {}", q(&p.alias))
                    }
                })
                .collect();
            format!("SELECT {} FROM {from}", cols.join(", "))
        }
        QueryOp::Limit(n) => format!("SELECT * FROM {from} LIMIT {n}"),
        QueryOp::Window { .. }
        | QueryOp::Stack { .. }
        | QueryOp::Pivot { .. }
        | QueryOp::Fold { .. }
        | QueryOp::Impute { .. }
        | QueryOp::TimeUnit { .. } => {
            return Err(DataError::not_supported(format!("{} has no SQL rendering", op.name())))
        }
    })
}

fn render_aggregate(agg: &Aggregate, d: &SqlDialect) -> String {
    let field = agg
        .field
        .as_deref()
        .map(|f| d.quote_ident(f))
        .unwrap_or_else(|| "NULL".to_string());
    match agg.op {
        AggregateOp::Count => "COUNT(*)".to_string(),
        AggregateOp::Valid => format!("COUNT({field})"),
        AggregateOp::Missing => format!("(COUNT(*) - COUNT({field}))"),
        AggregateOp::Distinct => format!("COUNT(DISTINCT {field})"),
        AggregateOp::Sum => format!("SUM({field})"),
        AggregateOp::Mean | AggregateOp::Average => format!("AVG({field})"),
        AggregateOp::Min => format!("MIN({field})"),
        AggregateOp::Max => format!("MAX({field})"),
    }
}

fn render_literal(value: &Value) -> DataResult<String> {
    Ok(match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => {
            return Err(DataError::not_supported(format!(
                "literal {other} has no SQL representation"
            )))
        }
    })
}

fn render_expr(expr: &ScalarExpr, schema: &Schema, d: &SqlDialect) -> DataResult<String> {
    let r = |e: &ScalarExpr| render_expr(e, schema, d);
    Ok(match expr {
        ScalarExpr::Column(name) => d.quote_ident(name),
        ScalarExpr::Literal(v) => render_literal(v)?,
        ScalarExpr::Unary { op, expr } => match op {
            UnaryOp::Not => format!("(NOT {})", r(expr)?),
            UnaryOp::Neg => format!("(-{})", r(expr)?),
            UnaryOp::Plus => r(expr)?,
        },
        ScalarExpr::Binary { op, left, right } => {
            let (l, rr) = (r(left)?, r(right)?);
            let is_text = |e: &ScalarExpr| e.data_type(schema) == DataType::Utf8;
            match op {
                BinaryOp::Add if is_text(left) || is_text(right) => format!("({l} || {rr})"),
                BinaryOp::Div => format!("(CAST({l} AS DOUBLE) / {rr})"),
                _ => {
                    let sym = match op {
                        BinaryOp::Add => "+",
                        BinaryOp::Sub => "-",
                        BinaryOp::Mul => "*",
                        BinaryOp::Mod => "%",
                        BinaryOp::Eq => "=",
                        BinaryOp::NotEq => "<>",
                        BinaryOp::Lt => "<",
                        BinaryOp::LtEq => "<=",
                        BinaryOp::Gt => ">",
                        BinaryOp::GtEq => ">=",
                        BinaryOp::And => "AND",
                        BinaryOp::Or => "OR",
                        BinaryOp::Div => "/",
                    };
                    format!("({l} {sym} {rr})")
                }
            }
        }
        ScalarExpr::Conditional {
            test,
            consequent,
            alternate,
        } => format!(
            "CASE WHEN {} THEN {} ELSE {} END",
            r(test)?,
            r(consequent)?,
            r(alternate)?
        ),
        ScalarExpr::Call { func, args } => {
            let args = args.iter().map(r).collect::<DataResult<Vec<_>>>()?;
            let arg = |i: usize| args.get(i).cloned().unwrap_or_else(|| "NULL".to_string());
            let ts = || format!("(to_timestamp({} / 1000.0) AT TIME ZONE {})", arg(0), arg(1));
            match func {
                ScalarFn::IsValid => format!("({} IS NOT NULL)", arg(0)),
                ScalarFn::IsFinite => format!("isfinite({})", arg(0)),
                ScalarFn::IsNaN => format!("isnan({})", arg(0)),
                ScalarFn::Log => format!("LN({})", arg(0)),
                ScalarFn::Pow => format!("POWER({}, {})", arg(0), arg(1)),
                ScalarFn::Min => format!("LEAST({})", args.join(", ")),
                ScalarFn::Max => format!("GREATEST({})", args.join(", ")),
                ScalarFn::ToDate => format!("epoch_ms(CAST({} AS TIMESTAMP))", arg(0)),
                ScalarFn::Year => format!("date_part('year', {})", ts()),
                ScalarFn::Month => format!("(date_part('month', {}) - 1)", ts()),
                ScalarFn::Date => format!("date_part('day', {})", ts()),
                ScalarFn::Day => format!("date_part('dow', {})", ts()),
                ScalarFn::Hours => format!("date_part('hour', {})", ts()),
                ScalarFn::Minutes => format!("date_part('minute', {})", ts()),
                ScalarFn::Seconds => format!("date_part('second', {})", ts()),
                other => format!("{}({})", other.name().to_uppercase(), args.join(", ")),
            }
        }
    })
}

// ---------------------------------------------------------------------------
// SqlConnection
// ---------------------------------------------------------------------------

/// Executes SQL text on behalf of a [`SqlConnection`].
#[async_trait]
pub trait SqlExecutor: Send + Sync + 'static {
    fn dialect(&self) -> &SqlDialect;

    async fn list_tables(&self) -> DataResult<HashMap<String, Schema>>;

    async fn execute_sql(&self, sql: &str) -> DataResult<Table>;
}

/// Connection that pushes queries down to a SQL engine.
pub struct SqlConnection<E> {
    executor: E,
    fallback: bool,
}

impl<E: SqlExecutor> SqlConnection<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            fallback: true,
        }
    }

    pub fn with_fallback(mut self, fallback: bool) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }
}

#[async_trait]
impl<E: SqlExecutor> Connection for SqlConnection<E> {
    fn id(&self) -> String {
        format!("sql:{}", self.executor.dialect().name)
    }

    fn fallback(&self) -> bool {
        self.fallback
    }

    fn supports(&self, op: &QueryOp) -> bool {
        self.executor.dialect().supports(op)
    }

    async fn tables(&self) -> DataResult<HashMap<String, Schema>> {
        self.executor.list_tables().await
    }

    async fn fetch_query(&self, query: &Query, expected: &Schema) -> DataResult<Table> {
        let tables = self.executor.list_tables().await?;
        let input = tables
            .get(&query.table)
            .ok_or_else(|| DataError::TableNotFound(query.table.clone()))?;
        let sql = query.to_sql(self.executor.dialect(), input)?;
        tracing::debug!(connection = %self.id(), %sql, "executing query");
        let table = self.executor.execute_sql(&sql).await?;
        expected.check_compatible(table.schema())?;
        Ok(table)
    }
}
