//! Relational query plans.
//!
//! A [`Query`] names a source table and a pipeline of [`QueryOp`]s. The
//! evaluator builds queries from chart transforms; connections either run
//! them natively (rendered as SQL) or through the default engine in
//! [`crate::exec`].

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DataResult;
use crate::schema::{DataType, Field, Schema};
use crate::table::Row;
use crate::timeunit::TimeUnit;
use crate::value::{
    as_f64, as_i64, compare, integral_number, is_valid, loose_eq, number, to_display_string,
    truthy,
};

// ---------------------------------------------------------------------------
// Row-level expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Neg,
    Plus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }
}

/// Closed set of scalar functions a row expression may call.
///
/// Date-part functions take the timestamp (epoch milliseconds) followed by
/// the IANA time zone name to interpret it in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScalarFn {
    IsValid,
    IsFinite,
    IsNaN,
    Abs,
    Ceil,
    Floor,
    Round,
    Sqrt,
    Log,
    Exp,
    Pow,
    Min,
    Max,
    Length,
    Lower,
    Upper,
    ToDate,
    Year,
    Month,
    Date,
    Day,
    Hours,
    Minutes,
    Seconds,
}

impl ScalarFn {
    pub fn name(self) -> &'static str {
        match self {
            ScalarFn::IsValid => "isValid",
            ScalarFn::IsFinite => "isFinite",
            ScalarFn::IsNaN => "isNaN",
            ScalarFn::Abs => "abs",
            ScalarFn::Ceil => "ceil",
            ScalarFn::Floor => "floor",
            ScalarFn::Round => "round",
            ScalarFn::Sqrt => "sqrt",
            ScalarFn::Log => "log",
            ScalarFn::Exp => "exp",
            ScalarFn::Pow => "pow",
            ScalarFn::Min => "min",
            ScalarFn::Max => "max",
            ScalarFn::Length => "length",
            ScalarFn::Lower => "lower",
            ScalarFn::Upper => "upper",
            ScalarFn::ToDate => "toDate",
            ScalarFn::Year => "year",
            ScalarFn::Month => "month",
            ScalarFn::Date => "date",
            ScalarFn::Day => "day",
            ScalarFn::Hours => "hours",
            ScalarFn::Minutes => "minutes",
            ScalarFn::Seconds => "seconds",
        }
    }

    pub fn is_date_part(self) -> bool {
        matches!(
            self,
            ScalarFn::Year
                | ScalarFn::Month
                | ScalarFn::Date
                | ScalarFn::Day
                | ScalarFn::Hours
                | ScalarFn::Minutes
                | ScalarFn::Seconds
        )
    }
}

impl fmt::Display for ScalarFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Expression evaluated once per row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScalarExpr {
    Column(String),
    Literal(Value),
    Unary {
        op: UnaryOp,
        expr: Box<ScalarExpr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<ScalarExpr>,
        right: Box<ScalarExpr>,
    },
    Conditional {
        test: Box<ScalarExpr>,
        consequent: Box<ScalarExpr>,
        alternate: Box<ScalarExpr>,
    },
    Call {
        func: ScalarFn,
        args: Vec<ScalarExpr>,
    },
}

impl ScalarExpr {
    pub fn column(name: impl Into<String>) -> Self {
        ScalarExpr::Column(name.into())
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        ScalarExpr::Literal(value.into())
    }

    pub fn binary(op: BinaryOp, left: ScalarExpr, right: ScalarExpr) -> Self {
        ScalarExpr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Columns referenced anywhere in the expression.
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            ScalarExpr::Column(name) => {
                out.insert(name.clone());
            }
            ScalarExpr::Literal(_) => {}
            ScalarExpr::Unary { expr, .. } => expr.collect_columns(out),
            ScalarExpr::Binary { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            ScalarExpr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                test.collect_columns(out);
                consequent.collect_columns(out);
                alternate.collect_columns(out);
            }
            ScalarExpr::Call { args, .. } => args.iter().for_each(|a| a.collect_columns(out)),
        }
    }

    /// Scalar functions used anywhere in the expression.
    pub fn functions(&self) -> BTreeSet<ScalarFn> {
        fn walk(expr: &ScalarExpr, out: &mut BTreeSet<ScalarFn>) {
            match expr {
                ScalarExpr::Column(_) | ScalarExpr::Literal(_) => {}
                ScalarExpr::Unary { expr, .. } => walk(expr, out),
                ScalarExpr::Binary { left, right, .. } => {
                    walk(left, out);
                    walk(right, out);
                }
                ScalarExpr::Conditional {
                    test,
                    consequent,
                    alternate,
                } => {
                    walk(test, out);
                    walk(consequent, out);
                    walk(alternate, out);
                }
                ScalarExpr::Call { func, args } => {
                    out.insert(*func);
                    args.iter().for_each(|a| walk(a, out));
                }
            }
        }
        let mut out = BTreeSet::new();
        walk(self, &mut out);
        out
    }

    /// Type of the expression's result over rows of `schema`.
    pub fn data_type(&self, schema: &Schema) -> DataType {
        match self {
            ScalarExpr::Column(name) => schema.data_type(name).unwrap_or(DataType::Null),
            ScalarExpr::Literal(v) => DataType::of(v),
            ScalarExpr::Unary { op, expr } => match op {
                UnaryOp::Not => DataType::Boolean,
                UnaryOp::Neg | UnaryOp::Plus => match expr.data_type(schema) {
                    DataType::Integer => DataType::Integer,
                    _ => DataType::Float,
                },
            },
            ScalarExpr::Binary { op, left, right } => {
                let (l, r) = (left.data_type(schema), right.data_type(schema));
                match op {
                    BinaryOp::And | BinaryOp::Or => l.merge(r),
                    op if op.is_comparison() => DataType::Boolean,
                    BinaryOp::Add if l == DataType::Utf8 || r == DataType::Utf8 => DataType::Utf8,
                    BinaryOp::Div => DataType::Float,
                    _ if l == DataType::Integer && r == DataType::Integer => DataType::Integer,
                    _ => DataType::Float,
                }
            }
            ScalarExpr::Conditional {
                consequent,
                alternate,
                ..
            } => consequent.data_type(schema).merge(alternate.data_type(schema)),
            ScalarExpr::Call { func, args } => match func {
                ScalarFn::IsValid | ScalarFn::IsFinite | ScalarFn::IsNaN => DataType::Boolean,
                ScalarFn::Abs | ScalarFn::Min | ScalarFn::Max => args
                    .iter()
                    .map(|a| a.data_type(schema))
                    .reduce(DataType::merge)
                    .filter(|t| *t == DataType::Integer)
                    .unwrap_or(DataType::Float),
                ScalarFn::Ceil | ScalarFn::Floor | ScalarFn::Round => DataType::Integer,
                ScalarFn::Sqrt | ScalarFn::Log | ScalarFn::Exp | ScalarFn::Pow => DataType::Float,
                ScalarFn::Length => DataType::Integer,
                ScalarFn::Lower | ScalarFn::Upper => DataType::Utf8,
                ScalarFn::ToDate => DataType::Integer,
                f if f.is_date_part() => DataType::Integer,
                _ => DataType::Json,
            },
        }
    }

    /// Evaluate against one row. Missing columns read as null.
    pub fn eval(&self, row: &Row) -> Value {
        match self {
            ScalarExpr::Column(name) => row.get(name).cloned().unwrap_or(Value::Null),
            ScalarExpr::Literal(v) => v.clone(),
            ScalarExpr::Unary { op, expr } => {
                let v = expr.eval(row);
                match op {
                    UnaryOp::Not => Value::Bool(!truthy(&v)),
                    UnaryOp::Neg => match as_i64(&v) {
                        Some(i) => Value::from(-i),
                        None => as_f64(&v).map(|x| number(-x)).unwrap_or(Value::Null),
                    },
                    UnaryOp::Plus => match &v {
                        Value::Number(_) => v,
                        _ => as_f64(&v).map(number).unwrap_or(Value::Null),
                    },
                }
            }
            ScalarExpr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let l = left.eval(row);
                    if truthy(&l) {
                        right.eval(row)
                    } else {
                        l
                    }
                }
                BinaryOp::Or => {
                    let l = left.eval(row);
                    if truthy(&l) {
                        l
                    } else {
                        right.eval(row)
                    }
                }
                _ => eval_binary(*op, &left.eval(row), &right.eval(row)),
            },
            ScalarExpr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if truthy(&test.eval(row)) {
                    consequent.eval(row)
                } else {
                    alternate.eval(row)
                }
            }
            ScalarExpr::Call { func, args } => {
                let values: Vec<Value> = args.iter().map(|a| a.eval(row)).collect();
                eval_call(*func, &values)
            }
        }
    }
}

/// Evaluate a binary operator on two already-evaluated operands.
pub fn eval_binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    use std::cmp::Ordering;
    match op {
        BinaryOp::Eq => Value::Bool(loose_eq(l, r)),
        BinaryOp::NotEq => Value::Bool(!loose_eq(l, r)),
        BinaryOp::Lt => Value::Bool(compare(l, r) == Some(Ordering::Less)),
        BinaryOp::LtEq => Value::Bool(matches!(
            compare(l, r),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Gt => Value::Bool(compare(l, r) == Some(Ordering::Greater)),
        BinaryOp::GtEq => Value::Bool(matches!(
            compare(l, r),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::And => {
            if truthy(l) {
                r.clone()
            } else {
                l.clone()
            }
        }
        BinaryOp::Or => {
            if truthy(l) {
                l.clone()
            } else {
                r.clone()
            }
        }
        BinaryOp::Add if l.is_string() || r.is_string() => {
            Value::String(format!("{}{}", to_display_string(l), to_display_string(r)))
        }
        _ => {
            if l.is_null() || r.is_null() {
                return Value::Null;
            }
            if let (Some(a), Some(b)) = (as_i64(l), as_i64(r)) {
                let exact = match op {
                    BinaryOp::Add => a.checked_add(b),
                    BinaryOp::Sub => a.checked_sub(b),
                    BinaryOp::Mul => a.checked_mul(b),
                    BinaryOp::Mod if b != 0 => a.checked_rem(b),
                    _ => None,
                };
                if let Some(v) = exact {
                    return Value::from(v);
                }
            }
            let (Some(a), Some(b)) = (as_f64(l), as_f64(r)) else {
                return Value::Null;
            };
            let x = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Mod => a % b,
                _ => f64::NAN,
            };
            number(x)
        }
    }
}

/// Evaluate a scalar function on already-evaluated arguments.
pub fn eval_call(func: ScalarFn, args: &[Value]) -> Value {
    let arg = |i: usize| args.get(i).unwrap_or(&Value::Null);
    let num = |i: usize| as_f64(arg(i));
    let unary_float = |f: fn(f64) -> f64| num(0).map(|x| number(f(x))).unwrap_or(Value::Null);
    match func {
        ScalarFn::IsValid => Value::Bool(is_valid(arg(0))),
        ScalarFn::IsFinite => Value::Bool(num(0).is_some_and(f64::is_finite)),
        ScalarFn::IsNaN => Value::Bool(match arg(0) {
            Value::Null => false,
            v => as_f64(v).map_or(true, f64::is_nan),
        }),
        ScalarFn::Abs => match as_i64(arg(0)) {
            Some(i) => Value::from(i.saturating_abs()),
            None => unary_float(f64::abs),
        },
        ScalarFn::Ceil => num(0).map(|x| integral_number(x.ceil())).unwrap_or(Value::Null),
        ScalarFn::Floor => num(0).map(|x| integral_number(x.floor())).unwrap_or(Value::Null),
        ScalarFn::Round => num(0).map(|x| integral_number(x.round())).unwrap_or(Value::Null),
        ScalarFn::Sqrt => unary_float(f64::sqrt),
        ScalarFn::Log => unary_float(f64::ln),
        ScalarFn::Exp => unary_float(f64::exp),
        ScalarFn::Pow => match (num(0), num(1)) {
            (Some(a), Some(b)) => number(a.powf(b)),
            _ => Value::Null,
        },
        ScalarFn::Min | ScalarFn::Max => {
            let mut best: Option<&Value> = None;
            for v in args {
                if as_f64(v).is_none() {
                    return Value::Null;
                }
                let replace = match best {
                    None => true,
                    Some(b) => {
                        let ord = compare(v, b);
                        if func == ScalarFn::Min {
                            ord == Some(std::cmp::Ordering::Less)
                        } else {
                            ord == Some(std::cmp::Ordering::Greater)
                        }
                    }
                };
                if replace {
                    best = Some(v);
                }
            }
            best.cloned().unwrap_or(Value::Null)
        }
        ScalarFn::Length => match arg(0) {
            Value::String(s) => Value::from(s.chars().count() as i64),
            Value::Array(items) => Value::from(items.len() as i64),
            _ => Value::Null,
        },
        ScalarFn::Lower => match arg(0) {
            Value::String(s) => Value::String(s.to_lowercase()),
            _ => Value::Null,
        },
        ScalarFn::Upper => match arg(0) {
            Value::String(s) => Value::String(s.to_uppercase()),
            _ => Value::Null,
        },
        ScalarFn::ToDate => to_date(arg(0), arg(1)),
        part => date_part(part, arg(0), arg(1)),
    }
}

fn parse_tz(value: &Value) -> Tz {
    value
        .as_str()
        .and_then(|name| name.parse::<Tz>().ok())
        .unwrap_or(Tz::UTC)
}

fn to_date(value: &Value, tz: &Value) -> Value {
    match value {
        Value::Number(_) => value.clone(),
        Value::String(text) => parse_datetime(text, parse_tz(tz))
            .map(Value::from)
            .unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

/// Parse a date string to epoch milliseconds. Strings without an explicit
/// offset are interpreted in `tz`.
pub fn parse_datetime(text: &str, tz: Tz) -> Option<i64> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.timestamp_millis());
    }
    let naive = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.timestamp_millis())
}

fn date_part(part: ScalarFn, value: &Value, tz: &Value) -> Value {
    let Some(millis) = as_f64(value).filter(|x| x.is_finite()) else {
        return Value::Null;
    };
    let Some(utc) = DateTime::<Utc>::from_timestamp_millis(millis as i64) else {
        return Value::Null;
    };
    let local = utc.with_timezone(&parse_tz(tz));
    let v = match part {
        ScalarFn::Year => local.year() as i64,
        // zero-based, as chart clients expect
        ScalarFn::Month => local.month0() as i64,
        ScalarFn::Date => local.day() as i64,
        ScalarFn::Day => local.weekday().num_days_from_sunday() as i64,
        ScalarFn::Hours => local.hour() as i64,
        ScalarFn::Minutes => local.minute() as i64,
        ScalarFn::Seconds => local.second() as i64,
        _ => return Value::Null,
    };
    Value::from(v)
}

// ---------------------------------------------------------------------------
// Relational operators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Count,
    Valid,
    Missing,
    Distinct,
    Sum,
    Mean,
    Average,
    Min,
    Max,
}

impl AggregateOp {
    pub fn name(self) -> &'static str {
        match self {
            AggregateOp::Count => "count",
            AggregateOp::Valid => "valid",
            AggregateOp::Missing => "missing",
            AggregateOp::Distinct => "distinct",
            AggregateOp::Sum => "sum",
            AggregateOp::Mean => "mean",
            AggregateOp::Average => "average",
            AggregateOp::Min => "min",
            AggregateOp::Max => "max",
        }
    }

    /// Result type given the aggregated field's type.
    pub fn output_type(self, input: DataType) -> DataType {
        match self {
            AggregateOp::Count
            | AggregateOp::Valid
            | AggregateOp::Missing
            | AggregateOp::Distinct => DataType::Integer,
            AggregateOp::Sum if input == DataType::Integer => DataType::Integer,
            AggregateOp::Sum | AggregateOp::Mean | AggregateOp::Average => DataType::Float,
            AggregateOp::Min | AggregateOp::Max => input,
        }
    }
}

/// One aggregate column: `op(field) AS alias`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    pub op: AggregateOp,
    pub field: Option<String>,
    pub alias: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub order: SortOrder,
}

/// Output column of a projection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Projection {
    pub field: String,
    pub alias: String,
}

/// Per-row result computed over a window partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowOp {
    RowNumber,
    Rank,
    DenseRank,
    PercentRank,
    CumeDist,
    FirstValue,
    LastValue,
    Count,
    Sum,
    Mean,
    Average,
    Min,
    Max,
}

impl WindowOp {
    pub fn name(self) -> &'static str {
        match self {
            WindowOp::RowNumber => "row_number",
            WindowOp::Rank => "rank",
            WindowOp::DenseRank => "dense_rank",
            WindowOp::PercentRank => "percent_rank",
            WindowOp::CumeDist => "cume_dist",
            WindowOp::FirstValue => "first_value",
            WindowOp::LastValue => "last_value",
            WindowOp::Count => "count",
            WindowOp::Sum => "sum",
            WindowOp::Mean => "mean",
            WindowOp::Average => "average",
            WindowOp::Min => "min",
            WindowOp::Max => "max",
        }
    }

    /// The aggregate evaluated over the frame, for aggregating ops.
    pub fn aggregate(self) -> Option<AggregateOp> {
        match self {
            WindowOp::Count => Some(AggregateOp::Count),
            WindowOp::Sum => Some(AggregateOp::Sum),
            WindowOp::Mean => Some(AggregateOp::Mean),
            WindowOp::Average => Some(AggregateOp::Average),
            WindowOp::Min => Some(AggregateOp::Min),
            WindowOp::Max => Some(AggregateOp::Max),
            _ => None,
        }
    }

    /// Whether the op reads a field of the frame.
    pub fn needs_field(self) -> bool {
        !matches!(
            self,
            WindowOp::RowNumber
                | WindowOp::Rank
                | WindowOp::DenseRank
                | WindowOp::PercentRank
                | WindowOp::CumeDist
                | WindowOp::Count
        )
    }

    fn output_type(self, input: DataType) -> DataType {
        match self {
            WindowOp::RowNumber | WindowOp::Rank | WindowOp::DenseRank => DataType::Integer,
            WindowOp::PercentRank | WindowOp::CumeDist => DataType::Float,
            WindowOp::FirstValue | WindowOp::LastValue => input,
            _ => self
                .aggregate()
                .map_or(DataType::Null, |agg| agg.output_type(input)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowColumn {
    pub op: WindowOp,
    pub field: Option<String>,
    pub alias: String,
}

/// Baseline of a stacked layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackOffset {
    #[default]
    Zero,
    Center,
    Normalize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryOp {
    Filter(ScalarExpr),
    Formula {
        expr: ScalarExpr,
        alias: String,
    },
    Aggregate {
        groupby: Vec<String>,
        aggregates: Vec<Aggregate>,
    },
    /// Aggregate per group and append the results to every input row.
    JoinAggregate {
        groupby: Vec<String>,
        aggregates: Vec<Aggregate>,
    },
    Sort(Vec<SortKey>),
    Project(Vec<Projection>),
    Limit(usize),
    /// Running values over the frame `[partition start, current row]`.
    ///
    /// Without `ignore_peers` the frame extends to the last row that ties
    /// with the current one on `sort`. Rows keep their input order.
    Window {
        groupby: Vec<String>,
        sort: Vec<SortKey>,
        columns: Vec<WindowColumn>,
        ignore_peers: bool,
    },
    Stack {
        field: String,
        groupby: Vec<String>,
        sort: Vec<SortKey>,
        offset: StackOffset,
        start: String,
        stop: String,
    },
    /// Spread the distinct values of `field` into columns.
    ///
    /// The output columns depend on the data, so [`QueryOp::output_schema`]
    /// only reports the group columns.
    Pivot {
        field: String,
        value: String,
        groupby: Vec<String>,
        limit: Option<usize>,
        op: AggregateOp,
    },
    /// One output row per input row and folded field.
    Fold {
        fields: Vec<String>,
        key: String,
        value: String,
    },
    /// Fill `field` with `value` where it is null, and add a row for every
    /// `key` value a group is missing.
    Impute {
        field: String,
        key: String,
        groupby: Vec<String>,
        value: Value,
    },
    /// Floor a timestamp to calendar units; `end` receives the next boundary.
    TimeUnit {
        field: String,
        units: Vec<TimeUnit>,
        timezone: String,
        input_timezone: String,
        start: String,
        end: Option<String>,
    },
}

impl QueryOp {
    pub fn name(&self) -> &'static str {
        match self {
            QueryOp::Filter(_) => "filter",
            QueryOp::Formula { .. } => "formula",
            QueryOp::Aggregate { .. } => "aggregate",
            QueryOp::JoinAggregate { .. } => "joinaggregate",
            QueryOp::Sort(_) => "sort",
            QueryOp::Project(_) => "project",
            QueryOp::Limit(_) => "limit",
            QueryOp::Window { .. } => "window",
            QueryOp::Stack { .. } => "stack",
            QueryOp::Pivot { .. } => "pivot",
            QueryOp::Fold { .. } => "fold",
            QueryOp::Impute { .. } => "impute",
            QueryOp::TimeUnit { .. } => "timeunit",
        }
    }

    /// Whether the output columns are only known after running the op.
    pub fn is_data_dependent(&self) -> bool {
        matches!(self, QueryOp::Pivot { .. })
    }

    /// Schema produced by applying this operator to `input`.
    pub fn output_schema(&self, input: &Schema) -> Schema {
        match self {
            QueryOp::Filter(_) | QueryOp::Sort(_) | QueryOp::Limit(_) => input.clone(),
            QueryOp::Formula { expr, alias } => input
                .clone()
                .with_field(Field::new(alias.clone(), expr.data_type(input))),
            QueryOp::Aggregate {
                groupby,
                aggregates,
            } => {
                let mut fields: Vec<Field> = groupby
                    .iter()
                    .map(|g| Field::new(g.clone(), input.data_type(g).unwrap_or(DataType::Null)))
                    .collect();
                fields.extend(aggregates.iter().map(|agg| aggregate_field(agg, input)));
                Schema::new(fields)
            }
            QueryOp::JoinAggregate { aggregates, .. } => aggregates
                .iter()
                .fold(input.clone(), |schema, agg| {
                    schema.with_field(aggregate_field(agg, input))
                }),
            QueryOp::Project(projections) => Schema::new(
                projections
                    .iter()
                    .map(|p| {
                        Field::new(
                            p.alias.clone(),
                            input.data_type(&p.field).unwrap_or(DataType::Null),
                        )
                    })
                    .collect(),
            ),
            QueryOp::Window { columns, .. } => columns.iter().fold(input.clone(), |schema, c| {
                let input_type = c
                    .field
                    .as_deref()
                    .and_then(|f| input.data_type(f))
                    .unwrap_or(DataType::Null);
                schema.with_field(Field::new(c.alias.clone(), c.op.output_type(input_type)))
            }),
            QueryOp::Stack { start, stop, .. } => input
                .clone()
                .with_field(Field::new(start.clone(), DataType::Float))
                .with_field(Field::new(stop.clone(), DataType::Float)),
            QueryOp::Pivot { groupby, .. } => Schema::new(
                groupby
                    .iter()
                    .map(|g| Field::new(g.clone(), input.data_type(g).unwrap_or(DataType::Null)))
                    .collect(),
            ),
            QueryOp::Fold { fields, key, value } => {
                let value_type = fields
                    .iter()
                    .map(|f| input.data_type(f).unwrap_or(DataType::Null))
                    .fold(DataType::Null, DataType::merge);
                input
                    .clone()
                    .with_field(Field::new(key.clone(), DataType::Utf8))
                    .with_field(Field::new(value.clone(), value_type))
            }
            QueryOp::Impute { field, value, .. } => {
                let filled = input
                    .data_type(field)
                    .unwrap_or(DataType::Null)
                    .merge(DataType::of(value));
                input.clone().with_field(Field::new(field.clone(), filled))
            }
            QueryOp::TimeUnit { start, end, .. } => {
                let schema = input.clone().with_field(Field::new(start.clone(), DataType::Integer));
                match end {
                    Some(end) => schema.with_field(Field::new(end.clone(), DataType::Integer)),
                    None => schema,
                }
            }
        }
    }
}

fn aggregate_field(agg: &Aggregate, input: &Schema) -> Field {
    let input_type = agg
        .field
        .as_deref()
        .and_then(|f| input.data_type(f))
        .unwrap_or(DataType::Null);
    Field::new(agg.alias.clone(), agg.op.output_type(input_type))
}

/// A pipeline of operators over a named table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub table: String,
    pub ops: Vec<QueryOp>,
}

impl Query {
    /// `SELECT * FROM table`.
    pub fn scan(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            ops: Vec::new(),
        }
    }

    pub fn with_op(mut self, op: QueryOp) -> Self {
        self.ops.push(op);
        self
    }

    /// Schema of the query result given the source table's schema.
    pub fn output_schema(&self, input: &Schema) -> DataResult<Schema> {
        Ok(self
            .ops
            .iter()
            .fold(input.clone(), |schema, op| op.output_schema(&schema)))
    }
}
