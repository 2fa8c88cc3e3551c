//! Server-side semantics of dataset transforms.
//!
//! Each transform reports the variables it reads, the signals it publishes,
//! and whether the server can run it. Supported transforms compile to a
//! [`Step`]: relational ops pushed to the connection, or a local step the
//! evaluator performs on the materialized table.

mod aggregate;
mod bin;

pub use bin::{BinOptions, Bins};

use chartfuse_data::value::{as_f64, integral_number};
use chartfuse_data::{
    AggregateOp, Projection, QueryOp, SortKey, SortOrder, StackOffset, Table, WindowColumn,
};
use serde_json::{json, Map, Value};

use crate::error::{ChartError, Result};
use crate::expr::{ExprEnv, Expression};
use crate::graph::Variable;
use crate::spec::{
    scan_json_inputs, BinExtent, CompareSpec, NumberOrSignal, SupportedTransform, TransformSpec,
};

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Ops(Vec<QueryOp>),
    /// `[min, max]` of a field over the table so far; the table passes through.
    Extent { field: String, signal: Option<String> },
    /// Replace the table with generated rows.
    Generate(Table),
    /// An op whose output columns depend on the data; it runs on the
    /// materialized table rather than inside a connection query.
    Local(QueryOp),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformPlan {
    pub step: Step,
    /// Signals whose values are known once the step is planned.
    pub signals: Vec<(String, Value)>,
}

impl TransformPlan {
    fn ops(ops: Vec<QueryOp>) -> Self {
        Self {
            step: Step::Ops(ops),
            signals: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Graph-facing metadata
// ---------------------------------------------------------------------------

impl TransformSpec {
    /// Variables the transform reads.
    ///
    /// For unsupported transforms this is a best-effort scan of their
    /// parameters; unparsable expressions contribute nothing.
    pub fn input_vars(&self) -> Vec<Variable> {
        let mut out = Vec::new();
        match self {
            TransformSpec::Supported(tx) => tx.collect_input_vars(&mut out),
            TransformSpec::Unsupported(tx) => {
                // top-level `signal` and `as` name outputs, not inputs
                for (key, value) in &tx.extra {
                    match (key.as_str(), value) {
                        ("signal" | "as", _) => {}
                        ("from", Value::String(from)) => out.push(Variable::data(from.clone())),
                        _ => scan_json_inputs(value, &mut out),
                    }
                }
            }
        }
        out.sort();
        out.dedup();
        out
    }

    /// Names of the signals this transform publishes.
    pub fn output_signals(&self) -> Vec<String> {
        match self {
            TransformSpec::Supported(SupportedTransform::Bin(tx)) => tx.signal.iter().cloned().collect(),
            TransformSpec::Supported(SupportedTransform::Extent(tx)) => {
                tx.signal.iter().cloned().collect()
            }
            TransformSpec::Supported(_) => Vec::new(),
            TransformSpec::Unsupported(tx) => match tx.extra.get("signal") {
                Some(Value::String(name)) => vec![name.clone()],
                _ => Vec::new(),
            },
        }
    }

    pub fn is_supported(&self) -> bool {
        match self {
            TransformSpec::Supported(tx) => tx.is_supported(),
            TransformSpec::Unsupported(_) => false,
        }
    }
}

fn expression_vars(src: &str, out: &mut Vec<Variable>) {
    if let Ok(expr) = Expression::parse(src) {
        out.extend(expr.input_vars());
    }
}

fn expression_supported(src: &str) -> bool {
    Expression::parse(src).is_ok_and(|e| e.is_supported())
}

fn param_vars(param: Option<&NumberOrSignal>, out: &mut Vec<Variable>) {
    if let Some(src) = param.and_then(NumberOrSignal::signal) {
        expression_vars(src, out);
    }
}

fn param_supported(param: Option<&NumberOrSignal>) -> bool {
    param
        .and_then(NumberOrSignal::signal)
        .map_or(true, expression_supported)
}

/// Every extra parameter is present only with the value the client would
/// assume anyway.
fn only_defaults(extra: &Map<String, Value>, defaults: &[(&str, Value)]) -> bool {
    extra
        .iter()
        .all(|(k, v)| defaults.iter().any(|(dk, dv)| dk == k && dv == v))
}

impl SupportedTransform {
    fn collect_input_vars(&self, out: &mut Vec<Variable>) {
        match self {
            SupportedTransform::Filter(tx) => expression_vars(&tx.expr, out),
            SupportedTransform::Formula(tx) => expression_vars(&tx.expr, out),
            SupportedTransform::Bin(tx) => {
                match &tx.extent {
                    BinExtent::Signal(r) => expression_vars(&r.signal, out),
                    BinExtent::Values(bounds) => {
                        bounds.iter().for_each(|b| param_vars(Some(b), out))
                    }
                }
                param_vars(tx.maxbins.as_ref(), out);
                param_vars(tx.step.as_ref(), out);
            }
            SupportedTransform::Sequence(tx) => {
                param_vars(Some(&tx.start), out);
                param_vars(Some(&tx.stop), out);
                param_vars(tx.step.as_ref(), out);
            }
            SupportedTransform::Aggregate(_)
            | SupportedTransform::Collect(_)
            | SupportedTransform::Extent(_)
            | SupportedTransform::Fold(_)
            | SupportedTransform::Impute(_)
            | SupportedTransform::JoinAggregate(_)
            | SupportedTransform::Pivot(_)
            | SupportedTransform::Project(_)
            | SupportedTransform::Stack(_)
            | SupportedTransform::TimeUnit(_)
            | SupportedTransform::Window(_) => {}
        }
    }

    pub fn is_supported(&self) -> bool {
        match self {
            SupportedTransform::Aggregate(tx) => {
                aggregate::is_well_formed(&tx.fields, &tx.ops, &tx.as_)
                    && only_defaults(
                        &tx.extra,
                        &[("cross", json!(false)), ("drop", json!(true))],
                    )
            }
            SupportedTransform::JoinAggregate(tx) => {
                aggregate::is_well_formed(&tx.fields, &tx.ops, &tx.as_) && tx.extra.is_empty()
            }
            SupportedTransform::Bin(tx) => {
                let extent_ok = match &tx.extent {
                    BinExtent::Signal(r) => expression_supported(&r.signal),
                    BinExtent::Values(bounds) => bounds.iter().all(|b| param_supported(Some(b))),
                };
                extent_ok
                    && param_supported(tx.maxbins.as_ref())
                    && param_supported(tx.step.as_ref())
                    && tx.as_.as_ref().map_or(true, |names| (1..=2).contains(&names.len()))
                    && tx.extra.is_empty()
            }
            SupportedTransform::Collect(tx) => tx.extra.is_empty(),
            SupportedTransform::Extent(tx) => tx.extra.is_empty(),
            SupportedTransform::Filter(tx) => {
                expression_supported(&tx.expr) && tx.extra.is_empty()
            }
            SupportedTransform::Formula(tx) => {
                expression_supported(&tx.expr) && tx.extra.is_empty()
            }
            SupportedTransform::Project(tx) => {
                tx.as_.len() <= tx.fields.len() && tx.extra.is_empty()
            }
            SupportedTransform::Sequence(tx) => {
                param_supported(Some(&tx.start))
                    && param_supported(Some(&tx.stop))
                    && param_supported(tx.step.as_ref())
                    && tx.extra.is_empty()
            }
            SupportedTransform::Window(tx) => {
                let fields_ok = tx.fields.len() <= tx.ops.len()
                    && tx.as_.len() <= tx.ops.len()
                    && tx.ops.iter().enumerate().all(|(i, op)| {
                        !op.needs_field() || tx.fields.get(i).is_some_and(Option::is_some)
                    });
                let params_ok = match &tx.params {
                    None => true,
                    Some(Value::Array(params)) => params.iter().all(Value::is_null),
                    Some(_) => false,
                };
                fields_ok
                    && params_ok
                    && tx.frame.as_ref().map_or(true, |f| *f == json!([null, 0]))
                    && tx.extra.is_empty()
            }
            SupportedTransform::Stack(tx) => pair(tx.as_.as_deref()) && tx.extra.is_empty(),
            SupportedTransform::Pivot(tx) => tx.extra.is_empty(),
            SupportedTransform::Fold(tx) => {
                !tx.fields.is_empty() && pair(tx.as_.as_deref()) && tx.extra.is_empty()
            }
            SupportedTransform::Impute(tx) => {
                tx.keyvals.is_none()
                    && tx.method.as_deref().map_or(true, |m| m == "value")
                    && tx.value.is_some()
                    && tx.extra.is_empty()
            }
            SupportedTransform::TimeUnit(tx) => {
                // binned units (step, extent, maxbins) arrive as extras
                tx.units.as_ref().is_some_and(|u| !u.is_empty())
                    && tx
                        .timezone
                        .as_deref()
                        .map_or(true, |tz| tz == "local" || tz == "utc")
                    && pair(tx.as_.as_deref())
                    && tx.extra.is_empty()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    /// Compile against the current signal values.
    pub fn plan(&self, env: &ExprEnv<'_>) -> Result<TransformPlan> {
        match self {
            SupportedTransform::Filter(tx) => {
                let predicate = Expression::parse(&tx.expr)?.compile(env)?;
                Ok(TransformPlan::ops(vec![QueryOp::Filter(predicate)]))
            }
            SupportedTransform::Formula(tx) => {
                let expr = Expression::parse(&tx.expr)?.compile(env)?;
                Ok(TransformPlan::ops(vec![QueryOp::Formula {
                    expr,
                    alias: tx.as_.clone(),
                }]))
            }
            SupportedTransform::Aggregate(tx) => Ok(TransformPlan::ops(vec![QueryOp::Aggregate {
                groupby: tx.groupby.clone(),
                aggregates: aggregate::aggregates(&tx.fields, &tx.ops, &tx.as_),
            }])),
            SupportedTransform::JoinAggregate(tx) => {
                Ok(TransformPlan::ops(vec![QueryOp::JoinAggregate {
                    groupby: tx.groupby.clone(),
                    aggregates: aggregate::aggregates(&tx.fields, &tx.ops, &tx.as_),
                }]))
            }
            SupportedTransform::Collect(tx) => match &tx.sort {
                Some(sort) => Ok(TransformPlan::ops(vec![QueryOp::Sort(sort_keys(Some(sort)))])),
                None => Ok(TransformPlan::ops(Vec::new())),
            },
            SupportedTransform::Project(tx) => {
                if tx.fields.is_empty() {
                    return Ok(TransformPlan::ops(Vec::new()));
                }
                let projections = tx
                    .fields
                    .iter()
                    .enumerate()
                    .map(|(i, field)| Projection {
                        field: field.clone(),
                        alias: tx.as_.get(i).cloned().flatten().unwrap_or_else(|| field.clone()),
                    })
                    .collect();
                Ok(TransformPlan::ops(vec![QueryOp::Project(projections)]))
            }
            SupportedTransform::Extent(tx) => Ok(TransformPlan {
                step: Step::Extent {
                    field: tx.field.clone(),
                    signal: tx.signal.clone(),
                },
                signals: Vec::new(),
            }),
            SupportedTransform::Bin(tx) => {
                let extent = match &tx.extent {
                    BinExtent::Signal(r) => {
                        let value = Expression::parse(&r.signal)?.eval(env)?;
                        match value.as_array().map(|a| a.as_slice()) {
                            Some([lo, hi]) => [as_f64(lo), as_f64(hi)],
                            _ => [None, None],
                        }
                    }
                    BinExtent::Values([lo, hi]) => {
                        [Some(number_param(lo, env)?), Some(number_param(hi, env)?)]
                    }
                };
                let [Some(lo), Some(hi)] = extent else {
                    return Err(ChartError::expression(format!(
                        "bin extent for '{}' must be two numbers",
                        tx.field
                    )));
                };
                let defaults = BinOptions::default();
                let opts = BinOptions {
                    maxbins: match &tx.maxbins {
                        Some(p) => number_param(p, env)?,
                        None => defaults.maxbins,
                    },
                    base: tx.base.as_ref().and_then(|n| n.as_f64()).unwrap_or(defaults.base),
                    divide: tx
                        .divide
                        .as_ref()
                        .map(|d| d.iter().filter_map(|n| n.as_f64()).collect())
                        .unwrap_or(defaults.divide),
                    minstep: tx.minstep.as_ref().and_then(|n| n.as_f64()).unwrap_or(0.0),
                    step: tx.step.as_ref().map(|p| number_param(p, env)).transpose()?,
                    nice: tx.nice.unwrap_or(true),
                };
                let bins = Bins::compute([lo, hi], &opts)?;

                let names = tx.as_.clone().unwrap_or_default();
                let bin0 = names.first().map_or("bin0", String::as_str);
                let bin1 = names.get(1).map_or("bin1", String::as_str);
                let bin1 = tx.interval.unwrap_or(true).then_some(bin1);
                Ok(TransformPlan {
                    step: Step::Ops(bins.formulas(&tx.field, bin0, bin1)),
                    signals: tx
                        .signal
                        .iter()
                        .map(|name| (name.clone(), bins.signal_value(&tx.field)))
                        .collect(),
                })
            }
            SupportedTransform::Sequence(tx) => {
                let start = number_param(&tx.start, env)?;
                let stop = number_param(&tx.stop, env)?;
                let step = match &tx.step {
                    Some(p) => number_param(p, env)?,
                    None => 1.0,
                };
                let field = tx.as_.clone().unwrap_or_else(|| "data".to_string());
                Ok(TransformPlan {
                    step: Step::Generate(sequence(start, stop, step, &field)?),
                    signals: Vec::new(),
                })
            }
            SupportedTransform::Window(tx) => {
                let columns = tx
                    .ops
                    .iter()
                    .enumerate()
                    .map(|(i, op)| {
                        let field = tx.fields.get(i).cloned().flatten();
                        let alias = tx.as_.get(i).cloned().flatten().unwrap_or_else(|| {
                            match &field {
                                Some(f) => format!("{}_{}", op.name(), f),
                                None => op.name().to_string(),
                            }
                        });
                        WindowColumn {
                            op: *op,
                            field,
                            alias,
                        }
                    })
                    .collect();
                Ok(TransformPlan::ops(vec![QueryOp::Window {
                    groupby: tx.groupby.clone(),
                    sort: sort_keys(tx.sort.as_ref()),
                    columns,
                    ignore_peers: tx.ignore_peers.unwrap_or(false),
                }]))
            }
            SupportedTransform::Stack(tx) => {
                let (start, stop) = names(tx.as_.as_deref(), ("y0", "y1"));
                Ok(TransformPlan::ops(vec![QueryOp::Stack {
                    field: tx.field.clone(),
                    groupby: tx.groupby.clone(),
                    sort: sort_keys(tx.sort.as_ref()),
                    offset: tx.offset.unwrap_or(StackOffset::Zero),
                    start,
                    stop,
                }]))
            }
            SupportedTransform::Pivot(tx) => Ok(TransformPlan {
                step: Step::Local(QueryOp::Pivot {
                    field: tx.field.clone(),
                    value: tx.value.clone(),
                    groupby: tx.groupby.clone(),
                    // zero means no limit
                    limit: tx.limit.filter(|&n| n > 0),
                    op: tx.op.unwrap_or(AggregateOp::Sum),
                }),
                signals: Vec::new(),
            }),
            SupportedTransform::Fold(tx) => {
                let (key, value) = names(tx.as_.as_deref(), ("key", "value"));
                Ok(TransformPlan::ops(vec![QueryOp::Fold {
                    fields: tx.fields.clone(),
                    key,
                    value,
                }]))
            }
            SupportedTransform::Impute(tx) => Ok(TransformPlan::ops(vec![QueryOp::Impute {
                field: tx.field.clone(),
                key: tx.key.clone(),
                groupby: tx.groupby.clone(),
                value: tx.value.clone().unwrap_or(Value::Null),
            }])),
            SupportedTransform::TimeUnit(tx) => {
                let (start, end) = names(tx.as_.as_deref(), ("unit0", "unit1"));
                let timezone = match tx.timezone.as_deref() {
                    Some("utc") => "UTC",
                    _ => env.local_tz,
                };
                Ok(TransformPlan::ops(vec![QueryOp::TimeUnit {
                    field: tx.field.clone(),
                    units: tx.units.clone().unwrap_or_default(),
                    timezone: timezone.to_string(),
                    input_timezone: env.default_input_tz.to_string(),
                    start,
                    end: tx.interval.unwrap_or(true).then_some(end),
                }]))
            }
        }
    }
}

/// Sort keys of a compare spec; missing orders default to ascending.
fn sort_keys(sort: Option<&CompareSpec>) -> Vec<SortKey> {
    let Some(sort) = sort else {
        return Vec::new();
    };
    let orders = sort.order.as_ref().map(|o| o.to_vec()).unwrap_or_default();
    sort.field
        .to_vec()
        .into_iter()
        .enumerate()
        .map(|(i, field)| SortKey {
            field,
            order: orders.get(i).copied().unwrap_or(SortOrder::Ascending),
        })
        .collect()
}

/// An `as` parameter naming exactly two outputs, when given.
fn pair(names: Option<&[String]>) -> bool {
    names.map_or(true, |n| n.len() == 2)
}

fn names(given: Option<&[String]>, (a, b): (&str, &str)) -> (String, String) {
    match given {
        Some([x, y]) => (x.clone(), y.clone()),
        _ => (a.to_string(), b.to_string()),
    }
}

fn number_param(param: &NumberOrSignal, env: &ExprEnv<'_>) -> Result<f64> {
    match param {
        NumberOrSignal::Number(n) => n
            .as_f64()
            .ok_or_else(|| ChartError::expression(format!("{n} is not a finite number"))),
        NumberOrSignal::Signal(r) => {
            let value = Expression::parse(&r.signal)?.eval(env)?;
            as_f64(&value).ok_or_else(|| {
                ChartError::expression(format!("'{}' evaluated to {value}, not a number", r.signal))
            })
        }
    }
}

/// Most rows a `sequence` transform may generate.
pub const MAX_SEQUENCE_ROWS: usize = 1_000_000;

/// Rows `start, start + step, ...` strictly below `stop`.
pub fn sequence(start: f64, stop: f64, step: f64, field: &str) -> Result<Table> {
    let n = ((stop - start) / step).ceil();
    if n.is_infinite() || n > MAX_SEQUENCE_ROWS as f64 {
        return Err(ChartError::expression(format!(
            "sequence from {start} to {stop} by {step} exceeds {MAX_SEQUENCE_ROWS} rows"
        )));
    }
    let n = if n > 0.0 { n as usize } else { 0 };
    let rows = (0..n)
        .map(|i| {
            let mut row = Map::new();
            row.insert(field.to_string(), integral_number(start + i as f64 * step));
            row
        })
        .collect();
    Ok(Table::from_rows(rows))
}

/// `[min, max]` over the numeric values of `field`; `[null, null]` if none.
pub fn field_extent(table: &Table, field: &str) -> Value {
    let mut bounds: Option<(f64, f64)> = None;
    for x in table
        .column(field)
        .filter(|v| !v.is_null())
        .filter_map(as_f64)
        .filter(|x| !x.is_nan())
    {
        bounds = Some(match bounds {
            None => (x, x),
            Some((lo, hi)) => (lo.min(x), hi.max(x)),
        });
    }
    match bounds {
        Some((lo, hi)) => json!([integral_number(lo), integral_number(hi)]),
        None => json!([null, null]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartfuse_data::{TimeUnit, WindowOp};
    use std::collections::HashMap;

    fn tx(value: Value) -> TransformSpec {
        serde_json::from_value(value).unwrap()
    }

    fn plan(spec: &TransformSpec, signals: &HashMap<String, Value>) -> TransformPlan {
        let TransformSpec::Supported(supported) = spec else {
            panic!("expected a supported transform");
        };
        let datasets = HashMap::new();
        let env = ExprEnv {
            signals,
            datasets: &datasets,
            local_tz: "UTC",
            default_input_tz: "UTC",
        };
        supported.plan(&env).unwrap()
    }

    #[test]
    fn input_vars_and_outputs() {
        let bin = tx(json!({
            "type": "bin", "field": "x",
            "extent": {"signal": "x_extent"},
            "maxbins": {"signal": "maxbins"},
            "signal": "x_bins"
        }));
        assert_eq!(
            bin.input_vars(),
            vec![Variable::signal("maxbins"), Variable::signal("x_extent")]
        );
        assert_eq!(bin.output_signals(), vec!["x_bins"]);

        let lookup = tx(json!({"type": "lookup", "from": "lookup_data", "key": "id",
                               "fields": ["id"], "signal": "picked"}));
        assert_eq!(lookup.input_vars(), vec![Variable::data("lookup_data")]);
        assert_eq!(lookup.output_signals(), vec!["picked"]);
        assert!(!lookup.is_supported());
    }

    #[test]
    fn support_depends_on_parameters() {
        assert!(tx(json!({"type": "filter", "expr": "datum.a > 2"})).is_supported());
        assert!(!tx(json!({"type": "filter", "expr": "vlSelectionTest('s', datum)"})).is_supported());
        assert!(tx(json!({"type": "aggregate", "groupby": ["k"], "drop": true})).is_supported());
        assert!(!tx(json!({"type": "aggregate", "groupby": ["k"], "cross": true})).is_supported());
        assert!(!tx(json!({"type": "extent", "field": "x", "signal": "e", "foo": 1})).is_supported());
    }

    #[test]
    fn bin_reads_extent_signal() {
        let spec = tx(json!({
            "type": "bin", "field": "x", "extent": {"signal": "x_extent"},
            "maxbins": 10, "signal": "x_bins"
        }));
        let signals = HashMap::from([("x_extent".to_string(), json!([1.4, 9.2]))]);
        let planned = plan(&spec, &signals);
        assert!(matches!(&planned.step, Step::Ops(ops) if ops.len() == 2));
        assert_eq!(planned.signals[0].0, "x_bins");
        assert_eq!(planned.signals[0].1["start"], json!(1));
        assert_eq!(planned.signals[0].1["step"], json!(1));
        assert_eq!(planned.signals[0].1["fname"], json!("bin_x"));
    }

    #[test]
    fn collect_and_project_compile_to_ops() {
        let signals = HashMap::new();
        let collect = tx(json!({"type": "collect",
                                "sort": {"field": ["a", "b"], "order": ["descending"]}}));
        assert_eq!(
            plan(&collect, &signals).step,
            Step::Ops(vec![QueryOp::Sort(vec![
                SortKey { field: "a".into(), order: SortOrder::Descending },
                SortKey { field: "b".into(), order: SortOrder::Ascending },
            ])])
        );
        let project = tx(json!({"type": "project", "fields": ["a", "b"], "as": ["x"]}));
        assert_eq!(
            plan(&project, &signals).step,
            Step::Ops(vec![QueryOp::Project(vec![
                Projection { field: "a".into(), alias: "x".into() },
                Projection { field: "b".into(), alias: "b".into() },
            ])])
        );
    }

    #[test]
    fn sequence_and_extent_helpers() {
        let table = sequence(0.0, 3.0, 1.0, "data").unwrap();
        assert_eq!(table.to_json(), json!([{"data": 0}, {"data": 1}, {"data": 2}]));
        assert_eq!(sequence(3.0, 0.0, 1.0, "v").unwrap().num_rows(), 0);
        assert_eq!(sequence(f64::NAN, 1.0, 1.0, "v").unwrap().num_rows(), 0);

        let rows = Table::from_json(&json!([{"x": 3}, {"x": null}, {"x": -1.5}, {"x": "7"}])).unwrap();
        assert_eq!(field_extent(&rows, "x"), json!([-1.5, 7]));
        assert_eq!(field_extent(&rows, "missing"), json!([null, null]));
    }

    #[test]
    fn oversized_sequences_are_rejected() {
        assert!(matches!(
            sequence(0.0, 1e12, 1.0, "v"),
            Err(ChartError::Expression(_))
        ));
        // a zero step would never reach `stop`
        assert!(sequence(0.0, 1.0, 0.0, "v").is_err());
        assert!(sequence(0.0, MAX_SEQUENCE_ROWS as f64 + 1.0, 1.0, "v").is_err());
        assert_eq!(sequence(0.0, 1e6, 1e5, "v").unwrap().num_rows(), 10);

        let spec = tx(json!({"type": "sequence", "start": 0, "stop": {"signal": "n"}}));
        let TransformSpec::Supported(supported) = &spec else {
            panic!("expected a supported transform");
        };
        let signals = HashMap::from([("n".to_string(), json!(1e12))]);
        let datasets = HashMap::new();
        let env = ExprEnv {
            signals: &signals,
            datasets: &datasets,
            local_tz: "UTC",
            default_input_tz: "UTC",
        };
        assert!(matches!(supported.plan(&env), Err(ChartError::Expression(_))));
    }

    #[test]
    fn reshaping_support_follows_parameters() {
        assert!(tx(json!({"type": "window", "ops": ["row_number"], "frame": [null, 0]})).is_supported());
        assert!(!tx(json!({"type": "window", "ops": ["sum"], "fields": ["v"], "frame": [-1, 1]})).is_supported());
        assert!(!tx(json!({"type": "window", "ops": ["sum"]})).is_supported());
        assert!(!tx(json!({"type": "window", "ops": ["first_value"], "fields": ["v"], "params": [2]})).is_supported());
        assert!(tx(json!({"type": "stack", "field": "v", "offset": "center"})).is_supported());
        assert!(!tx(json!({"type": "stack", "field": "v", "as": ["only"]})).is_supported());
        assert!(tx(json!({"type": "fold", "fields": ["a", "b"]})).is_supported());
        assert!(!tx(json!({"type": "fold", "fields": []})).is_supported());
        assert!(tx(json!({"type": "impute", "field": "v", "key": "k", "value": 0})).is_supported());
        assert!(!tx(json!({"type": "impute", "field": "v", "key": "k", "method": "mean"})).is_supported());
        assert!(!tx(json!({"type": "impute", "field": "v", "key": "k", "value": 0,
                           "keyvals": [1, 2]})).is_supported());
        assert!(tx(json!({"type": "timeunit", "field": "t", "units": ["year"]})).is_supported());
        assert!(!tx(json!({"type": "timeunit", "field": "t", "maxbins": 20})).is_supported());
        assert!(!tx(json!({"type": "timeunit", "field": "t", "units": ["year"],
                           "signal": "unit"})).is_supported());
    }

    #[test]
    fn reshaping_transforms_compile() {
        let signals = HashMap::new();
        let window = tx(json!({
            "type": "window", "groupby": ["g"],
            "sort": {"field": "v", "order": "descending"},
            "ops": ["rank", "sum"], "fields": [null, "v"], "as": ["r"]
        }));
        assert_eq!(
            plan(&window, &signals).step,
            Step::Ops(vec![QueryOp::Window {
                groupby: vec!["g".into()],
                sort: vec![SortKey { field: "v".into(), order: SortOrder::Descending }],
                columns: vec![
                    WindowColumn { op: WindowOp::Rank, field: None, alias: "r".into() },
                    WindowColumn { op: WindowOp::Sum, field: Some("v".into()), alias: "sum_v".into() },
                ],
                ignore_peers: false,
            }])
        );

        let pivot = tx(json!({"type": "pivot", "field": "k", "value": "v", "limit": 0}));
        assert_eq!(
            plan(&pivot, &signals).step,
            Step::Local(QueryOp::Pivot {
                field: "k".into(),
                value: "v".into(),
                groupby: Vec::new(),
                limit: None,
                op: AggregateOp::Sum,
            })
        );

        let stack = tx(json!({"type": "stack", "field": "v"}));
        let Step::Ops(ops) = plan(&stack, &signals).step else {
            panic!("stack compiles to ops");
        };
        assert!(matches!(&ops[..], [QueryOp::Stack { offset: StackOffset::Zero, start, stop, .. }]
            if start == "y0" && stop == "y1"));

        let unit = tx(json!({"type": "timeunit", "field": "t", "units": ["month"],
                             "timezone": "utc", "interval": false, "as": ["m0", "m1"]}));
        assert_eq!(
            plan(&unit, &signals).step,
            Step::Ops(vec![QueryOp::TimeUnit {
                field: "t".into(),
                units: vec![TimeUnit::Month],
                timezone: "UTC".into(),
                input_timezone: "UTC".into(),
                start: "m0".into(),
                end: None,
            }])
        );
    }
}
