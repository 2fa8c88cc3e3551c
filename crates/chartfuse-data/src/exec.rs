//! Default engine: executes [`QueryOp`]s over materialized tables.
//!
//! Used directly by [`crate::MemoryConnection`] and by the evaluator when a
//! connection cannot express an operation. Orderings run through the Arrow
//! kernels in [`crate::columnar`].

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono_tz::Tz;
use serde_json::Value;

use crate::columnar::{compare_rows, sort_permutation};
use crate::error::{DataError, DataResult};
use crate::query::{
    parse_datetime, Aggregate, AggregateOp, Projection, QueryOp, SortKey, StackOffset,
    WindowColumn, WindowOp,
};
use crate::schema::{DataType, Field, Schema};
use crate::table::{Row, Table};
use crate::timeunit::{self, TimeUnit};
use crate::value::{as_f64, integral_number, is_valid, number, sort_cmp, to_display_string, truthy};

/// Apply a pipeline of operators in order.
pub fn execute(table: &Table, ops: &[QueryOp]) -> DataResult<Table> {
    let mut current = table.clone();
    for op in ops {
        current = apply(&current, op)?;
    }
    Ok(current)
}

/// Apply a single operator.
pub fn apply(table: &Table, op: &QueryOp) -> DataResult<Table> {
    let schema = op.output_schema(table.schema());
    let rows: Vec<Row> = match op {
        QueryOp::Filter(predicate) => table
            .rows()
            .iter()
            .filter(|row| truthy(&predicate.eval(row)))
            .cloned()
            .collect(),
        QueryOp::Formula { expr, alias } => table
            .rows()
            .iter()
            .map(|row| {
                let mut out = row.clone();
                out.insert(alias.clone(), expr.eval(row));
                out
            })
            .collect(),
        QueryOp::Aggregate {
            groupby,
            aggregates,
        } => aggregate_rows(table.rows(), groupby, aggregates),
        QueryOp::JoinAggregate {
            groupby,
            aggregates,
        } => join_aggregate_rows(table.rows(), groupby, aggregates),
        QueryOp::Sort(keys) => sort_rows(table.rows(), keys)?,
        QueryOp::Project(projections) => project_rows(table.rows(), projections),
        QueryOp::Limit(n) => table.rows().iter().take(*n).cloned().collect(),
        QueryOp::Window {
            groupby,
            sort,
            columns,
            ignore_peers,
        } => window_rows(table.rows(), groupby, sort, columns, *ignore_peers)?,
        QueryOp::Stack {
            field,
            groupby,
            sort,
            offset,
            start,
            stop,
        } => stack_rows(table.rows(), field, groupby, sort, *offset, (start, stop))?,
        QueryOp::Pivot {
            field,
            value,
            groupby,
            limit,
            op,
        } => return Ok(pivot_table(table, field, value, groupby, *limit, *op)),
        QueryOp::Fold { fields, key, value } => fold_rows(table.rows(), fields, key, value),
        QueryOp::Impute {
            field,
            key,
            groupby,
            value,
        } => impute_rows(table.rows(), field, key, groupby, value),
        QueryOp::TimeUnit {
            field,
            units,
            timezone,
            input_timezone,
            start,
            end,
        } => {
            let zones = (parse_zone(timezone)?, parse_zone(input_timezone)?);
            timeunit_rows(table.rows(), field, units, zones, start, end.as_deref())
        }
    };
    Ok(Table::new(schema, rows))
}

fn group_key(row: &Row, groupby: &[String]) -> String {
    let key: Vec<&Value> = groupby
        .iter()
        .map(|g| row.get(g).unwrap_or(&Value::Null))
        .collect();
    serde_json::to_string(&key).unwrap_or_default()
}

/// Partition row indices by group key, in first-appearance order.
fn partition(rows: &[Row], groupby: &[String]) -> (Vec<Vec<usize>>, Vec<usize>) {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut membership = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let key = group_key(row, groupby);
        let g = *index.entry(key).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[g].push(i);
        membership.push(g);
    }
    (groups, membership)
}

fn aggregate_rows(rows: &[Row], groupby: &[String], aggregates: &[Aggregate]) -> Vec<Row> {
    let (groups, _) = partition(rows, groupby);
    groups
        .iter()
        .map(|members| {
            let mut out = Row::new();
            if let Some(&first) = members.first() {
                for g in groupby {
                    out.insert(g.clone(), rows[first].get(g).cloned().unwrap_or(Value::Null));
                }
            }
            for agg in aggregates {
                out.insert(agg.alias.clone(), aggregate_value(rows, members, agg));
            }
            out
        })
        .collect()
}

fn join_aggregate_rows(rows: &[Row], groupby: &[String], aggregates: &[Aggregate]) -> Vec<Row> {
    let (groups, membership) = partition(rows, groupby);
    let results: Vec<Vec<Value>> = groups
        .iter()
        .map(|members| {
            aggregates
                .iter()
                .map(|agg| aggregate_value(rows, members, agg))
                .collect()
        })
        .collect();
    rows.iter()
        .zip(membership)
        .map(|(row, g)| {
            let mut out = row.clone();
            for (agg, value) in aggregates.iter().zip(&results[g]) {
                out.insert(agg.alias.clone(), value.clone());
            }
            out
        })
        .collect()
}

fn aggregate_value(rows: &[Row], members: &[usize], agg: &Aggregate) -> Value {
    let values = || {
        members.iter().map(move |&i| match &agg.field {
            Some(f) => rows[i].get(f).unwrap_or(&Value::Null),
            None => &Value::Null,
        })
    };
    match agg.op {
        AggregateOp::Count => Value::from(members.len() as i64),
        AggregateOp::Valid => Value::from(values().filter(|v| is_valid(v)).count() as i64),
        AggregateOp::Missing => Value::from(values().filter(|v| v.is_null()).count() as i64),
        AggregateOp::Distinct => {
            let distinct: BTreeSet<String> = values().map(|v| v.to_string()).collect();
            Value::from(distinct.len() as i64)
        }
        AggregateOp::Sum => {
            let valid: Vec<&Value> = values().filter(|v| is_valid(v)).collect();
            if valid.iter().all(|v| v.is_i64()) {
                let total = valid
                    .iter()
                    .filter_map(|v| v.as_i64())
                    .try_fold(0i64, |acc, x| acc.checked_add(x));
                if let Some(total) = total {
                    return Value::from(total);
                }
            }
            number(valid.iter().filter_map(|v| as_f64(v)).sum())
        }
        AggregateOp::Mean | AggregateOp::Average => {
            let nums: Vec<f64> = values()
                .filter(|v| is_valid(v))
                .filter_map(as_f64)
                .collect();
            if nums.is_empty() {
                Value::Null
            } else {
                number(nums.iter().sum::<f64>() / nums.len() as f64)
            }
        }
        AggregateOp::Min | AggregateOp::Max => {
            let mut best: Option<&Value> = None;
            for v in values().filter(|v| is_valid(v)) {
                let replace = match best {
                    None => true,
                    Some(b) => {
                        let ord = sort_cmp(v, b);
                        if agg.op == AggregateOp::Min {
                            ord.is_lt()
                        } else {
                            ord.is_gt()
                        }
                    }
                };
                if replace {
                    best = Some(v);
                }
            }
            best.cloned().unwrap_or(Value::Null)
        }
    }
}

fn sort_rows(rows: &[Row], keys: &[SortKey]) -> DataResult<Vec<Row>> {
    let all: Vec<usize> = (0..rows.len()).collect();
    Ok(sort_permutation(rows, &all, keys)?
        .into_iter()
        .map(|i| rows[i].clone())
        .collect())
}

fn project_rows(rows: &[Row], projections: &[Projection]) -> Vec<Row> {
    rows.iter()
        .map(|row| {
            projections
                .iter()
                .map(|p| {
                    (
                        p.alias.clone(),
                        row.get(&p.field).cloned().unwrap_or(Value::Null),
                    )
                })
                .collect()
        })
        .collect()
}

/// Frame aggregates maintained incrementally as the frame grows.
struct Running<'a> {
    rows: usize,
    numbers: usize,
    float_sum: f64,
    int_sum: Option<i64>,
    min: Option<&'a Value>,
    max: Option<&'a Value>,
}

impl<'a> Running<'a> {
    fn new() -> Self {
        Self {
            rows: 0,
            numbers: 0,
            float_sum: 0.0,
            int_sum: Some(0),
            min: None,
            max: None,
        }
    }

    fn push(&mut self, value: &'a Value) {
        self.rows += 1;
        if !is_valid(value) {
            return;
        }
        if let Some(x) = as_f64(value) {
            self.float_sum += x;
            self.numbers += 1;
        }
        self.int_sum = match (self.int_sum, value.as_i64()) {
            (Some(acc), Some(x)) if value.is_i64() => acc.checked_add(x),
            _ => None,
        };
        if self.min.map_or(true, |m| sort_cmp(value, m).is_lt()) {
            self.min = Some(value);
        }
        if self.max.map_or(true, |m| sort_cmp(value, m).is_gt()) {
            self.max = Some(value);
        }
    }

    fn value(&self, op: AggregateOp) -> Value {
        match op {
            AggregateOp::Count => Value::from(self.rows as i64),
            AggregateOp::Sum => self
                .int_sum
                .map(Value::from)
                .unwrap_or_else(|| number(self.float_sum)),
            AggregateOp::Mean | AggregateOp::Average if self.numbers > 0 => {
                number(self.float_sum / self.numbers as f64)
            }
            AggregateOp::Min => self.min.cloned().unwrap_or(Value::Null),
            AggregateOp::Max => self.max.cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }
}

fn field_of<'a>(row: &'a Row, field: Option<&str>) -> &'a Value {
    field.and_then(|f| row.get(f)).unwrap_or(&Value::Null)
}

fn window_rows(
    rows: &[Row],
    groupby: &[String],
    sort: &[SortKey],
    columns: &[WindowColumn],
    ignore_peers: bool,
) -> DataResult<Vec<Row>> {
    let (groups, _) = partition(rows, groupby);
    let mut out = rows.to_vec();
    for members in &groups {
        let ordered = sort_permutation(rows, members, sort)?;
        let n = ordered.len();

        // [first, end) of each position's peers, and its dense rank
        let mut peers = vec![(0, 0, 0); n];
        let (mut p, mut dense) = (0, 0);
        while p < n {
            let mut q = p + 1;
            while q < n
                && !sort.is_empty()
                && compare_rows(&rows[ordered[p]], &rows[ordered[q]], sort).is_eq()
            {
                q += 1;
            }
            dense += 1;
            peers[p..q].fill((p, q, dense));
            p = q;
        }

        let mut running: Vec<Running<'_>> = columns.iter().map(|_| Running::new()).collect();
        let mut consumed = 0;
        for (pos, &i) in ordered.iter().enumerate() {
            let (first, end, dense) = peers[pos];
            let frame_end = if ignore_peers { pos + 1 } else { end };
            while consumed < frame_end {
                let row = &rows[ordered[consumed]];
                for (state, column) in running.iter_mut().zip(columns) {
                    state.push(field_of(row, column.field.as_deref()));
                }
                consumed += 1;
            }
            for (state, column) in running.iter().zip(columns) {
                let value = match column.op {
                    WindowOp::RowNumber => Value::from(pos as i64 + 1),
                    WindowOp::Rank => Value::from(first as i64 + 1),
                    WindowOp::DenseRank => Value::from(dense as i64),
                    WindowOp::PercentRank if n > 1 => number(first as f64 / (n - 1) as f64),
                    WindowOp::PercentRank => number(0.0),
                    WindowOp::CumeDist => number(end as f64 / n as f64),
                    WindowOp::FirstValue => {
                        field_of(&rows[ordered[0]], column.field.as_deref()).clone()
                    }
                    WindowOp::LastValue => {
                        field_of(&rows[ordered[frame_end - 1]], column.field.as_deref()).clone()
                    }
                    op => op.aggregate().map_or(Value::Null, |agg| state.value(agg)),
                };
                out[i].insert(column.alias.clone(), value);
            }
        }
    }
    Ok(out)
}

fn stack_rows(
    rows: &[Row],
    field: &str,
    groupby: &[String],
    sort: &[SortKey],
    offset: StackOffset,
    (start, stop): (&String, &String),
) -> DataResult<Vec<Row>> {
    // non-numeric values stack as zero
    let value = |i: usize| {
        rows[i]
            .get(field)
            .and_then(as_f64)
            .filter(|x| x.is_finite())
            .unwrap_or(0.0)
    };
    let (groups, _) = partition(rows, groupby);
    let totals: Vec<f64> = groups
        .iter()
        .map(|members| members.iter().map(|&i| value(i).abs()).sum())
        .collect();
    let max_total = totals.iter().copied().fold(0.0, f64::max);

    let mut out = rows.to_vec();
    for (members, &total) in groups.iter().zip(&totals) {
        let scale = if total == 0.0 { 0.0 } else { 1.0 / total };
        let (mut positive, mut negative) = (0.0, 0.0);
        let mut last = match offset {
            StackOffset::Center => (max_total - total) / 2.0,
            StackOffset::Zero | StackOffset::Normalize => 0.0,
        };
        for i in sort_permutation(rows, members, sort)? {
            let v = value(i);
            let (lo, hi) = match offset {
                StackOffset::Zero if v < 0.0 => {
                    let lo = negative;
                    negative += v;
                    (lo, negative)
                }
                StackOffset::Zero => {
                    let lo = positive;
                    positive += v;
                    (lo, positive)
                }
                StackOffset::Center => {
                    let lo = last;
                    last += v.abs();
                    (lo, last)
                }
                StackOffset::Normalize => {
                    let lo = last;
                    last += scale * v.abs();
                    (lo, last)
                }
            };
            out[i].insert(start.clone(), integral_number(lo));
            out[i].insert(stop.clone(), integral_number(hi));
        }
    }
    Ok(out)
}

/// Column name for a pivoted value.
fn pivot_name(value: &Value) -> String {
    match value {
        Value::String(s) if s.is_empty() => " ".to_string(),
        other => to_display_string(other),
    }
}

fn pivot_table(
    table: &Table,
    field: &str,
    value: &str,
    groupby: &[String],
    limit: Option<usize>,
    op: AggregateOp,
) -> Table {
    let rows = table.rows();

    // one column per distinct name; nulls first, then ascending
    let mut seen = HashSet::new();
    let mut keys: Vec<(&Value, String)> = Vec::new();
    for v in rows.iter().map(|row| row.get(field).unwrap_or(&Value::Null)) {
        let name = pivot_name(v);
        if seen.insert(name.clone()) {
            keys.push((v, name));
        }
    }
    keys.sort_by(|(a, _), (b, _)| match (a.is_null(), b.is_null()) {
        (true, true) => std::cmp::Ordering::Equal,
        (true, false) => std::cmp::Ordering::Less,
        (false, true) => std::cmp::Ordering::Greater,
        (false, false) => sort_cmp(a, b),
    });
    if let Some(limit) = limit.filter(|&l| l > 0) {
        keys.truncate(limit);
    }

    let value_type = table.schema().data_type(value).unwrap_or(DataType::Null);
    let mut fields: Vec<Field> = groupby
        .iter()
        .map(|g| Field::new(g.clone(), table.schema().data_type(g).unwrap_or(DataType::Null)))
        .collect();
    fields.extend(
        keys.iter()
            .map(|(_, name)| Field::new(name.clone(), op.output_type(value_type))),
    );

    let (groups, _) = partition(rows, groupby);
    let out = groups
        .iter()
        .map(|members| {
            let mut by_name: HashMap<String, Vec<usize>> = HashMap::new();
            for &i in members {
                by_name
                    .entry(pivot_name(rows[i].get(field).unwrap_or(&Value::Null)))
                    .or_default()
                    .push(i);
            }
            let mut row = Row::new();
            if let Some(&first) = members.first() {
                for g in groupby {
                    row.insert(g.clone(), rows[first].get(g).cloned().unwrap_or(Value::Null));
                }
            }
            for (_, name) in &keys {
                let cell = Aggregate {
                    op,
                    field: Some(value.to_string()),
                    alias: name.clone(),
                };
                let subset = by_name.get(name).map(Vec::as_slice).unwrap_or_default();
                row.insert(name.clone(), aggregate_value(rows, subset, &cell));
            }
            row
        })
        .collect();
    Table::new(Schema::new(fields), out)
}

fn fold_rows(rows: &[Row], fields: &[String], key: &str, value: &str) -> Vec<Row> {
    rows.iter()
        .flat_map(|row| {
            fields.iter().map(move |f| {
                let mut out = row.clone();
                out.insert(key.to_string(), Value::from(f.as_str()));
                out.insert(value.to_string(), row.get(f).cloned().unwrap_or(Value::Null));
                out
            })
        })
        .collect()
}

fn impute_rows(
    rows: &[Row],
    field: &str,
    key: &str,
    groupby: &[String],
    value: &Value,
) -> Vec<Row> {
    let mut out: Vec<Row> = rows
        .iter()
        .map(|row| {
            let mut row = row.clone();
            if row.get(field).map_or(true, Value::is_null) {
                row.insert(field.to_string(), value.clone());
            }
            row
        })
        .collect();

    let mut seen = HashSet::new();
    let keys: Vec<&Value> = rows
        .iter()
        .filter_map(|row| row.get(key))
        .filter(|k| !k.is_null() && seen.insert(k.to_string()))
        .collect();

    let (groups, _) = partition(rows, groupby);
    for members in &groups {
        let present: HashSet<String> = members
            .iter()
            .filter_map(|&i| rows[i].get(key))
            .map(Value::to_string)
            .collect();
        for k in keys.iter().filter(|k| !present.contains(&k.to_string())) {
            let mut row = Row::new();
            if let Some(&first) = members.first() {
                for g in groupby {
                    row.insert(g.clone(), rows[first].get(g).cloned().unwrap_or(Value::Null));
                }
            }
            row.insert(key.to_string(), (*k).clone());
            row.insert(field.to_string(), value.clone());
            out.push(row);
        }
    }
    out
}

fn parse_zone(name: &str) -> DataResult<Tz> {
    name.parse::<Tz>()
        .map_err(|_| DataError::InvalidData(format!("unknown time zone '{name}'")))
}

fn timeunit_rows(
    rows: &[Row],
    field: &str,
    units: &[TimeUnit],
    (tz, input_tz): (Tz, Tz),
    start: &str,
    end: Option<&str>,
) -> Vec<Row> {
    rows.iter()
        .map(|row| {
            let millis = match row.get(field) {
                Some(Value::String(text)) => parse_datetime(text, input_tz),
                Some(v @ Value::Number(_)) => {
                    as_f64(v).filter(|x| x.is_finite()).map(|x| x as i64)
                }
                _ => None,
            };
            let bounds = millis.and_then(|ms| timeunit::floor(ms, units, tz));
            let mut out = row.clone();
            out.insert(
                start.to_string(),
                bounds.map_or(Value::Null, |(lo, _)| Value::from(lo)),
            );
            if let Some(end) = end {
                out.insert(
                    end.to_string(),
                    bounds.map_or(Value::Null, |(_, hi)| Value::from(hi)),
                );
            }
            out
        })
        .collect()
}
