//! End-to-end pre-transform behaviour against in-memory connections.
//!
//! Covers grouped counts over inline datasets, cache correctness when the
//! inline data changes, determinism, row limits, single-flight sharing of
//! concurrent work, and the default-engine fallback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chartfuse_core::*;
use chartfuse_data::{
    Connection, DataResult, MemoryConnection, Query, QueryOp, Schema, Table,
};
use serde_json::{json, Value};

/// Memory connection that counts queries and can refuse aggregation.
struct CountingConnection {
    inner: MemoryConnection,
    queries: AtomicUsize,
    aggregate: bool,
    fallback: bool,
}

impl CountingConnection {
    fn new() -> Self {
        Self {
            inner: MemoryConnection::new(),
            queries: AtomicUsize::new(0),
            aggregate: true,
            fallback: true,
        }
    }

    fn without_aggregate(mut self, fallback: bool) -> Self {
        self.aggregate = false;
        self.fallback = fallback;
        self
    }

    fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for CountingConnection {
    fn id(&self) -> String {
        "counting".to_string()
    }

    fn fallback(&self) -> bool {
        self.fallback
    }

    fn supports(&self, op: &QueryOp) -> bool {
        self.aggregate || !matches!(op, QueryOp::Aggregate { .. })
    }

    async fn tables(&self) -> DataResult<HashMap<String, Schema>> {
        self.inner.tables().await
    }

    async fn fetch_query(&self, query: &Query, expected: &Schema) -> DataResult<Table> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_query(query, expected).await
    }

    async fn register_table(&self, name: &str, table: Table, temporary: bool) -> DataResult<()> {
        self.inner.register_table(name, table, temporary).await
    }

    async fn unregister(&self, name: &str) -> DataResult<()> {
        self.inner.unregister(name).await
    }
}

/// `sizes[i]` rows with `menu_item = i`.
fn order_items(sizes: &[usize]) -> Table {
    let rows: Vec<Value> = sizes
        .iter()
        .enumerate()
        .flat_map(|(item, n)| (0..*n).map(move |i| json!({"menu_item": item, "order": i})))
        .collect();
    Table::from_json(&Value::Array(rows)).unwrap()
}

fn counts_spec() -> ChartSpec {
    ChartSpec::from_value(json!({
        "$schema": "https://vega.github.io/schema/vega/v5.json",
        "data": [
            {"name": "order_items", "url": "vegafusion+dataset://order_items"},
            {"name": "counts", "source": "order_items", "transform": [
                {"type": "aggregate", "groupby": ["menu_item"]}
            ]}
        ],
        "marks": [{
            "type": "rect",
            "from": {"data": "counts"},
            "encode": {"update": {"y": {"field": "count"}}}
        }]
    }))
    .unwrap()
}

fn runtime(connection: Arc<dyn Connection>) -> Runtime {
    Runtime::new(RuntimeConfig::default().with_worker_threads(4), connection).unwrap()
}

fn counts_of(spec: &ChartSpec) -> Value {
    spec.get_nested_data(&Scope::root(), "counts")
        .unwrap()
        .values
        .clone()
        .unwrap()
}

#[tokio::test]
async fn grouped_counts_follow_the_inline_data() {
    let rt = runtime(Arc::new(MemoryConnection::new()));
    let n = 4050;

    let opts = PreTransformOptions::default().with_inline_dataset("order_items", order_items(&[n, n]));
    let out = rt.pre_transform_spec(&counts_spec(), &opts).await.unwrap();
    assert!(out.warnings.is_empty());
    assert_eq!(
        counts_of(&out.spec),
        json!([{"menu_item": 0, "count": 4050}, {"menu_item": 1, "count": 4050}])
    );

    // same node, new upstream data: never the cached result
    let opts = PreTransformOptions::default()
        .with_inline_dataset("order_items", order_items(&[n, 2 * n, 3 * n]));
    let out = rt.pre_transform_spec(&counts_spec(), &opts).await.unwrap();
    assert_eq!(
        counts_of(&out.spec),
        json!([
            {"menu_item": 0, "count": 4050},
            {"menu_item": 1, "count": 8100},
            {"menu_item": 2, "count": 12150}
        ])
    );

    let opts = PreTransformOptions::default()
        .with_inline_dataset("order_items", order_items(&[2 * n, 2 * n]));
    let out = rt.pre_transform_spec(&counts_spec(), &opts).await.unwrap();
    assert_eq!(
        counts_of(&out.spec),
        json!([{"menu_item": 0, "count": 8100}, {"menu_item": 1, "count": 8100}])
    );
}

#[tokio::test]
async fn only_requested_datasets_reach_the_client() {
    let rt = runtime(Arc::new(MemoryConnection::new()));
    let opts = PreTransformOptions::default().with_inline_dataset("order_items", order_items(&[3, 4]));
    let out = rt.pre_transform_spec(&counts_spec(), &opts).await.unwrap();
    let names: Vec<_> = out.spec.data.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, ["counts"]);
    assert_eq!(
        out.spec.schema.as_deref(),
        Some("https://vega.github.io/schema/vega/v5.json")
    );
}

#[tokio::test]
async fn repeated_runs_are_byte_identical() {
    let opts = PreTransformOptions::default()
        .with_inline_dataset("order_items", order_items(&[5, 7, 9]))
        .with_row_limit(2);

    let first = runtime(Arc::new(MemoryConnection::new()))
        .pre_transform_spec(&counts_spec(), &opts)
        .await
        .unwrap();
    let rt = runtime(Arc::new(MemoryConnection::new()));
    let second = rt.pre_transform_spec(&counts_spec(), &opts).await.unwrap();
    // the third run is answered from the cache
    let third = rt.pre_transform_spec(&counts_spec(), &opts).await.unwrap();

    let text = |out: &TransformedSpec| serde_json::to_string(&out.spec).unwrap();
    assert_eq!(text(&first), text(&second));
    assert_eq!(text(&second), text(&third));
    assert_eq!(first.warnings, second.warnings);
    assert_eq!(second.warnings, third.warnings);
}

#[tokio::test]
async fn row_limit_truncates_each_output_once() {
    let rt = runtime(Arc::new(MemoryConnection::new()));
    let opts = PreTransformOptions::default()
        .with_inline_dataset("order_items", order_items(&[1, 1, 1, 1, 1, 1]))
        .with_row_limit(4);
    let out = rt.pre_transform_spec(&counts_spec(), &opts).await.unwrap();

    assert_eq!(counts_of(&out.spec).as_array().unwrap().len(), 4);
    let limited: Vec<_> = out
        .warnings
        .iter()
        .filter(|w| w.kind == WarningKind::RowLimitExceeded)
        .collect();
    assert_eq!(limited.len(), 1);
    assert!(limited[0].message.contains("counts"));

    // cached values stay whole
    let tables = rt
        .pre_transform_datasets(
            &counts_spec(),
            &[Variable::data("counts").scoped(Scope::root())],
            &PreTransformOptions::default()
                .with_inline_dataset("order_items", order_items(&[1, 1, 1, 1, 1, 1])),
        )
        .await
        .unwrap();
    assert_eq!(tables.datasets[0].table.num_rows(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_requests_share_one_computation() {
    let conn = Arc::new(CountingConnection::new());
    let rt = runtime(conn.clone());
    let opts = PreTransformOptions::default().with_inline_dataset("order_items", order_items(&[40, 60]));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let rt = rt.clone();
        let opts = opts.clone();
        handles.push(tokio::spawn(async move {
            rt.pre_transform_spec(&counts_spec(), &opts).await
        }));
    }
    let mut specs = Vec::new();
    for handle in handles {
        specs.push(handle.await.unwrap().unwrap().spec);
    }

    assert!(specs.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(conn.queries(), 1);
}

#[tokio::test]
async fn unsupported_operations_fall_back_with_a_warning() {
    let conn = Arc::new(CountingConnection::new().without_aggregate(true));
    let rt = runtime(conn.clone());
    let opts = PreTransformOptions::default().with_inline_dataset("order_items", order_items(&[2, 3]));
    let out = rt.pre_transform_spec(&counts_spec(), &opts).await.unwrap();

    assert_eq!(
        counts_of(&out.spec),
        json!([{"menu_item": 0, "count": 2}, {"menu_item": 1, "count": 3}])
    );
    assert_eq!(conn.queries(), 0);
    assert_eq!(out.warnings.len(), 1);
    assert_eq!(out.warnings[0].kind, WarningKind::Planner);
    assert!(out.warnings[0].message.contains("counts"));

    // a cache hit reports the same warning
    let again = rt.pre_transform_spec(&counts_spec(), &opts).await.unwrap();
    assert_eq!(again.warnings, out.warnings);
}

#[tokio::test]
async fn fallback_is_an_error_when_the_connection_forbids_it() {
    let conn = Arc::new(CountingConnection::new().without_aggregate(false));
    let rt = runtime(conn);
    let opts = PreTransformOptions::default().with_inline_dataset("order_items", order_items(&[2, 3]));
    let err = rt.pre_transform_spec(&counts_spec(), &opts).await.unwrap_err();
    match err {
        ChartError::UnsupportedTransform { dataset, transform } => {
            assert_eq!(dataset, "counts");
            assert_eq!(transform, "aggregate");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn connection_tables_are_queried_in_place() {
    let conn = Arc::new(CountingConnection::new());
    conn.inner.insert("orders", order_items(&[3, 1])).await;
    let rt = runtime(conn.clone());

    let spec = ChartSpec::from_value(json!({
        "data": [{"name": "counts", "url": "orders", "transform": [
            {"type": "aggregate", "groupby": ["menu_item"]}
        ]}],
        "marks": [{"type": "rect", "from": {"data": "counts"}}]
    }))
    .unwrap();
    let out = rt.pre_transform_spec(&spec, &PreTransformOptions::default()).await.unwrap();
    assert_eq!(
        counts_of(&out.spec),
        json!([{"menu_item": 0, "count": 3}, {"menu_item": 1, "count": 1}])
    );
    assert_eq!(conn.queries(), 1);
}

#[tokio::test]
async fn signals_computed_from_data_are_inlined() {
    let rt = runtime(Arc::new(MemoryConnection::new()));
    let spec = ChartSpec::from_value(json!({
        "signals": [{"name": "total", "update": "length(data('order_items'))"}],
        "data": [
            {"name": "order_items", "url": "table://order_items", "transform": [
                {"type": "extent", "field": "order", "signal": "order_extent"}
            ]}
        ],
        "scales": [{"name": "x", "domain": {"signal": "order_extent"}}],
        "marks": [{"type": "text", "encode": {"update": {"text": {"signal": "total"}}}}]
    }))
    .unwrap();
    let opts = PreTransformOptions::default().with_inline_dataset("order_items", order_items(&[3, 2]));
    let out = rt.pre_transform_spec(&spec, &opts).await.unwrap();

    let total = out.spec.get_nested_signal(&Scope::root(), "total").unwrap();
    assert_eq!(total.value, Some(json!(5)));
    assert!(total.update.is_none());
    let extent = out.spec.get_nested_signal(&Scope::root(), "order_extent").unwrap();
    assert_eq!(extent.value, Some(json!([0, 2])));
    assert!(out.spec.data.is_empty());
}

fn grouped_spec() -> ChartSpec {
    ChartSpec::from_value(json!({
        "data": [{"name": "order_items", "url": "table://order_items"}],
        "marks": [
            {"type": "group",
             "data": [{"name": "totals", "source": "order_items", "transform": [
                 {"type": "aggregate", "groupby": ["menu_item"]}
             ]}],
             "marks": [{"type": "rect", "from": {"data": "totals"}}]},
            {"type": "group",
             "data": [{"name": "totals", "source": "order_items", "transform": [
                 {"type": "filter", "expr": "datum.menu_item == 1 && datum.order < 2"}
             ]}],
             "marks": [{"type": "rect", "from": {"data": "totals"}}]},
            {"type": "group",
             "from": {"facet": {"name": "per_item", "data": "order_items", "groupby": ["menu_item"]}},
             "data": [{"name": "faceted", "source": "per_item", "transform": [
                 {"type": "aggregate"}
             ]}],
             "marks": [{"type": "symbol", "from": {"data": "faceted"}}]}
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn group_datasets_are_inlined_in_their_own_scope() {
    let rt = runtime(Arc::new(MemoryConnection::new()));
    let opts = PreTransformOptions::default().with_inline_dataset("order_items", order_items(&[1, 3]));
    let out = rt.pre_transform_spec(&grouped_spec(), &opts).await.unwrap();

    let first = out.spec.get_nested_data(&Scope::new(vec![0]), "totals").unwrap();
    assert_eq!(
        first.values,
        Some(json!([{"menu_item": 0, "count": 1}, {"menu_item": 1, "count": 3}]))
    );
    assert!(first.source.is_none() && first.transform.is_empty());

    // same name, sibling group, different pipeline
    let second = out.spec.get_nested_data(&Scope::new(vec![1]), "totals").unwrap();
    assert_eq!(
        second.values,
        Some(json!([{"menu_item": 1, "order": 0}, {"menu_item": 1, "order": 1}]))
    );

    // the facet partition only exists on the client
    let faceted = out.spec.get_nested_data(&Scope::new(vec![2]), "faceted").unwrap();
    assert!(faceted.values.is_none());
    assert_eq!(faceted.transform.len(), 1);
    assert_eq!(faceted.sources(), vec!["per_item".to_string()]);
    assert!(out.warnings.is_empty(), "{:?}", out.warnings);
}

#[tokio::test]
async fn scoped_datasets_are_requested_by_scope() {
    let rt = runtime(Arc::new(MemoryConnection::new()));
    let opts = PreTransformOptions::default().with_inline_dataset("order_items", order_items(&[1, 3]));
    let first = Variable::data("totals").scoped(Scope::new(vec![0]));
    let second = Variable::data("totals").scoped(Scope::new(vec![1]));
    let out = rt
        .pre_transform_datasets(&grouped_spec(), &[second.clone(), first.clone()], &opts)
        .await
        .unwrap();

    assert_eq!(out.datasets.len(), 2);
    assert_eq!(out.datasets[0].variable, second);
    assert_eq!(out.datasets[0].table.num_rows(), 2);
    assert_eq!(out.datasets[1].variable, first);
    assert_eq!(out.datasets[1].table.num_rows(), 2);
    let counts: Vec<Value> = out.datasets[1].table.column("count").cloned().collect();
    assert_eq!(counts, vec![json!(1), json!(3)]);

    let faceted = Variable::data("faceted").scoped(Scope::new(vec![2]));
    let err = rt
        .pre_transform_datasets(&grouped_spec(), &[faceted], &opts)
        .await
        .unwrap_err();
    assert!(matches!(err, ChartError::InvalidRequest(_)), "{err}");
}

fn sales() -> Table {
    Table::from_json(&json!([
        {"region": "east", "quarter": "q1", "amount": 10, "date": "2024-01-15"},
        {"region": "west", "quarter": "q1", "amount": 30, "date": "2024-01-20"},
        {"region": "east", "quarter": "q2", "amount": 20, "date": "2024-04-02"}
    ]))
    .unwrap()
}

fn column(spec: &ChartSpec, dataset: &str, field: &str) -> Vec<Value> {
    let values = spec
        .get_nested_data(&Scope::root(), dataset)
        .ok()
        .and_then(|d| d.values.clone())
        .unwrap_or_else(|| panic!("{dataset} was not inlined"));
    values
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row.get(field).cloned().unwrap_or(Value::Null))
        .collect()
}

#[tokio::test]
async fn reshaping_transforms_run_on_the_server() {
    let rt = runtime(Arc::new(MemoryConnection::new()));
    let spec = ChartSpec::from_value(json!({
        "data": [
            {"name": "sales", "url": "table://sales"},
            {"name": "ranked", "source": "sales", "transform": [
                {"type": "window", "groupby": ["region"],
                 "sort": {"field": "amount", "order": "descending"},
                 "ops": ["rank"], "as": ["rank"]}
            ]},
            {"name": "spread", "source": "sales", "transform": [
                {"type": "pivot", "field": "quarter", "value": "amount", "groupby": ["region"]}
            ]},
            {"name": "monthly", "source": "sales", "transform": [
                {"type": "timeunit", "field": "date", "units": ["year", "month"], "timezone": "utc"},
                {"type": "aggregate", "groupby": ["unit0"]}
            ]},
            {"name": "stacked", "source": "sales", "transform": [
                {"type": "stack", "field": "amount", "groupby": ["quarter"],
                 "sort": {"field": "region"}}
            ]}
        ],
        "marks": [
            {"type": "symbol", "from": {"data": "ranked"}},
            {"type": "symbol", "from": {"data": "spread"}},
            {"type": "rect", "from": {"data": "monthly"}},
            {"type": "rect", "from": {"data": "stacked"}}
        ]
    }))
    .unwrap();
    let opts = PreTransformOptions::default().with_inline_dataset("sales", sales());
    let out = rt.pre_transform_spec(&spec, &opts).await.unwrap();
    assert!(out.warnings.is_empty(), "{:?}", out.warnings);

    assert_eq!(column(&out.spec, "ranked", "rank"), vec![json!(2), json!(1), json!(1)]);
    assert_eq!(
        out.spec
            .get_nested_data(&Scope::root(), "spread")
            .ok()
            .and_then(|d| d.values.clone()),
        Some(json!([
            {"region": "east", "q1": 10, "q2": 20},
            {"region": "west", "q1": 30, "q2": 0}
        ]))
    );
    // 2024-01-01 and 2024-04-01, UTC
    assert_eq!(
        column(&out.spec, "monthly", "unit0"),
        vec![json!(1_704_067_200_000i64), json!(1_711_929_600_000i64)]
    );
    assert_eq!(column(&out.spec, "monthly", "count"), vec![json!(2), json!(1)]);
    assert_eq!(column(&out.spec, "stacked", "y0"), vec![json!(0), json!(10), json!(0)]);
    assert_eq!(column(&out.spec, "stacked", "y1"), vec![json!(10), json!(40), json!(20)]);
}
