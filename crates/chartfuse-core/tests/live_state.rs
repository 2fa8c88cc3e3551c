//! Live sessions, spec patching and the channel transport, each checked
//! against a one-shot pre-transform of the same chart.

use std::sync::Arc;

use chartfuse_core::*;
use chartfuse_data::{MemoryConnection, Table};
use serde_json::{json, Value};

fn items() -> Table {
    Table::from_json(&json!([
        {"k": 1, "v": 10},
        {"k": 2, "v": 20},
        {"k": 2, "v": 30},
        {"k": 3, "v": 40},
        {"k": 3, "v": 50},
        {"k": 3, "v": 60}
    ]))
    .unwrap()
}

fn chart(pick: i64) -> Value {
    json!({
        "description": "items by key",
        "signals": [
            {"name": "pick", "value": pick, "bind": {"input": "range", "min": 1, "max": 3}}
        ],
        "data": [
            {"name": "items", "url": "table://items"},
            {"name": "picked", "source": "items", "transform": [
                {"type": "filter", "expr": "datum.k == pick"}
            ]},
            {"name": "totals", "source": "items", "transform": [
                {"type": "aggregate", "groupby": ["k"]}
            ]}
        ],
        "marks": [
            {"type": "symbol", "from": {"data": "picked"}},
            {"type": "rect", "from": {"data": "totals"},
             "encode": {"update": {"y": {"field": "count"}}}}
        ]
    })
}

fn spec(value: Value) -> ChartSpec {
    ChartSpec::from_value(value).unwrap()
}

fn runtime() -> Runtime {
    Runtime::new(RuntimeConfig::default(), Arc::new(MemoryConnection::new())).unwrap()
}

fn options() -> PreTransformOptions {
    PreTransformOptions::default().with_inline_dataset("items", items())
}

fn pick(value: i64) -> VariableUpdate {
    VariableUpdate {
        variable: Variable::signal("pick").scoped(Scope::root()),
        value: json!(value),
    }
}

fn data_values(spec: &ChartSpec, name: &str) -> Value {
    spec.get_nested_data(&Scope::root(), name)
        .unwrap()
        .values
        .clone()
        .unwrap()
}

#[tokio::test]
async fn session_updates_match_one_shot_runs() {
    let rt = runtime();
    let state = rt.new_chart_state(&spec(chart(2)), options()).await.unwrap();
    assert_eq!(state.get_input_spec(), &spec(chart(2)));

    for value in [3, 1, 2] {
        let changed = state.update(vec![pick(value)]).await.unwrap();
        let picked = changed
            .iter()
            .find(|u| u.variable.name() == "picked")
            .expect("picked was sent");

        // the same chart evaluated entirely on the server
        let one_shot = rt
            .pre_transform_spec(
                &spec(chart(value)),
                &options().with_preserve_interactivity(false),
            )
            .await
            .unwrap();
        assert_eq!(picked.value, data_values(&one_shot.spec, "picked"));
        // totals never depend on the signal
        assert!(changed.iter().all(|u| u.variable.name() != "totals"));
    }
}

#[tokio::test]
async fn the_client_spec_carries_the_initial_values() {
    let state = runtime()
        .new_chart_state(&spec(chart(3)), options())
        .await
        .unwrap();
    let client = state.get_client_spec();
    assert_eq!(
        data_values(client, "totals"),
        json!([
            {"k": 1, "count": 1},
            {"k": 2, "count": 2},
            {"k": 3, "count": 3}
        ])
    );
    assert_eq!(data_values(client, "picked").as_array().unwrap().len(), 3);
    assert!(state
        .get_server_spec()
        .get_nested_data(&Scope::root(), "items")
        .ok()
        .is_some());

    state.update(vec![pick(1)]).await.unwrap();
    // updates flow back to the caller, not into the stored client spec
    assert_eq!(data_values(state.get_client_spec(), "picked").as_array().unwrap().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_updates_are_applied_one_batch_at_a_time() {
    let state = Arc::new(
        runtime()
            .new_chart_state(&spec(chart(2)), options())
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for value in [1, 2, 3, 1, 2, 3, 1, 2] {
        let state = Arc::clone(&state);
        handles.push(tokio::spawn(async move { state.update(vec![pick(value)]).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // whatever the interleaving, the session settles on the last value set
    state.update(vec![pick(3)]).await.unwrap();
    assert!(state.update(vec![pick(3)]).await.unwrap().is_empty());
    assert!(state.get_warnings().await.unwrap().is_empty());
}

#[tokio::test]
async fn patched_specs_equal_a_full_run() {
    let rt = runtime();
    let spec1 = spec(chart(2));
    let transformed1 = rt.pre_transform_spec(&spec1, &options()).await.unwrap().spec;

    // unchanged input: the transformed spec comes back as is
    assert_eq!(
        patch_pre_transformed_spec(&spec1, &transformed1, &spec1).unwrap(),
        Some(transformed1.clone())
    );

    let mut edited = chart(2);
    edited["description"] = json!("counts per key");
    edited["marks"][1]["encode"]["update"]["fill"] = json!({"value": "steelblue"});
    let spec2 = spec(edited);

    let patched = patch_pre_transformed_spec(&spec1, &transformed1, &spec2)
        .unwrap()
        .expect("edit stays outside transformed content");
    let full = rt.pre_transform_spec(&spec2, &options()).await.unwrap().spec;
    assert_eq!(patched, full);
}

#[tokio::test]
async fn edits_to_server_work_are_not_patched() {
    let rt = runtime();
    let spec1 = spec(chart(2));
    let transformed1 = rt.pre_transform_spec(&spec1, &options()).await.unwrap().spec;

    let mut edited = chart(2);
    edited["data"][2]["transform"][0]["groupby"] = json!(["v"]);
    assert!(patch_pre_transformed_spec(&spec1, &transformed1, &spec(edited))
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn channel_answers_like_the_runtime() {
    let rt = runtime();
    let channel = ChannelRuntime::spawn(rt.clone());
    let spec = spec(chart(2));

    let direct = rt.pre_transform_spec(&spec, &options()).await.unwrap();
    let remote = channel.pre_transform_spec(&spec, &options()).await.unwrap();
    assert_eq!(direct.spec, remote.spec);
    assert_eq!(direct.warnings, remote.warnings);

    let totals = Variable::data("totals").scoped(Scope::root());
    let datasets = channel
        .pre_transform_datasets(&spec, &[totals.clone()], &options())
        .await
        .unwrap();
    assert_eq!(datasets.datasets.len(), 1);
    assert_eq!(datasets.datasets[0].variable, totals);
    assert_eq!(datasets.datasets[0].table.num_rows(), 3);

    let err = channel
        .pre_transform_extract(&spec, &ExtractOptions::new(options()))
        .await
        .unwrap_err();
    assert!(matches!(err, ChartError::NotSupportedOverTransport(_)));
}

#[tokio::test]
async fn a_bad_maxbins_update_fails_and_leaves_the_session_usable() {
    let chart = json!({
        "signals": [
            {"name": "bins", "value": 5, "bind": {"input": "range", "min": 1, "max": 20}}
        ],
        "data": [
            {"name": "items", "url": "table://items"},
            {"name": "binned", "source": "items", "transform": [
                {"type": "bin", "field": "v", "extent": [0, 60], "maxbins": {"signal": "bins"}}
            ]}
        ],
        "marks": [{"type": "rect", "from": {"data": "binned"}}]
    });
    let state = runtime().new_chart_state(&spec(chart), options()).await.unwrap();
    let bins = |value: f64| VariableUpdate {
        variable: Variable::signal("bins").scoped(Scope::root()),
        value: json!(value),
    };

    for bad in [-1.0, 0.0] {
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            state.update(vec![bins(bad)]),
        )
        .await
        .expect("update returns instead of spinning");
        assert!(matches!(result, Err(ChartError::Expression(_))), "{result:?}");
    }

    let changed = state.update(vec![bins(2.0)]).await.unwrap();
    assert!(changed.iter().any(|u| u.variable.name() == "binned"));
}
