//! Live chart sessions.
//!
//! A [`ChartState`] plans its spec once, evaluates the server half, and then
//! takes batches of client-side changes. Each batch re-evaluates only the
//! nodes whose fingerprints moved and answers with the server values that
//! actually changed.

use std::collections::HashMap;
use std::sync::Arc;

use chartfuse_data::Table;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::config::PreTransformOptions;
use crate::error::{ChartError, Result};
use crate::eval::{EvalSettings, Evaluator};
use crate::graph::{
    DataSource, DatasetTask, FingerprintContext, Namespace, NodeIndex, ScopedVariable, Task,
    TaskGraph,
};
use crate::planner::{CommPlan, PlannerConfig};
use crate::runtime::{evaluation_warnings, limited_json, set_client_value, Runtime};
use crate::spec::ChartSpec;
use crate::value::NodeValue;
use crate::warning::{extend_unique, Warning};

/// A new value for one variable, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableUpdate {
    #[serde(flatten)]
    pub variable: ScopedVariable,
    pub value: Value,
}

struct Session {
    graph: Arc<TaskGraph>,
    fingerprints: Arc<Vec<String>>,
    values: HashMap<NodeIndex, NodeValue>,
    /// Last value sent for each server-to-client variable.
    sent: HashMap<ScopedVariable, Value>,
    warnings: Vec<Warning>,
}

pub struct ChartState {
    input_spec: ChartSpec,
    client_spec: ChartSpec,
    server_spec: ChartSpec,
    comm_plan: CommPlan,
    row_limit: Option<usize>,
    context: FingerprintContext,
    settings: Arc<EvalSettings>,
    evaluator: Evaluator,
    /// `None` once closed.
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for ChartState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChartState")
            .field("comm_plan", &self.comm_plan)
            .field("row_limit", &self.row_limit)
            .finish_non_exhaustive()
    }
}

impl ChartState {
    #[instrument(skip_all, fields(row_limit = ?opts.row_limit))]
    pub(crate) async fn try_new(
        runtime: &Runtime,
        spec: &ChartSpec,
        opts: PreTransformOptions,
    ) -> Result<Self> {
        let prepared = runtime.prepare(spec, &opts, PlannerConfig::chart_state()).await?;
        let sent_vars = prepared.plan.comm_plan.server_to_client.clone();
        let targets = prepared.targets(&sent_vars)?;
        let evaluator = runtime.evaluator().clone();
        let values = evaluator
            .evaluate(
                &prepared.graph,
                &prepared.fingerprints,
                &prepared.settings,
                &targets,
                HashMap::new(),
            )
            .await?;

        let mut warnings = prepared.plan.warnings.clone();
        extend_unique(&mut warnings, evaluation_warnings(&prepared.graph, &values)?);

        let mut client_spec = prepared.plan.client_spec.clone();
        let mut sent = HashMap::new();
        for (var, idx) in sent_vars.iter().zip(&targets) {
            let value = values
                .get(idx)
                .map(|v| v.value.clone())
                .ok_or_else(|| ChartError::internal(format!("{var} was not evaluated")))?;
            let json = limited_json(var, value, opts.row_limit, &mut warnings);
            set_client_value(&mut client_spec, var, json.clone())?;
            sent.insert(var.clone(), json);
        }

        info!(
            server_to_client = sent_vars.len(),
            client_to_server = prepared.plan.comm_plan.client_to_server.len(),
            "chart state ready"
        );
        Ok(Self {
            input_spec: spec.clone(),
            client_spec,
            server_spec: prepared.plan.server_spec,
            comm_plan: prepared.plan.comm_plan,
            row_limit: opts.row_limit,
            context: prepared.context,
            settings: prepared.settings,
            evaluator,
            session: Mutex::new(Some(Session {
                graph: prepared.graph,
                fingerprints: prepared.fingerprints,
                values,
                sent,
                warnings,
            })),
        })
    }

    pub fn get_input_spec(&self) -> &ChartSpec {
        &self.input_spec
    }

    /// The client half with the initial server values inlined.
    pub fn get_client_spec(&self) -> &ChartSpec {
        &self.client_spec
    }

    pub fn get_server_spec(&self) -> &ChartSpec {
        &self.server_spec
    }

    pub fn get_comm_plan(&self) -> &CommPlan {
        &self.comm_plan
    }

    /// Warnings from planning, the first evaluation, and every update since.
    pub async fn get_warnings(&self) -> Result<Vec<Warning>> {
        let session = self.session.lock().await;
        session
            .as_ref()
            .map(|s| s.warnings.clone())
            .ok_or(ChartError::Closed)
    }

    /// Apply a batch of client changes and return the server values that
    /// changed as a result, ordered like the comm plan.
    ///
    /// The batch is all or nothing: if any update is rejected or evaluation
    /// fails, the session keeps its previous state.
    #[instrument(skip_all, fields(updates = updates.len()))]
    pub async fn update(&self, updates: Vec<VariableUpdate>) -> Result<Vec<VariableUpdate>> {
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ChartError::Closed)?;

        let mut graph = TaskGraph::clone(&session.graph);
        for update in &updates {
            if !self.comm_plan.client_to_server.contains(&update.variable) {
                return Err(ChartError::InvalidRequest(format!(
                    "{} is not updated by the client",
                    update.variable
                )));
            }
            let idx = graph.get(&update.variable).ok_or_else(|| {
                ChartError::internal(format!("{} has no server node", update.variable))
            })?;
            graph.node_mut(idx).task = update_task(&update.variable, &update.value)?;
        }

        let fingerprints = graph.compute_fingerprints(&self.context)?;
        let seed: HashMap<NodeIndex, NodeValue> = session
            .values
            .iter()
            .filter(|(idx, _)| session.fingerprints.get(idx.0) == fingerprints.get(idx.0))
            .map(|(idx, v)| (*idx, v.clone()))
            .collect();
        debug!(
            reused = seed.len(),
            dirty = session.values.len() - seed.len(),
            "re-evaluating chart state"
        );

        let graph = Arc::new(graph);
        let fingerprints = Arc::new(fingerprints);
        let targets: Vec<NodeIndex> = self
            .comm_plan
            .server_to_client
            .iter()
            .map(|var| {
                graph
                    .get(var)
                    .ok_or_else(|| ChartError::internal(format!("{var} has no server node")))
            })
            .collect::<Result<_>>()?;
        let values = self
            .evaluator
            .evaluate(&graph, &fingerprints, &self.settings, &targets, seed)
            .await?;

        let mut warnings = session.warnings.clone();
        extend_unique(&mut warnings, evaluation_warnings(&graph, &values)?);
        let mut sent = session.sent.clone();
        let mut changed = Vec::new();
        for (var, idx) in self.comm_plan.server_to_client.iter().zip(&targets) {
            let value = values
                .get(idx)
                .map(|v| v.value.clone())
                .ok_or_else(|| ChartError::internal(format!("{var} was not evaluated")))?;
            let json = limited_json(var, value, self.row_limit, &mut warnings);
            if sent.get(var) != Some(&json) {
                sent.insert(var.clone(), json.clone());
                changed.push(VariableUpdate {
                    variable: var.clone(),
                    value: json,
                });
            }
        }
        let mut deduped = Vec::new();
        extend_unique(&mut deduped, warnings);

        *session = Session {
            graph,
            fingerprints,
            values,
            sent,
            warnings: deduped,
        };
        debug!(changed = changed.len(), "chart state updated");
        Ok(changed)
    }

    /// End the session. Cached values stay available to other sessions.
    pub async fn close(&self) {
        if self.session.lock().await.take().is_some() {
            info!("chart state closed");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.session.lock().await.is_none()
    }
}

/// The task a client-owned node runs once the client has sent `value`.
fn update_task(var: &ScopedVariable, value: &Value) -> Result<Task> {
    match var.namespace() {
        Namespace::Signal => Ok(Task::Value(value.clone())),
        Namespace::Data => {
            Table::from_json(value).map_err(|e| {
                ChartError::InvalidRequest(format!("{var} must be an array of objects: {e}"))
            })?;
            Ok(Task::Dataset(DatasetTask {
                source: DataSource::Values {
                    values: value.clone(),
                    format: None,
                },
                transforms: Vec::new(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::graph::{Scope, Variable};
    use chartfuse_data::MemoryConnection;
    use serde_json::json;

    fn items() -> Table {
        Table::from_json(&json!([
            {"k": 1, "v": 10},
            {"k": 2, "v": 20},
            {"k": 2, "v": 30},
            {"k": 3, "v": 40}
        ]))
        .unwrap()
    }

    fn spec() -> ChartSpec {
        ChartSpec::from_value(json!({
            "signals": [
                {"name": "pick", "value": 2, "bind": {"input": "range"}}
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
                {"type": "rect", "from": {"data": "picked"}},
                {"type": "rect", "from": {"data": "totals"}}
            ]
        }))
        .unwrap()
    }

    async fn state() -> ChartState {
        let runtime = Runtime::new(RuntimeConfig::default(), Arc::new(MemoryConnection::new())).unwrap();
        let opts = PreTransformOptions::default().with_inline_dataset("items", items());
        runtime.new_chart_state(&spec(), opts).await.unwrap()
    }

    fn pick(value: Value) -> VariableUpdate {
        VariableUpdate {
            variable: Variable::signal("pick").scoped(Scope::root()),
            value,
        }
    }

    #[tokio::test]
    async fn initial_values_are_inlined() {
        let state = state().await;
        assert_eq!(
            state.get_comm_plan().client_to_server,
            vec![Variable::signal("pick").scoped(Scope::root())]
        );
        let picked = state
            .get_client_spec()
            .get_nested_data(&Scope::root(), "picked")
            .unwrap();
        assert_eq!(picked.values.as_ref().unwrap().as_array().unwrap().len(), 2);
        assert!(state.get_warnings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_changed_values_are_returned() {
        let state = state().await;
        let changed = state.update(vec![pick(json!(3))]).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].variable.name(), "picked");
        assert_eq!(changed[0].value, json!([{"k": 3, "v": 40}]));

        // same value again: nothing moves
        let changed = state.update(vec![pick(json!(3))]).await.unwrap();
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn updates_to_server_variables_are_rejected() {
        let state = state().await;
        let bad = VariableUpdate {
            variable: Variable::data("totals").scoped(Scope::root()),
            value: json!([]),
        };
        let err = state.update(vec![pick(json!(1)), bad]).await.unwrap_err();
        assert!(matches!(err, ChartError::InvalidRequest(_)));

        // the rejected batch left no trace
        let changed = state.update(vec![pick(json!(2))]).await.unwrap();
        assert!(changed.is_empty());
    }

    #[tokio::test]
    async fn closed_states_refuse_updates() {
        let state = state().await;
        state.close().await;
        assert!(state.is_closed().await);
        let err = state.update(vec![pick(json!(1))]).await.unwrap_err();
        assert!(matches!(err, ChartError::Closed));
    }

    #[test]
    fn updates_serialize_flat() {
        let update = pick(json!(4));
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["name"], "pick");
        assert_eq!(json["namespace"], "signal");
        assert_eq!(json["scope"], json!([]));
        assert_eq!(json["value"], 4);
    }
}
