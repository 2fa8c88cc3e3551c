//! The [`Runtime`]: one connection, one value cache, and the entry points
//! that plan, evaluate and rewrite chart specs.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chartfuse_data::{Connection, SerializedConnection, Table};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::cache::ValueCache;
use crate::chart_state::ChartState;
use crate::channel::{QueryRequest, QueryResponse};
use crate::config::{ExtractFormat, ExtractOptions, PreTransformOptions, RuntimeConfig};
use crate::error::{ChartError, Result};
use crate::eval::{EvalSettings, Evaluator};
use crate::graph::{build_graph, FingerprintContext, Namespace, NodeIndex, Scope, ScopedVariable, TaskGraph};
use crate::inline;
use crate::metrics::METRICS;
use crate::planner::{PlannerConfig, SpecPlan};
use crate::spec::ChartSpec;
use crate::value::{NodeValue, TaskValue};
use crate::warning::{extend_unique, Warning};

/// A transformed spec and the warnings raised producing it.
#[derive(Debug, Clone, Serialize)]
pub struct TransformedSpec {
    pub spec: ChartSpec,
    pub warnings: Vec<Warning>,
}

#[derive(Debug, Clone)]
pub struct NamedTable {
    pub variable: ScopedVariable,
    pub table: Table,
}

#[derive(Debug, Clone)]
pub struct TransformedDatasets {
    /// One table per requested variable, in request order.
    pub datasets: Vec<NamedTable>,
    pub warnings: Vec<Warning>,
}

/// Encoded rows of one extracted dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ExtractedData {
    Rows(Value),
    IpcBytes(Vec<u8>),
    IpcBase64(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractedDataset {
    pub name: String,
    pub scope: Scope,
    pub format: ExtractFormat,
    pub data: ExtractedData,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractedSpec {
    pub spec: ChartSpec,
    pub datasets: Vec<ExtractedDataset>,
    pub warnings: Vec<Warning>,
}

/// A planned spec with its server graph ready to evaluate.
pub(crate) struct Prepared {
    pub plan: SpecPlan,
    pub graph: Arc<TaskGraph>,
    pub fingerprints: Arc<Vec<String>>,
    pub settings: Arc<EvalSettings>,
    pub context: FingerprintContext,
}

impl Prepared {
    /// Server graph nodes of `vars`, which must all be server-evaluated.
    pub fn targets(&self, vars: &[ScopedVariable]) -> Result<Vec<NodeIndex>> {
        vars.iter()
            .map(|var| {
                self.graph.get(var).ok_or_else(|| {
                    ChartError::InvalidRequest(format!("{var} is not evaluated on the server"))
                })
            })
            .collect()
    }
}

/// Evaluates chart specs against one connection, sharing a value cache
/// across every request and chart state it serves.
///
/// Cloning is cheap; clones share the cache. Sizing is fixed at
/// construction: [`Runtime::reconfigure`] builds a new runtime.
#[derive(Clone)]
pub struct Runtime {
    config: RuntimeConfig,
    connection: Arc<dyn Connection>,
    cache: ValueCache,
    evaluator: Evaluator,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("connection", &self.connection.id())
            .field("cache", &self.cache)
            .finish()
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig, connection: Arc<dyn Connection>) -> Result<Self> {
        let connection: Arc<dyn Connection> = if connection.main_thread() {
            Arc::new(SerializedConnection::new(connection)?)
        } else {
            connection
        };
        let cache = ValueCache::new(config.cache_capacity, config.memory_limit);
        let evaluator = Evaluator::new(Arc::clone(&connection), cache.clone(), config.worker_threads);
        info!(
            connection = %connection.id(),
            cache_capacity = ?config.cache_capacity,
            memory_limit = ?config.memory_limit,
            worker_threads = config.worker_threads,
            "runtime ready"
        );
        Ok(Self {
            config,
            connection,
            cache,
            evaluator,
        })
    }

    /// A runtime over the same connection with new sizing and an empty
    /// cache. Work still running on `self` finishes there and never reaches
    /// the new cache.
    pub fn reconfigure(&self, config: RuntimeConfig) -> Result<Self> {
        Self::new(config, Arc::clone(&self.connection))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn cache(&self) -> &ValueCache {
        &self.cache
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Rewrite `spec` so everything the server can evaluate arrives as
    /// inline values.
    #[instrument(skip_all, fields(row_limit = ?opts.row_limit, preserve_interactivity = opts.preserve_interactivity))]
    pub async fn pre_transform_spec(
        &self,
        spec: &ChartSpec,
        opts: &PreTransformOptions,
    ) -> Result<TransformedSpec> {
        let prepared = self
            .prepare(spec, opts, PlannerConfig::pre_transform(opts.preserve_interactivity))
            .await?;
        let sent = prepared.plan.comm_plan.server_to_client.clone();
        let (values, mut warnings) = self.evaluate_vars(&prepared, &sent).await?;

        let mut client = prepared.plan.client_spec;
        for (var, value) in sent.iter().zip(values) {
            let value = limited_json(var, value, opts.row_limit, &mut warnings);
            set_client_value(&mut client, var, value)?;
        }
        METRICS.flush();
        Ok(TransformedSpec {
            spec: client,
            warnings,
        })
    }

    /// Evaluate the requested datasets and return them as tables.
    #[instrument(skip_all, fields(requested = variables.len()))]
    pub async fn pre_transform_datasets(
        &self,
        spec: &ChartSpec,
        variables: &[ScopedVariable],
        opts: &PreTransformOptions,
    ) -> Result<TransformedDatasets> {
        if let Some(var) = variables.iter().find(|v| v.namespace() != Namespace::Data) {
            return Err(ChartError::InvalidRequest(format!("{var} is not a dataset")));
        }
        let mut config = PlannerConfig::pre_transform(opts.preserve_interactivity);
        config.keep_datasets.extend(variables.iter().cloned());
        let prepared = self.prepare(spec, opts, config).await?;
        let (values, mut warnings) = self.evaluate_vars(&prepared, variables).await?;

        let mut datasets = Vec::with_capacity(values.len());
        for (var, value) in variables.iter().zip(values) {
            let mut table = value.into_table()?;
            if let Some(limit) = opts.row_limit.filter(|l| table.num_rows() > *l) {
                table = table.head(limit);
                warnings.push(Warning::row_limit(var.name(), limit));
            }
            datasets.push(NamedTable {
                variable: var.clone(),
                table,
            });
        }
        METRICS.flush();
        Ok(TransformedDatasets { datasets, warnings })
    }

    /// Like [`Runtime::pre_transform_spec`], except that datasets with at
    /// least `extract_threshold` rows are returned encoded next to the spec
    /// and left as empty named stubs inside it.
    #[instrument(skip_all, fields(threshold = opts.extract_threshold, format = %opts.extracted_format))]
    pub async fn pre_transform_extract(
        &self,
        spec: &ChartSpec,
        opts: &ExtractOptions,
    ) -> Result<ExtractedSpec> {
        let transform = &opts.transform;
        let prepared = self
            .prepare(spec, transform, PlannerConfig::pre_transform(transform.preserve_interactivity))
            .await?;
        let sent = prepared.plan.comm_plan.server_to_client.clone();
        let (values, mut warnings) = self.evaluate_vars(&prepared, &sent).await?;

        let mut client = prepared.plan.client_spec;
        let mut datasets = Vec::new();
        for (var, value) in sent.iter().zip(values) {
            if let TaskValue::Table(table) = &value {
                let table = match transform.row_limit.filter(|l| table.num_rows() > *l) {
                    Some(limit) => {
                        warnings.push(Warning::row_limit(var.name(), limit));
                        table.head(limit)
                    }
                    None => table.clone(),
                };
                if table.num_rows() >= opts.extract_threshold {
                    debug!(dataset = %var, rows = table.num_rows(), "extracting dataset");
                    datasets.push(ExtractedDataset {
                        name: var.name().to_string(),
                        scope: var.scope.clone(),
                        format: opts.extracted_format,
                        data: encode(&table, opts.extracted_format)?,
                    });
                    continue;
                }
                set_client_value(&mut client, var, table.to_json())?;
                continue;
            }
            set_client_value(&mut client, var, value.to_json())?;
        }
        METRICS.flush();
        Ok(ExtractedSpec {
            spec: client,
            datasets,
            warnings,
        })
    }

    /// Start a live session for `spec`.
    #[instrument(skip_all)]
    pub async fn new_chart_state(
        &self,
        spec: &ChartSpec,
        opts: PreTransformOptions,
    ) -> Result<ChartState> {
        ChartState::try_new(self, spec, opts).await
    }

    /// Serve one request arriving over a transport.
    pub async fn query_request(&self, request: QueryRequest) -> Result<QueryResponse> {
        match request {
            QueryRequest::PreTransformSpec { spec, options } => self
                .pre_transform_spec(&spec, &options)
                .await
                .map(QueryResponse::Spec),
            QueryRequest::PreTransformDatasets {
                spec,
                variables,
                options,
            } => self
                .pre_transform_datasets(&spec, &variables, &options)
                .await
                .map(QueryResponse::Datasets),
            QueryRequest::PreTransformExtract { .. } => Err(ChartError::NotSupportedOverTransport(
                "pre_transform_extract".to_string(),
            )),
        }
    }

    pub(crate) fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Plan `spec` and fingerprint its server graph.
    pub(crate) async fn prepare(
        &self,
        spec: &ChartSpec,
        opts: &PreTransformOptions,
        mut config: PlannerConfig,
    ) -> Result<Prepared> {
        let (local_tz, default_input_tz) = opts.timezones()?;
        config.server_tables = self
            .connection
            .tables()
            .await?
            .into_keys()
            .collect::<BTreeSet<_>>();
        config.keep_signals.extend(opts.keep_signals.iter().cloned());
        config.keep_datasets.extend(opts.keep_datasets.iter().cloned());

        let plan = SpecPlan::try_new(spec, &config)?;
        let graph = build_graph(&plan.server_spec)?;
        let context = FingerprintContext {
            inline: inline::fingerprints(&opts.inline_datasets),
            connection_id: self.connection.id(),
            local_tz: local_tz.clone(),
            default_input_tz: default_input_tz.clone(),
        };
        let fingerprints = graph.compute_fingerprints(&context)?;
        debug!(
            nodes = graph.len(),
            server_to_client = plan.comm_plan.server_to_client.len(),
            "prepared server graph"
        );
        Ok(Prepared {
            plan,
            graph: Arc::new(graph),
            fingerprints: Arc::new(fingerprints),
            settings: Arc::new(EvalSettings {
                inline: opts.inline_datasets.clone(),
                local_tz,
                default_input_tz,
            }),
            context,
        })
    }

    /// Values of `vars` in order, plus planner and evaluation warnings.
    async fn evaluate_vars(
        &self,
        prepared: &Prepared,
        vars: &[ScopedVariable],
    ) -> Result<(Vec<TaskValue>, Vec<Warning>)> {
        let targets = prepared.targets(vars)?;
        let values = self
            .evaluator
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
        let out = targets
            .iter()
            .map(|idx| {
                values.get(idx).map(|v| v.value.clone()).ok_or_else(|| {
                    ChartError::internal(format!("{idx} was requested but not evaluated"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((out, warnings))
    }
}

/// Warnings carried by evaluated nodes, in topological order.
pub(crate) fn evaluation_warnings(
    graph: &TaskGraph,
    values: &HashMap<NodeIndex, NodeValue>,
) -> Result<Vec<Warning>> {
    let mut warnings = Vec::new();
    for idx in graph.toposort()? {
        if let Some(value) = values.get(&idx) {
            extend_unique(&mut warnings, value.warnings.iter().cloned());
        }
    }
    Ok(warnings)
}

/// JSON for a value sent to the client, truncating tables to `row_limit`.
pub(crate) fn limited_json(
    var: &ScopedVariable,
    value: TaskValue,
    row_limit: Option<usize>,
    warnings: &mut Vec<Warning>,
) -> Value {
    match (value, row_limit) {
        (TaskValue::Table(table), Some(limit)) if table.num_rows() > limit => {
            warnings.push(Warning::row_limit(var.name(), limit));
            table.head(limit).to_json()
        }
        (value, _) => value.to_json(),
    }
}

/// Store `value` as the inline content of `var` in the client spec.
pub(crate) fn set_client_value(client: &mut ChartSpec, var: &ScopedVariable, value: Value) -> Result<()> {
    match var.namespace() {
        Namespace::Data => client.get_nested_data_mut(&var.scope, var.name())?.values = Some(value),
        Namespace::Signal => client.get_nested_signal_mut(&var.scope, var.name())?.value = Some(value),
    }
    Ok(())
}

fn encode(table: &Table, format: ExtractFormat) -> Result<ExtractedData> {
    Ok(match format {
        ExtractFormat::InlineTable => ExtractedData::Rows(table.to_json()),
        ExtractFormat::IpcBytes => ExtractedData::IpcBytes(table.to_ipc_bytes()?),
        ExtractFormat::IpcBase64 => ExtractedData::IpcBase64(table.to_ipc_base64()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Variable;
    use crate::warning::WarningKind;
    use chartfuse_data::MemoryConnection;
    use serde_json::json;

    fn runtime() -> Runtime {
        Runtime::new(
            RuntimeConfig::default().with_worker_threads(2),
            Arc::new(MemoryConnection::new()),
        )
        .unwrap()
    }

    fn rows(n: usize) -> Table {
        let rows: Vec<Value> = (0..n).map(|i| json!({"i": i, "k": i % 3})).collect();
        Table::from_json(&Value::Array(rows)).unwrap()
    }

    fn counted() -> ChartSpec {
        ChartSpec::from_value(json!({
            "data": [
                {"name": "items", "url": "table://items"},
                {"name": "counts", "source": "items", "transform": [
                    {"type": "aggregate", "groupby": ["k"]}
                ]}
            ],
            "marks": [{"type": "rect", "from": {"data": "counts"}}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn values_are_inlined_into_the_client_spec() {
        let opts = PreTransformOptions::default().with_inline_dataset("items", rows(9));
        let out = runtime().pre_transform_spec(&counted(), &opts).await.unwrap();
        assert!(out.warnings.is_empty());
        assert_eq!(out.spec.data.len(), 1);
        assert_eq!(
            out.spec.data[0].values,
            Some(json!([
                {"k": 0, "count": 3},
                {"k": 1, "count": 3},
                {"k": 2, "count": 3}
            ]))
        );
    }

    #[tokio::test]
    async fn row_limit_truncates_and_warns() {
        let spec = ChartSpec::from_value(json!({
            "data": [{"name": "items", "url": "table://items"}],
            "marks": [{"type": "rect", "from": {"data": "items"}}]
        }))
        .unwrap();
        let opts = PreTransformOptions::default()
            .with_inline_dataset("items", rows(10))
            .with_row_limit(4);
        let out = runtime().pre_transform_spec(&spec, &opts).await.unwrap();
        let values = out.spec.data[0].values.as_ref().unwrap();
        assert_eq!(values.as_array().unwrap().len(), 4);
        let limited: Vec<_> = out
            .warnings
            .iter()
            .filter(|w| w.kind == WarningKind::RowLimitExceeded)
            .collect();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn datasets_are_returned_as_tables() {
        let opts = PreTransformOptions::default().with_inline_dataset("items", rows(6));
        let counts = Variable::data("counts").scoped(Scope::root());
        let out = runtime()
            .pre_transform_datasets(&counted(), &[counts.clone()], &opts)
            .await
            .unwrap();
        assert_eq!(out.datasets.len(), 1);
        assert_eq!(out.datasets[0].variable, counts);
        assert_eq!(out.datasets[0].table.num_rows(), 3);
    }

    #[tokio::test]
    async fn requesting_a_signal_as_a_dataset_fails() {
        let var = Variable::signal("width").scoped(Scope::root());
        let err = runtime()
            .pre_transform_datasets(&counted(), &[var], &PreTransformOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChartError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn large_datasets_are_extracted() {
        let spec = ChartSpec::from_value(json!({
            "data": [
                {"name": "items", "url": "table://items"},
                {"name": "counts", "source": "items", "transform": [
                    {"type": "aggregate", "groupby": ["k"]}
                ]}
            ],
            "marks": [
                {"type": "rect", "from": {"data": "items"}},
                {"type": "rect", "from": {"data": "counts"}}
            ]
        }))
        .unwrap();
        let opts = ExtractOptions::new(PreTransformOptions::default().with_inline_dataset("items", rows(30)))
            .with_threshold(20)
            .with_format(ExtractFormat::IpcBase64);
        let out = runtime().pre_transform_extract(&spec, &opts).await.unwrap();

        assert_eq!(out.datasets.len(), 1);
        assert_eq!(out.datasets[0].name, "items");
        let ExtractedData::IpcBase64(encoded) = &out.datasets[0].data else {
            panic!("expected base64 data");
        };
        assert_eq!(Table::from_ipc_base64(encoded).unwrap().num_rows(), 30);

        let items = out.spec.get_nested_data(&Scope::root(), "items").unwrap();
        assert!(items.values.is_none());
        let counts = out.spec.get_nested_data(&Scope::root(), "counts").unwrap();
        assert_eq!(counts.values.as_ref().unwrap().as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_inline_dataset_is_invalid() {
        let err = runtime()
            .pre_transform_spec(&counted(), &PreTransformOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ChartError::InvalidSpec(_)));
    }

    #[tokio::test]
    async fn reconfigure_starts_with_an_empty_cache() {
        let rt = runtime();
        let opts = PreTransformOptions::default().with_inline_dataset("items", rows(3));
        rt.pre_transform_spec(&counted(), &opts).await.unwrap();
        assert!(rt.cache().size() > 0);

        let fresh = rt
            .reconfigure(RuntimeConfig::default().with_cache_capacity(Some(8)))
            .unwrap();
        assert_eq!(fresh.cache().size(), 0);
        assert_eq!(fresh.cache().capacity(), Some(8));
        assert!(rt.cache().size() > 0);
    }
}
