//! chartfuse core library
//!
//! Plans chart specs into a server half and a client half, evaluates the
//! server half against a [`chartfuse_data::Connection`] through a shared
//! value cache, and keeps live chart sessions in sync.

pub mod cache;
pub mod chart_state;
pub mod channel;
pub mod config;
pub mod error;
pub mod eval;
pub mod expr;
pub mod graph;
pub mod inline;
pub mod metrics;
pub mod patch;
pub mod planner;
pub mod runtime;
pub mod spec;
pub mod telemetry;
pub mod transform;
pub mod value;
pub mod warning;

pub use cache::ValueCache;
pub use chart_state::{ChartState, VariableUpdate};
pub use channel::{ChannelRuntime, QueryRequest, QueryResponse};
pub use config::{ExtractFormat, ExtractOptions, PreTransformOptions, RuntimeConfig};
pub use error::{ChartError, Result};
pub use eval::{EvalSettings, Evaluator};
pub use expr::{ExprEnv, Expression};
pub use graph::{
    build_graph, Namespace, NodeIndex, NodeKind, Scope, ScopedVariable, TaskGraph, Variable,
};
pub use metrics::{MetricsSnapshot, METRICS};
pub use patch::patch_pre_transformed_spec;
pub use planner::{CommPlan, PlannerConfig, SpecPlan, Support};
pub use runtime::{
    ExtractedData, ExtractedDataset, ExtractedSpec, NamedTable, Runtime, TransformedDatasets,
    TransformedSpec,
};
pub use spec::{ChartSpec, DataSpec, MarkSpec, SignalSpec, TransformSpec};
pub use telemetry::{init_tracing, init_tracing_with_level};
pub use value::{NodeValue, TaskValue};
pub use warning::{Warning, WarningKind};
