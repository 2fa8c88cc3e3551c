//! Transform definitions as they appear in a dataset's `transform` list.
//!
//! Transforms the server understands deserialize into [`SupportedTransform`];
//! anything else (unknown type, parameters in a shape we do not handle) is
//! kept verbatim as an [`UnsupportedTransform`] so it round-trips to the
//! client untouched.

use chartfuse_data::{AggregateOp, SortOrder, StackOffset, TimeUnit, WindowOp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use super::values::{present, NumberOrSignal, OneOrMany, SignalRef};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TransformSpec {
    Supported(SupportedTransform),
    Unsupported(UnsupportedTransform),
}

impl TransformSpec {
    /// The transform's `type` string.
    pub fn kind(&self) -> &str {
        match self {
            TransformSpec::Supported(tx) => tx.kind(),
            TransformSpec::Unsupported(tx) => &tx.kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SupportedTransform {
    Aggregate(AggregateTransform),
    Bin(BinTransform),
    Collect(CollectTransform),
    Extent(ExtentTransform),
    Filter(FilterTransform),
    Fold(FoldTransform),
    Formula(FormulaTransform),
    Impute(ImputeTransform),
    JoinAggregate(JoinAggregateTransform),
    Pivot(PivotTransform),
    Project(ProjectTransform),
    Sequence(SequenceTransform),
    Stack(StackTransform),
    TimeUnit(TimeUnitTransform),
    Window(WindowTransform),
}

impl SupportedTransform {
    pub fn kind(&self) -> &'static str {
        match self {
            SupportedTransform::Aggregate(_) => "aggregate",
            SupportedTransform::Bin(_) => "bin",
            SupportedTransform::Collect(_) => "collect",
            SupportedTransform::Extent(_) => "extent",
            SupportedTransform::Filter(_) => "filter",
            SupportedTransform::Fold(_) => "fold",
            SupportedTransform::Formula(_) => "formula",
            SupportedTransform::Impute(_) => "impute",
            SupportedTransform::JoinAggregate(_) => "joinaggregate",
            SupportedTransform::Pivot(_) => "pivot",
            SupportedTransform::Project(_) => "project",
            SupportedTransform::Sequence(_) => "sequence",
            SupportedTransform::Stack(_) => "stack",
            SupportedTransform::TimeUnit(_) => "timeunit",
            SupportedTransform::Window(_) => "window",
        }
    }

    /// Parameters captured but not interpreted.
    pub fn extra(&self) -> &Map<String, Value> {
        match self {
            SupportedTransform::Aggregate(tx) => &tx.extra,
            SupportedTransform::Bin(tx) => &tx.extra,
            SupportedTransform::Collect(tx) => &tx.extra,
            SupportedTransform::Extent(tx) => &tx.extra,
            SupportedTransform::Filter(tx) => &tx.extra,
            SupportedTransform::Fold(tx) => &tx.extra,
            SupportedTransform::Formula(tx) => &tx.extra,
            SupportedTransform::Impute(tx) => &tx.extra,
            SupportedTransform::JoinAggregate(tx) => &tx.extra,
            SupportedTransform::Pivot(tx) => &tx.extra,
            SupportedTransform::Project(tx) => &tx.extra,
            SupportedTransform::Sequence(tx) => &tx.extra,
            SupportedTransform::Stack(tx) => &tx.extra,
            SupportedTransform::TimeUnit(tx) => &tx.extra,
            SupportedTransform::Window(tx) => &tx.extra,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsupportedTransform {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateTransform {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groupby: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Option<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<AggregateOp>,

    #[serde(rename = "as", default, skip_serializing_if = "Vec::is_empty")]
    pub as_: Vec<Option<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinAggregateTransform {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groupby: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Option<String>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<AggregateOp>,

    #[serde(rename = "as", default, skip_serializing_if = "Vec::is_empty")]
    pub as_: Vec<Option<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BinExtent {
    Signal(SignalRef),
    Values([NumberOrSignal; 2]),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinTransform {
    pub field: String,

    pub extent: BinExtent,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub maxbins: Option<NumberOrSignal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<NumberOrSignal>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub minstep: Option<Number>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base: Option<Number>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub divide: Option<Vec<Number>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub nice: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<bool>,

    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompareSpec {
    pub field: OneOrMany<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub order: Option<OneOrMany<SortOrder>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectTransform {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<CompareSpec>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtentTransform {
    pub field: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterTransform {
    pub expr: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormulaTransform {
    pub expr: String,

    #[serde(rename = "as")]
    pub as_: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub initonly: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectTransform {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,

    #[serde(rename = "as", default, skip_serializing_if = "Vec::is_empty")]
    pub as_: Vec<Option<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceTransform {
    pub start: NumberOrSignal,

    pub stop: NumberOrSignal,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<NumberOrSignal>,

    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowTransform {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groupby: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<CompareSpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ops: Vec<WindowOp>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<Option<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,

    #[serde(rename = "as", default, skip_serializing_if = "Vec::is_empty")]
    pub as_: Vec<Option<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<Value>,

    #[serde(rename = "ignorePeers", skip_serializing_if = "Option::is_none")]
    pub ignore_peers: Option<bool>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackTransform {
    pub field: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groupby: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sort: Option<CompareSpec>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<StackOffset>,

    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PivotTransform {
    pub field: String,

    pub value: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groupby: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub op: Option<AggregateOp>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoldTransform {
    pub fields: Vec<String>,

    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImputeTransform {
    pub field: String,

    pub key: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groupby: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyvals: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub value: Option<Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeUnitTransform {
    pub field: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub units: Option<Vec<TimeUnit>>,

    /// `local` or `utc`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<bool>,

    #[serde(rename = "as", skip_serializing_if = "Option::is_none")]
    pub as_: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
