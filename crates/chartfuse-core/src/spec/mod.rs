//! Typed model of a chart specification.
//!
//! Only the parts the server reasons about are typed (signals, datasets,
//! transforms, group nesting). Everything else (scales, axes, encodings)
//! is carried through `extra` maps so a transformed spec keeps every
//! property of its input.

mod chart;
mod data;
mod mark;
mod signal;
mod transform;
mod values;
mod visitor;

pub use chart::ChartSpec;
pub use data::DataSpec;
pub use mark::{MarkFacetSpec, MarkFromSpec, MarkSpec};
pub use signal::SignalSpec;
pub use transform::{
    AggregateTransform, BinExtent, BinTransform, CollectTransform, CompareSpec, ExtentTransform,
    FilterTransform, FoldTransform, FormulaTransform, ImputeTransform, JoinAggregateTransform,
    PivotTransform, ProjectTransform, SequenceTransform, StackTransform, SupportedTransform,
    TimeUnitTransform, TransformSpec, UnsupportedTransform, WindowTransform,
};
pub use values::{NumberOrSignal, OneOrMany, SignalRef, StringOrSignal};
pub use visitor::{
    mark_inputs, scan_handler_inputs, scan_json_inputs, scan_object_inputs, ChartVisitor,
    MutChartVisitor,
};
