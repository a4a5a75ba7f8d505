//! Observability: log setup, run span attributes and the flow graph file.

mod graph;
mod logging;

pub use graph::{Graph, GraphExporter, GraphLink, GraphNode, NodeKey};
pub use logging::{init_tracing, FlowSpanAttributes, LogFormat, SpanTimer};
