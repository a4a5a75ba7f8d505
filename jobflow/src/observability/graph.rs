//! JSON export of the flow graph.
//!
//! Nodes are the invocations of the flow; groups only shape the links. In a
//! serial group every job depends on the last checked jobs of the previous
//! sibling; in a parallel group all children share the parent's predecessors.

use crate::core::{BuildResult, Checking, Propagation};
use crate::errors::FlowError;
use crate::flow::{FlowNode, Invocation, GRAPH_FILE_NAME};
use serde::{Deserialize, Serialize};
use serde_json::ser::PrettyFormatter;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Node identifier: the node id in compact output, the job name when indented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeKey {
    /// Numeric node id.
    Id(usize),
    /// Full job name.
    Name(String),
}

/// One invocation in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Node key.
    pub id: NodeKey,
    /// Job name without the stripped top-level prefix.
    pub name: String,
    /// Job URL once the job was resolved.
    pub url: Option<String>,
    /// `[max_tries, tried_times, total_max_tries, total_tried_times]`.
    pub tr: [u32; 4],
    /// Nesting level.
    pub nl: i32,
    /// Propagation.
    pub pr: Propagation,
    /// Checking status.
    pub cs: Checking,
    /// Result.
    pub res: BuildResult,
    /// Invocation time in epoch seconds, `0.0` before the current attempt started.
    pub it: f64,
    /// Parameters with quoted values; secrets are masked.
    pub params: Vec<(String, String)>,
}

/// A dependency between two invocations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphLink {
    /// The job that must finish first.
    pub source: NodeKey,
    /// The dependent job.
    pub target: NodeKey,
}

/// The exported document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    /// Invocations in declaration order.
    pub nodes: Vec<GraphNode>,
    /// Dependencies.
    pub links: Vec<GraphLink>,
}

/// Renders a flow tree as a [`Graph`].
#[derive(Debug, Clone, Default)]
pub struct GraphExporter {
    indent: Option<usize>,
    strip_prefix_len: usize,
}

impl GraphExporter {
    /// Creates an exporter. With an indent the output is pretty-printed and
    /// keyed by job names.
    #[must_use]
    pub fn new(indent: Option<usize>, strip_prefix_len: usize) -> Self {
        Self {
            indent,
            strip_prefix_len,
        }
    }

    /// Builds the graph of `root`.
    #[must_use]
    pub fn graph(&self, root: &FlowNode) -> Graph {
        let nodes = root.invocations().into_iter().map(|job| self.node(job)).collect();
        let mut links = Vec::new();
        self.links(root, &[], &mut links);
        Graph { nodes, links }
    }

    /// Serializes the graph of `root`.
    pub fn to_json_string(&self, root: &FlowNode) -> Result<String, FlowError> {
        let graph = self.graph(root);
        let Some(indent) = self.indent else {
            return Ok(serde_json::to_string(&graph)?);
        };

        let spaces = vec![b' '; indent];
        let mut buf = Vec::new();
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, PrettyFormatter::with_indent(&spaces));
        graph.serialize(&mut serializer)?;
        String::from_utf8(buf).map_err(|e| FlowError::Serialization(e.to_string()))
    }

    /// Writes the graph of `root` to `dir`, replacing the file atomically.
    pub fn write(&self, root: &FlowNode, dir: &Path) -> Result<PathBuf, FlowError> {
        let json = self.to_json_string(root)?;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(GRAPH_FILE_NAME);

        let mut file = NamedTempFile::new_in(dir)?;
        file.write_all(json.as_bytes())?;
        file.flush()?;
        file.persist(&path).map_err(|e| FlowError::Io(e.error))?;
        Ok(path)
    }

    fn key(&self, job: &Invocation) -> NodeKey {
        if self.indent.is_some() {
            NodeKey::Name(job.name().to_string())
        } else {
            NodeKey::Id(job.state().node_id())
        }
    }

    fn node(&self, job: &Invocation) -> GraphNode {
        let state = job.state();
        GraphNode {
            id: self.key(job),
            name: job.name().get(self.strip_prefix_len..).unwrap_or(job.name()).to_string(),
            url: job.job_url(),
            tr: [
                state.max_tries(),
                state.tried_times(),
                state.total_max_tries(),
                state.total_tried_times(),
            ],
            nl: state.nesting_level(),
            pr: state.propagation(),
            cs: state.checking_status(),
            res: state.result(),
            it: state.invocation_time(),
            params: job
                .display_params()
                .into_iter()
                .map(|(key, value)| (key, format!("{value:?}")))
                .collect(),
        }
    }

    fn links(&self, node: &FlowNode, prev_jobs: &[&Invocation], links: &mut Vec<GraphLink>) {
        match node {
            FlowNode::Invocation(job) => links.extend(prev_jobs.iter().map(|prev| GraphLink {
                source: self.key(prev),
                target: self.key(job),
            })),
            FlowNode::Serial(_) => {
                let mut prev: Vec<&Invocation> = prev_jobs.to_vec();
                for child in node.children() {
                    self.links(child, &prev, links);
                    prev = child.last_jobs_in_flow();
                }
            }
            FlowNode::Parallel(_) => {
                for child in node.children() {
                    self.links(child, prev_jobs, links);
                }
            }
        }
    }
}
