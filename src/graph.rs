//! Media graph runtime seam
//!
//! The conference never builds or renders media itself. It asks a
//! [`MediaGraph`] to instantiate nodes from textual descriptions, hands out
//! named ports and links them. [`InMemoryGraph`] is a bookkeeping runtime that
//! records what was asked of it; it backs the CLI and the tests.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct NodeId(pub(crate) u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// A named port on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PortId {
    pub node: NodeId,
    pub name: String,
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Null,
    Ready,
    Paused,
    Playing,
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("cannot instantiate node from description '{0}'")]
    Instantiate(String),
}

/// The operations the conference needs from a media graph runtime.
pub trait MediaGraph: Send + Sync {
    fn instantiate(&self, description: &str) -> Result<NodeId, GraphError>;

    /// Looks up a port by name. Names containing `%u` are request templates
    /// and yield a fresh port on every call.
    fn get_port(&self, node: NodeId, name: &str) -> Option<PortId>;

    fn link(&self, src: &PortId, dst: &PortId) -> bool;

    fn set_state(&self, node: NodeId, state: NodeState);
}

#[derive(Debug)]
struct NodeEntry {
    description: String,
    state: NodeState,
    requested: u32,
}

#[derive(Debug, Default)]
struct GraphInner {
    next_node: u64,
    nodes: HashMap<NodeId, NodeEntry>,
    links: Vec<(PortId, PortId)>,
}

/// A graph runtime that only keeps books.
///
/// Each port takes part in at most one link, the way pads behave in a real
/// pipeline.
#[derive(Debug, Default)]
pub struct InMemoryGraph {
    inner: Mutex<GraphInner>,
}

impl InMemoryGraph {
    pub fn new() -> InMemoryGraph {
        InMemoryGraph::default()
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().nodes.len()
    }

    pub fn description(&self, node: NodeId) -> Option<String> {
        self.inner
            .lock()
            .nodes
            .get(&node)
            .map(|n| n.description.clone())
    }

    pub fn state(&self, node: NodeId) -> Option<NodeState> {
        self.inner.lock().nodes.get(&node).map(|n| n.state)
    }

    /// All nodes instantiated from exactly this description.
    pub fn nodes_with_description(&self, description: &str) -> Vec<NodeId> {
        let inner = self.inner.lock();
        let mut nodes: Vec<NodeId> = inner
            .nodes
            .iter()
            .filter(|(_, n)| n.description == description)
            .map(|(id, _)| *id)
            .collect();
        nodes.sort();
        nodes
    }

    pub fn links(&self) -> Vec<(PortId, PortId)> {
        self.inner.lock().links.clone()
    }

    /// Links whose destination is a port on `node`.
    pub fn links_into(&self, node: NodeId) -> Vec<(PortId, PortId)> {
        self.inner
            .lock()
            .links
            .iter()
            .filter(|(_, dst)| dst.node == node)
            .cloned()
            .collect()
    }
}

impl MediaGraph for InMemoryGraph {
    fn instantiate(&self, description: &str) -> Result<NodeId, GraphError> {
        let description = description.trim();
        if description.is_empty() || description.starts_with('!') || description.ends_with('!') {
            return Err(GraphError::Instantiate(description.to_string()));
        }

        let mut inner = self.inner.lock();
        let id = NodeId(inner.next_node);
        inner.next_node += 1;
        inner.nodes.insert(
            id,
            NodeEntry {
                description: description.to_string(),
                state: NodeState::Null,
                requested: 0,
            },
        );
        debug!("Instantiated {} from '{}'", id, description);

        Ok(id)
    }

    fn get_port(&self, node: NodeId, name: &str) -> Option<PortId> {
        let mut inner = self.inner.lock();
        let entry = inner.nodes.get_mut(&node)?;

        let name = if name.contains("%u") {
            let n = entry.requested;
            entry.requested += 1;
            name.replacen("%u", &n.to_string(), 1)
        } else {
            name.to_string()
        };

        Some(PortId { node, name })
    }

    fn link(&self, src: &PortId, dst: &PortId) -> bool {
        let mut inner = self.inner.lock();

        if !inner.nodes.contains_key(&src.node) || !inner.nodes.contains_key(&dst.node) {
            return false;
        }

        let busy = inner
            .links
            .iter()
            .any(|(s, d)| s == src || d == dst || s == dst || d == src);
        if busy {
            return false;
        }

        debug!("Linked {} -> {}", src, dst);
        inner.links.push((src.clone(), dst.clone()));
        true
    }

    fn set_state(&self, node: NodeId, state: NodeState) {
        if let Some(entry) = self.inner.lock().nodes.get_mut(&node) {
            entry.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ports_are_unique() {
        let graph = InMemoryGraph::new();
        let funnel = graph.instantiate("funnel").unwrap();

        let a = graph.get_port(funnel, "sink_%u").unwrap();
        let b = graph.get_port(funnel, "sink_%u").unwrap();
        assert_eq!(a.name, "sink_0");
        assert_eq!(b.name, "sink_1");

        let src = graph.get_port(funnel, "src").unwrap();
        assert_eq!(src, graph.get_port(funnel, "src").unwrap());
    }

    #[test]
    fn test_port_links_once() {
        let graph = InMemoryGraph::new();
        let a = graph.instantiate("videotestsrc").unwrap();
        let b = graph.instantiate("fakesink").unwrap();
        let c = graph.instantiate("fakesink").unwrap();

        let src = graph.get_port(a, "src").unwrap();
        assert!(graph.link(&src, &graph.get_port(b, "sink").unwrap()));
        assert!(!graph.link(&src, &graph.get_port(c, "sink").unwrap()));
        assert_eq!(graph.links().len(), 1);
    }

    #[test]
    fn test_bad_description_and_unknown_node() {
        let graph = InMemoryGraph::new();
        assert!(graph.instantiate("  ").is_err());
        assert!(graph.instantiate("videotestsrc !").is_err());
        assert!(graph.get_port(NodeId(42), "src").is_none());
    }
}
