//! Shared downstream sink
//!
//! Every remote source in a conference ends up in one merge node feeding one
//! terminal consumer. Both are built on the first arrival and then reused;
//! the build decision is taken under the pool lock so concurrent first
//! arrivals still produce a single pair.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConferenceError, Result};
use crate::graph::{MediaGraph, NodeId, NodeState, PortId};
use crate::model::participant::ParticipantId;
use crate::model::stream::RemoteMedia;
use crate::model::tracks::TrackId;

/// Descriptions and port names for the shared sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Merge node description.
    pub merge: String,
    /// Terminal consumer description.
    pub consumer: String,
    /// Request template for merge inputs.
    pub merge_input: String,
    pub merge_output: String,
    pub consumer_input: String,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            merge: "funnel".to_string(),
            consumer: "autovideosink".to_string(),
            merge_input: "sink_%u".to_string(),
            merge_output: "src".to_string(),
            consumer_input: "sink".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkNodes {
    pub merge: NodeId,
    pub consumer: NodeId,
}

/// A source that was linked into the merge node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedSource {
    pub track: TrackId,
    pub participant: ParticipantId,
    pub ssrc: u32,
    pub source: PortId,
    pub input: PortId,
}

#[derive(Debug, Clone, Copy)]
enum PoolState {
    Idle,
    Running(SinkNodes),
    TornDown,
}

#[derive(Debug)]
struct PoolInner {
    state: PoolState,
    linked: Vec<LinkedSource>,
}

pub struct SharedSinkPool {
    config: SinkConfig,
    graph: Arc<dyn MediaGraph>,
    inner: Mutex<PoolInner>,
    constructions: AtomicUsize,
}

impl SharedSinkPool {
    pub fn new(config: SinkConfig, graph: Arc<dyn MediaGraph>) -> SharedSinkPool {
        SharedSinkPool {
            config,
            graph,
            inner: Mutex::new(PoolInner {
                state: PoolState::Idle,
                linked: vec![],
            }),
            constructions: AtomicUsize::new(0),
        }
    }

    /// Links `media` into a fresh merge input, building the merge node and
    /// consumer first if this is the first source. Returns the merge input.
    pub fn link_source(&self, media: &RemoteMedia) -> Result<PortId> {
        let mut inner = self.inner.lock();

        let state = inner.state;
        let nodes = match state {
            PoolState::Running(nodes) => nodes,
            PoolState::TornDown => {
                return Err(ConferenceError::LinkFailure(
                    "shared sink has been torn down".to_string(),
                ))
            }
            PoolState::Idle => {
                let nodes = self.construct()?;
                inner.state = PoolState::Running(nodes);
                nodes
            }
        };

        let input = self
            .graph
            .get_port(nodes.merge, &self.config.merge_input)
            .ok_or_else(|| {
                ConferenceError::LinkFailure(format!(
                    "{} has no '{}' port",
                    nodes.merge, self.config.merge_input
                ))
            })?;

        if !self.graph.link(&media.port, &input) {
            return Err(ConferenceError::LinkFailure(format!(
                "cannot link {} to {}",
                media.port, input
            )));
        }

        info!(
            "Linked source {:#010x} of participant {} ({}) into {}",
            media.ssrc, media.participant, media.codec, input
        );
        inner.linked.push(LinkedSource {
            track: media.track,
            participant: media.participant,
            ssrc: media.ssrc,
            source: media.port.clone(),
            input: input.clone(),
        });

        Ok(input)
    }

    /// How many times the merge/consumer pair has been built.
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    pub fn nodes(&self) -> Option<SinkNodes> {
        match self.inner.lock().state {
            PoolState::Running(nodes) => Some(nodes),
            PoolState::Idle | PoolState::TornDown => None,
        }
    }

    pub fn linked_sources(&self) -> Vec<LinkedSource> {
        self.inner.lock().linked.clone()
    }

    /// Stops the shared nodes. The pool is not rebuilt afterwards.
    pub fn teardown(&self) {
        let mut inner = self.inner.lock();
        if let PoolState::Running(nodes) = inner.state {
            self.graph.set_state(nodes.merge, NodeState::Null);
            self.graph.set_state(nodes.consumer, NodeState::Null);
            info!("Shared sink torn down after {} sources", inner.linked.len());
        }
        inner.state = PoolState::TornDown;
    }

    fn construct(&self) -> Result<SinkNodes> {
        let merge = self
            .graph
            .instantiate(&self.config.merge)
            .map_err(|e| ConferenceError::LinkFailure(e.to_string()))?;

        let consumer = match self.graph.instantiate(&self.config.consumer) {
            Ok(node) => node,
            Err(e) => {
                self.graph.set_state(merge, NodeState::Null);
                return Err(ConferenceError::LinkFailure(e.to_string()));
            }
        };

        self.graph.set_state(merge, NodeState::Playing);
        self.graph.set_state(consumer, NodeState::Playing);

        let output = self.graph.get_port(merge, &self.config.merge_output);
        let input = self.graph.get_port(consumer, &self.config.consumer_input);
        let linked = match (&output, &input) {
            (Some(output), Some(input)) => self.graph.link(output, input),
            _ => false,
        };

        if !linked {
            warn!("Cannot link {} to {}, discarding shared sink", merge, consumer);
            self.graph.set_state(merge, NodeState::Null);
            self.graph.set_state(consumer, NodeState::Null);
            return Err(ConferenceError::LinkFailure(format!(
                "cannot link {} '{}' to {} '{}'",
                merge, self.config.merge_output, consumer, self.config.consumer_input
            )));
        }

        let count = self.constructions.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Shared sink construction #{}", count);
        info!(
            "Shared sink built: {} ({}) -> {} ({})",
            merge, self.config.merge, consumer, self.config.consumer
        );

        Ok(SinkNodes { merge, consumer })
    }
}
