//! Per-participant stream state
//!
//! A [`Stream`] carries one participant's media for one track. It walks a
//! small state machine:
//!
//! ```text
//! INIT ──set_remote_codecs──▶ NEGOTIATING ──transport ready──▶ CONNECTED
//!   │                                                             ▲
//!   └──────────────force_remote_candidates────────────────────────┘
//! ```
//!
//! A required transport component failing moves the stream to FAILED.
//! Setup calls validate everything before touching the stream, so a failed
//! call leaves it as it was.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConferenceError, Result};
use crate::graph::PortId;
use crate::model::candidate::{ComponentId, TransportCandidate};
use crate::model::codec::{Codec, MediaType};
use crate::model::participant::ParticipantId;
use crate::model::tracks::TrackId;
use crate::negotiation::CodecNegotiator;
use crate::transport::{ComponentState, TransmitterKind, TransmitterRegistry, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
    Both,
}

impl Direction {
    pub fn receives(&self) -> bool {
        matches!(self, Direction::Recv | Direction::Both)
    }

    pub fn sends(&self) -> bool {
        matches!(self, Direction::Send | Direction::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamState {
    Init,
    Negotiating,
    Connected,
    Failed,
}

/// Identifies a stream within a conference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StreamKey {
    pub track: TrackId,
    pub participant: ParticipantId,
}

impl StreamKey {
    #[cfg(test)]
    pub(crate) fn for_test(track: u64, participant: u64) -> StreamKey {
        StreamKey {
            track: TrackId(track),
            participant: ParticipantId(participant),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.track, self.participant)
    }
}

/// A remote media source that became available on a stream.
#[derive(Debug, Clone)]
pub struct RemoteMedia {
    pub track: TrackId,
    pub participant: ParticipantId,
    pub ssrc: u32,
    pub port: PortId,
    pub codec: Codec,
}

impl RemoteMedia {
    pub fn key(&self) -> StreamKey {
        StreamKey {
            track: self.track,
            participant: self.participant,
        }
    }
}

/// Handle returned by [`Stream::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type RemoteMediaCallback = Box<dyn Fn(&RemoteMedia) + Send + Sync>;

pub struct Stream {
    key: StreamKey,
    media_type: MediaType,
    direction: Direction,
    state: StreamState,

    transmitters: Arc<TransmitterRegistry>,
    negotiator: Arc<dyn CodecNegotiator>,
    transmitter: Option<TransmitterKind>,
    transport: Option<Arc<dyn Transport>>,

    local_codecs: Vec<Codec>,
    remote_codecs: Vec<Codec>,
    negotiated: Option<Codec>,

    forced: Option<Vec<TransportCandidate>>,
    remote_candidates: Vec<TransportCandidate>,
    components: BTreeMap<ComponentId, ComponentState>,

    sources: HashSet<u32>,
    subscribers: Vec<(Subscription, RemoteMediaCallback)>,
    next_subscription: u64,
}

impl Stream {
    pub(crate) fn new(
        key: StreamKey,
        media_type: MediaType,
        direction: Direction,
        local_codecs: Vec<Codec>,
        transmitters: Arc<TransmitterRegistry>,
        negotiator: Arc<dyn CodecNegotiator>,
    ) -> Stream {
        Stream {
            key,
            media_type,
            direction,
            state: StreamState::Init,
            transmitters,
            negotiator,
            transmitter: None,
            transport: None,
            local_codecs,
            remote_codecs: vec![],
            negotiated: None,
            forced: None,
            remote_candidates: vec![],
            components: BTreeMap::new(),
            sources: HashSet::new(),
            subscribers: vec![],
            next_subscription: 0,
        }
    }

    pub fn key(&self) -> StreamKey {
        self.key
    }

    pub fn track(&self) -> TrackId {
        self.key.track
    }

    pub fn participant(&self) -> ParticipantId {
        self.key.participant
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn set_direction(&mut self, direction: Direction) {
        if self.direction != direction {
            info!("Stream {}: direction {:?} -> {:?}", self.key, self.direction, direction);
            self.direction = direction;
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn transmitter(&self) -> Option<TransmitterKind> {
        self.transmitter
    }

    pub fn local_codecs(&self) -> &[Codec] {
        &self.local_codecs
    }

    pub fn remote_codecs(&self) -> &[Codec] {
        &self.remote_codecs
    }

    pub fn negotiated_codec(&self) -> Option<&Codec> {
        self.negotiated.as_ref()
    }

    pub fn forced_candidates(&self) -> Option<&[TransportCandidate]> {
        self.forced.as_deref()
    }

    pub fn remote_candidates(&self) -> &[TransportCandidate] {
        &self.remote_candidates
    }

    pub fn component_state(&self, component: ComponentId) -> Option<ComponentState> {
        self.components.get(&component).copied()
    }

    pub fn has_source(&self, ssrc: u32) -> bool {
        self.sources.contains(&ssrc)
    }

    /// Selects how this stream reaches the participant. Only possible before
    /// any codecs or candidates have been applied.
    pub fn set_transmitter(&mut self, kind: TransmitterKind) -> Result<()> {
        if self.forced.is_some() {
            return Err(ConferenceError::InvalidState(format!(
                "stream {} already has forced candidates",
                self.key
            )));
        }
        if self.state != StreamState::Init || !self.remote_candidates.is_empty() {
            return Err(ConferenceError::InvalidState(format!(
                "stream {} cannot change transmitter once negotiation started",
                self.key
            )));
        }

        let transport = self.transmitters.get(kind).ok_or_else(|| {
            ConferenceError::TransportUnavailable(format!("no {kind} transmitter registered"))
        })?;

        info!("Stream {}: transmitter {}", self.key, kind);
        self.transmitter = Some(kind);
        self.transport = Some(transport);

        Ok(())
    }

    /// Applies the participant's codecs, highest priority first, and selects
    /// the first one we can use.
    pub fn set_remote_codecs(&mut self, codecs: Vec<Codec>) -> Result<()> {
        if codecs.is_empty() {
            return Err(ConferenceError::NoCodecMatch);
        }
        self.require_transmitter()?;
        self.require_not_failed()?;

        let negotiated = self
            .negotiator
            .negotiate(&self.local_codecs, &codecs)
            .ok_or(ConferenceError::NoCodecMatch)?;

        info!(
            "Stream {}: negotiated {} from {} remote codecs",
            self.key,
            negotiated,
            codecs.len()
        );

        self.remote_codecs = codecs;
        self.negotiated = Some(negotiated);
        if self.state == StreamState::Init {
            self.set_state(StreamState::Negotiating);
        }
        self.update_connection();

        Ok(())
    }

    /// Fixes the remote transport. Discovery is skipped and the stream is
    /// connected on return.
    pub fn force_remote_candidates(&mut self, candidates: Vec<TransportCandidate>) -> Result<()> {
        validate_candidates(&candidates)?;
        let (kind, transport) = self.require_transmitter()?;
        require_components(kind, &candidates)?;

        if self.forced.is_some() {
            return Err(ConferenceError::InvalidState(format!(
                "stream {} already has forced candidates",
                self.key
            )));
        }
        self.require_not_failed()?;

        let outcome = summarize(transport.establish(&self.key, &candidates));
        for component in kind.required_components() {
            if outcome.get(component) != Some(&ComponentState::Ready) {
                return Err(ConferenceError::TransportUnavailable(format!(
                    "{} component of stream {} could not be established",
                    component, self.key
                )));
            }
        }

        self.components = outcome;
        self.forced = Some(candidates);
        self.set_state(StreamState::Connected);

        Ok(())
    }

    /// Adds candidates discovered for a discovery-based transmitter. Each
    /// component's transport outcome is applied to the stream.
    pub fn add_remote_candidates(&mut self, candidates: Vec<TransportCandidate>) -> Result<()> {
        validate_candidates(&candidates)?;
        let (kind, transport) = self.require_transmitter()?;

        if !kind.uses_discovery() {
            return Err(ConferenceError::InvalidState(format!(
                "{kind} transmitter only accepts forced candidates"
            )));
        }
        if self.forced.is_some() {
            return Err(ConferenceError::InvalidState(format!(
                "stream {} already has forced candidates",
                self.key
            )));
        }
        self.require_not_failed()?;

        let outcome = summarize(transport.establish(&self.key, &candidates));
        self.remote_candidates.extend(candidates);

        for (component, state) in outcome {
            if state == ComponentState::Failed
                && self.components.get(&component) == Some(&ComponentState::Ready)
            {
                continue;
            }
            self.on_component_state(component, state);
        }

        Ok(())
    }

    /// Applies a transport report for one component.
    pub fn on_component_state(&mut self, component: ComponentId, state: ComponentState) {
        if self.state == StreamState::Failed {
            return;
        }

        self.components.insert(component, state);

        let required = self
            .transmitter
            .map(|k| k.required_components().contains(&component))
            .unwrap_or(false);

        if state == ComponentState::Failed && required {
            warn!("Stream {}: {} component failed", self.key, component);
            self.set_state(StreamState::Failed);
            return;
        }

        self.update_connection();
    }

    pub fn subscribe<F>(&mut self, callback: F) -> Subscription
    where
        F: Fn(&RemoteMedia) + Send + Sync + 'static,
    {
        let subscription = Subscription(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((subscription, Box::new(callback)));
        subscription
    }

    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(s, _)| *s != subscription);
        self.subscribers.len() != before
    }

    /// Fires the remote-media event for a newly seen source. Returns false if
    /// the source was already announced or the stream does not receive.
    pub fn notify_remote_media(&mut self, media: RemoteMedia) -> bool {
        if media.key() != self.key {
            warn!("Stream {} got remote media for {}", self.key, media.key());
            return false;
        }

        if !self.direction.receives() {
            debug!("Stream {} is send-only, dropping source {:#010x}", self.key, media.ssrc);
            return false;
        }

        if !self.sources.insert(media.ssrc) {
            return false;
        }

        info!(
            "Stream {}: source {:#010x} added on {} ({})",
            self.key, media.ssrc, media.port, media.codec
        );

        for (_, callback) in &self.subscribers {
            callback(&media);
        }

        true
    }

    /// The codec a remote source with `payload_type` is sending.
    pub fn codec_for_payload_type(&self, payload_type: u8) -> Option<&Codec> {
        self.negotiated
            .as_ref()
            .filter(|c| c.payload_type() == payload_type)
            .or_else(|| {
                self.remote_codecs
                    .iter()
                    .find(|c| c.payload_type() == payload_type)
            })
    }

    pub(crate) fn set_local_codecs(&mut self, codecs: Vec<Codec>) {
        self.local_codecs = codecs;
    }

    fn require_transmitter(&self) -> Result<(TransmitterKind, Arc<dyn Transport>)> {
        match (self.transmitter, &self.transport) {
            (Some(kind), Some(transport)) => Ok((kind, Arc::clone(transport))),
            _ => Err(ConferenceError::InvalidState(format!(
                "stream {} has no transmitter",
                self.key
            ))),
        }
    }

    fn require_not_failed(&self) -> Result<()> {
        if self.state == StreamState::Failed {
            return Err(ConferenceError::InvalidState(format!(
                "stream {} has failed",
                self.key
            )));
        }
        Ok(())
    }

    fn update_connection(&mut self) {
        let Some(kind) = self.transmitter else {
            return;
        };

        let ready = kind
            .required_components()
            .iter()
            .all(|c| self.components.get(c) == Some(&ComponentState::Ready));

        if ready && self.state == StreamState::Negotiating {
            self.set_state(StreamState::Connected);
        }
    }

    fn set_state(&mut self, state: StreamState) {
        info!("Stream {}: {:?} -> {:?}", self.key, self.state, state);
        self.state = state;
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if let Some(transport) = &self.transport {
            debug!("Stream {}: releasing transport", self.key);
            transport.release(&self.key);
        }
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("key", &self.key)
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("transmitter", &self.transmitter)
            .field("negotiated", &self.negotiated)
            .field("subscribers", &self.subscribers.len())
            .finish_non_exhaustive()
    }
}

fn validate_candidates(candidates: &[TransportCandidate]) -> Result<()> {
    if candidates.is_empty() {
        return Err(ConferenceError::InvalidCandidateSet(
            "no candidates given".to_string(),
        ));
    }
    candidates.iter().try_for_each(TransportCandidate::validate)
}

fn require_components(kind: TransmitterKind, candidates: &[TransportCandidate]) -> Result<()> {
    for component in kind.required_components() {
        if !candidates.iter().any(|c| c.component() == *component) {
            return Err(ConferenceError::InvalidCandidateSet(format!(
                "no candidate for the {component} component"
            )));
        }
    }
    Ok(())
}

/// One state per component; a component is ready if any candidate for it is.
fn summarize(
    outcome: Vec<(ComponentId, ComponentState)>,
) -> BTreeMap<ComponentId, ComponentState> {
    let mut summary = BTreeMap::new();
    for (component, state) in outcome {
        let entry = summary.entry(component).or_insert(state);
        if state == ComponentState::Ready {
            *entry = ComponentState::Ready;
        }
    }
    summary
}
