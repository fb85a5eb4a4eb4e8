//! The conference aggregate
//!
//! A [`Conference`] owns its tracks and participants. Setup calls run on the
//! caller's thread; asynchronous transport events reach it through
//! [`Conference::propagate`], which the dispatcher calls one event at a time.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ConferenceConfig;
use crate::error::{ConferenceError, Result};
use crate::graph::{MediaGraph, NodeId, NodeState};
use crate::model::codec::MediaType;
use crate::model::identity::Identity;
use crate::model::participant::{Participant, ParticipantId};
use crate::model::propagated::Propagated;
use crate::model::stream::{Direction, RemoteMedia, Stream, StreamKey};
use crate::model::tracks::{MediaTrack, TrackId};
use crate::negotiation::{CodecNegotiator, SdpNegotiator};
use crate::sink::SharedSinkPool;
use crate::transport::{TransmitterKind, TransmitterRegistry, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConferenceId(pub(crate) u64);

impl Deref for ConferenceId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ConferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConferenceState {
    New,
    Playing,
    Stopped,
}

pub struct Conference {
    id: ConferenceId,
    config: ConferenceConfig,
    graph: Arc<dyn MediaGraph>,
    negotiator: Arc<dyn CodecNegotiator>,
    transmitters: Arc<TransmitterRegistry>,
    identity: Identity,
    tracks: Vec<MediaTrack>,
    participants: Vec<Participant>,
    sink_pool: Arc<SharedSinkPool>,
    node: Option<NodeId>,
    /// `None` until [`Conference::create`] succeeds.
    state: Option<ConferenceState>,
}

impl Conference {
    pub fn new(config: ConferenceConfig, graph: Arc<dyn MediaGraph>) -> Conference {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        let next_id = ID_COUNTER.fetch_add(1, Ordering::SeqCst);

        let sink_pool = Arc::new(SharedSinkPool::new(config.sink.clone(), Arc::clone(&graph)));

        Conference {
            id: ConferenceId(next_id),
            config,
            graph,
            negotiator: Arc::new(SdpNegotiator),
            transmitters: Arc::new(TransmitterRegistry::new()),
            identity: Identity::defaults(),
            tracks: vec![],
            participants: vec![],
            sink_pool,
            node: None,
            state: None,
        }
    }

    /// Replaces the codec negotiator used by tracks added from now on.
    pub fn with_negotiator(mut self, negotiator: Arc<dyn CodecNegotiator>) -> Conference {
        self.negotiator = negotiator;
        self
    }

    pub fn register_transmitter(&self, kind: TransmitterKind, transport: Arc<dyn Transport>) {
        info!("Conference {}: {} transmitter registered", self.id, kind);
        self.transmitters.register(kind, transport);
    }

    /// Instantiates the conference node and fills in the identity defaults.
    pub fn create(&mut self) -> Result<()> {
        if self.state.is_some() {
            return Err(ConferenceError::InvalidState(format!(
                "conference {} already created",
                self.id
            )));
        }

        let node = self
            .graph
            .instantiate(&self.config.conference_element)
            .map_err(|e| ConferenceError::LinkFailure(e.to_string()))?;

        self.identity = Identity::defaults().with_fields(self.config.identity.clone());
        self.node = Some(node);
        self.state = Some(ConferenceState::New);

        info!(
            "Conference {} created on {} as {}",
            self.id,
            node,
            self.identity.cname().unwrap_or("-")
        );

        Ok(())
    }

    pub fn id(&self) -> ConferenceId {
        self.id
    }

    /// `None` before [`Conference::create`].
    pub fn state(&self) -> Option<ConferenceState> {
        self.state
    }

    pub fn node(&self) -> Option<NodeId> {
        self.node
    }

    pub fn config(&self) -> &ConferenceConfig {
        &self.config
    }

    pub fn graph(&self) -> &Arc<dyn MediaGraph> {
        &self.graph
    }

    pub fn sink_pool(&self) -> &Arc<SharedSinkPool> {
        &self.sink_pool
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Merges `fields` over the current identity. Snapshots taken earlier
    /// through [`Conference::identity`] are not affected.
    pub fn set_identity<K, V>(&mut self, fields: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.identity = self.identity.with_fields(fields);
        debug!("Conference {}: identity {:?}", self.id, self.identity);
    }

    pub fn add_track(&mut self, media_type: MediaType) -> Result<&mut MediaTrack> {
        let node = self.node.ok_or(ConferenceError::NotInitialized)?;

        let local_port = self
            .graph
            .get_port(node, &self.config.producer_port)
            .ok_or_else(|| {
                ConferenceError::LinkFailure(format!(
                    "{} has no '{}' port",
                    node, self.config.producer_port
                ))
            })?;

        let track = MediaTrack::new(
            self.id,
            media_type,
            local_port,
            self.config.local_codecs.clone(),
            Arc::clone(&self.transmitters),
            Arc::clone(&self.negotiator),
            Arc::clone(&self.sink_pool),
        );
        info!(
            "Conference {}: {} track {} on {}",
            self.id,
            media_type,
            track.id(),
            track.local_port()
        );

        let index = self.tracks.len();
        self.tracks.push(track);
        Ok(&mut self.tracks[index])
    }

    pub fn add_participant(&mut self) -> Result<&mut Participant> {
        if self.state.is_none() {
            return Err(ConferenceError::NotInitialized);
        }

        let participant = Participant::new(self.id);
        info!("Conference {}: participant {} joined", self.id, participant.id());

        let index = self.participants.len();
        self.participants.push(participant);
        Ok(&mut self.participants[index])
    }

    /// Drops the participant and every stream carrying their media.
    pub fn remove_participant(&mut self, id: ParticipantId) -> Result<Participant> {
        let index = self
            .participants
            .iter()
            .position(|p| p.id() == id)
            .ok_or(ConferenceError::UnknownParticipant(id))?;

        for track in &mut self.tracks {
            track.remove_stream(id);
        }

        let participant = self.participants.remove(index);
        info!("Conference {}: participant {} left", self.id, participant.display_name());
        Ok(participant)
    }

    pub fn new_stream(
        &mut self,
        track: TrackId,
        participant: ParticipantId,
        direction: Direction,
    ) -> Result<&mut Stream> {
        let participant = self
            .participants
            .iter()
            .find(|p| p.id() == participant)
            .ok_or(ConferenceError::UnknownParticipant(participant))?;
        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.id() == track)
            .ok_or(ConferenceError::UnknownTrack(track))?;

        track.new_stream(participant, direction)
    }

    /// Instantiates `description` as the local producer of `track` and links
    /// its `src` port to the track's local port.
    pub fn attach_producer(&mut self, track: TrackId, description: &str) -> Result<NodeId> {
        let playing = match self.state {
            None => return Err(ConferenceError::NotInitialized),
            Some(state) => state == ConferenceState::Playing,
        };

        let track = self
            .tracks
            .iter_mut()
            .find(|t| t.id() == track)
            .ok_or(ConferenceError::UnknownTrack(track))?;

        if let Some(existing) = track.producer() {
            return Err(ConferenceError::InvalidState(format!(
                "track {} already has producer {}",
                track.id(),
                existing
            )));
        }

        let node = self
            .graph
            .instantiate(description)
            .map_err(|e| ConferenceError::LinkFailure(e.to_string()))?;

        let linked = match self.graph.get_port(node, "src") {
            Some(src) => self.graph.link(&src, track.local_port()),
            None => false,
        };
        if !linked {
            self.graph.set_state(node, NodeState::Null);
            return Err(ConferenceError::LinkFailure(format!(
                "cannot link producer '{}' to {}",
                description,
                track.local_port()
            )));
        }

        if playing {
            self.graph.set_state(node, NodeState::Playing);
        }
        track.set_producer(node);
        info!("Track {}: producer '{}' attached as {}", track.id(), description, node);

        Ok(node)
    }

    /// Sets the conference and every producer playing. Calling it again is a
    /// no-op.
    pub fn start(&mut self) -> Result<()> {
        let node = self.node.ok_or(ConferenceError::NotInitialized)?;
        if self.state == Some(ConferenceState::Playing) {
            return Ok(());
        }

        self.set_nodes_state(node, NodeState::Playing);
        self.state = Some(ConferenceState::Playing);
        info!("Conference {} playing with {} tracks", self.id, self.tracks.len());

        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        let node = self.node.ok_or(ConferenceError::NotInitialized)?;
        if self.state == Some(ConferenceState::Stopped) {
            return Ok(());
        }

        self.set_nodes_state(node, NodeState::Paused);
        self.state = Some(ConferenceState::Stopped);
        info!("Conference {} stopped", self.id);

        Ok(())
    }

    pub fn track(&self, id: TrackId) -> Option<&MediaTrack> {
        self.tracks.iter().find(|t| t.id() == id)
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut MediaTrack> {
        self.tracks.iter_mut().find(|t| t.id() == id)
    }

    pub fn tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter()
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id() == id)
    }

    pub fn participant_mut(&mut self, id: ParticipantId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id() == id)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter()
    }

    pub fn stream(&self, key: StreamKey) -> Option<&Stream> {
        self.track(key.track)?.stream(key.participant)
    }

    pub fn stream_mut(&mut self, key: StreamKey) -> Option<&mut Stream> {
        self.track_mut(key.track)?.stream_mut(key.participant)
    }

    /// A transport saw a new SSRC on the stream `key`. Allocates a source port
    /// on the conference node and announces the source as remote media.
    ///
    /// Returns whether the stream accepted the source.
    pub fn source_discovered(&mut self, key: StreamKey, ssrc: u32, payload_type: u8) -> Result<bool> {
        let node = self.node.ok_or(ConferenceError::NotInitialized)?;
        let stream = locate(&mut self.tracks, key)?;

        if stream.has_source(ssrc) {
            return Ok(false);
        }
        if !stream.direction().receives() {
            debug!("Stream {} is send-only, ignoring source {:#010x}", key, ssrc);
            return Ok(false);
        }

        let Some(codec) = stream.codec_for_payload_type(payload_type).cloned() else {
            warn!(
                "Stream {}: no codec for payload type {}, dropping source {:#010x}",
                key, payload_type, ssrc
            );
            return Ok(false);
        };

        let port = self
            .graph
            .get_port(node, &self.config.source_port)
            .ok_or_else(|| {
                ConferenceError::LinkFailure(format!(
                    "{} has no '{}' port",
                    node, self.config.source_port
                ))
            })?;

        Ok(stream.notify_remote_media(RemoteMedia {
            track: key.track,
            participant: key.participant,
            ssrc,
            port,
            codec,
        }))
    }

    /// Applies one asynchronous event to the stream it names.
    pub fn propagate(&mut self, event: Propagated) -> Result<()> {
        match event {
            Propagated::RemoteMedia(media) => {
                locate(&mut self.tracks, media.key())?.notify_remote_media(media);
            }
            Propagated::SourceDiscovered {
                key,
                ssrc,
                payload_type,
            } => {
                self.source_discovered(key, ssrc, payload_type)?;
            }
            Propagated::ComponentState(key, component, state) => {
                locate(&mut self.tracks, key)?.on_component_state(component, state);
            }
            Propagated::Noop | Propagated::Stop => {}
        }

        Ok(())
    }

    fn set_nodes_state(&self, node: NodeId, state: NodeState) {
        self.graph.set_state(node, state);
        for producer in self.tracks.iter().filter_map(MediaTrack::producer) {
            self.graph.set_state(producer, state);
        }
    }
}

impl Drop for Conference {
    fn drop(&mut self) {
        self.sink_pool.teardown();
        if let Some(node) = self.node {
            self.set_nodes_state(node, NodeState::Null);
            debug!("Conference {} torn down", self.id);
        }
    }
}

impl fmt::Debug for Conference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conference")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("node", &self.node)
            .field("identity", &self.identity)
            .field("tracks", &self.tracks)
            .field("participants", &self.participants)
            .finish_non_exhaustive()
    }
}

fn locate(tracks: &mut [MediaTrack], key: StreamKey) -> Result<&mut Stream> {
    tracks
        .iter_mut()
        .find(|t| t.id() == key.track)
        .ok_or(ConferenceError::UnknownTrack(key.track))?
        .stream_mut(key.participant)
        .ok_or(ConferenceError::UnknownParticipant(key.participant))
}
