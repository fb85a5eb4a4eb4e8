//! Media tracks
//!
//! A [`MediaTrack`] is the local endpoint for one media type. It is shared by
//! every participant: one local producer feeds it, and it holds one
//! [`Stream`] per remote participant.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::conference::ConferenceId;
use crate::error::{ConferenceError, Result};
use crate::graph::{NodeId, PortId};
use crate::model::codec::{Codec, MediaType};
use crate::model::participant::{Participant, ParticipantId};
use crate::model::stream::{Direction, Stream, StreamKey, StreamState};
use crate::negotiation::CodecNegotiator;
use crate::sink::SharedSinkPool;
use crate::transport::TransmitterRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TrackId(pub(crate) u64);

impl Deref for TrackId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct MediaTrack {
    id: TrackId,
    conference: ConferenceId,
    media_type: MediaType,
    /// Where the local producer's output is linked.
    local_port: PortId,
    producer: Option<NodeId>,
    local_codecs: Vec<Codec>,
    streams: Vec<Stream>,
    transmitters: Arc<TransmitterRegistry>,
    negotiator: Arc<dyn CodecNegotiator>,
    sink_pool: Arc<SharedSinkPool>,
}

impl MediaTrack {
    pub(crate) fn new(
        conference: ConferenceId,
        media_type: MediaType,
        local_port: PortId,
        local_codecs: Vec<Codec>,
        transmitters: Arc<TransmitterRegistry>,
        negotiator: Arc<dyn CodecNegotiator>,
        sink_pool: Arc<SharedSinkPool>,
    ) -> MediaTrack {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        let next_id = ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        MediaTrack {
            id: TrackId(next_id),
            conference,
            media_type,
            local_port,
            producer: None,
            local_codecs: local_codecs
                .into_iter()
                .filter(|c| c.media_type() == media_type && c.validate().is_ok())
                .collect(),
            streams: vec![],
            transmitters,
            negotiator,
            sink_pool,
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// The attachment point for the local media producer.
    pub fn local_port(&self) -> &PortId {
        &self.local_port
    }

    pub fn producer(&self) -> Option<NodeId> {
        self.producer
    }

    pub fn local_codecs(&self) -> &[Codec] {
        &self.local_codecs
    }

    /// Replaces the local codec preferences. Codecs of another media type or
    /// with an out-of-range payload type are dropped. Streams that have not started negotiating pick up the new list.
    pub fn set_local_codecs(&mut self, codecs: Vec<Codec>) {
        let media_type = self.media_type;
        let (kept, dropped): (Vec<Codec>, Vec<Codec>) = codecs
            .into_iter()
            .partition(|c| c.media_type() == media_type && c.validate().is_ok());

        for codec in &dropped {
            warn!("Track {}: ignoring codec preference {}", self.id, codec);
        }

        for stream in &mut self.streams {
            if stream.state() == StreamState::Init {
                stream.set_local_codecs(kept.clone());
            }
        }
        self.local_codecs = kept;
    }

    /// Creates the stream carrying `participant`'s media on this track.
    ///
    /// Remote media announced on the new stream is linked into the
    /// conference's shared sink.
    pub fn new_stream(&mut self, participant: &Participant, direction: Direction) -> Result<&mut Stream> {
        if participant.conference() != self.conference {
            return Err(ConferenceError::UnknownParticipant(participant.id()));
        }
        if self.streams.iter().any(|s| s.participant() == participant.id()) {
            return Err(ConferenceError::DuplicateStream {
                track: self.id,
                participant: participant.id(),
            });
        }

        let key = StreamKey {
            track: self.id,
            participant: participant.id(),
        };
        let mut stream = Stream::new(
            key,
            self.media_type,
            direction,
            self.local_codecs.clone(),
            Arc::clone(&self.transmitters),
            Arc::clone(&self.negotiator),
        );

        let pool = Arc::clone(&self.sink_pool);
        stream.subscribe(move |media| {
            if let Err(e) = pool.link_source(media) {
                warn!(
                    "Dropping source {:#010x} of participant {}: {}",
                    media.ssrc, media.participant, e
                );
            }
        });

        info!(
            "Track {}: new {:?} stream for {}",
            self.id,
            direction,
            participant.display_name()
        );
        self.streams.push(stream);

        let index = self.streams.len() - 1;
        Ok(&mut self.streams[index])
    }

    pub fn stream(&self, participant: ParticipantId) -> Option<&Stream> {
        self.streams.iter().find(|s| s.participant() == participant)
    }

    pub fn stream_mut(&mut self, participant: ParticipantId) -> Option<&mut Stream> {
        self.streams.iter_mut().find(|s| s.participant() == participant)
    }

    pub fn streams(&self) -> impl Iterator<Item = &Stream> {
        self.streams.iter()
    }

    pub fn remove_stream(&mut self, participant: ParticipantId) -> Option<Stream> {
        let index = self.streams.iter().position(|s| s.participant() == participant)?;
        Some(self.streams.remove(index))
    }

    pub(crate) fn set_producer(&mut self, node: NodeId) {
        self.producer = Some(node);
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("media_type", &self.media_type)
            .field("local_port", &self.local_port)
            .field("producer", &self.producer)
            .field("streams", &self.streams)
            .finish_non_exhaustive()
    }
}
