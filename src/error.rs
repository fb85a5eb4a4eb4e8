//! Error types for conference setup and event handling

use crate::model::{participant::ParticipantId, tracks::TrackId};

/// Errors raised by the conference core.
///
/// Every setup call that returns one of these leaves the conference exactly as
/// it was before the call.
#[derive(Debug, thiserror::Error)]
pub enum ConferenceError {
    #[error("conference has not been created")]
    NotInitialized,

    #[error("a stream already exists for participant {participant} on track {track}")]
    DuplicateStream {
        track: TrackId,
        participant: ParticipantId,
    },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid candidate set: {0}")]
    InvalidCandidateSet(String),

    #[error("invalid codec: {0}")]
    InvalidCodec(String),

    #[error("no mutually acceptable codec")]
    NoCodecMatch,

    #[error("link failure: {0}")]
    LinkFailure(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("unknown participant {0}")]
    UnknownParticipant(ParticipantId),

    #[error("unknown track {0}")]
    UnknownTrack(TrackId),

    #[error("event dispatcher is closed")]
    DispatcherClosed,
}

pub type Result<T> = std::result::Result<T, ConferenceError>;
