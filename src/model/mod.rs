//! Data models for the conference
//!
//! This module contains the value types and per-participant state used
//! throughout the crate: candidates, codecs, identity, participants, streams,
//! tracks, and the events propagated between them.

pub mod candidate;
pub mod codec;
pub mod identity;
pub mod participant;
pub mod propagated;
pub mod stream;
pub mod tracks;
