//! Conferencing core: participants, per-participant streams with codec and
//! transport negotiation, and a shared sink every remote source is linked
//! into.

pub mod conference;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod graph;
pub mod model;
pub mod negotiation;
pub mod sink;
pub mod transport;
pub mod util;

pub use conference::{Conference, ConferenceId, ConferenceState};
pub use config::ConferenceConfig;
pub use error::{ConferenceError, Result};
