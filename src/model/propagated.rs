//! Asynchronous events routed to streams
//!
//! Transport threads never touch the conference directly. They push
//! [`Propagated`] events into the dispatcher queue, which hands them to the
//! conference one at a time.

use crate::model::candidate::ComponentId;
use crate::model::stream::{RemoteMedia, StreamKey};
use crate::transport::ComponentState;

#[derive(Debug, Clone)]
pub enum Propagated {
    /// When we have nothing to propagate.
    Noop,

    /// A remote source is ready to be linked.
    RemoteMedia(RemoteMedia),

    /// A transport saw a new SSRC. The conference allocates its port and
    /// resolves its codec before announcing it as remote media.
    SourceDiscovered {
        key: StreamKey,
        ssrc: u32,
        payload_type: u8,
    },

    /// A transport component changed state.
    ComponentState(StreamKey, ComponentId, ComponentState),

    /// Ask the run loop to return.
    Stop,
}

impl Propagated {
    /// The stream this event is for, if any.
    pub fn stream_key(&self) -> Option<StreamKey> {
        match self {
            Propagated::RemoteMedia(media) => Some(media.key()),
            Propagated::SourceDiscovered { key, .. } | Propagated::ComponentState(key, _, _) => {
                Some(*key)
            }
            Propagated::Noop | Propagated::Stop => None,
        }
    }
}
