use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::conference::ConferenceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(pub(crate) u64);

impl Deref for ParticipantId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A remote party in a conference.
///
/// Participants are created by [`crate::conference::Conference::add_participant`]
/// and referenced by id from every stream that carries their media.
#[derive(Debug, Clone)]
pub struct Participant {
    id: ParticipantId,
    conference: ConferenceId,
    cname: Option<String>,
    attributes: BTreeMap<String, String>,
}

impl Participant {
    pub(crate) fn new(conference: ConferenceId) -> Participant {
        static ID_COUNTER: AtomicU64 = AtomicU64::new(0);
        let next_id = ID_COUNTER.fetch_add(1, Ordering::SeqCst);
        Participant {
            id: ParticipantId(next_id),
            conference,
            cname: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn conference(&self) -> ConferenceId {
        self.conference
    }

    /// The canonical name learned from the participant's RTCP SDES, if any.
    pub fn cname(&self) -> Option<&str> {
        self.cname.as_deref()
    }

    pub fn set_cname(&mut self, cname: impl Into<String>) {
        self.cname = Some(cname.into());
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Name to show for this participant: cname when known, else the id.
    pub fn display_name(&self) -> String {
        match &self.cname {
            Some(cname) => cname.clone(),
            None => format!("participant-{}", self.id),
        }
    }
}
