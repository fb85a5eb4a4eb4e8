//! Transport candidates
//!
//! A [`TransportCandidate`] describes one network endpoint for one component
//! (RTP or RTCP) of a stream. Candidates are values: overriding a field always
//! produces a new candidate and never touches the one it was derived from.

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use serde::{Deserialize, Serialize};

use crate::error::{ConferenceError, Result};

/// The component of a media stream a candidate carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentId {
    Rtp = 1,
    Rtcp = 2,
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentId::Rtp => f.write_str("rtp"),
            ComponentId::Rtcp => f.write_str("rtcp"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Multicast,
}

/// One network endpoint for one stream component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCandidate {
    #[serde(default)]
    foundation: String,
    component: ComponentId,
    ip: IpAddr,
    port: u16,
    protocol: NetworkProtocol,
    #[serde(rename = "type")]
    kind: CandidateType,
    #[serde(default = "default_ttl")]
    ttl: u8,
    #[serde(default)]
    priority: u32,
    #[serde(default)]
    base: Option<SocketAddr>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

fn default_ttl() -> u8 {
    1
}

impl TransportCandidate {
    /// Creates a validated candidate with a ttl of 1 and no credentials.
    pub fn new(
        ip: IpAddr,
        port: u16,
        component: ComponentId,
        protocol: NetworkProtocol,
        kind: CandidateType,
    ) -> Result<TransportCandidate> {
        let candidate = TransportCandidate {
            foundation: String::new(),
            component,
            ip,
            port,
            protocol,
            kind,
            ttl: default_ttl(),
            priority: 0,
            base: None,
            username: None,
            password: None,
        };
        candidate.validate()?;
        Ok(candidate)
    }

    /// An independent copy of this candidate, ready to be overridden.
    pub fn copy(&self) -> TransportCandidate {
        self.clone()
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = ip;
        self
    }

    pub fn with_component(mut self, component: ComponentId) -> Self {
        self.component = component;
        self
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_foundation(mut self, foundation: impl Into<String>) -> Self {
        self.foundation = foundation.into();
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_base(mut self, base: SocketAddr) -> Self {
        self.base = Some(base);
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn foundation(&self) -> &str {
        &self.foundation
    }

    pub fn component(&self) -> ComponentId {
        self.component
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn protocol(&self) -> NetworkProtocol {
        self.protocol
    }

    pub fn kind(&self) -> CandidateType {
        self.kind
    }

    pub fn ttl(&self) -> u8 {
        self.ttl
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn base(&self) -> Option<SocketAddr> {
        self.base
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    /// Checks the constraints a candidate must satisfy before it can be used.
    ///
    /// Candidates deserialized from configuration skip [`TransportCandidate::new`],
    /// so this is run again whenever candidates are handed to a stream.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ConferenceError::InvalidCandidateSet(format!(
                "{} candidate for {} has port 0",
                self.component, self.ip
            )));
        }

        if self.kind == CandidateType::Multicast {
            if !self.ip.is_multicast() {
                return Err(ConferenceError::InvalidCandidateSet(format!(
                    "{} is not a multicast address",
                    self.ip
                )));
            }
            if self.ttl == 0 {
                return Err(ConferenceError::InvalidCandidateSet(format!(
                    "multicast candidate {} needs a ttl of at least 1",
                    self.socket_addr()
                )));
            }
        }

        Ok(())
    }
}

impl fmt::Display for TransportCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?}/{:?} {}",
            self.component,
            self.kind,
            self.protocol,
            self.socket_addr()
        )
    }
}

/// Host candidates can be handed to a str0m `Rtc` as local or remote ICE candidates.
impl TryFrom<&TransportCandidate> for str0m::Candidate {
    type Error = ConferenceError;

    fn try_from(candidate: &TransportCandidate) -> Result<Self> {
        if candidate.kind != CandidateType::Host {
            return Err(ConferenceError::InvalidCandidateSet(format!(
                "only host candidates map to ICE candidates, got {:?}",
                candidate.kind
            )));
        }

        let proto = match candidate.protocol {
            NetworkProtocol::Udp => str0m::net::Protocol::Udp,
            NetworkProtocol::Tcp => str0m::net::Protocol::Tcp,
        };

        str0m::Candidate::host(candidate.socket_addr(), proto)
            .map_err(|e| ConferenceError::InvalidCandidateSet(e.to_string()))
    }
}
