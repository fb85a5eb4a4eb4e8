//! Conference configuration

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::candidate::{CandidateType, ComponentId, NetworkProtocol, TransportCandidate};
use crate::model::codec::{Codec, MediaType};
use crate::sink::SinkConfig;
use crate::transport::TransmitterKind;

/// Everything needed to build and drive a conference.
///
/// Missing fields fall back to their defaults, so a config file only has to
/// list what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConferenceConfig {
    /// Description of the node every track's local port lives on.
    pub conference_element: String,
    /// Identity fields merged over the built-in defaults at creation.
    pub identity: BTreeMap<String, String>,
    /// Local codec capabilities, in preference order, for all media types.
    pub local_codecs: Vec<Codec>,
    /// Output port template on the conference node for remote sources.
    pub source_port: String,
    /// Input port template on the conference node for local producers.
    pub producer_port: String,
    pub sink: SinkConfig,
    /// Bound of the dispatcher event queue.
    pub queue_size: usize,

    /// Transmitter the CLI selects for its stream.
    pub transmitter: TransmitterKind,
    /// Remote codecs the CLI applies to its stream.
    pub remote_codecs: Vec<Codec>,
    /// Remote candidates the CLI forces on its stream.
    pub remote_candidates: Vec<TransportCandidate>,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            conference_element: "rtpconference".to_string(),
            identity: BTreeMap::new(),
            local_codecs: default_local_codecs(),
            source_port: "src_%u".to_string(),
            producer_port: "sink_%u".to_string(),
            sink: SinkConfig::default(),
            queue_size: 64,
            transmitter: TransmitterKind::Multicast,
            remote_codecs: vec![Codec::new(96, "H263-1998", MediaType::Video, 90000)],
            remote_candidates: default_remote_candidates(),
        }
    }
}

impl ConferenceConfig {
    /// Reads a JSON config file.
    pub fn load(path: &Path) -> Result<ConferenceConfig> {
        let file = File::open(path)
            .with_context(|| format!("opening config file {}", path.display()))?;
        let config: ConferenceConfig = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("checking config file {}", path.display()))?;
        Ok(config)
    }

    /// Checks every codec and candidate the config carries.
    pub fn validate(&self) -> Result<()> {
        for codec in self.local_codecs.iter().chain(&self.remote_codecs) {
            codec.validate()?;
        }
        for candidate in &self.remote_candidates {
            candidate.validate()?;
        }
        Ok(())
    }
}

fn default_local_codecs() -> Vec<Codec> {
    vec![
        Codec::new(96, "H263-1998", MediaType::Video, 90000),
        Codec::new(97, "H264", MediaType::Video, 90000).with_parameter("packetization-mode", "1"),
        Codec::new(98, "VP8", MediaType::Video, 90000),
        Codec::new(111, "opus", MediaType::Audio, 48000).with_channels(2),
        Codec::new(0, "PCMU", MediaType::Audio, 8000).with_channels(1),
        Codec::new(8, "PCMA", MediaType::Audio, 8000).with_channels(1),
    ]
}

fn default_remote_candidates() -> Vec<TransportCandidate> {
    let group = std::net::Ipv4Addr::new(224, 0, 0, 110).into();
    let Ok(rtp) = TransportCandidate::new(
        group,
        3442,
        ComponentId::Rtp,
        NetworkProtocol::Udp,
        CandidateType::Multicast,
    ) else {
        return vec![];
    };
    let rtcp = rtp.copy().with_port(3443).with_component(ComponentId::Rtcp);
    vec![rtp, rtcp]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConferenceConfig::default();
        assert_eq!(config.remote_candidates.len(), 2);
        assert_eq!(config.remote_candidates[1].port(), 3443);
        assert_eq!(config.transmitter, TransmitterKind::Multicast);
        assert!(config
            .local_codecs
            .iter()
            .any(|c| c.encoding_name() == "H263-1998"));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "transmitter": "nice",
            "identity": { "name": "Rover" },
            "sink": { "consumer": "fakesink" }
        }"#;
        let config: ConferenceConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.transmitter, TransmitterKind::Nice);
        assert_eq!(config.identity.get("name").map(String::as_str), Some("Rover"));
        assert_eq!(config.sink.consumer, "fakesink");
        assert_eq!(config.sink.merge, "funnel");
        assert_eq!(config.queue_size, 64);
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConferenceConfig::load(Path::new("/nonexistent/conference.json")).unwrap_err();
        assert!(err.to_string().contains("opening config file"));
    }

    #[test]
    fn test_out_of_range_payload_type_is_rejected() {
        let json = r#"{
            "remote_codecs": [
                { "payload_type": 200, "encoding_name": "H264", "media_type": "video", "clock_rate": 90000 }
            ]
        }"#;
        let config: ConferenceConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
        assert!(ConferenceConfig::default().validate().is_ok());

        let path = std::env::temp_dir().join(format!("rover-conference-{}.json", std::process::id()));
        std::fs::write(&path, json).unwrap();
        let err = ConferenceConfig::load(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(err.to_string().contains("checking config file"));
    }
}
