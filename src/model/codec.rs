//! Codec descriptions used during negotiation

use std::fmt;

use serde::{Deserialize, Serialize};
use str0m::media::MediaKind;

use crate::error::{ConferenceError, Result};

/// Highest payload type an RTP header can carry.
pub const MAX_PAYLOAD_TYPE: u8 = 127;

/// First payload type of the dynamic range.
pub const DYNAMIC_PAYLOAD_TYPE_START: u8 = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Application,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Application => "application",
        }
    }

    /// The str0m media kind for this type. Application data has none.
    pub fn media_kind(&self) -> Option<MediaKind> {
        match self {
            MediaType::Audio => Some(MediaKind::Audio),
            MediaType::Video => Some(MediaKind::Video),
            MediaType::Application => None,
        }
    }
}

impl From<MediaKind> for MediaType {
    fn from(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => MediaType::Audio,
            MediaKind::Video => MediaType::Video,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An optional `name=value` codec parameter (fmtp).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecParameter {
    pub name: String,
    pub value: String,
}

/// One negotiable media encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codec {
    payload_type: u8,
    encoding_name: String,
    media_type: MediaType,
    clock_rate: u32,
    #[serde(default)]
    channels: u8,
    #[serde(default)]
    parameters: Vec<CodecParameter>,
}

impl Codec {
    /// Builds a codec without range checks. Payload types above
    /// [`MAX_PAYLOAD_TYPE`] are rejected by [`Codec::validate`], when loading a
    /// config, and skipped during negotiation.
    pub fn new(
        payload_type: u8,
        encoding_name: impl Into<String>,
        media_type: MediaType,
        clock_rate: u32,
    ) -> Codec {
        Codec {
            payload_type,
            encoding_name: encoding_name.into(),
            media_type,
            clock_rate,
            channels: 0,
            parameters: vec![],
        }
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_payload_type(mut self, payload_type: u8) -> Self {
        self.payload_type = payload_type;
        self
    }

    /// Adds a parameter, replacing any existing one with the same name.
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.parameters
            .retain(|p| !p.name.eq_ignore_ascii_case(&name));
        self.parameters.push(CodecParameter {
            name,
            value: value.into(),
        });
        self
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn encoding_name(&self) -> &str {
        &self.encoding_name
    }

    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn parameters(&self) -> &[CodecParameter] {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_str())
    }

    pub fn is_dynamic(&self) -> bool {
        self.payload_type >= DYNAMIC_PAYLOAD_TYPE_START
    }

    pub fn has_valid_payload_type(&self) -> bool {
        self.payload_type <= MAX_PAYLOAD_TYPE
    }

    pub fn validate(&self) -> Result<()> {
        if !self.has_valid_payload_type() {
            return Err(ConferenceError::InvalidCodec(format!(
                "payload type {} of {} is outside 0-{}",
                self.payload_type, self.encoding_name, MAX_PAYLOAD_TYPE
            )));
        }
        if self.encoding_name.is_empty() {
            return Err(ConferenceError::InvalidCodec(format!(
                "codec with payload type {} has no encoding name",
                self.payload_type
            )));
        }
        Ok(())
    }

    /// Negotiation identity: same payload type and encoding name.
    pub fn matches(&self, other: &Codec) -> bool {
        self.payload_type == other.payload_type
            && self.encoding_name.eq_ignore_ascii_case(&other.encoding_name)
    }

    /// Same encoding regardless of payload type numbering.
    pub fn same_encoding(&self, other: &Codec) -> bool {
        self.media_type == other.media_type
            && self.clock_rate == other.clock_rate
            && self.encoding_name.eq_ignore_ascii_case(&other.encoding_name)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {} clock:{} channels:{}",
            self.payload_type, self.media_type, self.encoding_name, self.clock_rate, self.channels
        )?;
        for p in &self.parameters {
            write!(f, " {}={}", p.name, p.value)?;
        }
        Ok(())
    }
}
