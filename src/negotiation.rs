//! Codec negotiation seam

use tracing::debug;

use crate::model::codec::Codec;

/// Picks the codec both ends can use.
pub trait CodecNegotiator: Send + Sync {
    /// Returns the highest-priority remote codec that has a local counterpart.
    fn negotiate(&self, local: &[Codec], remote: &[Codec]) -> Option<Codec>;
}

/// SDP offer/answer style intersection.
///
/// Remote codecs are walked in the order given (their priority). For each one
/// the local codec sharing its payload type is tried first; dynamic payload
/// types may also match a local codec by encoding, media type and clock rate.
/// The negotiated codec keeps the remote payload type.
#[derive(Debug, Default, Clone, Copy)]
pub struct SdpNegotiator;

impl SdpNegotiator {
    fn intersect(local: &Codec, remote: &Codec) -> Codec {
        let mut negotiated = remote.clone();
        if negotiated.channels() == 0 && local.channels() != 0 {
            negotiated = negotiated.with_channels(local.channels());
        }
        for param in local.parameters() {
            if negotiated.parameter(&param.name).is_none() {
                negotiated = negotiated.with_parameter(param.name.clone(), param.value.clone());
            }
        }
        negotiated
    }
}

impl CodecNegotiator for SdpNegotiator {
    fn negotiate(&self, local: &[Codec], remote: &[Codec]) -> Option<Codec> {
        for remote_codec in remote {
            if !remote_codec.has_valid_payload_type() {
                debug!("Skipping remote codec with bad payload type: {}", remote_codec);
                continue;
            }

            let same_pt = local
                .iter()
                .find(|l| l.matches(remote_codec) && l.same_encoding(remote_codec));

            let by_encoding = || {
                remote_codec
                    .is_dynamic()
                    .then(|| local.iter().find(|l| l.same_encoding(remote_codec)))
                    .flatten()
            };

            if let Some(local_codec) = same_pt.or_else(by_encoding) {
                let negotiated = Self::intersect(local_codec, remote_codec);
                debug!("Negotiated codec {}", negotiated);
                return Some(negotiated);
            }

            debug!("No local match for remote codec {}", remote_codec);
        }

        None
    }
}
