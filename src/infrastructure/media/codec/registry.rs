//! Codec registry
//!
//! Static description of the audio and video codecs the media subsystem can
//! run, used to resolve account preference lists into SDP payload formats.

use tracing::warn;

/// Payload type of the codec every session can fall back to (PCMU)
pub const DEFAULT_AUDIO_PAYLOAD: u8 = 0;
/// First payload number handed to dynamically numbered video codecs
pub const FIRST_DYNAMIC_PAYLOAD: u8 = 96;
/// RTP clock of all video codecs
pub const VIDEO_CLOCK_RATE: u32 = 90000;

/// Audio codec descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioCodec {
    pub payload_type: u8,
    pub name: String,
    /// Sampling rate the codec runs at
    pub clock_rate: u32,
    pub channels: u8,
    /// Nominal bitrate in kbit/s
    pub bitrate: u32,
}

impl AudioCodec {
    pub fn new(payload_type: u8, name: &str, clock_rate: u32, bitrate: u32) -> Self {
        Self {
            payload_type,
            name: name.to_string(),
            clock_rate,
            channels: 1,
            bitrate,
        }
    }

    /// Clock rate written in `a=rtpmap`. G.722 samples at 16 kHz but is
    /// advertised with 8000 (RFC 3551 section 4.5.2).
    pub fn sdp_clock_rate(&self) -> u32 {
        if self.name.eq_ignore_ascii_case("G722") {
            8000
        } else {
            self.clock_rate
        }
    }

    /// Encoding name for rtpmap
    pub fn encoding(&self) -> String {
        format!("{}/{}", self.name, self.sdp_clock_rate())
    }

    /// Static payload types (below 96) are identified by number alone
    pub fn is_static(&self) -> bool {
        self.payload_type < FIRST_DYNAMIC_PAYLOAD
    }
}

/// Video codec descriptor; payload numbers are assigned per offer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoCodec {
    pub name: String,
    pub fmtp: Option<String>,
}

/// Registry of supported codecs
#[derive(Debug, Clone)]
pub struct CodecRegistry {
    audio: Vec<AudioCodec>,
    video: Vec<VideoCodec>,
}

impl CodecRegistry {
    /// Create registry with the default codec set
    pub fn new() -> Self {
        let audio = vec![
            AudioCodec::new(0, "PCMU", 8000, 64),
            AudioCodec::new(3, "GSM", 8000, 13),
            AudioCodec::new(8, "PCMA", 8000, 64),
            AudioCodec::new(9, "G722", 16000, 64),
            AudioCodec::new(18, "G729", 8000, 8),
            AudioCodec::new(110, "speex", 8000, 24),
            AudioCodec::new(111, "speex", 16000, 42),
            AudioCodec::new(112, "speex", 32000, 42),
        ];

        let video = vec![
            VideoCodec {
                name: "H264".to_string(),
                fmtp: Some("profile-level-id=428014".to_string()),
            },
            VideoCodec {
                name: "VP8".to_string(),
                fmtp: None,
            },
            VideoCodec {
                name: "H263-1998".to_string(),
                fmtp: None,
            },
        ];

        Self { audio, video }
    }

    /// Find codec by payload type
    pub fn audio(&self, payload_type: u8) -> Option<&AudioCodec> {
        self.audio.iter().find(|c| c.payload_type == payload_type)
    }

    /// Find codec by rtpmap encoding name and advertised clock rate
    pub fn audio_by_encoding(&self, name: &str, sdp_clock_rate: u32) -> Option<&AudioCodec> {
        self.audio
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name) && c.sdp_clock_rate() == sdp_clock_rate)
    }

    /// PCMU, used before negotiation completes and when nothing else is known
    pub fn default_audio(&self) -> AudioCodec {
        self.audio(DEFAULT_AUDIO_PAYLOAD)
            .cloned()
            .unwrap_or_else(|| AudioCodec::new(DEFAULT_AUDIO_PAYLOAD, "PCMU", 8000, 64))
    }

    /// Resolve an ordered payload preference list, skipping unknown entries
    pub fn resolve_audio(&self, payloads: &[u8]) -> Vec<AudioCodec> {
        payloads
            .iter()
            .filter_map(|pt| {
                let codec = self.audio(*pt).cloned();
                if codec.is_none() {
                    warn!(payload_type = pt, "Unknown audio payload type in preferences");
                }
                codec
            })
            .collect()
    }

    pub fn video(&self, name: &str) -> Option<&VideoCodec> {
        self.video.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Resolve video codec names; unknown names get no fmtp
    pub fn resolve_video<'a, I>(&self, names: I) -> Vec<VideoCodec>
    where
        I: IntoIterator<Item = &'a str>,
    {
        names
            .into_iter()
            .map(|name| {
                self.video(name).cloned().unwrap_or_else(|| VideoCodec {
                    name: name.to_string(),
                    fmtp: None,
                })
            })
            .collect()
    }

    /// Get all supported payload types
    pub fn supported_payload_types(&self) -> Vec<u8> {
        self.audio.iter().map(|c| c.payload_type).collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_encoding() {
        let registry = CodecRegistry::new();
        assert_eq!(registry.audio(0).unwrap().encoding(), "PCMU/8000");
        assert_eq!(registry.audio(111).unwrap().encoding(), "speex/16000");
    }

    #[test]
    fn test_g722_advertised_at_8000() {
        let registry = CodecRegistry::new();
        let g722 = registry.audio(9).unwrap();
        assert_eq!(g722.clock_rate, 16000);
        assert_eq!(g722.sdp_clock_rate(), 8000);
        assert_eq!(g722.encoding(), "G722/8000");
        assert_eq!(registry.audio_by_encoding("g722", 8000).unwrap().payload_type, 9);
    }

    #[test]
    fn test_resolve_audio_keeps_order_and_skips_unknown() {
        let registry = CodecRegistry::new();
        let resolved = registry.resolve_audio(&[9, 77, 0]);
        let payloads: Vec<u8> = resolved.iter().map(|c| c.payload_type).collect();
        assert_eq!(payloads, vec![9, 0]);
    }

    #[test]
    fn test_video_fmtp() {
        let registry = CodecRegistry::new();
        let resolved = registry.resolve_video(["H264", "THEORA"]);
        assert_eq!(resolved[0].fmtp.as_deref(), Some("profile-level-id=428014"));
        assert_eq!(resolved[1].fmtp, None);
    }

    #[test]
    fn test_default_audio_is_pcmu() {
        assert_eq!(CodecRegistry::new().default_audio().name, "PCMU");
    }
}
