//! Audio/video codec descriptors

pub mod registry;

pub use registry::{
    AudioCodec, CodecRegistry, VideoCodec, DEFAULT_AUDIO_PAYLOAD, FIRST_DYNAMIC_PAYLOAD,
    VIDEO_CLOCK_RATE,
};
