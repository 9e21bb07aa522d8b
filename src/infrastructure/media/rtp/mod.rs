//! RTP media seams and the recording implementation

pub mod recorder;
pub mod session;

pub use recorder::{MediaEvent, RecordingMediaFactory};
pub use session::{MediaError, MediaFactory, MediaPortAllocator, RtpSession, VideoSession, ZrtpEvent};
