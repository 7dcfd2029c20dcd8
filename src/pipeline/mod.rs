//! Audio pipeline components.
//!
//! ```text
//! CPAL input thread → Ring Buffer → Capture Bridge → Dispatcher → socket
//! socket → Dispatcher → Playback Queue → CPAL output thread
//! ```
//!
//! - **Ring Buffer**: Lock-free SPSC queue so the input callback never blocks
//! - **Capture Bridge**: Drains the buffer, converts to mono PCM16, chunks
//! - **Playback Queue**: Chunk FIFO with gain and interruption state, pulled
//!   by the output callback

mod capture;
mod playback;

pub(crate) use capture::{CaptureConfig, CapturePipeline, CapturedAudio};
pub use playback::OutputRenderer;
pub(crate) use playback::{PlaybackPipeline, PlaybackSignal};
