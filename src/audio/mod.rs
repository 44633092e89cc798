//! Audio module for the voice assistant
//!
//! Handles input device selection, microphone capture, WAV encoding, reply
//! artifacts and playback. Uses CPAL for device I/O and hound for WAV.

pub mod buffer;
pub mod devices;
mod paths;
pub mod playback;
pub mod recorder;
pub mod wav;

pub use buffer::{CaptureBuffer, CaptureSink, Frame, DEFAULT_FRAME_SAMPLES};
pub use devices::{AudioDevice, DeviceRegistry, DEFAULT_SAMPLE_RATE};
pub use paths::{artifact_file_name, create_output_dir, generate_artifact_path, persist_artifact};
pub use playback::{AudioPlayer, PlaybackEngine, PlaybackError};
pub use recorder::{AudioCapture, AudioError, CaptureEngine};
