//! Audio capture using CPAL
//!
//! The CaptureEngine binds to an input device and records into a
//! [`CaptureSink`]. Each recording runs on a dedicated capture thread that owns
//! the cpal stream; the realtime callback only converts samples and appends
//! them under the sink's short critical section. Recording is controlled via
//! start_capture() and stop_capture().

use std::sync::mpsc;
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{BufferSize, SampleFormat, SampleRate, Stream, StreamConfig};
use thiserror::Error;

use super::buffer::{CaptureBuffer, CaptureSink, Frame};
use super::devices::{AudioDevice, DeviceRegistry, DEFAULT_SAMPLE_RATE};

/// Errors that can occur during device selection and audio capture.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("A capture is already in progress")]
    AlreadyCapturing,
    #[error("Audio stream error: {0}")]
    StreamError(String),
    #[error("Failed to encode audio: {0}")]
    EncodeFailed(String),
}

/// Capture seam driven by the orchestrator.
pub trait AudioCapture: Send {
    /// Begin streaming into a fresh buffer.
    fn start_capture(&mut self) -> Result<(), AudioError>;

    /// Stop streaming and hand over every frame captured so far, in arrival
    /// order. Returns an empty vec when not capturing.
    fn stop_capture(&mut self) -> Vec<Frame>;

    /// Stop streaming and drop the captured data.
    fn discard_capture(&mut self) {
        let discarded = self.stop_capture();
        log::debug!("Discarded {} captured frames", discarded.len());
    }

    fn is_capturing(&self) -> bool;

    fn sample_rate(&self) -> u32;

    fn channels(&self) -> u16;
}

/// The stream thread of an in-progress capture.
struct ActiveCapture {
    stop_tx: mpsc::Sender<()>,
    thread: JoinHandle<()>,
}

/// Records from a single input device.
pub struct CaptureEngine {
    device: AudioDevice,
    config: StreamConfig,
    sample_format: SampleFormat,
    frame_samples: usize,
    sink: CaptureSink,
    active: Option<ActiveCapture>,
}

impl CaptureEngine {
    /// Bind to `device` using its default input config. Does not start streaming.
    pub fn open(device: &AudioDevice, frame_samples: usize) -> Result<Self, AudioError> {
        let registry = DeviceRegistry::new();
        let handle = registry.locate(device)?;

        let (config, sample_format) = match handle.default_input_config() {
            Ok(supported) => {
                log::info!(
                    "Audio config: {} Hz, {} channels, {:?}",
                    supported.sample_rate().0,
                    supported.channels(),
                    supported.sample_format()
                );
                let sample_format = supported.sample_format();
                (supported.into(), sample_format)
            }
            Err(e) => {
                log::warn!(
                    "No default input config for {:?} ({}), falling back to {} Hz mono",
                    device.name,
                    e,
                    DEFAULT_SAMPLE_RATE
                );
                let config = StreamConfig {
                    channels: 1,
                    sample_rate: SampleRate(DEFAULT_SAMPLE_RATE),
                    buffer_size: BufferSize::Default,
                };
                (config, SampleFormat::I16)
            }
        };

        log::info!("Using audio input device: {}", device.label());

        Ok(Self {
            device: device.clone(),
            config,
            sample_format,
            frame_samples,
            sink: CaptureSink::new(),
            active: None,
        })
    }

    pub fn device(&self) -> &AudioDevice {
        &self.device
    }
}

impl AudioCapture for CaptureEngine {
    fn start_capture(&mut self) -> Result<(), AudioError> {
        if self.active.is_some() || !self.sink.arm(self.frame_samples, self.config.channels) {
            return Err(AudioError::AlreadyCapturing);
        }

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), AudioError>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let device = self.device.clone();
        let config = self.config.clone();
        let sample_format = self.sample_format;
        let sink = self.sink.clone();

        let spawned = std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                run_capture_thread(device, config, sample_format, sink, ready_tx, stop_rx)
            });

        let thread = match spawned {
            Ok(thread) => thread,
            Err(e) => {
                self.sink.detach();
                return Err(AudioError::StreamError(format!(
                    "Failed to spawn capture thread: {}",
                    e
                )));
            }
        };

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(AudioError::StreamError(
                "Capture thread exited before the stream started".to_string(),
            ))
        });

        match ready {
            Ok(()) => {
                log::info!(
                    "Capture started on {:?} ({} Hz, {} ch)",
                    self.device.name,
                    self.config.sample_rate.0,
                    self.config.channels
                );
                self.active = Some(ActiveCapture { stop_tx, thread });
                Ok(())
            }
            Err(e) => {
                let _ = thread.join();
                self.sink.detach();
                Err(e)
            }
        }
    }

    fn stop_capture(&mut self) -> Vec<Frame> {
        let Some(active) = self.active.take() else {
            return Vec::new();
        };

        // Swap the buffer out first; anything the callback delivers after
        // this point lands in a disarmed slot and is dropped.
        let frames = self
            .sink
            .detach()
            .map(CaptureBuffer::into_frames)
            .unwrap_or_default();

        let _ = active.stop_tx.send(());
        if active.thread.join().is_err() {
            log::error!("Capture thread panicked while shutting down");
        }

        log::info!("Capture stopped: {} frames", frames.len());
        frames
    }

    fn is_capturing(&self) -> bool {
        self.active.is_some()
    }

    fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }

    fn channels(&self) -> u16 {
        self.config.channels
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        if self.active.is_some() {
            self.discard_capture();
        }
    }
}

/// Body of the capture thread: owns the stream until a stop is requested.
fn run_capture_thread(
    device: AudioDevice,
    config: StreamConfig,
    sample_format: SampleFormat,
    sink: CaptureSink,
    ready_tx: mpsc::SyncSender<Result<(), AudioError>>,
    stop_rx: mpsc::Receiver<()>,
) {
    let stream = match build_stream(&device, &config, sample_format, sink) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(AudioError::StreamError(format!(
            "Failed to start stream: {}",
            e
        ))));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    // Blocks until stop_capture() signals or the engine is dropped
    let _ = stop_rx.recv();
    drop(stream);
    log::debug!("Capture stream closed");
}

fn build_stream(
    device: &AudioDevice,
    config: &StreamConfig,
    sample_format: SampleFormat,
    sink: CaptureSink,
) -> Result<Stream, AudioError> {
    let handle = DeviceRegistry::new().locate(device)?;
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(&handle, config, sink, err_fn),
        SampleFormat::U16 => build_stream_typed::<u16>(&handle, config, sink, err_fn),
        SampleFormat::F32 => build_stream_typed::<f32>(&handle, config, sink, err_fn),
        other => Err(AudioError::StreamError(format!(
            "Unsupported sample format {:?}",
            other
        ))),
    }
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    sink: CaptureSink,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<Stream, AudioError>
where
    T: cpal::Sample + cpal::SizedSample + Send + 'static,
    i16: cpal::FromSample<T>,
{
    let mut scratch: Vec<i16> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&sample| sample_to_i16(sample)));
                sink.append(&scratch);
            },
            err_fn,
            None,
        )
        .map_err(|e| AudioError::StreamError(e.to_string()))
}

/// Convert any supported sample type to PCM16.
fn sample_to_i16<T>(sample: T) -> i16
where
    T: cpal::Sample,
    i16: cpal::FromSample<T>,
{
    <i16 as cpal::FromSample<T>>::from_sample_(sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_to_i16() {
        // PCM16 passes through untouched
        assert_eq!(sample_to_i16(1234i16), 1234);
        assert_eq!(sample_to_i16(i16::MIN), i16::MIN);

        // Float conversion keeps silence and sign
        assert_eq!(sample_to_i16(0.0f32), 0);
        assert!(sample_to_i16(0.5f32) > 0);
        assert!(sample_to_i16(-0.5f32) < 0);
    }

    #[test]
    fn test_audio_error_display() {
        assert_eq!(
            AudioError::NoInputDevice.to_string(),
            "No audio input device found"
        );
        assert!(AudioError::StreamError("boom".to_string())
            .to_string()
            .contains("boom"));
    }
}
