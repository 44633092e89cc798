//! Reply playback to the default output device
//!
//! Playback is synchronous: `play()` blocks the calling thread until the clip
//! has drained or the clip length plus a margin has elapsed. Callers on an
//! async runtime run it through `spawn_blocking`.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use thiserror::Error;

use super::wav::{decode_file, DecodedAudio};

/// Extra wait on top of the clip length before giving up
const DRAIN_MARGIN: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaybackError {
    #[error("Playback failed: {0}")]
    PlaybackFailure(String),
    #[error("Another playback is already in progress")]
    PlaybackBusy,
}

/// Playback seam driven by the processing task.
pub trait AudioPlayer: Send + Sync {
    /// Play a WAV file to completion.
    fn play(&self, path: &Path) -> Result<(), PlaybackError>;
}

/// Plays WAV artifacts on the default output device. At most one clip plays
/// at a time; a concurrent call is rejected, not queued.
#[derive(Debug, Default)]
pub struct PlaybackEngine {
    busy: AtomicBool,
}

/// Clears the busy flag when playback ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl PlaybackEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_playing(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> Result<BusyGuard<'_>, PlaybackError> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| BusyGuard(&self.busy))
            .map_err(|_| PlaybackError::PlaybackBusy)
    }

    fn play_decoded(&self, audio: DecodedAudio) -> Result<(), PlaybackError> {
        let mono = downmix(&audio.samples, audio.channels);
        if mono.is_empty() {
            log::debug!("Nothing to play");
            return Ok(());
        }

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlaybackError::PlaybackFailure("no output device".to_string()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| PlaybackError::PlaybackFailure(e.to_string()))?;

        let sample_format = supported.sample_format();
        let config: StreamConfig = supported.into();

        let samples = resample_linear(&mono, audio.sample_rate, config.sample_rate.0);
        let clip = Duration::from_secs_f64(samples.len() as f64 / config.sample_rate.0 as f64);

        log::debug!(
            "Playing {:.2}s on {:?} ({} Hz, {} ch, {:?})",
            clip.as_secs_f64(),
            device.name().unwrap_or_default(),
            config.sample_rate.0,
            config.channels,
            sample_format
        );

        let (done_tx, done_rx) = mpsc::sync_channel::<()>(1);
        let samples = Arc::new(samples);

        let stream = match sample_format {
            SampleFormat::F32 => build_output::<f32>(&device, &config, samples, done_tx),
            SampleFormat::I16 => build_output::<i16>(&device, &config, samples, done_tx),
            SampleFormat::U16 => build_output::<u16>(&device, &config, samples, done_tx),
            other => Err(PlaybackError::PlaybackFailure(format!(
                "Unsupported output format {:?}",
                other
            ))),
        }?;

        stream
            .play()
            .map_err(|e| PlaybackError::PlaybackFailure(e.to_string()))?;

        let result = match done_rx.recv_timeout(clip + DRAIN_MARGIN) {
            Ok(()) => Ok(()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(PlaybackError::PlaybackFailure(
                "timed out waiting for playback to finish".to_string(),
            )),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(PlaybackError::PlaybackFailure(
                "output stream closed early".to_string(),
            )),
        };

        // Let the device flush its last buffer
        std::thread::sleep(Duration::from_millis(100));
        drop(stream);

        result
    }
}

impl AudioPlayer for PlaybackEngine {
    fn play(&self, path: &Path) -> Result<(), PlaybackError> {
        let _guard = self.acquire()?;

        let audio = decode_file(path).map_err(|e| {
            PlaybackError::PlaybackFailure(format!("cannot decode {:?}: {}", path, e))
        })?;

        self.play_decoded(audio)?;
        log::info!("Playback complete: {:?}", path);
        Ok(())
    }
}

fn build_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    samples: Arc<Vec<f32>>,
    done_tx: mpsc::SyncSender<()>,
) -> Result<Stream, PlaybackError>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    let mut position = 0usize;
    let mut signalled = false;

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    let sample = samples.get(position).copied().unwrap_or(0.0);
                    for out in frame.iter_mut() {
                        *out = T::from_sample_(sample);
                    }
                    if position < samples.len() {
                        position += 1;
                    }
                }

                if position >= samples.len() && !signalled {
                    signalled = true;
                    let _ = done_tx.try_send(());
                }
            },
            |err| log::error!("Audio playback error: {}", err),
            None,
        )
        .map_err(|e| PlaybackError::PlaybackFailure(e.to_string()))
}

/// Average interleaved channels into one.
fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if channels == 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear interpolation from `from_rate` to `to_rate`.
pub(crate) fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round().max(1.0) as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let src = i as f64 * ratio;
            let idx = (src.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (src - idx as f64) as f32;
            samples[idx] + (samples[next] - samples[idx]) * frac
        })
        .collect()
}
