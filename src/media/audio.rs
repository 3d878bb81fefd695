//! Audio Handler - Mikrofon Capture und Lautsprecher Playback
//!
//! Verwendet cpal für Cross-Platform Audio I/O. cpal-Streams sind nicht
//! `Send`, deshalb lebt jeder Stream auf einem eigenen Thread, der so lange
//! läuft wie der zugehörige Track.

use super::codec::{self, DECIMATION, ULAW_SILENCE};
use super::stream::{MediaSample, MediaTrack};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Dauer eines Frames
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

/// Poll-Intervall der Playback-Schleife
const PLAYBACK_POLL: Duration = Duration::from_millis(5);

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

type SampleBuffer = Arc<Mutex<HeapRb<f32>>>;

// ============================================================================
// MICROPHONE
// ============================================================================

/// Öffnet das Standard-Mikrofon und speist 20ms PCMU-Frames in `track`.
///
/// Kehrt zurück sobald das Gerät läuft oder abgelehnt wurde. Das Gerät
/// wird freigegeben sobald der Track gestoppt wird.
pub async fn start_microphone(track: MediaTrack) -> Result<(), AudioError> {
    let (ready_tx, ready_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name("peerchat-mic".to_string())
        .spawn(move || run_microphone(track, ready_tx))
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    ready_rx
        .await
        .map_err(|_| AudioError::StreamBuildError("capture thread exited".to_string()))?
}

fn run_microphone(track: MediaTrack, ready_tx: oneshot::Sender<Result<(), AudioError>>) {
    let buffer: SampleBuffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));

    let stream = match open_input(&buffer) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let silence = vec![ULAW_SILENCE; FRAME_SIZE / DECIMATION];

    while !track.is_stopped() {
        std::thread::sleep(FRAME_DURATION);

        while let Some(frame) = read_frame(&buffer) {
            // Deaktivierter Track sendet Stille statt abzubrechen
            let payload = if track.is_enabled() {
                codec::encode_frame(&frame)
            } else {
                silence.clone()
            };
            if !track.push(MediaSample::new(payload, FRAME_DURATION)) {
                break;
            }
        }
    }

    drop(stream);
    tracing::info!("Microphone released");
}

fn open_input(buffer: &SampleBuffer) -> Result<Stream, AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(AudioError::NoInputDevice)?;

    let config = find_best_input_config(&device)?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let capture_buffer = Arc::clone(buffer);
    let target_sample_rate = SAMPLE_RATE;
    let source_sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Downmix auf Mono
                let mono: Vec<f32> = data
                    .chunks(channels.max(1))
                    .map(|c| c.iter().sum::<f32>() / c.len() as f32)
                    .collect();

                let samples = if source_sample_rate != target_sample_rate {
                    resample(&mono, source_sample_rate, target_sample_rate)
                } else {
                    mono
                };

                let mut buffer = capture_buffer.lock();
                for sample in samples {
                    let _ = buffer.try_push(sample);
                }
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

    Ok(stream)
}

/// Liest einen Frame von aufgenommenem Audio
fn read_frame(buffer: &SampleBuffer) -> Option<Vec<f32>> {
    let mut buffer = buffer.lock();
    if buffer.occupied_len() < FRAME_SIZE {
        return None;
    }
    let mut frame = Vec::with_capacity(FRAME_SIZE);
    for _ in 0..FRAME_SIZE {
        if let Some(sample) = buffer.try_pop() {
            frame.push(sample);
        }
    }
    Some(frame)
}

/// Einfaches Linear-Resampling
fn resample(data: &[f32], from: u32, to: u32) -> Vec<f32> {
    let ratio = to as f32 / from as f32;
    let new_len = (data.len() as f32 * ratio) as usize;
    (0..new_len)
        .map(|i| {
            let src_idx = i as f32 / ratio;
            let idx = src_idx as usize;
            let frac = src_idx - idx as f32;
            let s1 = data.get(idx).copied().unwrap_or(0.0);
            let s2 = data.get(idx + 1).copied().unwrap_or(s1);
            s1 + (s2 - s1) * frac
        })
        .collect()
}

// ============================================================================
// SPEAKER
// ============================================================================

/// Spielt einen Remote-Audio-Track über den Standard-Lautsprecher ab
pub struct SpeakerPlayback {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SpeakerPlayback {
    pub fn start(track: MediaTrack) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("peerchat-speaker".to_string())
            .spawn(move || {
                if let Err(e) = run_playback(track, stop_flag) {
                    tracing::error!("Audio playback failed: {}", e);
                }
            })
            .map_err(|e| tracing::error!("Failed to spawn playback thread: {}", e))
            .ok();

        Self { stop, thread }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SpeakerPlayback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_playback(track: MediaTrack, stop: Arc<AtomicBool>) -> Result<(), AudioError> {
    let buffer: SampleBuffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
    let mut samples = track.subscribe();
    let (_stream, device_rate) = open_output(&buffer)?;

    while !stop.load(Ordering::SeqCst) && !track.is_stopped() {
        match samples.try_recv() {
            Ok(sample) => {
                let pcm = playback_samples(&sample.data, device_rate);
                let mut buffer = buffer.lock();
                for s in pcm {
                    let _ = buffer.try_push(s);
                }
            }
            Err(TryRecvError::Empty) => std::thread::sleep(PLAYBACK_POLL),
            Err(TryRecvError::Lagged(n)) => {
                tracing::debug!("Playback lagged by {} samples", n);
            }
            Err(TryRecvError::Closed) => break,
        }
    }

    tracing::info!("Audio playback stopped");
    Ok(())
}

/// Dekodiert einen Frame und bringt ihn auf die Rate des Ausgabegeräts
fn playback_samples(payload: &[u8], device_rate: u32) -> Vec<f32> {
    let pcm = codec::decode_frame(payload);
    if device_rate == SAMPLE_RATE {
        pcm
    } else {
        resample(&pcm, SAMPLE_RATE, device_rate)
    }
}

/// Ein Sample pro Frame aus dem Ring, auf alle Kanäle verteilt
fn fill_output(data: &mut [f32], channels: usize, buffer: &mut HeapRb<f32>) {
    for frame in data.chunks_mut(channels.max(1)) {
        let sample = buffer.try_pop().unwrap_or(0.0);
        frame.fill(sample);
    }
}

/// Öffnet den Standard-Lautsprecher. Liefert auch dessen Sample Rate.
fn open_output(buffer: &SampleBuffer) -> Result<(Stream, u32), AudioError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or(AudioError::NoOutputDevice)?;

    let config = find_best_output_config(&device)?;

    tracing::info!(
        "Starting audio playback: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let playback_buffer = Arc::clone(buffer);
    let channels = config.channels as usize;

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                fill_output(data, channels, &mut playback_buffer.lock());
            },
            |err| {
                tracing::error!("Audio playback error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::StreamBuildError(e.to_string()))?;

    stream
        .play()
        .map_err(|e| AudioError::StreamPlayError(e.to_string()))?;

    Ok((stream, config.sample_rate.0))
}

// ============================================================================
// CONFIG SELECTION
// ============================================================================

fn find_best_input_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

fn find_best_output_config(device: &Device) -> Result<StreamConfig, AudioError> {
    let configs = device
        .supported_output_configs()
        .map_err(|e| AudioError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Priorität: 48kHz > andere, F32 > andere
fn select_best_config(configs: Vec<SupportedStreamConfigRange>) -> Result<StreamConfig, AudioError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    for config in &configs {
        if config.min_sample_rate() <= target_rate
            && config.max_sample_rate() >= target_rate
            && config.sample_format() == SampleFormat::F32
        {
            return Ok(config.with_sample_rate(target_rate).into());
        }
    }

    for config in &configs {
        if config.sample_format() == SampleFormat::F32 {
            return Ok(config.with_max_sample_rate().into());
        }
    }

    Err(AudioError::UnsupportedConfig(
        "No f32 audio configuration found".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resample_length() {
        let data = vec![0.5f32; 480];
        let out = resample(&data, 24000, 48000);
        assert_eq!(out.len(), 960);
        assert!(out.iter().all(|s| (*s - 0.5).abs() < f32::EPSILON));
    }

    #[test]
    fn test_playback_follows_device_rate() {
        // 20 ms µ-law @ 8 kHz
        let payload = vec![ULAW_SILENCE; 160];
        assert_eq!(playback_samples(&payload, SAMPLE_RATE).len(), FRAME_SIZE);
        assert_eq!(playback_samples(&payload, 24000).len(), FRAME_SIZE / 2);
        assert_eq!(playback_samples(&payload, 96000).len(), FRAME_SIZE * 2);
    }

    #[test]
    fn test_fill_output_pops_one_sample_per_frame() {
        let mut ring = HeapRb::<f32>::new(16);
        for s in [0.1, 0.2, 0.3] {
            let _ = ring.try_push(s);
        }

        // Stereo, 4 Frames: drei Samples, dann Stille
        let mut data = [1.0f32; 8];
        fill_output(&mut data, 2, &mut ring);

        assert_eq!(data, [0.1, 0.1, 0.2, 0.2, 0.3, 0.3, 0.0, 0.0]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_read_frame_needs_full_frame() {
        let buffer: SampleBuffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        {
            let mut b = buffer.lock();
            for _ in 0..FRAME_SIZE - 1 {
                let _ = b.try_push(0.1);
            }
        }
        assert!(read_frame(&buffer).is_none());

        let _ = buffer.lock().try_push(0.1);
        let frame = read_frame(&buffer).unwrap();
        assert_eq!(frame.len(), FRAME_SIZE);
        assert!(read_frame(&buffer).is_none());
    }
}
