//! Audio capture and playback adapters using CPAL and Rodio
//!
//! Capture produces fixed-length PCM16 mono blocks tagged with a per-source
//! sequence number; playback consumes raw PCM16LE bytes behind the
//! `OutputDevice` seam so tests can substitute their own device.

use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, Sink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Fixed-length PCM16 mono sample buffer with a per-source sequence number.
/// Immutable once produced.
#[derive(Debug, Clone)]
pub struct AudioBlock {
    /// PCM16 samples, mono.
    pub samples: Vec<i16>,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Monotonically increasing per capture source.
    pub seq: u64,
}

impl AudioBlock {
    /// Build a block from little-endian PCM16 bytes. A trailing odd byte is dropped.
    pub fn from_pcm16le(bytes: &[u8], sample_rate: u32, seq: u64) -> Self {
        Self {
            samples: pcm16le_to_samples(bytes),
            sample_rate,
            seq,
        }
    }

    /// Encode as little-endian PCM16 bytes, the wire format for audio appends.
    pub fn to_pcm16le(&self) -> Vec<u8> {
        samples_to_pcm16le(&self.samples)
    }

    /// Duration covered by this block.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }
}

/// Decode little-endian PCM16 bytes to samples.
pub fn pcm16le_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

/// Encode samples as little-endian PCM16 bytes.
pub fn samples_to_pcm16le(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Audio capture configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 24000, the transmission rate)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Block length in milliseconds (default: 20)
    pub block_ms: u32,
}

impl AudioConfig {
    /// Samples per block at the configured rate.
    pub fn block_samples(&self) -> usize {
        (self.sample_rate as u64 * self.block_ms as u64 / 1000) as usize
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
            block_ms: 20,
        }
    }
}

/// Microphone capture using CPAL.
///
/// Emits `AudioBlock`s into a bounded channel; the hardware callback blocks
/// on a full channel rather than dropping blocks, so consumers see strict
/// capture order. A read failure is pushed into the channel as an error so
/// the absence of the source is observable rather than inferred from silence.
pub struct AudioCapture {
    config: AudioConfig,
    device: Device,
    stream_config: StreamConfig,
}

impl AudioCapture {
    /// Create a new capture bound to the default input device.
    pub fn new(config: AudioConfig) -> VoiceResult<Self> {
        info!(
            "Initializing audio capture ({}Hz, {} channels, {}ms blocks)",
            config.sample_rate, config.channels, config.block_ms
        );

        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

        info!(
            "Using input device: {}",
            device.name().unwrap_or_else(|_| "Unknown".to_string())
        );

        let stream_config = StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        Ok(Self {
            config,
            device,
            stream_config,
        })
    }

    /// Start capturing. Blocks of `block_ms` worth of samples are sent to
    /// `block_tx` with increasing sequence numbers. Keep the returned stream
    /// alive; dropping it stops capture and closes the channel.
    pub fn start_capture(
        self,
        block_tx: mpsc::Sender<VoiceResult<AudioBlock>>,
    ) -> VoiceResult<Stream> {
        let block_samples = self.config.block_samples();
        let sample_rate = self.config.sample_rate;
        let mut sample_buffer: Vec<i16> = Vec::with_capacity(block_samples);
        let mut seq: u64 = 0;

        let err_tx = block_tx.clone();
        let stream = self.device.build_input_stream(
            &self.stream_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                for &sample in data {
                    sample_buffer.push((sample.clamp(-1.0, 1.0) * 32767.0) as i16);

                    if sample_buffer.len() >= block_samples {
                        let block = AudioBlock {
                            samples: std::mem::replace(
                                &mut sample_buffer,
                                Vec::with_capacity(block_samples),
                            ),
                            sample_rate,
                            seq,
                        };
                        seq += 1;

                        // Bounded backpressure: the callback thread waits
                        // rather than dropping blocks.
                        if block_tx.blocking_send(Ok(block)).is_err() {
                            return;
                        }
                    }
                }
            },
            move |err| {
                warn!("Audio stream error: {}", err);
                let _ = err_tx.try_send(Err(VoiceError::Capture(err.to_string())));
            },
            None,
        )?;

        stream.play()?;

        info!("Audio capture started");

        Ok(stream)
    }

    /// List available input devices.
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }
}

/// Playback device consuming the accumulator's byte queue.
pub trait OutputDevice: Send {
    /// Queue PCM16LE bytes for playback.
    fn enqueue(&mut self, bytes: &[u8]) -> VoiceResult<()>;

    /// Stop playback immediately and discard anything queued (barge-in).
    fn stop(&mut self);

    /// True when nothing is queued or playing.
    fn is_idle(&self) -> bool;
}

/// Rodio-backed output device.
///
/// The `rodio::OutputStream` is not `Send`, so it lives on a dedicated
/// thread; the `Sink` handle is shared and safe to drive from async tasks.
pub struct RodioOutput {
    sink: Arc<Sink>,
    sample_rate: u32,
    shutdown: Arc<AtomicBool>,
}

impl RodioOutput {
    /// Create a new output at the given playback sample rate (PCM16 mono).
    pub fn new(sample_rate: u32) -> VoiceResult<Self> {
        let (sink_tx, sink_rx) = std::sync::mpsc::channel::<VoiceResult<Arc<Sink>>>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&shutdown);

        thread::spawn(move || {
            let built = OutputStream::try_default()
                .map_err(|e| VoiceError::Playback(e.to_string()))
                .and_then(|(stream, handle)| {
                    Sink::try_new(&handle)
                        .map(|sink| (stream, Arc::new(sink)))
                        .map_err(|e| VoiceError::Playback(e.to_string()))
                });

            match built {
                Ok((_stream, sink)) => {
                    let _ = sink_tx.send(Ok(Arc::clone(&sink)));
                    // Keep the OutputStream alive until shutdown.
                    while !stop.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(50));
                    }
                }
                Err(e) => {
                    let _ = sink_tx.send(Err(e));
                }
            }
        });

        let sink = sink_rx
            .recv()
            .map_err(|_| VoiceError::Playback("output thread died".to_string()))??;

        info!("Audio playback ready ({}Hz PCM16 mono)", sample_rate);

        Ok(Self {
            sink,
            sample_rate,
            shutdown,
        })
    }
}

impl OutputDevice for RodioOutput {
    fn enqueue(&mut self, bytes: &[u8]) -> VoiceResult<()> {
        let samples = pcm16le_to_samples(bytes);
        if samples.is_empty() {
            return Ok(());
        }
        self.sink
            .append(SamplesBuffer::new(1, self.sample_rate, samples));
        Ok(())
    }

    fn stop(&mut self) {
        self.sink.stop();
        info!("Playback stopped");
    }

    fn is_idle(&self) -> bool {
        self.sink.empty()
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_config_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.sample_rate, 24000);
        assert_eq!(config.channels, 1);
        assert_eq!(config.block_samples(), 480); // 20ms at 24kHz
    }

    #[test]
    fn pcm16le_round_trip() {
        let samples = vec![0i16, -1, 1, i16::MIN, i16::MAX];
        let bytes = samples_to_pcm16le(&samples);
        assert_eq!(bytes.len(), samples.len() * 2);
        assert_eq!(pcm16le_to_samples(&bytes), samples);
    }

    #[test]
    fn block_from_bytes_drops_trailing_odd_byte() {
        let block = AudioBlock::from_pcm16le(&[0x01, 0x00, 0xff], 16000, 7);
        assert_eq!(block.samples, vec![1]);
        assert_eq!(block.seq, 7);
    }

    #[test]
    fn block_duration() {
        let block = AudioBlock {
            samples: vec![0; 480],
            sample_rate: 24000,
            seq: 0,
        };
        assert_eq!(block.duration(), Duration::from_millis(20));
    }
}
