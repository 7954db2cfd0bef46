/**
 * ============================================================================
 * LOOPBACK CAPTURE MODULE
 * ============================================================================
 *
 * PURPOSE: OS system-audio capture feeding the silence-filling source
 *
 * IMPLEMENTATIONS:
 * - CpalLoopback (feature "loopback"): builds an input stream on an output
 *   device, which cpal maps to WASAPI loopback on Windows
 * - SilentCapture: no device at all; the heartbeat alone produces a silent
 *   track so the container still has audio aligned to the video
 *
 * CONTRACT:
 * - format() is known before start() so the encoder topology can be built
 * - Callbacks deliver whole sample frames and never block on I/O
 *
 * ============================================================================
 */

use crate::recording::audio_source::SilenceFillingSource;
use crate::recording::error::Result;
use crate::recording::logger::SessionLogger;
use crate::recording::types::AudioFormat;
use std::sync::Arc;

pub trait LoopbackSource {
    fn format(&self) -> Result<AudioFormat>;

    // Begin delivering audio into `source`
    fn start(&mut self, source: Arc<SilenceFillingSource>, log: &SessionLogger) -> Result<()>;

    // Stop delivery. No callback may reach the source after this returns.
    fn stop(&mut self);

    fn describe(&self) -> String;
}

// =============================================================================
// Silent Capture
// =============================================================================

// Capture source that never delivers; the timeline is filled by the heartbeat
#[derive(Debug, Clone)]
pub struct SilentCapture {
    format: AudioFormat,
}

impl SilentCapture {
    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }
}

impl Default for SilentCapture {
    fn default() -> Self {
        Self::new(AudioFormat::float32(48_000, 2))
    }
}

impl LoopbackSource for SilentCapture {
    fn format(&self) -> Result<AudioFormat> {
        Ok(self.format)
    }

    fn start(&mut self, _source: Arc<SilenceFillingSource>, log: &SessionLogger) -> Result<()> {
        log.info(format_args!("Silent capture: audio track will be synthesized by the heartbeat"));
        Ok(())
    }

    fn stop(&mut self) {}

    fn describe(&self) -> String {
        "silent".to_string()
    }
}

// =============================================================================
// cpal Loopback
// =============================================================================

#[cfg(feature = "loopback")]
pub use cpal_backend::CpalLoopback;

#[cfg(feature = "loopback")]
mod cpal_backend {
    use super::LoopbackSource;
    use crate::recording::audio_source::SilenceFillingSource;
    use crate::recording::error::{RecorderError, Result};
    use crate::recording::logger::SessionLogger;
    use crate::recording::types::{AudioFormat, SampleEncoding};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{FromSample, Sample, SampleFormat, SizedSample};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub struct CpalLoopback {
        device: cpal::Device,
        config: cpal::SupportedStreamConfig,
        stream: Option<cpal::Stream>,
        running: Arc<AtomicBool>,
        log: Option<SessionLogger>,
    }

    impl CpalLoopback {
        // Open the named output device (or the default one) for loopback
        pub fn open(device_name: Option<&str>) -> Result<Self> {
            let host = cpal::default_host();
            let device = match device_name {
                Some(name) => host
                    .output_devices()
                    .map_err(|e| RecorderError::CaptureUnavailable(e.to_string()))?
                    .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                    .ok_or_else(|| RecorderError::CaptureUnavailable(format!("Output device '{}' not found", name)))?,
                None => host
                    .default_output_device()
                    .ok_or_else(|| RecorderError::CaptureUnavailable("No output device available".to_string()))?,
            };

            let config = device
                .default_output_config()
                .map_err(|e| RecorderError::CaptureUnavailable(e.to_string()))?;

            Ok(Self {
                device,
                config,
                stream: None,
                running: Arc::new(AtomicBool::new(false)),
                log: None,
            })
        }

        fn build_stream<T>(&self, source: Arc<SilenceFillingSource>, log: SessionLogger) -> Result<cpal::Stream>
        where
            T: SizedSample + Send + 'static,
            f32: FromSample<T>,
        {
            let stream_config: cpal::StreamConfig = self.config.clone().into();
            let running = self.running.clone();
            let err_fn = move |err| log.error(format_args!("Loopback stream error: {}", err));

            self.device
                .build_input_stream(
                    &stream_config,
                    move |data: &[T], _: &cpal::InputCallbackInfo| {
                        if !running.load(Ordering::Acquire) {
                            return;
                        }
                        let bytes: Vec<u8> = data
                            .iter()
                            .flat_map(|s| f32::from_sample(*s).to_le_bytes())
                            .collect();
                        source.on_audio(&bytes);
                    },
                    err_fn,
                    None,
                )
                .map_err(|e| RecorderError::CaptureUnavailable(e.to_string()))
        }
    }

    impl LoopbackSource for CpalLoopback {
        // Device samples are converted to f32 in the callback
        fn format(&self) -> Result<AudioFormat> {
            Ok(AudioFormat {
                sample_rate: self.config.sample_rate().0,
                channels: self.config.channels(),
                bits_per_sample: 32,
                encoding: SampleEncoding::Float,
            })
        }

        fn start(&mut self, source: Arc<SilenceFillingSource>, log: &SessionLogger) -> Result<()> {
            if self.stream.is_some() {
                return Ok(());
            }

            log.info(format_args!(
                "Loopback device: {} ({} Hz, {} ch, {:?})",
                self.describe(),
                self.config.sample_rate().0,
                self.config.channels(),
                self.config.sample_format()
            ));

            self.running.store(true, Ordering::Release);
            let stream_log = log.clone();
            let stream = match self.config.sample_format() {
                SampleFormat::F32 => self.build_stream::<f32>(source, stream_log),
                SampleFormat::I16 => self.build_stream::<i16>(source, stream_log),
                SampleFormat::U16 => self.build_stream::<u16>(source, stream_log),
                SampleFormat::I32 => self.build_stream::<i32>(source, stream_log),
                SampleFormat::U8 => self.build_stream::<u8>(source, stream_log),
                other => Err(RecorderError::CaptureUnavailable(format!(
                    "Unsupported device sample format: {:?}",
                    other
                ))),
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    self.running.store(false, Ordering::Release);
                    return Err(e);
                }
            };

            if let Err(e) = stream.play() {
                self.running.store(false, Ordering::Release);
                return Err(RecorderError::CaptureUnavailable(e.to_string()));
            }

            self.stream = Some(stream);
            self.log = Some(log.clone());
            Ok(())
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::Release);
            if let Some(stream) = self.stream.take() {
                if let Err(e) = stream.pause() {
                    if let Some(log) = &self.log {
                        log.warn(format_args!("Failed to pause loopback stream: {}", e));
                    }
                }
                drop(stream);
            }
        }

        fn describe(&self) -> String {
            self.device.name().unwrap_or_else(|_| "loopback".to_string())
        }
    }
}
