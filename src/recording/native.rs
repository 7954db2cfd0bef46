/**
 * ============================================================================
 * NATIVE MULTIPLEXER MODULE
 * ============================================================================
 *
 * PURPOSE: Write audio and video samples straight into a container through
 * a host-provided streaming multiplexer, without an encoder subprocess
 *
 * STATE MACHINE (mirrors the external encoder):
 * Uninitialized -> Configured (streams added) -> Running (writing)
 *   -> Finished (finalize() called exactly once)
 * Samples are rejected before begin_writing() and after finalize().
 *
 * TIMESTAMPS:
 * - Video: frame index x nominal frame duration
 * - Audio: cumulative bytes written / bytes per second
 * Both come from counters, never from the wall clock, so the two tracks
 * stay on the same monotonic timeline as the silence-filling source.
 *
 * AUDIO ROUTING:
 * Audio reaches the multiplexer through a PipeWriter whose stream is a
 * NativeAudioStream, so producers never wait on the multiplexer lock.
 * finish() keeps waiting for a writer that outlived its join timeout (up to
 * the drain timeout) and only then finalizes. Audio that still never
 * arrived turns the finish into an error.
 *
 * ============================================================================
 */

use crate::recording::error::{RecorderError, Result};
use crate::recording::lock_recover;
use crate::recording::logger::SessionLogger;
use crate::recording::pipe_writer::{PipeWriter, WriterShutdown, WriterStats};
use crate::recording::types::{AudioFormat, EncoderState, TimelineConfig};
use crate::recording::audio_source::AudioSink;
use crate::recording::video::FrameClock;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// =============================================================================
// Host Multiplexer Collaborator
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CodecParams {
    // Uncompressed BGRA frames
    Video { width: u32, height: u32, fps: u32 },
    Audio(AudioFormat),
}

impl CodecParams {
    pub fn media_type(&self) -> MediaType {
        match self {
            CodecParams::Video { .. } => MediaType::Video,
            CodecParams::Audio(_) => MediaType::Audio,
        }
    }
}

// Streaming container writer provided by the host platform
pub trait StreamMuxer: Send {
    // Add one bitstream; returns its stream index
    fn configure_stream(&mut self, media: MediaType, params: &CodecParams) -> Result<usize>;

    fn begin_writing(&mut self) -> Result<()>;

    fn write_sample(&mut self, stream: usize, data: &[u8], timestamp: Duration, duration: Duration) -> Result<()>;

    // Flush and close every stream
    fn finalize(&mut self) -> Result<()>;
}

// =============================================================================
// Native Multiplexer
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub video_frames: u64,
    pub audio_bytes: u64,
    pub audio_samples: u64,
    pub rejected_writes: u64,
}

struct AudioTrack {
    index: usize,
    format: AudioFormat,
    bytes: u64,
}

struct VideoTrack {
    index: usize,
    clock: FrameClock,
}

struct MuxInner {
    muxer: Box<dyn StreamMuxer>,
    state: EncoderState,
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    stats: MuxStats,
}

pub struct NativeMultiplexer {
    inner: Mutex<MuxInner>,
    log: SessionLogger,
}

impl NativeMultiplexer {
    pub fn new(muxer: Box<dyn StreamMuxer>, log: SessionLogger) -> Self {
        Self {
            inner: Mutex::new(MuxInner {
                muxer,
                state: EncoderState::Uninitialized,
                video: None,
                audio: None,
                stats: MuxStats::default(),
            }),
            log: log.child("native"),
        }
    }

    pub fn state(&self) -> EncoderState {
        lock_recover(&self.inner).state
    }

    pub fn stats(&self) -> MuxStats {
        lock_recover(&self.inner).stats
    }

    pub fn configure_video(&self, width: u32, height: u32, fps: u32) -> Result<usize> {
        if width == 0 || height == 0 || fps == 0 {
            return Err(RecorderError::InvalidConfig(format!(
                "video stream {}x{} @ {} fps",
                width, height, fps
            )));
        }
        let mut inner = lock_recover(&self.inner);
        ensure_configurable(&inner)?;
        if inner.video.is_some() {
            return Err(RecorderError::InvalidState("video stream already configured".to_string()));
        }

        let index = inner
            .muxer
            .configure_stream(MediaType::Video, &CodecParams::Video { width, height, fps })?;
        inner.video = Some(VideoTrack {
            index,
            clock: FrameClock::new(fps),
        });
        inner.state = EncoderState::Configured;
        self.log.info(format_args!("Video stream {}: {}x{} @ {} fps", index, width, height, fps));
        Ok(index)
    }

    pub fn configure_audio(&self, format: AudioFormat) -> Result<usize> {
        if !format.is_usable() {
            return Err(RecorderError::InvalidConfig(format!("unusable audio format {:?}", format)));
        }
        let mut inner = lock_recover(&self.inner);
        ensure_configurable(&inner)?;
        if inner.audio.is_some() {
            return Err(RecorderError::InvalidState("audio stream already configured".to_string()));
        }

        let index = inner.muxer.configure_stream(MediaType::Audio, &CodecParams::Audio(format))?;
        inner.audio = Some(AudioTrack { index, format, bytes: 0 });
        inner.state = EncoderState::Configured;
        self.log.info(format_args!(
            "Audio stream {}: {} Hz / {} ch / {}-bit",
            index, format.sample_rate, format.channels, format.bits_per_sample
        ));
        Ok(index)
    }

    pub fn begin_writing(&self) -> Result<()> {
        let mut inner = lock_recover(&self.inner);
        if inner.state != EncoderState::Configured {
            return Err(RecorderError::InvalidState(format!("begin_writing() in state {:?}", inner.state)));
        }
        inner.muxer.begin_writing()?;
        inner.state = EncoderState::Running;
        Ok(())
    }

    // Returns the timestamp the frame was written at
    pub fn write_video_frame(&self, frame: &[u8]) -> Result<Duration> {
        let mut inner = lock_recover(&self.inner);
        if let Err(e) = ensure_writable(&inner) {
            inner.stats.rejected_writes += 1;
            return Err(e);
        }
        let inner = &mut *inner;
        let track = inner
            .video
            .as_mut()
            .ok_or_else(|| RecorderError::InvalidState("no video stream configured".to_string()))?;

        let (timestamp, duration) = track.clock.tick();
        inner.muxer.write_sample(track.index, frame, timestamp, duration)?;
        inner.stats.video_frames += 1;
        Ok(timestamp)
    }

    pub fn write_audio(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let mut inner = lock_recover(&self.inner);
        if let Err(e) = ensure_writable(&inner) {
            inner.stats.rejected_writes += 1;
            return Err(e);
        }
        let inner = &mut *inner;
        let track = inner
            .audio
            .as_mut()
            .ok_or_else(|| RecorderError::InvalidState("no audio stream configured".to_string()))?;

        let timestamp = track.format.duration_of(track.bytes);
        let duration = track.format.duration_of(track.bytes + data.len() as u64) - timestamp;
        inner.muxer.write_sample(track.index, data, timestamp, duration)?;
        track.bytes += data.len() as u64;
        inner.stats.audio_bytes += data.len() as u64;
        inner.stats.audio_samples += 1;
        Ok(())
    }

    // Exactly once; later writes and a second finalize are rejected
    pub fn finalize(&self) -> Result<MuxStats> {
        let mut inner = lock_recover(&self.inner);
        match inner.state {
            EncoderState::Finished => {
                return Err(RecorderError::InvalidState("multiplexer already finalized".to_string()));
            }
            EncoderState::Uninitialized => {
                return Err(RecorderError::InvalidState("finalize() before any stream was configured".to_string()));
            }
            _ => {}
        }

        // Finished before the call so a failing finalize is never retried
        inner.state = EncoderState::Finished;
        inner.muxer.finalize()?;

        let stats = inner.stats;
        self.log.info(format_args!(
            "Multiplexer finalized: {} video frames, {} audio bytes in {} samples",
            stats.video_frames, stats.audio_bytes, stats.audio_samples
        ));
        Ok(stats)
    }
}

fn ensure_configurable(inner: &MuxInner) -> Result<()> {
    match inner.state {
        EncoderState::Uninitialized | EncoderState::Configured => Ok(()),
        other => Err(RecorderError::InvalidState(format!("cannot add streams in state {:?}", other))),
    }
}

fn ensure_writable(inner: &MuxInner) -> Result<()> {
    match inner.state {
        EncoderState::Running => Ok(()),
        EncoderState::Finished | EncoderState::StopRequested => {
            Err(RecorderError::Muxer("write after finalize".to_string()))
        }
        other => Err(RecorderError::InvalidState(format!("write before begin_writing() (state {:?})", other))),
    }
}

// =============================================================================
// Audio Stream Adapter
// =============================================================================

// io::Write over the multiplexer's audio stream, drained by a PipeWriter
pub struct NativeAudioStream {
    mux: Arc<NativeMultiplexer>,
}

impl Write for NativeAudioStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.mux
            .write_audio(buf)
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// =============================================================================
// Native Backend
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone)]
pub struct NativeReport {
    pub mux: MuxStats,
    pub writer: WriterStats,
}

pub struct NativeBackend {
    mux: Arc<NativeMultiplexer>,
    writer: Arc<PipeWriter<NativeAudioStream>>,
    drain_timeout: Duration,
    log: SessionLogger,
}

impl NativeBackend {
    // Configure both streams, begin writing, start the audio writer
    pub fn start(
        muxer: Box<dyn StreamMuxer>,
        video: Option<VideoParams>,
        audio: AudioFormat,
        timeline: &TimelineConfig,
        log: SessionLogger,
    ) -> Result<Self> {
        let mux = Arc::new(NativeMultiplexer::new(muxer, log.clone()));
        if let Some(v) = video {
            mux.configure_video(v.width, v.height, v.fps)?;
        }
        mux.configure_audio(audio)?;
        mux.begin_writing()?;

        let writer = PipeWriter::spawn(
            NativeAudioStream { mux: mux.clone() },
            timeline.writer_wait(),
            timeline.writer_join_timeout(),
            None,
            log.child("writer"),
        )?;

        Ok(Self {
            mux,
            writer: Arc::new(writer),
            drain_timeout: timeline.drain_timeout(),
            log: log.child("native"),
        })
    }

    pub fn audio_sink(&self) -> Arc<dyn AudioSink> {
        self.writer.clone()
    }

    pub fn multiplexer(&self) -> &Arc<NativeMultiplexer> {
        &self.mux
    }

    pub fn push_video_frame(&self, frame: &[u8]) -> Result<Duration> {
        self.mux.write_video_frame(frame)
    }

    // Drain queued audio into the multiplexer; idempotent
    pub fn request_stop(&self) {
        if !self.writer.is_accepting() {
            return;
        }
        self.log.info(format_args!("Draining audio into multiplexer"));
        if let WriterShutdown::Detached = self.writer.shutdown() {
            self.log.info(format_args!(
                "Audio writer still draining, finish() waits up to {:?}",
                self.drain_timeout
            ));
        }
    }

    // Finalize only once the writer has let go of the multiplexer.
    // Queued audio that never reached it is reported as an error after
    // the container has still been closed.
    pub fn finish(&self) -> Result<NativeReport> {
        self.request_stop();

        let drain = self.writer.await_drain(self.drain_timeout);
        let writer = self.writer.stats();
        if drain.is_detached() {
            self.log.error(format_args!(
                "Audio writer did not drain within {:?}, {} bytes still queued",
                self.drain_timeout,
                writer.pending_bytes()
            ));
        }
        if writer.discarded_bytes > 0 {
            self.log.warn(format_args!(
                "{} bytes of audio were discarded before reaching the multiplexer",
                writer.discarded_bytes
            ));
        }

        let mux = self.mux.finalize()?;
        if drain.is_detached() {
            return Err(RecorderError::Muxer(format!(
                "{} bytes of queued audio never reached the multiplexer",
                writer.pending_bytes()
            )));
        }
        Ok(NativeReport { mux, writer })
    }
}

// =============================================================================
// Tests
// =============================================================================
