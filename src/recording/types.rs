/**
 * ============================================================================
 * RECORDING TYPES MODULE
 * ============================================================================
 *
 * PURPOSE: Data structures shared by the recording core
 *
 * TYPES:
 * - AudioFormat: Capture format parameters and byte-timeline arithmetic
 * - MuxMode / BackendKind: Muxing strategy, fixed at configuration time
 * - EncoderState: Lifecycle of the encoder handle
 * - TimelineConfig: Gap thresholds, heartbeat and writer timings
 * - ShutdownPolicy: Escalation ladder used by finish()
 * - RecorderConfig: Persisted recorder configuration
 * - SessionMetadata: JSON sidecar written when a session finishes
 *
 * ============================================================================
 */

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// Audio Format
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SampleEncoding {
    Float,
    Int,
}

// Format parameters exposed by the capture collaborator once capture begins
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub encoding: SampleEncoding,
}

impl AudioFormat {
    pub fn float32(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 32,
            encoding: SampleEncoding::Float,
        }
    }

    pub fn pcm16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
            encoding: SampleEncoding::Int,
        }
    }

    // Bytes in one multi-channel sample frame
    pub fn block_align(&self) -> u64 {
        self.channels as u64 * (self.bits_per_sample as u64 / 8)
    }

    pub fn bytes_per_second(&self) -> u64 {
        self.sample_rate as u64 * self.block_align()
    }

    // Zero block size or rate means the format is unusable for timeline math
    pub fn is_usable(&self) -> bool {
        self.block_align() > 0 && self.sample_rate > 0
    }

    // Round down to a whole number of sample frames
    pub fn align_down(&self, bytes: u64) -> u64 {
        let block = self.block_align();
        if block == 0 {
            return 0;
        }
        bytes - bytes % block
    }

    // Block-aligned byte count covering `duration` (fraction discarded)
    pub fn bytes_for(&self, duration: Duration) -> u64 {
        let raw = duration.as_nanos() * self.bytes_per_second() as u128 / 1_000_000_000;
        self.align_down(raw.min(u64::MAX as u128) as u64)
    }

    pub fn duration_of(&self, bytes: u64) -> Duration {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }
        let nanos = bytes as u128 * 1_000_000_000 / bps as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    // Silence in this encoding; unsigned 8-bit PCM centres on 0x80
    pub fn silence(&self, bytes: usize) -> Vec<u8> {
        if self.encoding == SampleEncoding::Int && self.bits_per_sample == 8 {
            vec![0x80; bytes]
        } else {
            vec![0u8; bytes]
        }
    }

    // Raw sample format tag understood by the external encoder
    pub fn ffmpeg_sample_format(&self) -> &'static str {
        match (self.encoding, self.bits_per_sample) {
            (SampleEncoding::Float, 64) => "f64le",
            (SampleEncoding::Float, _) => "f32le",
            (SampleEncoding::Int, 8) => "u8",
            (SampleEncoding::Int, 24) => "s24le",
            (SampleEncoding::Int, 32) => "s32le",
            (SampleEncoding::Int, _) => "s16le",
        }
    }
}

// =============================================================================
// Modes and States
// =============================================================================

// How audio reaches the container
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MuxMode {
    // Raw audio streamed into the encoder's stdin while it grabs video itself
    #[default]
    Pipe,
    // Separate video and WAV files combined by a second encoder pass
    Merge,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    External,
    Native,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EncoderState {
    Uninitialized,
    Configured,
    Running,
    StopRequested,
    Finished,
}

// =============================================================================
// Timing Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimelineConfig {
    // Minimum gap padded before a real audio chunk
    pub inline_gap_ms: u64,

    // Minimum gap padded by the heartbeat when no audio arrives
    pub idle_gap_ms: u64,

    // Minimum gap padded between the last audio and the stop instant
    pub tail_gap_ms: u64,

    pub heartbeat_interval_ms: u64,

    // Bounded wait of the pipe-writer loop between liveness checks
    pub writer_wait_ms: u64,

    pub writer_join_timeout_ms: u64,

    // How long the native backend keeps waiting for a writer that outlived
    // the join timeout before it finalizes anyway
    pub drain_timeout_ms: u64,

    // Extra silence written straight to the encoder before closing its input
    pub stop_padding_secs: f64,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            inline_gap_ms: 100,
            idle_gap_ms: 200,
            tail_gap_ms: 20,
            heartbeat_interval_ms: 100,
            writer_wait_ms: 100,
            writer_join_timeout_ms: 2_000,
            drain_timeout_ms: 30_000,
            stop_padding_secs: 15.0,
        }
    }
}

impl TimelineConfig {
    pub fn inline_gap(&self) -> Duration {
        Duration::from_millis(self.inline_gap_ms)
    }

    pub fn idle_gap(&self) -> Duration {
        Duration::from_millis(self.idle_gap_ms)
    }

    pub fn tail_gap(&self) -> Duration {
        Duration::from_millis(self.tail_gap_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn writer_wait(&self) -> Duration {
        Duration::from_millis(self.writer_wait_ms)
    }

    pub fn writer_join_timeout(&self) -> Duration {
        Duration::from_millis(self.writer_join_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn stop_padding(&self) -> Duration {
        Duration::try_from_secs_f64(self.stop_padding_secs).unwrap_or(Duration::ZERO)
    }
}

// Escalation ladder for finish(): graceful wait -> force kill -> brief wait
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownPolicy {
    pub quick_exit_wait_ms: u64,
    pub graceful_base_secs: u64,
    // One extra second of graceful wait per this many output bytes
    pub bytes_per_extra_second: u64,
    pub graceful_max_secs: u64,
    pub kill_wait_ms: u64,
    pub size_poll_interval_ms: u64,
    pub size_stable_reads: u32,
    pub size_max_wait_secs: u64,
    pub merge_timeout_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            quick_exit_wait_ms: 3_000,
            graceful_base_secs: 120,
            bytes_per_extra_second: 10 * 1024 * 1024,
            graceful_max_secs: 600,
            kill_wait_ms: 5_000,
            size_poll_interval_ms: 500,
            size_stable_reads: 3,
            size_max_wait_secs: 30,
            merge_timeout_secs: 300,
            poll_interval_ms: 50,
        }
    }
}

impl ShutdownPolicy {
    // Graceful ceiling scaled to how much output has already been produced
    pub fn graceful_timeout(&self, output_bytes: u64) -> Duration {
        let extra = if self.bytes_per_extra_second == 0 {
            0
        } else {
            output_bytes / self.bytes_per_extra_second
        };
        let secs = self
            .graceful_base_secs
            .saturating_add(extra)
            .min(self.graceful_max_secs.max(self.graceful_base_secs));
        Duration::from_secs(secs)
    }

    pub fn quick_exit_wait(&self) -> Duration {
        Duration::from_millis(self.quick_exit_wait_ms)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_millis(self.kill_wait_ms)
    }

    pub fn size_poll_interval(&self) -> Duration {
        Duration::from_millis(self.size_poll_interval_ms)
    }

    pub fn size_max_wait(&self) -> Duration {
        Duration::from_secs(self.size_max_wait_secs)
    }

    pub fn merge_timeout(&self) -> Duration {
        Duration::from_secs(self.merge_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

// =============================================================================
// Recorder Configuration
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecorderConfig {
    // Root directory for recordings (None = platform video dir)
    pub output_dir: Option<PathBuf>,

    // Container extension of the final output
    pub container: String,

    pub framerate: u32,

    pub video_codec: String,

    // FFmpeg preset (ultrafast ... veryslow)
    pub preset: String,

    // Target video bitrate, e.g. "6M" (None = derived from resolution)
    pub video_bitrate: Option<String>,

    // Capture region size, e.g. "1920x1080" (None = whole display)
    pub video_size: Option<String>,

    // Overrides for the encoder's grab device (None = platform default)
    pub video_input_format: Option<String>,
    pub video_input: Option<String>,

    pub mux_mode: MuxMode,

    pub backend: BackendKind,

    // Explicit encoder binary (None = resolved automatically)
    pub ffmpeg_path: Option<PathBuf>,

    // Output device to loop back (None = default output device)
    pub audio_device: Option<String>,

    pub audio_codec: String,

    pub audio_bitrate: String,

    pub timeline: TimelineConfig,

    pub shutdown: ShutdownPolicy,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            container: "mp4".to_string(),
            framerate: 30,
            video_codec: "libx264".to_string(),
            preset: "veryfast".to_string(),
            video_bitrate: None,
            video_size: None,
            video_input_format: None,
            video_input: None,
            mux_mode: MuxMode::Pipe,
            backend: BackendKind::External,
            ffmpeg_path: None,
            audio_device: None,
            audio_codec: "aac".to_string(),
            audio_bitrate: "192k".to_string(),
            timeline: TimelineConfig::default(),
            shutdown: ShutdownPolicy::default(),
        }
    }
}

// =============================================================================
// Session Metadata
// =============================================================================

// JSON sidecar describing a finished session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionMetadata {
    // Unique session ID (timestamp + random suffix)
    pub id: String,

    // ISO 8601 timestamps
    pub start_time: String,
    pub end_time: String,

    pub duration_seconds: f64,

    pub mux_mode: MuxMode,

    pub backend: BackendKind,

    pub audio_format: Option<AudioFormat>,

    pub output_path: PathBuf,

    pub file_size_bytes: u64,

    // Container detected by the header probe (None = unrecognised)
    pub container: Option<String>,

    pub valid: bool,

    // Captured audio vs synthetic silence written to the timeline
    pub real_audio_bytes: u64,
    pub silence_bytes: u64,

    pub forced_termination: bool,
}
