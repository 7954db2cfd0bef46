/**
 * ============================================================================
 * RECORDING SESSION MODULE
 * ============================================================================
 *
 * PURPOSE: Lifecycle of one recording run
 *
 * RESPONSIBILITIES:
 * - Resolve paths and session id, build the encoder topology
 * - Wire capture -> silence-filling source -> backend audio sink
 * - Stop everything in order and write the metadata sidecar
 *
 * RECORDING FLOW:
 * 1. start / start_native -> backend running, timeline origin set, heartbeat
 *    and capture started
 * 2. stop -> capture stopped, tail silence emitted, backend told to drain
 * 3. finish -> backend finished (escalating if needed), output probed,
 *    <session_id>.json written next to the output
 *
 * ============================================================================
 */

use crate::recording::audio_source::{SilenceFillingSource, SourceStats};
use crate::recording::backend::{BackendReport, EncoderBackend};
use crate::recording::encoder::{EncoderController, EncoderSpec};
use crate::recording::error::{RecorderError, Result};
use crate::recording::ffmpeg::{check_ffmpeg, resolve_ffmpeg_path, FfmpegCommandBuilder};
use crate::recording::logger::SessionLogger;
use crate::recording::loopback::LoopbackSource;
use crate::recording::native::{NativeBackend, StreamMuxer, VideoParams};
use crate::recording::process::cleanup_orphaned_encoders;
use crate::recording::storage::{self, SessionPaths};
use crate::recording::types::{AudioFormat, BackendKind, MuxMode, RecorderConfig, SessionMetadata};
use crate::recording::validate::{probe_container, ProbeResult};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "screen-capture")]
use crate::recording::video::{DisplayCapture, DisplayCaptureStats};

// Session identity and file layout, resolved before any process starts
struct SessionLayout {
    id: String,
    root: PathBuf,
    paths: SessionPaths,
    log: SessionLogger,
}

impl SessionLayout {
    fn resolve(config: &RecorderConfig) -> Result<Self> {
        config.validate()?;

        let id = storage::generate_session_id();
        let log = SessionLogger::new(&id);
        let root = storage::recordings_root(config.output_dir.as_deref());
        let dir = storage::ensure_recording_dir(&root, &Utc::now().date_naive())?;
        let paths = storage::session_paths(&dir, &id, &config.container);

        Ok(Self { id, root, paths, log })
    }
}

pub struct RecordingSession {
    id: String,
    config: RecorderConfig,
    paths: SessionPaths,
    format: AudioFormat,
    backend: EncoderBackend,
    source: Arc<SilenceFillingSource>,
    capture: Box<dyn LoopbackSource>,
    start_time: DateTime<Utc>,
    stop_time: Option<DateTime<Utc>>,
    video_shutdown: Arc<AtomicBool>,
    log: SessionLogger,
}

impl std::fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RecordingSession({}, {:?}, {})",
            self.id,
            self.backend.kind(),
            self.capture.describe()
        )
    }
}

impl RecordingSession {
    // Start a session on the external encoder (pipe or merge mode)
    pub fn start(config: RecorderConfig, capture: Box<dyn LoopbackSource>) -> Result<Self> {
        let layout = SessionLayout::resolve(&config)?;
        let log = layout.log.clone();
        log.info(format_args!(
            "Starting session ({:?} mode, capture: {}) -> {:?}",
            config.mux_mode,
            capture.describe(),
            layout.paths.output
        ));

        let ffmpeg = resolve_ffmpeg_path(config.ffmpeg_path.as_deref(), &log);
        check_ffmpeg(&ffmpeg, &log)?;

        // Leftovers from a crashed run would keep writing into the same tree
        if let Some(name) = ffmpeg.file_name().and_then(|n| n.to_str()) {
            cleanup_orphaned_encoders(name, &layout.root, &log);
        }

        let format = capture.format()?;
        let builder = FfmpegCommandBuilder::from_config(ffmpeg, &config)?;
        let spec = encoder_spec(&config, &builder, &layout.paths, format);

        let encoder = EncoderController::new(log.child("encoder"));
        encoder.configure(spec)?;
        encoder.start()?;

        Self::launch(config, layout, EncoderBackend::External(encoder), capture, format)
    }

    // Start a session on a host multiplexer; `open_muxer` receives the output path
    pub fn start_native<F>(
        config: RecorderConfig,
        capture: Box<dyn LoopbackSource>,
        video: Option<VideoParams>,
        open_muxer: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Path) -> Result<Box<dyn StreamMuxer>>,
    {
        let layout = SessionLayout::resolve(&config)?;
        let log = layout.log.clone();
        log.info(format_args!(
            "Starting native session (video: {:?}, capture: {}) -> {:?}",
            video,
            capture.describe(),
            layout.paths.output
        ));

        let format = capture.format()?;
        let muxer = open_muxer(&layout.paths.output)?;
        let native = NativeBackend::start(muxer, video, format, &config.timeline, log.clone())?;

        Self::launch(config, layout, EncoderBackend::Native(native), capture, format)
    }

    // The backend is running; set the timeline origin and start audio
    fn launch(
        config: RecorderConfig,
        layout: SessionLayout,
        backend: EncoderBackend,
        mut capture: Box<dyn LoopbackSource>,
        format: AudioFormat,
    ) -> Result<Self> {
        let log = layout.log;
        let source = Arc::new(SilenceFillingSource::new(
            backend.audio_sink(),
            config.timeline.clone(),
            log.child("audio"),
        ));
        let start_time = Utc::now();
        source.initialize(format, Instant::now());

        let started = source
            .start_heartbeat()
            .and_then(|_| capture.start(source.clone(), &log.child("loopback")));
        if let Err(e) = started {
            log.error(format_args!("Audio start failed, tearing down backend: {}", e));
            capture.stop();
            source.stop();
            if let Err(stop_err) = backend.request_stop() {
                log.warn(format_args!("Backend stop after failed start: {}", stop_err));
            }
            if let Err(finish_err) = backend.finish(true) {
                log.warn(format_args!("Backend finish after failed start: {}", finish_err));
            }
            return Err(e);
        }

        log.info(format_args!("Session {} recording", layout.id));
        Ok(Self {
            id: layout.id,
            config,
            paths: layout.paths,
            format,
            backend,
            source,
            capture,
            start_time,
            stop_time: None,
            video_shutdown: Arc::new(AtomicBool::new(false)),
            log,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn paths(&self) -> &SessionPaths {
        &self.paths
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn audio_format(&self) -> AudioFormat {
        self.format
    }

    pub fn source_stats(&self) -> SourceStats {
        self.source.stats()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop_time.is_some()
    }

    // Native backend only; the external encoder grabs video itself
    pub fn push_video_frame(&self, frame: &[u8]) -> Result<Duration> {
        match &self.backend {
            EncoderBackend::Native(native) => native.push_video_frame(frame),
            EncoderBackend::External(_) => Err(RecorderError::InvalidState(
                "video frames are grabbed by the external encoder".to_string(),
            )),
        }
    }

    // Drive a display capture into the native multiplexer on the calling
    // thread until the session stops
    #[cfg(feature = "screen-capture")]
    pub fn pump_display(&self, display: DisplayCapture) -> Result<DisplayCaptureStats> {
        let EncoderBackend::Native(native) = &self.backend else {
            return Err(RecorderError::InvalidState(
                "display capture needs the native backend".to_string(),
            ));
        };
        let mux = native.multiplexer().clone();
        let log = self.log.child("video");
        Ok(display.run(&self.video_shutdown, |frame| match mux.write_video_frame(frame) {
            Ok(_) => true,
            Err(e) => {
                log.warn(format_args!("Video frame rejected, ending capture: {}", e));
                false
            }
        }))
    }

    // Stop capture, pad the tail and let the backend drain. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        if self.stop_time.is_some() {
            return Ok(());
        }
        let stop_instant = Instant::now();
        self.stop_time = Some(Utc::now());
        self.video_shutdown.store(true, Ordering::SeqCst);

        self.capture.stop();
        let tail = self.source.stop_at(stop_instant);
        self.log.info(format_args!(
            "Stopping session: {} bytes of tail silence, timeline {:.3}s",
            tail,
            self.source.timeline_position().as_secs_f64()
        ));

        self.backend.request_stop()
    }

    // Finish the backend and write the metadata sidecar. The sidecar is
    // written even when the backend reports an error.
    pub fn finish(mut self, quick_exit: bool) -> Result<SessionMetadata> {
        let stopped = self.stop();
        let outcome = stopped.and_then(|_| self.backend.finish(quick_exit));

        let probe = match &outcome {
            Ok(BackendReport::External(report)) => report.probe.clone(),
            _ => probe_container(&self.paths.output, &self.log),
        };
        if !probe.is_valid() {
            self.log.warn(format_args!(
                "Output {:?} failed validation ({:?}); keeping whatever was written",
                self.paths.output, probe
            ));
        }

        let forced = outcome.as_ref().map(|r| r.forced_termination()).unwrap_or(false);
        let metadata = self.build_metadata(&probe, forced);

        if let Err(e) = storage::save_metadata(&self.paths.metadata, &metadata, &self.log) {
            self.log.error(format_args!("Failed to write metadata sidecar: {}", e));
            outcome?;
            return Err(e);
        }

        outcome?;
        self.log.info(format_args!(
            "Session finished: {:.1}s, {} bytes, container {:?}",
            metadata.duration_seconds,
            metadata.file_size_bytes,
            metadata.container
        ));
        Ok(metadata)
    }

    fn build_metadata(&self, probe: &ProbeResult, forced_termination: bool) -> SessionMetadata {
        let end_time = self.stop_time.unwrap_or_else(Utc::now);
        let duration_seconds = (end_time - self.start_time).num_milliseconds() as f64 / 1000.0;
        let stats = self.source.stats();

        SessionMetadata {
            id: self.id.clone(),
            start_time: self.start_time.to_rfc3339(),
            end_time: end_time.to_rfc3339(),
            duration_seconds,
            mux_mode: self.config.mux_mode,
            backend: self.backend.kind(),
            audio_format: Some(self.format),
            output_path: self.paths.output.clone(),
            file_size_bytes: probe.size(),
            container: probe.kind().map(|kind| kind.name().to_string()),
            valid: probe.is_valid(),
            real_audio_bytes: stats.real_bytes,
            silence_bytes: stats.silence_bytes,
            forced_termination,
        }
    }
}

// Topology for the configured mux mode
fn encoder_spec(
    config: &RecorderConfig,
    builder: &FfmpegCommandBuilder,
    paths: &SessionPaths,
    format: AudioFormat,
) -> EncoderSpec {
    let (capture, merge, video_intermediate, audio_intermediate) = match config.mux_mode {
        MuxMode::Pipe => (builder.pipe_command(&format, &paths.output), None, None, None),
        MuxMode::Merge => (
            builder.merge_video_command(&paths.video_intermediate),
            Some(builder.merge_pass_command(
                &paths.video_intermediate,
                &paths.audio_intermediate,
                &paths.output,
            )),
            Some(paths.video_intermediate.clone()),
            Some(paths.audio_intermediate.clone()),
        ),
    };

    EncoderSpec {
        mode: config.mux_mode,
        capture,
        merge,
        output: paths.output.clone(),
        video_intermediate,
        audio_intermediate,
        audio_format: format,
        timeline: config.timeline.clone(),
        policy: config.shutdown.clone(),
    }
}
