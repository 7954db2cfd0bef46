/**
 * ============================================================================
 * ENCODER CONTROLLER MODULE
 * ============================================================================
 *
 * PURPOSE: Own the external encoder process for one session
 *
 * STATE MACHINE:
 * Uninitialized -> Configured -> Running -> StopRequested -> Finished
 * configure() fixes every stream parameter; nothing changes after it.
 *
 * MODES (chosen by configuration, never negotiated at runtime):
 * - Pipe: the encoder grabs the screen itself and reads raw audio from
 *   stdin. Closing stdin ends the audio stream and -shortest ends the
 *   encode. On stop a background thread lets the queue drain, writes the
 *   stop padding straight into stdin and closes it, so request_stop()
 *   never waits on the encoder reading. Finishes within seconds of stop.
 * - Merge: the encoder grabs video into its own file while audio goes to a
 *   WAV intermediate. Stop is "q" on stdin. A second encoder pass combines
 *   both files afterwards.
 *
 * FINISH LADDER:
 * 1. Graceful wait (quick exit: a few seconds; normal: minutes, scaled by
 *    output size)
 * 2. Force terminate
 * 3. Brief wait for the kill to take effect
 * Normal finish then waits for the output size to settle, runs the merge
 * pass in merge mode and probes the container header.
 *
 * LOCKING:
 * State and the process handle sit behind their own mutexes, separate from
 * the timeline lock held by audio producers.
 *
 * ============================================================================
 */

use crate::recording::audio_source::AudioSink;
use crate::recording::error::{RecorderError, Result};
use crate::recording::ffmpeg::EncoderCommand;
use crate::recording::lock_recover;
use crate::recording::logger::SessionLogger;
use crate::recording::monitor::EncoderMonitor;
use crate::recording::pipe_writer::{PipeWriter, WriterShutdown, WriterStats};
use crate::recording::process::{force_terminate, wait_with_timeout};
use crate::recording::storage::remove_intermediate;
use crate::recording::types::{AudioFormat, EncoderState, MuxMode, ShutdownPolicy, TimelineConfig};
use crate::recording::validate::{probe_container, ProbeResult};
use crate::recording::wav::WavStream;
use once_cell::sync::OnceCell;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// =============================================================================
// Encoder Spec
// =============================================================================

// Everything fixed at configure() time
#[derive(Debug, Clone)]
pub struct EncoderSpec {
    pub mode: MuxMode,
    // Pipe mode: the single encode. Merge mode: the video-only pass.
    pub capture: EncoderCommand,
    // Merge mode only: the combining pass
    pub merge: Option<EncoderCommand>,
    pub output: PathBuf,
    pub video_intermediate: Option<PathBuf>,
    pub audio_intermediate: Option<PathBuf>,
    pub audio_format: AudioFormat,
    pub timeline: TimelineConfig,
    pub policy: ShutdownPolicy,
}

impl EncoderSpec {
    fn check(&self) -> Result<()> {
        if !self.audio_format.is_usable() {
            return Err(RecorderError::InvalidConfig(format!(
                "unusable audio format {:?}",
                self.audio_format
            )));
        }
        if self.mode == MuxMode::Merge
            && (self.merge.is_none() || self.video_intermediate.is_none() || self.audio_intermediate.is_none())
        {
            return Err(RecorderError::InvalidConfig(
                "merge mode needs a merge command and both intermediate paths".to_string(),
            ));
        }
        Ok(())
    }

    // File the capture process is writing to
    fn capture_target(&self) -> &Path {
        match (self.mode, &self.video_intermediate) {
            (MuxMode::Merge, Some(video)) => video,
            _ => &self.output,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FinishReport {
    pub exit_code: Option<i32>,
    pub forced_termination: bool,
    pub merged: bool,
    pub output: PathBuf,
    pub file_size: u64,
    pub probe: ProbeResult,
    pub writer: WriterStats,
    // Pipe mode: silence written directly to stdin after the queue drained
    pub padding_bytes: u64,
}

// =============================================================================
// Audio Routing
// =============================================================================

enum AudioPath {
    Pipe(Arc<PipeWriter<ChildStdin>>),
    Wav(Arc<PipeWriter<WavStream>>),
}

// Sink handed to the audio source before start(); forwards once the writer
// exists, drops audio before that
#[derive(Default)]
struct EncoderSink {
    target: OnceCell<Arc<dyn AudioSink>>,
}

impl AudioSink for EncoderSink {
    fn push(&self, chunk: Vec<u8>) {
        if let Some(target) = self.target.get() {
            target.push(chunk);
        }
    }
}

// Pipe-mode stop: drain the queue, append padding, close stdin
struct StopPadding {
    handle: JoinHandle<()>,
    done: Receiver<()>,
    writer: Arc<PipeWriter<ChildStdin>>,
    written: Arc<AtomicU64>,
}

impl StopPadding {
    fn spawn(
        writer: Arc<PipeWriter<ChildStdin>>,
        exited: Arc<AtomicBool>,
        format: AudioFormat,
        padding: u64,
        retry: Duration,
        log: SessionLogger,
    ) -> Result<Self> {
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let written = Arc::new(AtomicU64::new(0));

        let thread_writer = writer.clone();
        let thread_written = written.clone();
        let handle = std::thread::Builder::new()
            .name("screenmux-stop-padding".to_string())
            .spawn(move || {
                if let Some(stdin) = drain_for_padding(&thread_writer, &exited, retry, &log) {
                    write_padding(stdin, &exited, &format, padding, &thread_written, &log);
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| RecorderError::Spawn(format!("Failed to start stop padding thread: {}", e)))?;

        Ok(Self {
            handle,
            done: done_rx,
            writer,
            written,
        })
    }

    // Bounded join; returns the writer counters and the padding written
    fn join(self, timeout: Duration, log: &SessionLogger) -> (WriterStats, u64) {
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if self.handle.join().is_err() {
                    log.error(format_args!("Stop padding thread panicked"));
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log.warn(format_args!("Stop padding still running after {:?}, detaching it", timeout));
            }
        }
        (self.writer.stats(), self.written.load(Ordering::Relaxed))
    }
}

#[derive(Default)]
struct EncoderHandle {
    child: Option<Child>,
    // Merge mode control channel
    control: Option<ChildStdin>,
    monitor: Option<EncoderMonitor>,
    audio: Option<AudioPath>,
    padding: Option<StopPadding>,
    writer_stats: WriterStats,
}

// =============================================================================
// Encoder Controller
// =============================================================================

pub struct EncoderController {
    state: Mutex<EncoderState>,
    spec: OnceCell<EncoderSpec>,
    handle: Mutex<EncoderHandle>,
    sink: Arc<EncoderSink>,
    log: SessionLogger,
}

impl EncoderController {
    pub fn new(log: SessionLogger) -> Self {
        Self {
            state: Mutex::new(EncoderState::Uninitialized),
            spec: OnceCell::new(),
            handle: Mutex::new(EncoderHandle::default()),
            sink: Arc::new(EncoderSink::default()),
            log: log.child("encoder"),
        }
    }

    pub fn state(&self) -> EncoderState {
        *lock_recover(&self.state)
    }

    pub fn mode(&self) -> Option<MuxMode> {
        self.spec.get().map(|spec| spec.mode)
    }

    // Sink the audio source emits into. Valid before start().
    pub fn audio_sink(&self) -> Arc<dyn AudioSink> {
        self.sink.clone()
    }

    pub fn configure(&self, spec: EncoderSpec) -> Result<()> {
        let mut state = lock_recover(&self.state);
        if *state != EncoderState::Uninitialized {
            return Err(RecorderError::InvalidState(format!("configure() in state {:?}", *state)));
        }
        spec.check()?;

        self.log.info(format_args!(
            "Encoder configured: {:?} mode, {} Hz / {} ch / {}-bit {:?} -> {:?}",
            spec.mode,
            spec.audio_format.sample_rate,
            spec.audio_format.channels,
            spec.audio_format.bits_per_sample,
            spec.audio_format.encoding,
            spec.output
        ));

        self.spec
            .set(spec)
            .map_err(|_| RecorderError::InvalidState("encoder already configured".to_string()))?;
        *state = EncoderState::Configured;
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let mut state = lock_recover(&self.state);
        if *state != EncoderState::Configured {
            return Err(RecorderError::InvalidState(format!("start() in state {:?}", *state)));
        }
        let spec = self.configured_spec()?;

        // The WAV intermediate is created first so a bad path fails before spawn
        let wav = match spec.mode {
            MuxMode::Merge => match &spec.audio_intermediate {
                Some(path) => Some(WavStream::create(path, spec.audio_format, self.log.child("wav"))?),
                None => None,
            },
            MuxMode::Pipe => None,
        };

        let mut child = self.spawn_encoder(&spec.capture)?;
        match self.wire_up(spec, &mut child, wav) {
            Ok(mut handle) => {
                self.log.info(format_args!("Encoder running (PID: {})", child.id()));
                handle.child = Some(child);
                *lock_recover(&self.handle) = handle;
                *state = EncoderState::Running;
                Ok(())
            }
            Err(e) => {
                let _ = force_terminate(&mut child, spec.policy.kill_wait(), spec.policy.poll_interval(), &self.log);
                Err(e)
            }
        }
    }

    fn spawn_encoder(&self, command: &EncoderCommand) -> Result<Child> {
        self.log.info(format_args!("Spawning encoder: {:?} {}", command.program, command.args.join(" ")));
        command
            .to_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    RecorderError::EncoderNotFound(format!("{:?}: {}", command.program, e))
                }
                _ => RecorderError::Spawn(format!("{:?}: {}", command.program, e)),
            })
    }

    // Attach the monitor and the audio writer to a freshly spawned encoder
    fn wire_up(&self, spec: &EncoderSpec, child: &mut Child, wav: Option<WavStream>) -> Result<EncoderHandle> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RecorderError::Spawn("encoder stdin not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RecorderError::Spawn("encoder stderr not captured".to_string()))?;

        let monitor = EncoderMonitor::spawn(stderr, self.log.child("ffmpeg"))?;
        let writer_log = self.log.child("writer");
        let wait = spec.timeline.writer_wait();
        let join_timeout = spec.timeline.writer_join_timeout();

        let mut handle = EncoderHandle::default();
        let sink_target: Arc<dyn AudioSink> = match (spec.mode, wav) {
            (MuxMode::Merge, Some(wav)) => {
                let writer = Arc::new(PipeWriter::spawn(wav, wait, join_timeout, None, writer_log)?);
                handle.control = Some(stdin);
                handle.audio = Some(AudioPath::Wav(writer.clone()));
                writer
            }
            _ => {
                let exited = monitor.exited_flag();
                let writer = Arc::new(PipeWriter::spawn(stdin, wait, join_timeout, Some(exited), writer_log)?);
                handle.audio = Some(AudioPath::Pipe(writer.clone()));
                writer
            }
        };

        if self.sink.target.set(sink_target).is_err() {
            return Err(RecorderError::InvalidState("audio sink already bound".to_string()));
        }
        handle.monitor = Some(monitor);
        Ok(handle)
    }

    // Idempotent; safe from any thread
    pub fn request_stop(&self) -> Result<()> {
        {
            let mut state = lock_recover(&self.state);
            match *state {
                EncoderState::Running => *state = EncoderState::StopRequested,
                EncoderState::StopRequested | EncoderState::Finished => return Ok(()),
                other => {
                    return Err(RecorderError::InvalidState(format!("request_stop() in state {:?}", other)));
                }
            }
        }
        let spec = self.configured_spec()?;

        let mut handle = lock_recover(&self.handle);
        match handle.audio.take() {
            Some(AudioPath::Pipe(writer)) => {
                // Trailing silence keeps the audio stream alive while the
                // encoder flushes buffered video
                let padding = spec.audio_format.bytes_for(spec.timeline.stop_padding());
                self.log.info(format_args!(
                    "Stopping pipe-mode encoder: draining queue, then {} bytes of stop padding",
                    padding
                ));

                let exited = match &handle.monitor {
                    Some(monitor) => monitor.exited_flag(),
                    None => Arc::new(AtomicBool::new(false)),
                };
                match StopPadding::spawn(
                    writer.clone(),
                    exited,
                    spec.audio_format,
                    padding,
                    spec.timeline.writer_join_timeout(),
                    self.log.child("padding"),
                ) {
                    Ok(stop) => handle.padding = Some(stop),
                    Err(e) => {
                        // Without padding: dropping the drained stream closes stdin
                        self.log.error(format_args!("{}; closing stdin without padding", e));
                        drop(writer.shutdown());
                        handle.writer_stats = writer.stats();
                    }
                }
            }
            Some(AudioPath::Wav(writer)) => {
                let outcome = match writer.shutdown() {
                    WriterShutdown::Detached => writer.await_drain(spec.timeline.drain_timeout()),
                    other => other,
                };
                match outcome {
                    WriterShutdown::Drained(wav) => {
                        if let Err(e) = wav.finalize() {
                            self.log.error(format_args!("Failed to finalize WAV intermediate: {}", e));
                        }
                    }
                    WriterShutdown::Stopped => {
                        self.log.warn(format_args!("WAV writer stopped early; header may be stale"))
                    }
                    WriterShutdown::Detached => self.log.warn(format_args!(
                        "WAV writer still busy after {:?}; header may be stale",
                        spec.timeline.drain_timeout()
                    )),
                }
                handle.writer_stats = writer.stats();
            }
            None => {}
        }

        if let Some(mut control) = handle.control.take() {
            self.log.info(format_args!("Sending stop directive to encoder"));
            if let Err(e) = control.write_all(b"q\n").and_then(|_| control.flush()) {
                self.log.warn(format_args!("Failed to send stop directive: {}", e));
            }
        }

        Ok(())
    }

    pub fn finish(&self, quick_exit: bool) -> Result<FinishReport> {
        match self.state() {
            EncoderState::Running => self.request_stop()?,
            EncoderState::StopRequested => {}
            other => return Err(RecorderError::InvalidState(format!("finish() in state {:?}", other))),
        }
        let spec = self.configured_spec()?;
        let policy = &spec.policy;

        let (child, monitor, padding, mut writer_stats) = {
            let mut handle = lock_recover(&self.handle);
            (
                handle.child.take(),
                handle.monitor.take(),
                handle.padding.take(),
                handle.writer_stats,
            )
        };

        let mut exit_code = None;
        let mut forced = false;
        if let Some(mut child) = child {
            let graceful = if quick_exit {
                policy.quick_exit_wait()
            } else {
                policy.graceful_timeout(file_size(spec.capture_target()))
            };
            self.log.info(format_args!(
                "Waiting up to {:?} for encoder to exit{}",
                graceful,
                if quick_exit { " (quick exit)" } else { "" }
            ));

            let mut status = wait_with_timeout(&mut child, graceful, policy.poll_interval())?;
            if status.is_none() {
                self.log.warn(format_args!("Encoder did not exit within {:?}, escalating", graceful));
                forced = true;
                status = force_terminate(&mut child, policy.kill_wait(), policy.poll_interval(), &self.log)?;
            }
            exit_code = status.and_then(|s| s.code());

            match status {
                Some(s) if s.success() => self.log.info(format_args!("Encoder exited cleanly")),
                Some(s) => self.log.warn(format_args!("Encoder exited with {}", s)),
                None => self.log.error(format_args!("Encoder could not be confirmed dead")),
            }
        }

        // The encoder is gone, so a padding write still in flight fails fast
        let mut padding_bytes = 0;
        if let Some(stop) = padding {
            (writer_stats, padding_bytes) = stop.join(policy.kill_wait(), &self.log);
            self.log.info(format_args!(
                "Audio: {} bytes queued, {} written, {} discarded, {} bytes of stop padding",
                writer_stats.enqueued_bytes,
                writer_stats.written_bytes,
                writer_stats.discarded_bytes,
                padding_bytes
            ));
        }

        if let Some(mut monitor) = monitor {
            if !monitor.join(policy.kill_wait()) {
                self.log.warn(format_args!("Encoder diagnostic stream still open, detaching reader"));
            }
            if exit_code != Some(0) {
                for line in monitor.recent_lines() {
                    self.log.warn(format_args!("ffmpeg: {}", line));
                }
            }
        }

        if !quick_exit {
            wait_for_stable_size(spec.capture_target(), policy, &self.log);
        }

        let merge_result = match (spec.mode, quick_exit) {
            (MuxMode::Merge, false) => self.run_merge_pass(spec).map(|()| true),
            (MuxMode::Merge, true) => {
                self.log.warn(format_args!("Quick exit: merge pass skipped, intermediates kept"));
                Ok(false)
            }
            (MuxMode::Pipe, _) => Ok(false),
        };

        *lock_recover(&self.state) = EncoderState::Finished;
        let merged = merge_result?;

        let probe = probe_container(&spec.output, &self.log);
        match &probe {
            ProbeResult::Valid { kind, size } => self.log.info(format_args!(
                "Output {:?}: {} container, {} bytes",
                spec.output,
                kind.name(),
                size
            )),
            other => self.log.warn(format_args!("Output {:?} failed validation: {:?}", spec.output, other)),
        }

        Ok(FinishReport {
            exit_code,
            forced_termination: forced,
            merged,
            output: spec.output.clone(),
            file_size: probe.size(),
            probe,
            writer: writer_stats,
            padding_bytes,
        })
    }

    fn run_merge_pass(&self, spec: &EncoderSpec) -> Result<()> {
        let (Some(command), Some(video), Some(audio)) =
            (&spec.merge, &spec.video_intermediate, &spec.audio_intermediate)
        else {
            return Err(RecorderError::Merge("merge pass not configured".to_string()));
        };
        let policy = &spec.policy;

        if file_size(video) == 0 {
            return Err(RecorderError::Merge(format!("video intermediate {:?} is missing or empty", video)));
        }

        self.log.info(format_args!("Running merge pass: {:?} + {:?} -> {:?}", video, audio, spec.output));
        let started = Instant::now();

        let mut child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RecorderError::Merge(format!("failed to spawn {:?}: {}", command.program, e)))?;
        let mut monitor = match child.stderr.take() {
            Some(stderr) => Some(EncoderMonitor::spawn(stderr, self.log.child("merge"))?),
            None => None,
        };

        let mut status = wait_with_timeout(&mut child, policy.merge_timeout(), policy.poll_interval())?;
        let timed_out = status.is_none();
        if timed_out {
            self.log.warn(format_args!("Merge pass exceeded {:?}, terminating", policy.merge_timeout()));
            status = force_terminate(&mut child, policy.kill_wait(), policy.poll_interval(), &self.log)?;
        }

        let recent = match monitor.as_mut() {
            Some(monitor) => {
                monitor.join(policy.kill_wait());
                monitor.recent_lines()
            }
            None => Vec::new(),
        };

        match status {
            Some(s) if s.success() && !timed_out => {
                self.log.info(format_args!("Merge pass finished in {:.1}s", started.elapsed().as_secs_f64()));
                remove_intermediate(video, &self.log);
                remove_intermediate(audio, &self.log);
                Ok(())
            }
            other => {
                let detail = recent.last().cloned().unwrap_or_default();
                Err(RecorderError::Merge(format!(
                    "{} (status {:?}); intermediates kept at {:?} and {:?}. {}",
                    if timed_out { "timed out" } else { "encoder failed" },
                    other.and_then(|s| s.code()),
                    video,
                    audio,
                    detail
                )))
            }
        }
    }

    fn configured_spec(&self) -> Result<&EncoderSpec> {
        self.spec
            .get()
            .ok_or_else(|| RecorderError::InvalidState("encoder not configured".to_string()))
    }
}

impl Drop for EncoderController {
    fn drop(&mut self) {
        let mut handle = lock_recover(&self.handle);
        if let Some(mut child) = handle.child.take() {
            self.log.warn(format_args!("Encoder dropped while running, terminating"));
            let _ = force_terminate(&mut child, Duration::from_secs(1), Duration::from_millis(20), &self.log);
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

// Shut the writer down and keep waiting while it drains. None if the loop
// ended without handing stdin back or the encoder exited meanwhile.
fn drain_for_padding(
    writer: &PipeWriter<ChildStdin>,
    exited: &AtomicBool,
    retry: Duration,
    log: &SessionLogger,
) -> Option<ChildStdin> {
    let mut outcome = writer.shutdown();
    while outcome.is_detached() {
        if exited.load(Ordering::Acquire) {
            log.warn(format_args!("Encoder exited while audio was still queued, no stop padding"));
            return None;
        }
        outcome = writer.await_drain(retry);
    }

    let stdin = outcome.into_stream();
    if stdin.is_none() {
        log.warn(format_args!("Audio writer stopped early, no stop padding"));
    }
    stdin
}

// Silence in one-second chunks straight into stdin, which is closed on return
fn write_padding(
    mut stdin: ChildStdin,
    exited: &AtomicBool,
    format: &AudioFormat,
    bytes: u64,
    written: &AtomicU64,
    log: &SessionLogger,
) {
    let chunk = format.bytes_per_second().max(format.block_align());
    let mut remaining = bytes;
    while remaining > 0 {
        if exited.load(Ordering::Acquire) {
            log.debug(format_args!("Encoder exited, {} bytes of stop padding skipped", remaining));
            return;
        }
        let n = remaining.min(chunk);
        if let Err(e) = stdin.write_all(&format.silence(n as usize)) {
            log.debug(format_args!("Stop padding ended early: {}", e));
            return;
        }
        written.fetch_add(n, Ordering::Relaxed);
        remaining -= n;
    }

    if let Err(e) = stdin.flush() {
        log.debug(format_args!("Flush after stop padding failed: {}", e));
    }
    log.debug(format_args!("Stop padding written, closing encoder stdin"));
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

// Poll the file size until several consecutive reads agree
fn wait_for_stable_size(path: &Path, policy: &ShutdownPolicy, log: &SessionLogger) -> u64 {
    let deadline = Instant::now() + policy.size_max_wait();
    let mut last = file_size(path);
    let mut stable: u32 = 0;

    while stable < policy.size_stable_reads {
        if Instant::now() >= deadline {
            log.warn(format_args!("Output size of {:?} did not settle, continuing at {} bytes", path, last));
            return last;
        }
        std::thread::sleep(policy.size_poll_interval());
        let size = file_size(path);
        if size == last {
            stable += 1;
        } else {
            stable = 0;
            last = size;
        }
    }

    log.debug(format_args!("Output size of {:?} settled at {} bytes", path, last));
    last
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::recording::validate::ContainerKind;

    fn fast_policy() -> ShutdownPolicy {
        ShutdownPolicy {
            quick_exit_wait_ms: 200,
            graceful_base_secs: 1,
            bytes_per_extra_second: 10 * 1024 * 1024,
            graceful_max_secs: 2,
            kill_wait_ms: 2_000,
            size_poll_interval_ms: 20,
            size_stable_reads: 2,
            size_max_wait_secs: 1,
            merge_timeout_secs: 5,
            poll_interval_ms: 10,
        }
    }

    fn fast_timeline() -> TimelineConfig {
        TimelineConfig {
            stop_padding_secs: 0.05,
            ..TimelineConfig::default()
        }
    }

    fn sh(script: &str, extra: &[&Path]) -> EncoderCommand {
        let mut args = vec!["-c".to_string(), script.to_string()];
        args.extend(extra.iter().map(|p| p.to_string_lossy().into_owned()));
        EncoderCommand::new("sh", args)
    }

    fn pipe_spec(capture: EncoderCommand, output: PathBuf) -> EncoderSpec {
        EncoderSpec {
            mode: MuxMode::Pipe,
            capture,
            merge: None,
            output,
            video_intermediate: None,
            audio_intermediate: None,
            audio_format: AudioFormat::float32(48_000, 2),
            timeline: fast_timeline(),
            policy: fast_policy(),
        }
    }

    #[test]
    fn test_state_machine_guards() {
        let encoder = EncoderController::new(SessionLogger::new("test"));
        assert_eq!(encoder.state(), EncoderState::Uninitialized);
        assert!(matches!(encoder.start(), Err(RecorderError::InvalidState(_))));
        assert!(matches!(encoder.request_stop(), Err(RecorderError::InvalidState(_))));
        assert!(matches!(encoder.finish(false), Err(RecorderError::InvalidState(_))));

        let dir = tempfile::tempdir().unwrap();
        let spec = pipe_spec(sh("cat > /dev/null", &[]), dir.path().join("out.bin"));
        encoder.configure(spec.clone()).unwrap();
        assert_eq!(encoder.state(), EncoderState::Configured);
        assert!(matches!(encoder.configure(spec), Err(RecorderError::InvalidState(_))));
    }

    #[test]
    fn test_missing_binary_is_fatal_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = EncoderController::new(SessionLogger::new("test"));
        let command = EncoderCommand::new("/nonexistent/ffmpeg", Vec::new());
        encoder.configure(pipe_spec(command, dir.path().join("out.mp4"))).unwrap();
        assert!(matches!(encoder.start(), Err(RecorderError::EncoderNotFound(_))));
        assert_eq!(encoder.state(), EncoderState::Configured);
    }

    #[test]
    fn test_pipe_mode_graceful_finish() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.raw");
        let encoder = EncoderController::new(SessionLogger::new("test"));
        encoder
            .configure(pipe_spec(sh("cat > \"$0\"", &[&output]), output.clone()))
            .unwrap();

        let sink = encoder.audio_sink();
        // Dropped: no writer yet
        sink.push(vec![1u8; 8]);

        encoder.start().unwrap();
        assert_eq!(encoder.state(), EncoderState::Running);
        for _ in 0..10 {
            sink.push(vec![7u8; 800]);
        }

        encoder.request_stop().unwrap();
        encoder.request_stop().unwrap();
        assert_eq!(encoder.state(), EncoderState::StopRequested);

        let report = encoder.finish(false).unwrap();
        assert_eq!(encoder.state(), EncoderState::Finished);
        assert!(!report.forced_termination);
        assert_eq!(report.exit_code, Some(0));

        // 8000 bytes of audio, then 50 ms of padding at 384000 B/s
        let padding = 19_200;
        assert_eq!(report.writer.enqueued_bytes, 8_000);
        assert_eq!(report.writer.written_bytes, 8_000);
        assert_eq!(report.padding_bytes, padding);
        assert_eq!(std::fs::metadata(&output).unwrap().len(), 8_000 + padding);

        // Raw bytes are not a container: reported, file kept
        assert!(!report.probe.is_valid());
        assert!(output.exists());
        assert!(matches!(encoder.finish(false), Err(RecorderError::InvalidState(_))));
    }

    #[test]
    fn test_stop_padding_reaches_slow_reader() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.raw");
        let mut spec = pipe_spec(sh("sleep 1; cat > \"$0\"", &[&output]), output.clone());
        // More padding than a pipe buffer holds, reader idle past the join timeout
        spec.timeline.stop_padding_secs = 1.0;
        spec.timeline.writer_join_timeout_ms = 200;
        spec.policy.graceful_base_secs = 10;
        spec.policy.graceful_max_secs = 10;

        let encoder = EncoderController::new(SessionLogger::new("test"));
        encoder.configure(spec).unwrap();
        encoder.start().unwrap();

        let sink = encoder.audio_sink();
        for _ in 0..10 {
            sink.push(vec![7u8; 800]);
        }

        let started = Instant::now();
        encoder.request_stop().unwrap();
        assert!(started.elapsed() < Duration::from_millis(500), "request_stop took {:?}", started.elapsed());

        let report = encoder.finish(false).unwrap();
        assert!(!report.forced_termination);
        assert_eq!(report.exit_code, Some(0));
        assert_eq!(report.writer.enqueued_bytes, 8_000);
        assert_eq!(report.writer.written_bytes, 8_000);
        assert_eq!(report.writer.discarded_bytes, 0);
        assert_eq!(report.padding_bytes, 384_000);

        // Queued audio first, padding after it
        let written = std::fs::read(&output).unwrap();
        assert_eq!(written.len(), 392_000);
        assert!(written[..8_000].iter().all(|&b| b == 7));
        assert!(written[8_000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_stuck_encoder_is_force_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = EncoderController::new(SessionLogger::new("test"));
        encoder
            .configure(pipe_spec(sh("trap '' INT TERM; exec sleep 30", &[]), dir.path().join("out.mp4")))
            .unwrap();
        encoder.start().unwrap();
        encoder.audio_sink().push(vec![0u8; 64]);

        let started = Instant::now();
        let report = encoder.finish(false).unwrap();
        let elapsed = started.elapsed();

        assert!(report.forced_termination);
        assert!(elapsed < Duration::from_secs(10), "finish took {:?}", elapsed);
        assert_eq!(encoder.state(), EncoderState::Finished);
        assert!(matches!(report.probe, ProbeResult::Missing));
    }

    #[test]
    fn test_quick_exit_escalates_fast() {
        let dir = tempfile::tempdir().unwrap();
        let encoder = EncoderController::new(SessionLogger::new("test"));
        encoder
            .configure(pipe_spec(sh("trap '' INT TERM; exec sleep 30", &[]), dir.path().join("out.mp4")))
            .unwrap();
        encoder.start().unwrap();

        let started = Instant::now();
        let report = encoder.finish(true).unwrap();
        assert!(report.forced_termination);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    fn merge_spec(dir: &Path, merge: EncoderCommand) -> (EncoderSpec, PathBuf, PathBuf, PathBuf) {
        let video = dir.join("s_video.mp4");
        let audio = dir.join("s_audio.wav");
        let output = dir.join("s.mp4");
        // Waits for the stop directive, then writes an ISO BMFF header
        let capture = sh(
            "read cmd; [ \"$cmd\" = q ] && printf '\\000\\000\\000\\030ftypisom' > \"$0\"",
            &[&video],
        );
        let spec = EncoderSpec {
            mode: MuxMode::Merge,
            capture,
            merge: Some(merge),
            output: output.clone(),
            video_intermediate: Some(video.clone()),
            audio_intermediate: Some(audio.clone()),
            audio_format: AudioFormat::float32(48_000, 2),
            timeline: fast_timeline(),
            policy: fast_policy(),
        };
        (spec, video, audio, output)
    }

    #[test]
    fn test_merge_mode_combines_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let video = dir.path().join("s_video.mp4");
        let audio = dir.path().join("s_audio.wav");
        let output = dir.path().join("s.mp4");
        let merge = sh("cat \"$0\" \"$1\" > \"$2\"", &[&video, &audio, &output]);
        let (spec, video, audio, output) = merge_spec(dir.path(), merge);

        let encoder = EncoderController::new(SessionLogger::new("test"));
        encoder.configure(spec).unwrap();
        encoder.start().unwrap();
        encoder.audio_sink().push(vec![0u8; 3_840]);

        let report = encoder.finish(false).unwrap();
        assert!(report.merged);
        assert!(!report.forced_termination);
        assert_eq!(report.probe.kind(), Some(ContainerKind::IsoBmff));
        assert_eq!(report.writer.written_bytes, 3_840);
        assert!(output.exists());
        assert!(!video.exists());
        assert!(!audio.exists());
    }

    #[test]
    fn test_merge_failure_keeps_intermediates() {
        let dir = tempfile::tempdir().unwrap();
        let (spec, video, audio, _) = merge_spec(dir.path(), sh("exit 1", &[]));

        let encoder = EncoderController::new(SessionLogger::new("test"));
        encoder.configure(spec).unwrap();
        encoder.start().unwrap();
        encoder.audio_sink().push(vec![0u8; 800]);

        let result = encoder.finish(false);
        assert!(matches!(result, Err(RecorderError::Merge(_))));
        assert_eq!(encoder.state(), EncoderState::Finished);
        assert!(video.exists());
        assert!(audio.exists());

        let reader = hound::WavReader::open(&audio).unwrap();
        assert_eq!(reader.len(), 200);
    }
}
