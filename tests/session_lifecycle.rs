use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use screenmux::recording::audio_source::SilenceFillingSource;
use screenmux::recording::loopback::{LoopbackSource, SilentCapture};
use screenmux::recording::native::{CodecParams, MediaType, StreamMuxer, VideoParams};
use screenmux::recording::storage::load_metadata;
use screenmux::{AudioFormat, BackendKind, RecorderConfig, RecorderError, RecordingSession, Result, SessionLogger};

// =============================================================================
// Fakes
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
struct AudioSample {
    len: usize,
    timestamp: Duration,
    duration: Duration,
}

#[derive(Default)]
struct Recorded {
    video_timestamps: Vec<Duration>,
    audio: Vec<AudioSample>,
    finalize_calls: u32,
}

struct MemoryMuxer {
    recorded: Arc<Mutex<Recorded>>,
    audio_stream: Option<usize>,
    streams: usize,
}

impl StreamMuxer for MemoryMuxer {
    fn configure_stream(&mut self, media: MediaType, _params: &CodecParams) -> Result<usize> {
        let index = self.streams;
        self.streams += 1;
        if media == MediaType::Audio {
            self.audio_stream = Some(index);
        }
        Ok(index)
    }

    fn begin_writing(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_sample(&mut self, stream: usize, data: &[u8], timestamp: Duration, duration: Duration) -> Result<()> {
        let mut recorded = self.recorded.lock().unwrap();
        if Some(stream) == self.audio_stream {
            recorded.audio.push(AudioSample {
                len: data.len(),
                timestamp,
                duration,
            });
        } else {
            recorded.video_timestamps.push(timestamp);
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.recorded.lock().unwrap().finalize_calls += 1;
        Ok(())
    }
}

// Delivers a few bursts of audio separated by silent stretches
struct BurstCapture {
    format: AudioFormat,
    bursts: usize,
    burst_len: usize,
    pause: Duration,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl BurstCapture {
    fn new(bursts: usize, pause: Duration) -> Self {
        let format = AudioFormat::pcm16(16_000, 1);
        Self {
            format,
            bursts,
            // 50 ms per burst
            burst_len: format.bytes_for(Duration::from_millis(50)) as usize,
            pause,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl LoopbackSource for BurstCapture {
    fn format(&self) -> Result<AudioFormat> {
        Ok(self.format)
    }

    fn start(&mut self, source: Arc<SilenceFillingSource>, _log: &SessionLogger) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let (bursts, burst_len, pause) = (self.bursts, self.burst_len, self.pause);
        self.thread = Some(std::thread::spawn(move || {
            for _ in 0..bursts {
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                source.on_audio(&vec![0x11u8; burst_len]);
                std::thread::sleep(pause);
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn describe(&self) -> String {
        "bursts".to_string()
    }
}

struct FailingCapture;

impl LoopbackSource for FailingCapture {
    fn format(&self) -> Result<AudioFormat> {
        Ok(AudioFormat::float32(48_000, 2))
    }

    fn start(&mut self, _source: Arc<SilenceFillingSource>, _log: &SessionLogger) -> Result<()> {
        Err(RecorderError::CaptureUnavailable("device unplugged".to_string()))
    }

    fn stop(&mut self) {}

    fn describe(&self) -> String {
        "failing".to_string()
    }
}

fn native_config(dir: &Path) -> RecorderConfig {
    RecorderConfig {
        output_dir: Some(dir.to_path_buf()),
        backend: BackendKind::Native,
        ..RecorderConfig::default()
    }
}

fn memory_muxer(recorded: Arc<Mutex<Recorded>>) -> impl FnOnce(&Path) -> Result<Box<dyn StreamMuxer>> {
    move |_output| {
        Ok(Box::new(MemoryMuxer {
            recorded,
            audio_stream: None,
            streams: 0,
        }) as Box<dyn StreamMuxer>)
    }
}

// =============================================================================
// Native sessions
// =============================================================================

#[test]
fn test_bursty_audio_yields_contiguous_track() {
    let dir = tempfile::tempdir().unwrap();
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let capture = BurstCapture::new(3, Duration::from_millis(300));
    let burst_len = capture.burst_len as u64;

    let session = RecordingSession::start_native(
        native_config(dir.path()),
        Box::new(capture),
        Some(VideoParams { width: 4, height: 2, fps: 10 }),
        memory_muxer(recorded.clone()),
    )
    .unwrap();

    for _ in 0..5 {
        session.push_video_frame(&[0u8; 32]).unwrap();
    }
    std::thread::sleep(Duration::from_millis(1_100));
    let metadata = session.finish(false).unwrap();

    assert_eq!(metadata.real_audio_bytes, 3 * burst_len);
    assert!(metadata.silence_bytes > 0);

    let recorded = recorded.lock().unwrap();
    assert_eq!(recorded.finalize_calls, 1);

    // Video timestamps come from the frame index
    let expected: Vec<Duration> = (0..5).map(|i| Duration::from_millis(100 * i)).collect();
    assert_eq!(recorded.video_timestamps, expected);

    // Every audio sample starts where the previous one ended
    let mut cursor = Duration::ZERO;
    let mut total = 0u64;
    for sample in &recorded.audio {
        assert_eq!(sample.timestamp, cursor);
        cursor += sample.duration;
        total += sample.len as u64;
    }
    assert_eq!(total, metadata.real_audio_bytes + metadata.silence_bytes);

    // The track covers the session's wall-clock span
    let covered = cursor.as_secs_f64();
    assert!(covered >= 1.0, "audio track covers only {:.3}s", covered);
    assert!(covered <= metadata.duration_seconds + 0.1);
}

#[test]
fn test_sidecar_matches_returned_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let recorded = Arc::new(Mutex::new(Recorded::default()));

    let session = RecordingSession::start_native(
        native_config(dir.path()),
        Box::new(SilentCapture::default()),
        None,
        memory_muxer(recorded),
    )
    .unwrap();
    let id = session.id().to_string();
    let sidecar = session.paths().metadata.clone();

    let metadata = session.finish(true).unwrap();
    assert_eq!(metadata.id, id);
    assert_eq!(load_metadata(&sidecar).unwrap(), metadata);
    assert!(sidecar.starts_with(dir.path()));
}

#[test]
fn test_capture_start_failure_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let recorded = Arc::new(Mutex::new(Recorded::default()));

    let result = RecordingSession::start_native(
        native_config(dir.path()),
        Box::new(FailingCapture),
        None,
        memory_muxer(recorded.clone()),
    );

    assert!(matches!(result, Err(RecorderError::CaptureUnavailable(_))));
    // The multiplexer was still closed properly
    assert_eq!(recorded.lock().unwrap().finalize_calls, 1);
}

// =============================================================================
// External encoder
// =============================================================================

// Shell stand-in for ffmpeg: answers -version, otherwise copies stdin into
// its last argument
#[cfg(unix)]
fn fake_ffmpeg(dir: &Path) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("ffmpeg");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         if [ \"$1\" = \"-version\" ]; then echo 'ffmpeg version test'; exit 0; fi\n\
         for last; do :; done\n\
         cat > \"$last\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
#[test]
fn test_pipe_session_with_fake_encoder() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RecorderConfig {
        output_dir: Some(dir.path().join("recordings")),
        ffmpeg_path: Some(fake_ffmpeg(dir.path())),
        ..RecorderConfig::default()
    };
    config.timeline.stop_padding_secs = 1.0;

    let format = AudioFormat::pcm16(8_000, 1);
    let mut session = RecordingSession::start(config, Box::new(SilentCapture::new(format))).unwrap();
    assert_eq!(session.backend_kind(), BackendKind::External);
    assert!(matches!(
        session.push_video_frame(&[0u8; 4]),
        Err(RecorderError::InvalidState(_))
    ));

    std::thread::sleep(Duration::from_millis(400));
    session.stop().unwrap();
    let metadata = session.finish(false).unwrap();

    // Raw PCM is not a container, but every byte reached the encoder
    assert!(!metadata.valid);
    assert!(!metadata.forced_termination);
    let padding = format.bytes_for(Duration::from_secs(1));
    assert_eq!(metadata.file_size_bytes, metadata.silence_bytes + padding);
    assert_eq!(std::fs::metadata(&metadata.output_path).unwrap().len(), metadata.file_size_bytes);
}
