/**
 * ============================================================================
 * SILENCE-FILLING AUDIO SOURCE MODULE
 * ============================================================================
 *
 * PURPOSE: Guarantee audio exists for every wall-clock instant of a session
 *
 * EVENTS (each may run on its own thread):
 * - Audio delivery: pad the inter-callback gap (>= inline threshold), then
 *   forward the block-aligned part of the payload and advance the timeline
 *   by its size. A partial frame is held back and completed by the next
 *   delivery.
 * - Heartbeat tick: pad the idle gap (>= idle threshold) so the timeline
 *   moves forward even if the OS delivers nothing at all
 * - Stop: pad the tail gap (>= tail threshold) up to the stop instant
 *
 * All timeline mutation and emission happens under one mutex, so silence
 * for a gap is always queued before the chunk that followed it and two
 * producers can never pad the same interval twice. The sink is expected to
 * be non-blocking (see pipe_writer).
 *
 * ============================================================================
 */

use crate::recording::error::{RecorderError, Result};
use crate::recording::lock_recover;
use crate::recording::logger::SessionLogger;
use crate::recording::timeline::TimelineTracker;
use crate::recording::types::{AudioFormat, TimelineConfig};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// Destination of real and synthetic audio. push() must not block on I/O.
pub trait AudioSink: Send + Sync {
    fn push(&self, chunk: Vec<u8>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GapKind {
    Inline,
    Idle,
    Tail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    pub real_bytes: u64,
    pub silence_bytes: u64,
    pub inline_fills: u64,
    pub idle_fills: u64,
    pub tail_fills: u64,
    pub misaligned_chunks: u64,
}

struct SourceState {
    timeline: TimelineTracker,
    stats: SourceStats,
    // Trailing bytes of a partial frame, prepended to the next delivery
    pending: Vec<u8>,
}

struct Heartbeat {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

pub struct SilenceFillingSource {
    state: Mutex<SourceState>,
    sink: Arc<dyn AudioSink>,
    config: TimelineConfig,
    stopped: AtomicBool,
    heartbeat: Mutex<Option<Heartbeat>>,
    log: SessionLogger,
}

impl SilenceFillingSource {
    pub fn new(sink: Arc<dyn AudioSink>, config: TimelineConfig, log: SessionLogger) -> Self {
        Self {
            state: Mutex::new(SourceState {
                timeline: TimelineTracker::new(),
                stats: SourceStats::default(),
                pending: Vec::new(),
            }),
            sink,
            config,
            stopped: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
            log,
        }
    }

    // Called once the capture collaborator knows its format
    pub fn initialize(&self, format: AudioFormat, origin: Instant) {
        if !format.is_usable() {
            self.log.warn(format_args!("Ignoring unusable audio format {:?}", format));
            return;
        }

        let mut state = lock_recover(&self.state);
        state.timeline.initialize(format, origin);
        self.log.info(format_args!(
            "Audio timeline initialized: {} Hz, {} ch, {} bit {:?} ({} B/s, block {})",
            format.sample_rate,
            format.channels,
            format.bits_per_sample,
            format.encoding,
            format.bytes_per_second(),
            format.block_align()
        ));
    }

    pub fn is_initialized(&self) -> bool {
        lock_recover(&self.state).timeline.is_initialized()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    // Capture callback entry point
    pub fn on_audio(&self, data: &[u8]) {
        self.on_audio_at(data, Instant::now());
    }

    pub fn on_audio_at(&self, data: &[u8], now: Instant) {
        if data.is_empty() || self.is_stopped() {
            return;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.deliver(data, now)));
        if outcome.is_err() {
            self.log.error(format_args!("Audio delivery iteration panicked, continuing"));
        }
    }

    // One heartbeat iteration; returns the bytes of silence emitted
    pub fn heartbeat_tick_at(&self, now: Instant) -> u64 {
        if self.is_stopped() {
            return 0;
        }

        let mut state = lock_recover(&self.state);
        let format = match state.timeline.format().copied() {
            Some(format) => format,
            None => return 0,
        };

        let gap = state.timeline.compute_gap(now, self.config.idle_gap());
        if gap > 0 {
            self.emit_silence(&mut state, &format, gap, now, GapKind::Idle);
        }
        gap
    }

    // Spawn the periodic heartbeat thread
    pub fn start_heartbeat(self: &Arc<Self>) -> Result<()> {
        let mut slot = lock_recover(&self.heartbeat);
        if slot.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        // Weak so a dropped source ends the thread
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.heartbeat_interval();

        let handle = std::thread::Builder::new()
            .name("screenmux-heartbeat".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            let Some(source) = weak.upgrade() else {
                                break;
                            };
                            let tick = panic::catch_unwind(AssertUnwindSafe(|| {
                                source.heartbeat_tick_at(Instant::now())
                            }));
                            if tick.is_err() {
                                source.log.error(format_args!("Heartbeat iteration panicked, continuing"));
                            }
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| RecorderError::Spawn(format!("Failed to start heartbeat thread: {}", e)))?;

        *slot = Some(Heartbeat { stop: stop_tx, handle });
        self.log.debug(format_args!("Heartbeat started (every {:?})", interval));
        Ok(())
    }

    pub fn stop(&self) -> u64 {
        self.stop_at(Instant::now())
    }

    // Cease accepting audio, stop the heartbeat and pad up to `stop_instant`.
    // Returns the tail silence in bytes. Idempotent.
    pub fn stop_at(&self, stop_instant: Instant) -> u64 {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return 0;
        }

        if let Some(heartbeat) = lock_recover(&self.heartbeat).take() {
            let _ = heartbeat.stop.send(());
            if heartbeat.handle.join().is_err() {
                self.log.error(format_args!("Heartbeat thread panicked"));
            }
        }

        let mut state = lock_recover(&self.state);
        let format = match state.timeline.format().copied() {
            Some(format) => format,
            None => {
                self.log.warn(format_args!("Stopped before the audio format was known"));
                return 0;
            }
        };

        if !state.pending.is_empty() {
            self.log.debug(format_args!("Dropping {} bytes of a partial frame", state.pending.len()));
            state.pending.clear();
        }

        let tail = state.timeline.compute_gap(stop_instant, self.config.tail_gap());
        if tail > 0 {
            self.emit_silence(&mut state, &format, tail, stop_instant, GapKind::Tail);
        }

        let stats = state.stats;
        self.log.info(format_args!(
            "Audio source stopped: {} real bytes, {} silence bytes ({} inline / {} idle / {} tail fills), timeline {:.3}s",
            stats.real_bytes,
            stats.silence_bytes,
            stats.inline_fills,
            stats.idle_fills,
            stats.tail_fills,
            state.timeline.position().as_secs_f64()
        ));
        tail
    }

    pub fn stats(&self) -> SourceStats {
        lock_recover(&self.state).stats
    }

    pub fn format(&self) -> Option<AudioFormat> {
        lock_recover(&self.state).timeline.format().copied()
    }

    pub fn timeline_position(&self) -> Duration {
        lock_recover(&self.state).timeline.position()
    }

    pub fn timeline_bytes(&self) -> u64 {
        lock_recover(&self.state).timeline.bytes_written()
    }

    // =========================================================================
    // Internals (caller holds the state lock)
    // =========================================================================

    fn deliver(&self, data: &[u8], now: Instant) {
        let mut state = lock_recover(&self.state);
        let format = match state.timeline.format().copied() {
            Some(format) => format,
            None => return,
        };

        let gap = state.timeline.compute_gap(now, self.config.inline_gap());
        if gap > 0 {
            self.emit_silence(&mut state, &format, gap, now, GapKind::Inline);
        }

        let block = format.block_align();
        if data.len() as u64 % block != 0 {
            state.stats.misaligned_chunks += 1;
            if state.stats.misaligned_chunks <= 3 {
                self.log.warn(format_args!(
                    "Capture delivered {} bytes, not a multiple of block size {}",
                    data.len(),
                    block
                ));
            }
        }

        let mut chunk = std::mem::take(&mut state.pending);
        chunk.extend_from_slice(data);
        let whole = format.align_down(chunk.len() as u64);
        state.pending = chunk.split_off(whole as usize);
        if whole == 0 {
            return;
        }

        self.sink.push(chunk);
        state.timeline.advance(whole, now);
        state.stats.real_bytes += whole;
    }

    fn emit_silence(&self, state: &mut SourceState, format: &AudioFormat, bytes: u64, now: Instant, kind: GapKind) {
        // At most one second per chunk keeps long gaps from allocating at once
        let max_chunk = format.align_down(format.bytes_per_second()).max(format.block_align());
        let mut remaining = bytes;
        while remaining > 0 {
            let n = remaining.min(max_chunk);
            self.sink.push(format.silence(n as usize));
            remaining -= n;
        }

        state.timeline.advance(bytes, now);
        state.stats.silence_bytes += bytes;
        match kind {
            GapKind::Inline => state.stats.inline_fills += 1,
            GapKind::Idle => state.stats.idle_fills += 1,
            GapKind::Tail => state.stats.tail_fills += 1,
        }

        self.log.debug(format_args!(
            "{:?} gap: {} bytes of silence ({:.1} ms)",
            kind,
            bytes,
            format.duration_of(bytes).as_secs_f64() * 1000.0
        ));
    }
}

impl Drop for SilenceFillingSource {
    fn drop(&mut self) {
        if let Some(heartbeat) = lock_recover(&self.heartbeat).take() {
            let _ = heartbeat.stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CollectingSink {
        chunks: Mutex<Vec<Vec<u8>>>,
    }

    impl CollectingSink {
        fn total(&self) -> u64 {
            self.chunks.lock().unwrap().iter().map(|c| c.len() as u64).sum()
        }

        fn count(&self) -> usize {
            self.chunks.lock().unwrap().len()
        }
    }

    impl AudioSink for CollectingSink {
        fn push(&self, chunk: Vec<u8>) {
            self.chunks.lock().unwrap().push(chunk);
        }
    }

    fn format() -> AudioFormat {
        AudioFormat::float32(48_000, 2)
    }

    fn source_with(sink: Arc<CollectingSink>, config: TimelineConfig) -> SilenceFillingSource {
        SilenceFillingSource::new(sink, config, SessionLogger::new("test").child("audio"))
    }

    #[test]
    fn test_uninitialized_source_is_noop() {
        let sink = Arc::new(CollectingSink::default());
        let source = source_with(sink.clone(), TimelineConfig::default());
        let t0 = Instant::now();

        source.on_audio_at(&[0u8; 64], t0);
        assert_eq!(source.heartbeat_tick_at(t0 + Duration::from_secs(1)), 0);
        assert_eq!(source.stop_at(t0 + Duration::from_secs(2)), 0);
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_inline_gap_precedes_real_chunk() {
        let sink = Arc::new(CollectingSink::default());
        let source = source_with(sink.clone(), TimelineConfig::default());
        let t0 = Instant::now();
        source.initialize(format(), t0);

        let real = vec![7u8; 800];
        let arrival = t0 + Duration::from_millis(500);
        source.on_audio_at(&real, arrival);

        let bps = format().bytes_per_second();
        let block = format().block_align();
        let expected_silence = (bps / 2) / block * block;

        let chunks = sink.chunks.lock().unwrap().clone();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len() as u64, expected_silence);
        assert!(chunks[0].iter().all(|b| *b == 0));
        assert_eq!(chunks[1], real);

        // The heartbeat must not pad the same interval again
        assert_eq!(source.heartbeat_tick_at(arrival), 0);
        assert_eq!(source.heartbeat_tick_at(arrival + Duration::from_millis(150)), 0);
        assert_eq!(source.stats().silence_bytes, expected_silence);
        assert_eq!(source.stats().inline_fills, 1);
    }

    #[test]
    fn test_small_inline_gap_not_padded() {
        let sink = Arc::new(CollectingSink::default());
        let source = source_with(sink.clone(), TimelineConfig::default());
        let t0 = Instant::now();
        source.initialize(format(), t0);

        source.on_audio_at(&[0u8; 80], t0 + Duration::from_millis(50));
        assert_eq!(sink.count(), 1);
        assert_eq!(source.stats().silence_bytes, 0);
    }

    #[test]
    fn test_partial_frame_carried_to_next_delivery() {
        let sink = Arc::new(CollectingSink::default());
        let source = source_with(sink.clone(), TimelineConfig::default());
        let t0 = Instant::now();
        // 4-byte frames
        source.initialize(AudioFormat::pcm16(16_000, 2), t0);

        source.on_audio_at(&[1, 2, 3, 4, 5, 6, 7], t0);
        assert_eq!(source.timeline_bytes(), 4);
        source.on_audio_at(&[8], t0 + Duration::from_millis(1));
        assert_eq!(source.timeline_bytes(), 8);
        source.on_audio_at(&[9, 10], t0 + Duration::from_millis(2));
        assert_eq!(source.timeline_bytes(), 8);

        let chunks = sink.chunks.lock().unwrap().clone();
        assert_eq!(chunks, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]]);

        let stats = source.stats();
        assert_eq!(stats.real_bytes, 8);
        assert_eq!(stats.misaligned_chunks, 3);
    }

    #[test]
    fn test_heartbeat_fills_once_per_interval() {
        let sink = Arc::new(CollectingSink::default());
        let source = source_with(sink.clone(), TimelineConfig::default());
        let t0 = Instant::now();
        source.initialize(format(), t0);

        // 250 ms without audio, ticks every 50 ms
        let mut fills = 0;
        for ms in [50u64, 100, 150, 200, 250] {
            if source.heartbeat_tick_at(t0 + Duration::from_millis(ms)) > 0 {
                fills += 1;
            }
        }
        assert_eq!(fills, 1);
        assert_eq!(source.stats().idle_fills, 1);
        assert_eq!(sink.total(), format().bytes_for(Duration::from_millis(200)));
    }

    #[test]
    fn test_heartbeat_long_silence() {
        let sink = Arc::new(CollectingSink::default());
        let source = source_with(sink.clone(), TimelineConfig::default());
        let t0 = Instant::now();
        source.initialize(format(), t0);

        // One second of ticks every 100 ms: one fill per 200 ms, not per tick
        for i in 1..=10u64 {
            source.heartbeat_tick_at(t0 + Duration::from_millis(i * 100));
        }
        assert_eq!(source.stats().idle_fills, 5);
        assert_eq!(sink.total(), format().bytes_per_second());
    }

    #[test]
    fn test_tail_fill_correctness() {
        let sink = Arc::new(CollectingSink::default());
        let source = source_with(sink.clone(), TimelineConfig::default());
        let t0 = Instant::now();
        source.initialize(format(), t0);

        let bps = format().bytes_per_second();
        let block = format().block_align();

        // A one-second burst at t0 covers the timeline up to t0 + 1s
        source.on_audio_at(&vec![1u8; bps as usize], t0);
        let audio_end = t0 + Duration::from_secs(1);
        assert_eq!(source.stats().silence_bytes, 0);
        let before_stop = sink.total();

        let tail = source.stop_at(audio_end + Duration::from_millis(1_237));
        assert_eq!(tail, (1_237 * bps / 1_000) / block * block);
        assert_eq!(sink.total() - before_stop, tail);
        assert_eq!(source.stats().tail_fills, 1);
    }

    #[test]
    fn test_stop_is_idempotent_and_final() {
        let sink = Arc::new(CollectingSink::default());
        let source = source_with(sink.clone(), TimelineConfig::default());
        let t0 = Instant::now();
        source.initialize(format(), t0);

        let first = source.stop_at(t0 + Duration::from_millis(100));
        assert!(first > 0);
        assert_eq!(source.stop_at(t0 + Duration::from_secs(10)), 0);

        let before = sink.total();
        source.on_audio_at(&[0u8; 64], t0 + Duration::from_secs(11));
        assert_eq!(source.heartbeat_tick_at(t0 + Duration::from_secs(12)), 0);
        assert_eq!(sink.total(), before);
    }

    #[test]
    fn test_concurrent_heartbeat_and_delivery_account_every_byte() {
        let sink = Arc::new(CollectingSink::default());
        let config = TimelineConfig {
            heartbeat_interval_ms: 5,
            idle_gap_ms: 20,
            inline_gap_ms: 10,
            ..TimelineConfig::default()
        };
        let source = Arc::new(source_with(sink.clone(), config));
        source.initialize(format(), Instant::now());
        source.start_heartbeat().unwrap();

        let producer = {
            let source = source.clone();
            std::thread::spawn(move || {
                for i in 0..40 {
                    // Irregular bursts, always whole frames
                    source.on_audio(&vec![3u8; 8 * (1 + i % 7) * 60]);
                    std::thread::sleep(Duration::from_millis((i % 5) as u64 * 7));
                }
            })
        };
        producer.join().unwrap();
        source.stop();

        let stats = source.stats();
        assert_eq!(sink.total(), stats.real_bytes + stats.silence_bytes);
        assert_eq!(sink.total(), source.timeline_bytes());
        assert_eq!(source.timeline_bytes() % format().block_align(), 0);
    }

    struct PanicOnceSink {
        panicked: AtomicBool,
        inner: CollectingSink,
    }

    impl AudioSink for PanicOnceSink {
        fn push(&self, chunk: Vec<u8>) {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("sink failure");
            }
            self.inner.push(chunk);
        }
    }

    #[test]
    fn test_panicking_iteration_does_not_stop_delivery() {
        let sink = Arc::new(PanicOnceSink {
            panicked: AtomicBool::new(false),
            inner: CollectingSink::default(),
        });
        let source = SilenceFillingSource::new(
            sink.clone(),
            TimelineConfig::default(),
            SessionLogger::new("test"),
        );
        let t0 = Instant::now();
        source.initialize(format(), t0);

        source.on_audio_at(&[0u8; 64], t0);
        source.on_audio_at(&[5u8; 64], t0 + Duration::from_millis(1));
        assert_eq!(sink.inner.total(), 64);
    }
}
