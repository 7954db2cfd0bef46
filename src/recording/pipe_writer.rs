/**
 * ============================================================================
 * NON-BLOCKING PIPE WRITER MODULE
 * ============================================================================
 *
 * PURPOSE: Isolate audio producers from a slow or stalled encoder input
 *
 * ARCHITECTURE:
 * - Producers (capture callback, heartbeat, tail fill) call enqueue(), which
 *   pushes onto an unbounded MPSC channel and returns immediately
 * - One dedicated thread waits on the channel (bounded wait for liveness
 *   checks), drains everything queued, then flushes the stream
 * - A failed write or an exited encoder ends the loop quietly; queued data
 *   is discarded and producers are never told
 *
 * SHUTDOWN:
 * shutdown() stops accepting, closes the channel and joins the loop with a
 * bounded wait. Everything queued before shutdown is written first. The
 * stream is handed back to the caller so it can append trailing data and
 * close it only after the loop is gone. A loop still draining when the wait
 * runs out is reported as Detached and stays joinable through await_drain().
 *
 * ============================================================================
 */

use crate::recording::audio_source::AudioSink;
use crate::recording::error::{RecorderError, Result};
use crate::recording::lock_recover;
use crate::recording::logger::SessionLogger;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct WriterCounters {
    enqueued_chunks: AtomicU64,
    enqueued_bytes: AtomicU64,
    written_bytes: AtomicU64,
    discarded_bytes: AtomicU64,
    failed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriterStats {
    pub enqueued_chunks: u64,
    pub enqueued_bytes: u64,
    pub written_bytes: u64,
    pub discarded_bytes: u64,
    pub failed: bool,
}

impl WriterStats {
    // Bytes accepted but neither written nor discarded yet
    pub fn pending_bytes(&self) -> u64 {
        self.enqueued_bytes
            .saturating_sub(self.written_bytes)
            .saturating_sub(self.discarded_bytes)
    }
}

// How the drain loop ended when shutdown() returned
#[derive(Debug)]
pub enum WriterShutdown<W> {
    // Everything queued was written; the stream is handed back
    Drained(W),
    // The loop ended on a failed write or an exited destination
    Stopped,
    // The loop is still draining after the wait
    Detached,
}

impl<W> WriterShutdown<W> {
    pub fn into_stream(self) -> Option<W> {
        match self {
            WriterShutdown::Drained(stream) => Some(stream),
            _ => None,
        }
    }

    pub fn is_detached(&self) -> bool {
        matches!(self, WriterShutdown::Detached)
    }
}

// =============================================================================
// Pipe Writer
// =============================================================================

struct Worker<W> {
    handle: JoinHandle<Option<W>>,
    done: Receiver<()>,
}

pub struct PipeWriter<W: Write + Send + 'static> {
    sender: Mutex<Option<Sender<Vec<u8>>>>,
    accepting: AtomicBool,
    worker: Mutex<Option<Worker<W>>>,
    counters: Arc<WriterCounters>,
    join_timeout: Duration,
    log: SessionLogger,
}

impl<W: Write + Send + 'static> PipeWriter<W> {
    // Start the drain loop over `stream`.
    // `exited` is flipped by whoever observes the destination going away.
    pub fn spawn(
        stream: W,
        wait: Duration,
        join_timeout: Duration,
        exited: Option<Arc<AtomicBool>>,
        log: SessionLogger,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let counters = Arc::new(WriterCounters::default());

        let loop_counters = counters.clone();
        let loop_log = log.clone();
        let handle = std::thread::Builder::new()
            .name("screenmux-writer".to_string())
            .spawn(move || {
                let stream = drain_loop(stream, rx, wait, exited, &loop_counters, &loop_log);
                let _ = done_tx.send(());
                stream
            })
            .map_err(|e| RecorderError::Spawn(format!("Failed to start writer thread: {}", e)))?;

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            accepting: AtomicBool::new(true),
            worker: Mutex::new(Some(Worker { handle, done: done_rx })),
            counters,
            join_timeout,
            log,
        })
    }

    // Queue a chunk for the writer thread. Never blocks on I/O.
    pub fn enqueue(&self, chunk: Vec<u8>) {
        if chunk.is_empty() || !self.accepting.load(Ordering::Acquire) {
            return;
        }

        let len = chunk.len() as u64;
        let sender = lock_recover(&self.sender);
        match sender.as_ref() {
            Some(tx) => {
                if tx.send(chunk).is_ok() {
                    self.counters.enqueued_chunks.fetch_add(1, Ordering::Relaxed);
                    self.counters.enqueued_bytes.fetch_add(len, Ordering::Relaxed);
                } else {
                    // Loop already gone (write failure / encoder exit)
                    self.counters.discarded_bytes.fetch_add(len, Ordering::Relaxed);
                }
            }
            None => {}
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    // Stop accepting, let the loop drain what is queued, join it within the
    // join timeout.
    pub fn shutdown(&self) -> WriterShutdown<W> {
        self.accepting.store(false, Ordering::Release);
        drop(lock_recover(&self.sender).take());

        let outcome = self.await_drain(self.join_timeout);
        if outcome.is_detached() {
            self.log.warn(format_args!(
                "Writer did not finish within {:?}, {} bytes still queued",
                self.join_timeout,
                self.stats().pending_bytes()
            ));
        }
        outcome
    }

    // Wait up to `timeout` for a loop that shutdown() left draining.
    // The worker is kept on timeout so the wait can be retried.
    pub fn await_drain(&self, timeout: Duration) -> WriterShutdown<W> {
        let mut slot = lock_recover(&self.worker);
        let Some(worker) = slot.take() else {
            return WriterShutdown::Stopped;
        };

        match worker.done.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => match worker.handle.join() {
                Ok(Some(stream)) => WriterShutdown::Drained(stream),
                Ok(None) => WriterShutdown::Stopped,
                Err(_) => {
                    self.log.error(format_args!("Writer thread panicked"));
                    WriterShutdown::Stopped
                }
            },
            Err(RecvTimeoutError::Timeout) => {
                *slot = Some(worker);
                WriterShutdown::Detached
            }
        }
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            enqueued_chunks: self.counters.enqueued_chunks.load(Ordering::Relaxed),
            enqueued_bytes: self.counters.enqueued_bytes.load(Ordering::Relaxed),
            written_bytes: self.counters.written_bytes.load(Ordering::Relaxed),
            discarded_bytes: self.counters.discarded_bytes.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

impl<W: Write + Send + 'static> AudioSink for PipeWriter<W> {
    fn push(&self, chunk: Vec<u8>) {
        self.enqueue(chunk);
    }
}

impl<W: Write + Send + 'static> Drop for PipeWriter<W> {
    fn drop(&mut self) {
        // Closing the channel lets a still-running loop drain and exit on its own
        self.accepting.store(false, Ordering::Release);
        drop(lock_recover(&self.sender).take());
    }
}

// =============================================================================
// Drain Loop
// =============================================================================

fn drain_loop<W: Write>(
    mut stream: W,
    rx: Receiver<Vec<u8>>,
    wait: Duration,
    exited: Option<Arc<AtomicBool>>,
    counters: &WriterCounters,
    log: &SessionLogger,
) -> Option<W> {
    let mut cycles: u64 = 0;

    loop {
        if exited.as_ref().is_some_and(|flag| flag.load(Ordering::Acquire)) {
            let dropped = discard_remaining(&rx, counters);
            log.warn(format_args!(
                "Encoder has exited, writer stopping ({} queued bytes discarded)",
                dropped
            ));
            return None;
        }

        match rx.recv_timeout(wait) {
            Ok(first) => {
                let mut ok = write_chunk(&mut stream, first, counters, log);
                while ok {
                    match rx.try_recv() {
                        Ok(chunk) => ok = write_chunk(&mut stream, chunk, counters, log),
                        Err(_) => break,
                    }
                }

                if ok {
                    if let Err(e) = stream.flush() {
                        log.warn(format_args!("Flush failed, encoder stopped consuming: {}", e));
                        ok = false;
                    }
                }

                if !ok {
                    counters.failed.store(true, Ordering::Relaxed);
                    let dropped = discard_remaining(&rx, counters);
                    log.warn(format_args!("Writer stopping after failure ({} queued bytes discarded)", dropped));
                    return None;
                }

                cycles += 1;
                if cycles % 100 == 0 {
                    log.debug(format_args!(
                        "Writer: {} drain cycles, {} bytes written",
                        cycles,
                        counters.written_bytes.load(Ordering::Relaxed)
                    ));
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                // Every queued chunk has been received and written
                if let Err(e) = stream.flush() {
                    log.warn(format_args!("Final flush failed: {}", e));
                }
                log.debug(format_args!(
                    "Writer drained, {} bytes written",
                    counters.written_bytes.load(Ordering::Relaxed)
                ));
                return Some(stream);
            }
        }
    }
}

fn write_chunk<W: Write>(stream: &mut W, chunk: Vec<u8>, counters: &WriterCounters, log: &SessionLogger) -> bool {
    match stream.write_all(&chunk) {
        Ok(()) => {
            counters.written_bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            true
        }
        Err(e) => {
            log.warn(format_args!("Audio write failed ({} bytes): {}", chunk.len(), e));
            counters.discarded_bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            false
        }
    }
}

fn discard_remaining(rx: &Receiver<Vec<u8>>, counters: &WriterCounters) -> u64 {
    let mut dropped = 0;
    for chunk in rx.try_iter() {
        dropped += chunk.len() as u64;
    }
    counters.discarded_bytes.fetch_add(dropped, Ordering::Relaxed);
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::Condvar;
    use std::time::Instant;

    // Writer that blocks every write until the gate opens
    #[derive(Clone)]
    struct GatedWriter {
        gate: Arc<(Mutex<bool>, Condvar)>,
        out: Arc<Mutex<Vec<u8>>>,
    }

    impl GatedWriter {
        fn new() -> Self {
            Self {
                gate: Arc::new((Mutex::new(false), Condvar::new())),
                out: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn open(&self) {
            let (lock, cvar) = &*self.gate;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
    }

    impl Write for GatedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let (lock, cvar) = &*self.gate;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cvar.wait(open).unwrap();
            }
            self.out.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    // Writer that fails with a broken pipe once `limit` bytes were accepted
    struct BrokenAfter {
        limit: usize,
        written: usize,
    }

    impl Write for BrokenAfter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.written + buf.len() > self.limit {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "encoder gone"));
            }
            self.written += buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn test_log() -> SessionLogger {
        SessionLogger::new("test").child("writer")
    }

    #[test]
    fn test_enqueue_never_blocks_on_stalled_consumer() {
        let sink = GatedWriter::new();
        let writer = PipeWriter::spawn(
            sink.clone(),
            Duration::from_millis(100),
            Duration::from_secs(10),
            None,
            test_log(),
        )
        .unwrap();

        let started = Instant::now();
        let mut slowest = Duration::ZERO;
        for i in 0..10_000u32 {
            let before = Instant::now();
            writer.enqueue(vec![(i % 251) as u8; 64]);
            slowest = slowest.max(before.elapsed());
        }
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(slowest < Duration::from_millis(500));

        // Nothing can have been written while the gate is closed
        assert_eq!(sink.out.lock().unwrap().len(), 0);

        sink.open();
        assert!(matches!(writer.shutdown(), WriterShutdown::Drained(_)));

        let stats = writer.stats();
        assert_eq!(stats.enqueued_chunks, 10_000);
        assert_eq!(stats.enqueued_bytes, 640_000);
        assert_eq!(stats.written_bytes, stats.enqueued_bytes);
        assert_eq!(sink.out.lock().unwrap().len(), 640_000);
    }

    #[test]
    fn test_shutdown_drains_before_returning_stream() {
        let sink = GatedWriter::new();
        let writer = PipeWriter::spawn(
            sink.clone(),
            Duration::from_millis(20),
            Duration::from_secs(10),
            None,
            test_log(),
        )
        .unwrap();

        let mut expected = Vec::new();
        for i in 0..50u8 {
            let chunk = vec![i; 100 + i as usize];
            expected.extend_from_slice(&chunk);
            writer.enqueue(chunk);
        }

        // Release the consumer from another thread while shutdown is waiting
        let opener = sink.clone();
        let release = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            opener.open();
        });

        let outcome = writer.shutdown();
        release.join().unwrap();

        assert!(matches!(outcome, WriterShutdown::Drained(_)));
        assert_eq!(*sink.out.lock().unwrap(), expected);
        assert_eq!(writer.stats().written_bytes, expected.len() as u64);
    }

    #[test]
    fn test_enqueue_after_shutdown_is_noop() {
        let writer = PipeWriter::spawn(
            Vec::<u8>::new(),
            Duration::from_millis(10),
            Duration::from_secs(5),
            None,
            test_log(),
        )
        .unwrap();

        writer.enqueue(vec![1, 2, 3, 4]);
        let stream = writer.shutdown().into_stream().unwrap();
        assert_eq!(stream, vec![1, 2, 3, 4]);

        assert!(!writer.is_accepting());
        writer.enqueue(vec![5, 6]);
        assert_eq!(writer.stats().enqueued_bytes, 4);
    }

    #[test]
    fn test_broken_pipe_stops_loop_quietly() {
        let writer = PipeWriter::spawn(
            BrokenAfter { limit: 16, written: 0 },
            Duration::from_millis(10),
            Duration::from_secs(5),
            None,
            test_log(),
        )
        .unwrap();

        for _ in 0..10 {
            writer.enqueue(vec![0u8; 8]);
        }

        // Wait for the loop to hit the failure
        let deadline = Instant::now() + Duration::from_secs(5);
        while !writer.stats().failed && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(writer.stats().failed);

        // Producers keep going without error
        writer.enqueue(vec![0u8; 8]);

        assert!(matches!(writer.shutdown(), WriterShutdown::Stopped));
        let stats = writer.stats();
        assert_eq!(stats.written_bytes, 16);
        assert!(stats.discarded_bytes > 0);
    }

    #[test]
    fn test_exited_encoder_discards_queue() {
        let exited = Arc::new(AtomicBool::new(true));
        let sink = GatedWriter::new();
        let writer = PipeWriter::spawn(
            sink.clone(),
            Duration::from_millis(10),
            Duration::from_secs(5),
            Some(exited),
            test_log(),
        )
        .unwrap();

        writer.enqueue(vec![9u8; 32]);
        assert!(matches!(writer.shutdown(), WriterShutdown::Stopped));
        assert_eq!(sink.out.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_join_timeout_detaches_stalled_loop() {
        let sink = GatedWriter::new();
        let writer = PipeWriter::spawn(
            sink.clone(),
            Duration::from_millis(10),
            Duration::from_millis(100),
            None,
            test_log(),
        )
        .unwrap();

        writer.enqueue(vec![1u8; 8]);
        let started = Instant::now();
        assert!(writer.shutdown().is_detached());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(writer.stats().pending_bytes(), 8);

        // Still nothing while the consumer is stuck
        assert!(writer.await_drain(Duration::from_millis(50)).is_detached());

        // The detached loop is still joinable once the consumer moves
        sink.open();
        let stream = writer.await_drain(Duration::from_secs(5)).into_stream().unwrap();
        assert_eq!(*stream.out.lock().unwrap(), vec![1u8; 8]);
        assert_eq!(writer.stats().pending_bytes(), 0);

        // Nothing left to join
        assert!(matches!(writer.await_drain(Duration::from_millis(10)), WriterShutdown::Stopped));
    }

    // Consumer slower than the join timeout: every queued byte still lands
    #[test]
    fn test_slow_consumer_drains_after_detach() {
        struct SlowWriter {
            out: Arc<Mutex<Vec<u8>>>,
            delay: Duration,
        }

        impl Write for SlowWriter {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                std::thread::sleep(self.delay);
                self.out.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }

            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let out = Arc::new(Mutex::new(Vec::new()));
        let writer = PipeWriter::spawn(
            SlowWriter {
                out: out.clone(),
                delay: Duration::from_millis(20),
            },
            Duration::from_millis(10),
            Duration::from_millis(50),
            None,
            test_log(),
        )
        .unwrap();

        for i in 0..20u8 {
            writer.enqueue(vec![i; 100]);
        }

        assert!(writer.shutdown().is_detached());
        assert!(writer.stats().pending_bytes() > 0);

        assert!(matches!(writer.await_drain(Duration::from_secs(10)), WriterShutdown::Drained(_)));
        let stats = writer.stats();
        assert_eq!(stats.written_bytes, 2_000);
        assert_eq!(stats.pending_bytes(), 0);
        assert_eq!(out.lock().unwrap().len(), 2_000);
    }
}
