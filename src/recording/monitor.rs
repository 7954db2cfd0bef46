/**
 * ============================================================================
 * ENCODER MONITOR MODULE
 * ============================================================================
 *
 * PURPOSE: Drain the encoder's diagnostic stream without blocking anyone
 *
 * An undrained stderr pipe eventually fills and stalls the encoder, so a
 * dedicated thread reads it for the whole life of the process:
 * - Lines are split on both '\r' (progress redraws) and '\n'
 * - Progress lines are parsed and logged at most once per interval
 * - The last few non-progress lines are kept for error reports
 * - EOF means the encoder closed its side: the `exited` flag flips, which
 *   the pipe writer uses as its liveness check
 *
 * ============================================================================
 */

use crate::recording::error::{RecorderError, Result};
use crate::recording::lock_recover;
use crate::recording::logger::SessionLogger;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const TAIL_LINES: usize = 20;
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

static PROGRESS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(frame|fps|size|time|bitrate|speed)=\s*([^\s]+)").expect("valid progress regex")
});

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Progress {
    pub frame: Option<u64>,
    pub fps: Option<f64>,
    pub time: Option<String>,
    pub bitrate: Option<String>,
    pub speed: Option<String>,
}

// Parse an encoder status line; None unless it carries a time= field
pub fn parse_progress(line: &str) -> Option<Progress> {
    let mut progress = Progress::default();
    let mut has_time = false;

    for caps in PROGRESS_RE.captures_iter(line) {
        let value = &caps[2];
        match &caps[1] {
            "frame" => progress.frame = value.parse().ok(),
            "fps" => progress.fps = value.parse().ok(),
            "time" => {
                has_time = true;
                progress.time = Some(value.to_string());
            }
            "bitrate" => progress.bitrate = Some(value.to_string()),
            "speed" => progress.speed = Some(value.to_string()),
            _ => {}
        }
    }

    if has_time { Some(progress) } else { None }
}

#[derive(Debug, Default)]
struct MonitorShared {
    tail: Mutex<VecDeque<String>>,
    last_progress: Mutex<Option<Progress>>,
}

pub struct EncoderMonitor {
    exited: Arc<AtomicBool>,
    shared: Arc<MonitorShared>,
    handle: Option<JoinHandle<()>>,
    done: Receiver<()>,
}

impl EncoderMonitor {
    pub fn spawn<R: Read + Send + 'static>(reader: R, log: SessionLogger) -> Result<Self> {
        let exited = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(MonitorShared::default());
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let thread_exited = exited.clone();
        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("screenmux-monitor".to_string())
            .spawn(move || {
                read_loop(reader, &thread_shared, &log);
                thread_exited.store(true, Ordering::Release);
                log.debug(format_args!("Encoder diagnostic stream closed"));
                let _ = done_tx.send(());
            })
            .map_err(|e| RecorderError::Spawn(format!("Failed to start monitor thread: {}", e)))?;

        Ok(Self {
            exited,
            shared,
            handle: Some(handle),
            done: done_rx,
        })
    }

    // Flag set once the encoder closes its diagnostic stream
    pub fn exited_flag(&self) -> Arc<AtomicBool> {
        self.exited.clone()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }

    pub fn recent_lines(&self) -> Vec<String> {
        lock_recover(&self.shared.tail).iter().cloned().collect()
    }

    pub fn last_progress(&self) -> Option<Progress> {
        lock_recover(&self.shared.last_progress).clone()
    }

    // Wait for the reader to hit EOF. A grandchild holding the pipe open
    // would keep it alive forever, so the wait is bounded.
    pub fn join(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        match self.done.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                true
            }
            Err(mpsc::RecvTimeoutError::Timeout) => false,
        }
    }
}

fn read_loop<R: Read>(mut reader: R, shared: &MonitorShared, log: &SessionLogger) {
    let mut buf = [0u8; 4096];
    let mut line: Vec<u8> = Vec::with_capacity(256);
    let mut last_logged: Option<Instant> = None;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log.debug(format_args!("Encoder diagnostic read failed: {}", e));
                break;
            }
        };

        for &byte in &buf[..n] {
            if byte == b'\n' || byte == b'\r' {
                handle_line(&line, shared, log, &mut last_logged);
                line.clear();
            } else {
                line.push(byte);
            }
        }
    }

    handle_line(&line, shared, log, &mut last_logged);
}

fn handle_line(raw: &[u8], shared: &MonitorShared, log: &SessionLogger, last_logged: &mut Option<Instant>) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return;
    }

    if let Some(progress) = parse_progress(text) {
        let due = last_logged.map_or(true, |at| at.elapsed() >= PROGRESS_LOG_INTERVAL);
        if due {
            log.info(format_args!(
                "Encoder progress: time={} fps={} bitrate={} speed={}",
                progress.time.as_deref().unwrap_or("?"),
                progress.fps.map(|f| format!("{:.1}", f)).unwrap_or_else(|| "?".to_string()),
                progress.bitrate.as_deref().unwrap_or("?"),
                progress.speed.as_deref().unwrap_or("?")
            ));
            *last_logged = Some(Instant::now());
        }
        *lock_recover(&shared.last_progress) = Some(progress);
        return;
    }

    log.debug(format_args!("ffmpeg: {}", text));
    let mut tail = lock_recover(&shared.tail);
    if tail.len() == TAIL_LINES {
        tail.pop_front();
    }
    tail.push_back(text.to_string());
}
