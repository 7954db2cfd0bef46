/**
 * ============================================================================
 * VIDEO MODULE
 * ============================================================================
 *
 * PURPOSE: Frame pacing and frame hygiene for the native backend
 *
 * FUNCTIONALITY:
 * - FrameClock: timestamp = frame index x nominal frame duration, computed
 *   from the index each time so rounding never accumulates
 * - FrameNormalizer: reuse the last good frame for empty captures, skip
 *   frames of the wrong size so the stream never desyncs
 * - DisplayCapture (feature "screen-capture"): scap display capture loop
 *
 * ============================================================================
 */

use crate::recording::logger::SessionLogger;
use std::time::Duration;

// =============================================================================
// Frame Clock
// =============================================================================

#[derive(Debug, Clone)]
pub struct FrameClock {
    fps: u32,
    index: u64,
}

impl FrameClock {
    pub fn new(fps: u32) -> Self {
        Self { fps: fps.max(1), index: 0 }
    }

    pub fn timestamp_of(&self, index: u64) -> Duration {
        let nanos = index as u128 * 1_000_000_000 / self.fps as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }

    pub fn frame_duration(&self) -> Duration {
        self.timestamp_of(1)
    }

    // Timestamp and duration of the next frame
    pub fn tick(&mut self) -> (Duration, Duration) {
        let start = self.timestamp_of(self.index);
        let end = self.timestamp_of(self.index + 1);
        self.index += 1;
        (start, end - start)
    }

    pub fn frames(&self) -> u64 {
        self.index
    }
}

// =============================================================================
// Frame Normalizer
// =============================================================================

#[derive(Debug)]
pub struct FrameNormalizer {
    expected_len: usize,
    last_good: Option<Vec<u8>>,
    empty_reused: u64,
    wrong_size_skipped: u64,
    log: SessionLogger,
}

impl FrameNormalizer {
    // BGRA = 4 bytes per pixel
    pub fn bgra(width: u32, height: u32, log: SessionLogger) -> Self {
        Self::with_len(width as usize * height as usize * 4, log)
    }

    pub fn with_len(expected_len: usize, log: SessionLogger) -> Self {
        Self {
            expected_len,
            last_good: None,
            empty_reused: 0,
            wrong_size_skipped: 0,
            log,
        }
    }

    // Frame to emit for this capture, or None to skip it
    pub fn normalize(&mut self, data: Vec<u8>) -> Option<&[u8]> {
        if data.len() == self.expected_len {
            self.last_good = Some(data);
        } else if data.is_empty() {
            // Empty frame from the capturer: reuse the last good one
            self.empty_reused += 1;
        } else {
            self.wrong_size_skipped += 1;
            if self.wrong_size_skipped <= 3 {
                self.log.warn(format_args!(
                    "Wrong frame size! Expected {} bytes, got {} bytes",
                    self.expected_len,
                    data.len()
                ));
            }
            return None;
        }
        self.last_good.as_deref()
    }

    pub fn empty_reused(&self) -> u64 {
        self.empty_reused
    }

    pub fn wrong_size_skipped(&self) -> u64 {
        self.wrong_size_skipped
    }
}

// =============================================================================
// Display Capture
// =============================================================================

#[cfg(feature = "screen-capture")]
pub use display::{DisplayCapture, DisplayCaptureStats};

#[cfg(feature = "screen-capture")]
mod display {
    use super::FrameNormalizer;
    use crate::recording::error::{RecorderError, Result};
    use crate::recording::logger::SessionLogger;
    use scap::{
        capturer::{Capturer, Options},
        frame::{Frame, FrameType},
        Target,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{Duration, Instant};

    const FIRST_FRAME_TIMEOUT: Duration = Duration::from_secs(15);

    #[derive(Debug, Clone, Default)]
    pub struct DisplayCaptureStats {
        pub frames: u64,
        pub empty_reused: u64,
        pub wrong_size_skipped: u64,
    }

    pub struct DisplayCapture {
        capturer: Capturer,
        display_index: u32,
        width: u32,
        height: u32,
        first_frame: Option<Vec<u8>>,
        log: SessionLogger,
    }

    impl DisplayCapture {
        // Start capturing and block until the first frame fixes the dimensions
        pub fn open(display_index: u32, fps: u32, log: SessionLogger) -> Result<Self> {
            if !scap::is_supported() {
                return Err(RecorderError::CaptureUnavailable(
                    "Screen capture not supported on this platform".to_string(),
                ));
            }
            if !scap::has_permission() {
                return Err(RecorderError::CaptureUnavailable(
                    "Screen recording permission not granted".to_string(),
                ));
            }

            let target = scap::get_all_targets()
                .into_iter()
                .filter(|t| matches!(t, Target::Display(_)))
                .nth(display_index as usize)
                .ok_or_else(|| RecorderError::CaptureUnavailable(format!("Display {} not found", display_index)))?;

            let options = Options {
                fps,
                target: Some(target),
                show_cursor: true,
                show_highlight: false,
                excluded_targets: None,
                output_type: FrameType::BGRAFrame,
                output_resolution: scap::capturer::Resolution::Captured,
                ..Default::default()
            };

            let mut capturer = Capturer::build(options).map_err(|e| {
                RecorderError::CaptureUnavailable(format!("Failed to create capturer for display {}: {:?}", display_index, e))
            })?;
            capturer.start_capture();

            let (width, height, first) = wait_for_first_frame(&mut capturer, display_index, &log)?;
            log.info(format_args!("Display {}: Capture initialized: {}x{}", display_index, width, height));

            Ok(Self {
                capturer,
                display_index,
                width,
                height,
                first_frame: Some(first),
                log,
            })
        }

        pub fn dimensions(&self) -> (u32, u32) {
            (self.width, self.height)
        }

        // Feed frames to `on_frame` until `shutdown` is set or it returns false
        pub fn run<F>(mut self, shutdown: &AtomicBool, mut on_frame: F) -> DisplayCaptureStats
        where
            F: FnMut(&[u8]) -> bool,
        {
            let mut normalizer = FrameNormalizer::bgra(self.width, self.height, self.log.clone());
            let mut stats = DisplayCaptureStats::default();

            if let Some(first) = self.first_frame.take() {
                if let Some(frame) = normalizer.normalize(first) {
                    if on_frame(frame) {
                        stats.frames += 1;
                    }
                }
            }

            while !shutdown.load(Ordering::SeqCst) {
                match self.capturer.get_next_frame() {
                    Ok(frame) => {
                        let Some(data) = frame_bytes(frame) else {
                            continue;
                        };
                        let Some(frame) = normalizer.normalize(data) else {
                            continue;
                        };
                        if !on_frame(frame) {
                            break;
                        }
                        stats.frames += 1;
                    }
                    Err(e) => {
                        self.log.error(format_args!("Display {}: Capture error: {:?}", self.display_index, e));
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }

            self.capturer.stop_capture();
            stats.empty_reused = normalizer.empty_reused();
            stats.wrong_size_skipped = normalizer.wrong_size_skipped();
            self.log.info(format_args!(
                "Display {}: Capture finished: {} frames ({} reused, {} skipped)",
                self.display_index,
                stats.frames,
                stats.empty_reused,
                stats.wrong_size_skipped
            ));
            stats
        }
    }

    fn frame_bytes(frame: Frame) -> Option<Vec<u8>> {
        match frame {
            Frame::BGRA(f) => Some(f.data),
            Frame::BGR0(f) => Some(f.data),
            Frame::BGRx(f) => Some(f.data),
            _ => None,
        }
    }

    fn wait_for_first_frame(
        capturer: &mut Capturer,
        display_index: u32,
        log: &SessionLogger,
    ) -> Result<(u32, u32, Vec<u8>)> {
        let start = Instant::now();
        let mut attempt = 0;

        while start.elapsed() < FIRST_FRAME_TIMEOUT {
            attempt += 1;
            match capturer.get_next_frame() {
                Ok(frame) => {
                    let (width, height, data) = match frame {
                        Frame::BGRA(f) => (f.width as u32, f.height as u32, f.data),
                        Frame::BGR0(f) => (f.width as u32, f.height as u32, f.data),
                        Frame::BGRx(f) => (f.width as u32, f.height as u32, f.data),
                        _ => continue,
                    };
                    if data.is_empty() {
                        continue;
                    }
                    return Ok((width, height, data));
                }
                Err(_) => {
                    if attempt % 50 == 0 {
                        log.warn(format_args!(
                            "Display {}: Still waiting for first frame ({:.1}s elapsed)",
                            display_index,
                            start.elapsed().as_secs_f32()
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }

        Err(RecorderError::CaptureUnavailable(format!(
            "Display {}: Timeout waiting for first frame after {:.1}s",
            display_index,
            FIRST_FRAME_TIMEOUT.as_secs_f32()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_clock_no_drift() {
        let mut clock = FrameClock::new(30);
        let mut total = Duration::ZERO;
        for _ in 0..3_000 {
            let (ts, dur) = clock.tick();
            assert_eq!(ts, total);
            total += dur;
        }
        // 3000 frames at 30 fps is exactly 100 seconds
        assert_eq!(total, Duration::from_secs(100));
        assert_eq!(clock.frames(), 3_000);
    }

    #[test]
    fn test_frame_clock_index_math() {
        let clock = FrameClock::new(60);
        assert_eq!(clock.timestamp_of(60), Duration::from_secs(1));
        assert_eq!(clock.frame_duration(), Duration::from_nanos(16_666_666));
    }

    #[test]
    fn test_normalizer_reuse_and_skip() {
        let mut normalizer = FrameNormalizer::bgra(2, 2, SessionLogger::new("test"));

        // Nothing to reuse yet
        assert!(normalizer.normalize(Vec::new()).is_none());

        let good = vec![9u8; 16];
        assert_eq!(normalizer.normalize(good.clone()), Some(&good[..]));
        assert_eq!(normalizer.normalize(Vec::new()), Some(&good[..]));
        assert!(normalizer.normalize(vec![1u8; 5]).is_none());

        assert_eq!(normalizer.empty_reused(), 2);
        assert_eq!(normalizer.wrong_size_skipped(), 1);
    }
}
