/**
 * ============================================================================
 * RECORDING MODULE
 * ============================================================================
 * 
 * PURPOSE: Time-aligned screen + system audio recording into one container
 * 
 * SUBMODULES:
 * - timeline: Byte-counted audio clock shared by every audio producer
 * - audio_source: Silence-filling source + heartbeat thread
 * - loopback: OS loopback capture collaborator (cpal) and silent fallback
 * - pipe_writer: Non-blocking queue + drain thread into the encoder input
 * - ffmpeg: Encoder binary resolution and command topology
 * - monitor: Encoder stderr reader (progress, liveness)
 * - process: Bounded waits, forced termination, orphan cleanup
 * - encoder: External encoder lifecycle (pipe and merge modes)
 * - wav / validate: Merge intermediates and output container probe
 * - native / video: In-process multiplexer backend and frame pacing
 * - backend: Tagged variant over the two encoder backends
 * - session: Lifecycle management (start / stop / finish)
 * - config / storage / types / logger / error: Ambient plumbing
 * 
 * ARCHITECTURE:
 * Four execution contexts run per session:
 * 1. OS audio callback: on_audio() pads gaps, forwards real audio
 * 2. Heartbeat thread: pads the timeline while the device is silent
 * 3. Writer thread: drains queued audio into the encoder's input
 * 4. Controlling thread: start / stop / finish
 * Only the timeline mutex is shared between producers. Producers never
 * block on I/O.
 * 
 * OUTPUT FORMAT:
 * - <session_id>.mp4: Final container (video + aligned audio)
 * - <session_id>.json: Metadata sidecar
 * - merge mode only: <session_id>_video.mp4 + <session_id>_audio.wav,
 *   removed after a successful merge pass
 * 
 * ============================================================================
 */

pub mod audio_source;
pub mod backend;
pub mod config;
pub mod encoder;
pub mod error;
pub mod ffmpeg;
pub mod logger;
pub mod loopback;
pub mod monitor;
pub mod native;
pub mod pipe_writer;
pub mod process;
pub mod session;
pub mod storage;
pub mod timeline;
pub mod types;
pub mod validate;
pub mod video;
pub mod wav;

use std::sync::{Mutex, MutexGuard};

// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
