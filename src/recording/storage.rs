/**
 * ============================================================================
 * RECORDING STORAGE MODULE
 * ============================================================================
 *
 * PURPOSE: Output locations and metadata persistence for sessions
 *
 * FILE STRUCTURE:
 * <Videos>/screenmux/
 * ├── 2025-01-15/
 * │   ├── session_1736956800_abc123.mp4        # Final container
 * │   ├── session_1736956800_abc123.json       # Metadata sidecar
 * │   ├── session_1736956800_abc123_video.mp4  # merge mode, transient
 * │   └── session_1736956800_abc123_audio.wav  # merge mode, transient
 * └── 2025-01-16/
 *     └── ...
 *
 * ============================================================================
 */

use crate::recording::error::{RecorderError, Result};
use crate::recording::logger::SessionLogger;
use crate::recording::types::SessionMetadata;
use chrono::{NaiveDate, Utc};
use std::path::{Path, PathBuf};

// Every file that belongs to one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    pub output: PathBuf,
    pub video_intermediate: PathBuf,
    pub audio_intermediate: PathBuf,
    pub metadata: PathBuf,
}

// Get the base recordings directory
pub fn default_recordings_dir() -> PathBuf {
    dirs::video_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join("screenmux")
}

// Resolve the recordings root, honouring an explicit override
pub fn recordings_root(override_dir: Option<&Path>) -> PathBuf {
    match override_dir {
        Some(dir) => dir.to_path_buf(),
        None => default_recordings_dir(),
    }
}

// Ensure the recordings directory exists for a date
pub fn ensure_recording_dir(root: &Path, date: &NaiveDate) -> Result<PathBuf> {
    let date_dir = root.join(date.format("%Y-%m-%d").to_string());
    std::fs::create_dir_all(&date_dir)?;
    Ok(date_dir)
}

// Generate a unique session ID
pub fn generate_session_id() -> String {
    let timestamp = Utc::now().timestamp();
    let random_suffix: String = (0..6)
        .map(|_| {
            let byte: u8 = rand::random();
            format!("{:02x}", byte)
        })
        .collect();
    format!("session_{}_{}", timestamp, random_suffix)
}

pub fn session_paths(dir: &Path, session_id: &str, container: &str) -> SessionPaths {
    SessionPaths {
        output: dir.join(format!("{}.{}", session_id, container)),
        video_intermediate: dir.join(format!("{}_video.{}", session_id, container)),
        audio_intermediate: dir.join(format!("{}_audio.wav", session_id)),
        metadata: dir.join(format!("{}.json", session_id)),
    }
}

// Save session metadata to JSON file
pub fn save_metadata(path: &Path, metadata: &SessionMetadata, log: &SessionLogger) -> Result<()> {
    let contents = serde_json::to_string_pretty(metadata)
        .map_err(|e| RecorderError::Config(format!("Failed to serialize metadata: {}", e)))?;

    std::fs::write(path, contents)?;

    log.info(format_args!("Saved metadata to {:?}", path));
    Ok(())
}

// Load session metadata from JSON file
pub fn load_metadata(path: &Path) -> Result<SessionMetadata> {
    let contents = std::fs::read_to_string(path)?;

    serde_json::from_str(&contents)
        .map_err(|e| RecorderError::Config(format!("Failed to parse metadata: {}", e)))
}

// Remove a transient file, logging rather than failing
pub fn remove_intermediate(path: &Path, log: &SessionLogger) {
    match std::fs::remove_file(path) {
        Ok(()) => log.debug(format_args!("Removed intermediate {:?}", path)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log.warn(format_args!("Failed to remove intermediate {:?}: {}", path, e)),
    }
}
