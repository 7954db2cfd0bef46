/**
 * ============================================================================
 * RECORDING CONFIG MODULE
 * ============================================================================
 *
 * PURPOSE: Configuration persistence and validation for the recorder
 *
 * FUNCTIONALITY:
 * - Load/save recorder configuration to disk
 * - Default configuration when none exists
 * - JSON-based storage in the user config directory
 * - Reject values that would break the timing model before a session starts
 *
 * ============================================================================
 */

use crate::recording::error::{RecorderError, Result};
use crate::recording::types::RecorderConfig;
use std::path::{Path, PathBuf};

// Presets accepted by the x264/x265 family of encoders
pub const VALID_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

// Get config file path
pub fn config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join("screenmux").join("recorder_config.json"))
        .ok_or_else(|| RecorderError::Config("No user config directory on this platform".to_string()))
}

// Load configuration from the default location
pub fn load_config() -> Result<RecorderConfig> {
    load_config_from(&config_path()?)
}

// Load configuration from disk
pub fn load_config_from(path: &Path) -> Result<RecorderConfig> {
    if !path.exists() {
        log::info!("No recorder config found at {:?}, using defaults", path);
        return Ok(RecorderConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .map_err(|e| RecorderError::Config(format!("Failed to read config: {}", e)))?;

    let config: RecorderConfig = serde_json::from_str(&contents)
        .map_err(|e| RecorderError::Config(format!("Failed to parse config: {}", e)))?;

    config.validate()?;

    log::info!("Loaded recorder config from {:?}", path);
    Ok(config)
}

// Save configuration to disk
pub fn save_config_to(path: &Path, config: &RecorderConfig) -> Result<()> {
    config.validate()?;

    // Ensure directory exists
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| RecorderError::Config(format!("Failed to create config dir: {}", e)))?;
    }

    let contents = serde_json::to_string_pretty(config)
        .map_err(|e| RecorderError::Config(format!("Failed to serialize config: {}", e)))?;

    std::fs::write(path, contents)
        .map_err(|e| RecorderError::Config(format!("Failed to write config: {}", e)))?;

    log::info!("Saved recorder config to {:?}", path);
    Ok(())
}

impl RecorderConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1..=120).contains(&self.framerate) {
            return Err(RecorderError::InvalidConfig(format!(
                "framerate must be within 1..=120, got {}",
                self.framerate
            )));
        }

        if !VALID_PRESETS.contains(&self.preset.as_str()) {
            return Err(RecorderError::InvalidConfig(format!("unknown preset '{}'", self.preset)));
        }

        if self.container.trim().is_empty() {
            return Err(RecorderError::InvalidConfig("container extension is empty".to_string()));
        }

        let timeline = &self.timeline;
        if timeline.inline_gap_ms == 0 || timeline.idle_gap_ms == 0 || timeline.tail_gap_ms == 0 {
            return Err(RecorderError::InvalidConfig("gap thresholds must be non-zero".to_string()));
        }
        if timeline.heartbeat_interval_ms == 0 || timeline.heartbeat_interval_ms >= timeline.idle_gap_ms {
            return Err(RecorderError::InvalidConfig(format!(
                "heartbeat interval ({} ms) must be non-zero and shorter than the idle threshold ({} ms)",
                timeline.heartbeat_interval_ms, timeline.idle_gap_ms
            )));
        }
        if !timeline.stop_padding_secs.is_finite() || timeline.stop_padding_secs < 0.0 {
            return Err(RecorderError::InvalidConfig(format!(
                "stop padding must be a non-negative number of seconds, got {}",
                timeline.stop_padding_secs
            )));
        }

        if self.shutdown.size_stable_reads == 0 {
            return Err(RecorderError::InvalidConfig("size_stable_reads must be at least 1".to_string()));
        }

        Ok(())
    }
}
