/**
 * ============================================================================
 * RECORDING ERROR MODULE
 * ============================================================================
 *
 * PURPOSE: Error taxonomy for the recording core
 *
 * CATEGORIES:
 * - Fatal-at-init: encoder binary missing, capture device unavailable, spawn
 * - Invalid use: state machine violations, bad configuration
 * - Merge: second encoder pass failed (intermediates are preserved)
 *
 * Runtime degradation (broken pipe, failed chunk write, validation warnings)
 * is logged where it happens and never surfaces as an error.
 *
 * ============================================================================
 */

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("Encoder binary not available: {0}")]
    EncoderNotFound(String),

    #[error("Audio capture unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("Failed to spawn encoder: {0}")]
    Spawn(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Merge pass failed: {0}")]
    Merge(String),

    #[error("Multiplexer error: {0}")]
    Muxer(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RecorderError>;
