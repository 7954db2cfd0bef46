/**
 * ============================================================================
 * ENCODER BACKEND MODULE
 * ============================================================================
 *
 * PURPOSE: One interface over the two ways a session produces its container
 *
 * - External: ffmpeg subprocess (pipe or merge mode)
 * - Native: host multiplexer fed in-process
 *
 * The variant is picked from configuration when the session starts.
 *
 * ============================================================================
 */

use crate::recording::audio_source::AudioSink;
use crate::recording::encoder::{EncoderController, FinishReport};
use crate::recording::error::Result;
use crate::recording::native::{NativeBackend, NativeReport};
use crate::recording::types::BackendKind;
use std::sync::Arc;

pub enum EncoderBackend {
    External(EncoderController),
    Native(NativeBackend),
}

#[derive(Debug, Clone)]
pub enum BackendReport {
    External(FinishReport),
    Native(NativeReport),
}

impl BackendReport {
    pub fn forced_termination(&self) -> bool {
        match self {
            BackendReport::External(report) => report.forced_termination,
            BackendReport::Native(_) => false,
        }
    }
}

impl EncoderBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            EncoderBackend::External(_) => BackendKind::External,
            EncoderBackend::Native(_) => BackendKind::Native,
        }
    }

    pub fn audio_sink(&self) -> Arc<dyn AudioSink> {
        match self {
            EncoderBackend::External(encoder) => encoder.audio_sink(),
            EncoderBackend::Native(native) => native.audio_sink(),
        }
    }

    pub fn request_stop(&self) -> Result<()> {
        match self {
            EncoderBackend::External(encoder) => encoder.request_stop(),
            EncoderBackend::Native(native) => {
                native.request_stop();
                Ok(())
            }
        }
    }

    // quick_exit only changes the external encoder's escalation ladder
    pub fn finish(&self, quick_exit: bool) -> Result<BackendReport> {
        match self {
            EncoderBackend::External(encoder) => encoder.finish(quick_exit).map(BackendReport::External),
            EncoderBackend::Native(native) => native.finish().map(BackendReport::Native),
        }
    }
}
