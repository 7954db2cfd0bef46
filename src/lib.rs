pub mod recording;

pub use recording::backend::EncoderBackend;
pub use recording::config::{config_path, load_config, load_config_from, save_config_to};
pub use recording::error::{RecorderError, Result};
pub use recording::logger::SessionLogger;
pub use recording::session::RecordingSession;
pub use recording::types::{
    AudioFormat, BackendKind, EncoderState, MuxMode, RecorderConfig, SessionMetadata,
};
