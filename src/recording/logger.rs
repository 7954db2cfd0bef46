/**
 * ============================================================================
 * SESSION LOGGER MODULE
 * ============================================================================
 *
 * PURPOSE: Logger instance owned by a recording session
 *
 * Every component receives a SessionLogger at construction instead of
 * logging through a process-wide handle. Records go through the `log`
 * facade with a per-component target (screenmux::<component>) and are
 * prefixed with the session id, so output from concurrent sessions can be
 * told apart.
 *
 * ============================================================================
 */

use log::Level;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SessionLogger {
    session_id: Arc<str>,
    target: Arc<str>,
}

impl SessionLogger {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: Arc::from(session_id),
            target: Arc::from("screenmux::session"),
        }
    }

    // Logger for a sub-component of the same session
    pub fn child(&self, component: &str) -> Self {
        Self {
            session_id: self.session_id.clone(),
            target: Arc::from(format!("screenmux::{}", component).as_str()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        let target: &str = &self.target;
        log::log!(target: target, level, "[{}] {}", self.session_id, args);
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }
}
