//! Session configuration.

use crate::frame::DEFAULT_INITIAL_WINDOW_SIZE;

/// Tunables for a single SPDY session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Session-level receive window advertised to the peer. Clamped to at
    /// least the protocol default of 65,535 (the startup WINDOW_UPDATE can
    /// only add credit, never remove it).
    pub session_receive_window: i32,
    /// Per-stream receive window, advertised via SETTINGS at startup.
    pub stream_receive_window: i32,
    /// How many server-pushed streams we accept concurrently.
    pub max_push_streams: u32,
    /// Upper bound on the decoded size of a single header block.
    pub max_header_size: usize,
    /// Size of the single input buffer reads land in.
    pub read_buffer_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_receive_window: DEFAULT_INITIAL_WINDOW_SIZE,
            stream_receive_window: DEFAULT_INITIAL_WINDOW_SIZE,
            max_push_streams: 0,
            max_header_size: 32 * 1024,
            read_buffer_size: 64 * 1024,
        }
    }
}

impl SessionConfig {
    /// Returns the configuration with window sizes clamped to valid ranges.
    pub(crate) fn validated(mut self) -> Self {
        self.session_receive_window = self.session_receive_window.max(DEFAULT_INITIAL_WINDOW_SIZE);
        self.stream_receive_window = self.stream_receive_window.max(1);
        self
    }
}
