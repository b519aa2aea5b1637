//! # Spindle
//!
//! Client-side SPDY/3.1 session multiplexer.
//!
//! Spindle turns one connected duplex byte stream into many concurrent
//! request/response streams: it frames and deframes the SPDY/3.1 wire
//! protocol, enforces the dual-level (session and per-stream)
//! credit-based flow control, tracks concurrency limits, accepts
//! server-pushed streams, and drains gracefully on GOAWAY.
//!
//! The transport is abstract (`AsyncRead + AsyncWrite`); TLS, connection
//! establishment, and cross-origin pooling live outside this crate.

// Wire protocol
pub mod codec;
pub mod frame;
pub mod header;

// Session core
pub mod config;
pub mod error;
pub mod origin;
pub mod request;
pub mod response;
pub mod session;
pub mod settings;

mod stream;

// Re-exports for convenient access
pub use codec::{FrameDecoder, FrameEncoder, FrameEvent};
pub use config::SessionConfig;
pub use error::{Error, Result};
pub use frame::{GoAwayStatus, StreamStatus};
pub use origin::Origin;
pub use request::Request;
pub use response::{PushedResponse, Response};
pub use session::{CloseOutcome, RequestHandle, Session, SessionHandle};
pub use settings::{SettingsStore, SpdySettings};
