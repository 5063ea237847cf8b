//! Lumi Voice Library Crate
//!
//! The real-time voice session manager: microphone capture, gap-free
//! playback of agent speech, the promotion tool protocol and the session
//! actor that wires them to a Gemini Live channel. The `lumi` binary is a thin
//! wrapper around this library.

pub mod audio_utils;
pub mod backend;
pub mod capture;
pub mod config;
pub mod error;
pub mod observer;
pub mod playback;
pub mod session;
pub mod tool_protocol;

pub use error::SessionError;
pub use observer::{ChannelObserver, SessionObserver};
pub use session::SessionManager;
