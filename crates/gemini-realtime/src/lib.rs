//! Gemini Live Realtime Client
//!
//! A small client for the Gemini Live `BidiGenerateContent` WebSocket protocol:
//!
//! - `types`: serde models of the client and server frames.
//! - `client`: the `LiveConnector` seam, the duplex `LiveChannel` it hands out,
//!   and the WebSocket-backed `GeminiLiveClient`.
//! - `error`: failures while opening or using a channel.

pub mod client;
pub mod error;
pub mod types;

pub use client::{GeminiLiveClient, LiveChannel, LiveConnector, LiveEvent, LiveSender};
pub use error::LiveError;
