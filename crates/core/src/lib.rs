//! Lumi Core
//!
//! Provider-agnostic domain types for the Lumi onboarding voice agent: the
//! onboarding stage catalog, the per-session configuration handed to the voice
//! session manager, the promotion tool the remote agent may call, and the
//! event surface reported back to the application layer.

pub mod events;
pub mod session_config;
pub mod stage;
pub mod tools;

pub use events::{ConnectionState, SessionEvent};
pub use session_config::SessionConfig;
pub use stage::{Promotion, Stage, StageCatalog, StageTrack};
pub use tools::{ToolCall, ToolResponse, ToolResult};
