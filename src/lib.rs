//! Talkbridge - realtime voice conversations with a speech model
//!
//! Bridges a client's microphone and speaker to a realtime speech model:
//! - Two capture strategies: local end-of-speech detection or a continuous stream
//! - Turn-taking state machine with barge-in
//! - Tool calls executed mid-dialogue, with per-owner credit accounting
//! - Reconnecting transport that replays the recent transcript
//! - Authenticated WebSocket control channel for clients
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use talkbridge::{Config, SessionManager, SessionOptions};
//!
//! let config = Config::load()?;
//! let manager = SessionManager::new(Arc::new(config), connector, tools, ledger);
//! let session = manager.start(SessionOptions::new("kitchen", "alice")).await?;
//! session.push_audio(&pcm16);
//! ```

// Core modules
pub mod types;
pub mod error;
pub mod config;
pub mod credentials;
pub mod voice;
pub mod realtime;
pub mod credits;
pub mod tools;
pub mod session;
pub mod server;
pub mod cli;

pub use config::{CaptureMode, Config};

pub use credentials::{delete_api_key, get_api_key, set_api_key};

pub use credits::{CreditContext, CreditLedger, InMemoryLedger};

pub use realtime::{LoopbackConnector, Phase, TurnStateMachine, WsConnector};

pub use session::{Notification, Session, SessionManager, SessionOptions, SessionRegistry};

pub use tools::{ToolInvocationBridge, ToolRegistry};

pub use server::{start as start_server, ServerState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Realtime voice conversation bridge", NAME, VERSION)
}
