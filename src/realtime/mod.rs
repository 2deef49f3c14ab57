//! Speech model connection: event vocabulary, wire dialects, transport and
//! turn-taking

pub mod dialect;
pub mod events;
pub mod loopback;
pub mod transport;
pub mod turn;

pub use dialect::Dialect;
pub use events::{InboundEvent, OutboundEvent};
pub use loopback::{LoopbackConnector, RemoteEnd};
pub use transport::{Connection, Connector, SessionSettings, TransportSession, WsConnector};
pub use turn::{CaptureCommand, Phase, Transition, TurnInput, TurnStateMachine};
