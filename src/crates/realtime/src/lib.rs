//! Window-scoped realtime fanout bus for chainflow.
//!
//! Multiplexes orchestrator and agent state changes onto long-lived
//! bidirectional client connections. Every connection is tagged with a
//! [`WindowType`]; messages are typed by [`MessageType`] and delivered in
//! send order per connection. A background reaper drops idle connections,
//! and a failing send disconnects only the failing consumer.

pub mod bus;
pub mod error;
pub mod message;
pub mod transport;

pub use bus::{
    CommandSink, Connection, ConnectionStats, FanoutBus, InboundHandler, DEFAULT_IDLE_THRESHOLD,
};
pub use error::{RealtimeError, Result};
pub use message::{BusMessage, MessageType, WindowType};
pub use transport::{ChannelTransport, Transport, WsTransport};
