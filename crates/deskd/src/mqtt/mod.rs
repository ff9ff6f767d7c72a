mod backoff;
mod client;
pub mod discovery;
mod session;
mod topics;

pub use backoff::Backoff;
pub use client::InboundMessage;
pub use client::OFFLINE;
pub use client::ONLINE;
pub use client::RumqttcTransport;
pub use client::Transport;
pub use client::TransportError;
pub use client::TransportEvent;
pub use session::BrokerSession;
pub use session::ConnectionState;
pub use session::Outbound;
pub use session::SessionHandle;
pub use session::relay_commands;
pub use topics::Topics;
