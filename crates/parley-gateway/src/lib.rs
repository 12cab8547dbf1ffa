//! WebSocket voice gateway.
//!
//! Each client socket gets a [`Session`] that streams its audio to STT, sends
//! final transcripts with the conversation history to the LLM, and speaks the
//! reply back through TTS. The [`SessionRegistry`] owns the live sessions and
//! the profile new ones start from.

pub mod connection;
pub mod connector;
pub mod hot_reload;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod registry;
pub mod server;
pub mod session;
pub mod state;
pub mod turn;

#[cfg(test)]
mod testing;

pub use connector::{Connector, LiveConnector};
pub use registry::SessionRegistry;
pub use server::{serve, start_gateway};
pub use session::{Outbound, Session, SessionHandle, SessionState, SessionStatus};
pub use state::GatewayState;
