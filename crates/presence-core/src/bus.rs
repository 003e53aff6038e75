//! Broadcast bus abstraction.
//!
//! The daemon's in-process hub is the native implementation. A browser host
//! would meet the same contract with one `BroadcastChannel` per channel name.
//!
//! Delivery is at most once to every other member of the channel, never to the
//! sender, with no ordering between different senders and no history.
//! Receiving is push-based: the host feeds deliveries to
//! [`PresenceContext::handle_message`](crate::PresenceContext::handle_message).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Channel closed: {0}")]
    Closed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Sending half of a joined broadcast channel.
pub trait Bus: Send + Sync {
    /// Name of the joined channel
    fn channel(&self) -> &str;

    /// Post one message to every other member of the channel.
    ///
    /// Must not block. Lost messages are tolerated by the protocol.
    fn send(&self, data: &[u8]) -> Result<(), BusError>;
}
