pub mod fake_network;

use crate::common::PartyId;
use async_trait::async_trait;
use thiserror::Error;

/// Error type for network related issues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("party {0} is not part of the network")]
    PartyNotFound(PartyId),
    #[error("the connection to party {0} is closed")]
    NotConnected(PartyId),
}

/// What a receive yields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Data(Vec<u8>),
    /// Substituted for the message of a peer that disconnected or did not answer in time.
    Dummy,
}

impl Message {
    pub fn is_dummy(&self) -> bool {
        matches!(self, Message::Dummy)
    }
}

/// Point-to-point connections of one privacy peer to every other peer.
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Returns the ID of the local peer.
    fn id(&self) -> PartyId;

    /// Sends `payload` to `peer` and returns the number of bytes sent.
    async fn send(&self, peer: PartyId, payload: Vec<u8>) -> Result<usize, NetworkError>;

    /// Blocks until the next message of `peer` arrives. Never blocks forever: a peer that is
    /// gone yields [`Message::Dummy`].
    async fn receive(&self, peer: PartyId) -> Result<Message, NetworkError>;
}
