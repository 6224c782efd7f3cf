/// Prime field arithmetic and Shamir secret sharing over a runtime modulus, together with the
/// session configuration, the round metrics and the sentinel values marking missing shares and
/// failed comparisons.
pub mod common;

/// The round-based operation engine. Operations are small state machines that advance by one
/// round of share exchange per step; the engine schedules them in bounded-parallelism batches
/// and (de)multiplexes the flat share buffers exchanged with every remote peer.
pub mod engine;

/// Point-to-point connection layer used by the round protocol.
pub mod network;

/// The per-peer-pair round protocol driving an [`engine::OperationEngine`] across the wire.
pub mod protocol;

pub use common::{
    config::{RandomAlgorithm, SessionConfig},
    field::PrimeField,
    share::{
        shamir::{ShamirSharing, SharingParams},
        ShareError,
    },
    PartyId, FAILED_RESULT, MISSING_SHARE,
};
pub use engine::{EngineError, OperationEngine};
pub use protocol::{
    session::{PrivacyPeerSession, SessionEvent},
    ProtocolError, RoundProtocol,
};
