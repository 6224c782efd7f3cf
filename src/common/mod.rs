pub mod config;
pub mod field;
pub mod metrics;
/// Shamir secret sharing over a [`field::PrimeField`].
pub mod share;

/// Type to identify a privacy peer in a session. Peer `i` evaluates sharing polynomials at
/// `α_i = i + 2`.
pub type PartyId = usize;

/// Marks a share that is not available, e.g. because the peer holding it went offline.
pub const MISSING_SHARE: i64 = -1;

/// Result entry of a probabilistic operation (comparison, random bit generation) whose
/// randomised protocol failed. Callers are expected to check for it and retry with fresh
/// randomness.
pub const FAILED_RESULT: i64 = -1;
