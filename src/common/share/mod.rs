pub mod shamir;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShareError {
    #[error("too few shares to reconstruct ({available} available, {required} required)")]
    InsufficientShares { available: usize, required: usize },
    #[error("invalid field size {0}")]
    InvalidFieldSize(i64),
    #[error("invalid degree {degree} for {peers} peers")]
    InvalidDegree { degree: usize, peers: usize },
    #[error("{0} has no multiplicative inverse")]
    NoInverse(i64),
    #[error("expected {expected} shares, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}
