//! Session configuration for a privacy peer.
use crate::common::{field::DEFAULT_FIELD_SIZE, share::shamir::SharingParams};
use rand::{rngs::OsRng, rngs::StdRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown random algorithm {0:?}")]
    UnknownRandomAlgorithm(String),
    #[error("invalid seed in random algorithm {0:?}")]
    InvalidSeed(String),
}

/// Configuration consumed once when a privacy peer session is set up.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub field_size: i64,
    /// `None` selects the default degree `(peers - 1) / 2`.
    pub degree: Option<usize>,
    pub peers: usize,
    /// Name resolved through [`RandomAlgorithm::from_str`].
    pub random_algorithm: String,
    /// Number of round protocol tasks sharing one engine. Defaults to one per counterpart.
    pub protocol_threads: Option<usize>,
    /// How long a receive may block before the counterpart is considered offline.
    pub receive_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            field_size: DEFAULT_FIELD_SIZE,
            degree: None,
            peers: 3,
            random_algorithm: RandomAlgorithm::ChaCha20.to_string(),
            protocol_threads: None,
            receive_timeout_ms: 30_000,
        }
    }
}

impl SessionConfig {
    pub fn new(peers: usize) -> Self {
        Self {
            peers,
            ..Self::default()
        }
    }

    pub fn sharing_params(&self) -> SharingParams {
        SharingParams::new(self.field_size, self.degree, self.peers)
    }

    pub fn protocol_threads(&self) -> usize {
        self.protocol_threads
            .unwrap_or(self.peers.saturating_sub(1))
            .max(1)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn random_algorithm(&self) -> Result<RandomAlgorithm, ConfigError> {
        self.random_algorithm.parse()
    }
}

/// The generators a session can be configured with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RandomAlgorithm {
    /// ChaCha20 seeded from the operating system. The default.
    ChaCha20,
    /// The operating system generator, queried for every draw.
    Os,
    /// Deterministic generator for tests. Not suitable for sharing real secrets.
    Seeded(u64),
}

impl RandomAlgorithm {
    pub fn build(&self) -> Box<dyn RngCore + Send> {
        match self {
            RandomAlgorithm::ChaCha20 => Box::new(ChaCha20Rng::from_entropy()),
            RandomAlgorithm::Os => Box::new(OsRng),
            RandomAlgorithm::Seeded(seed) => {
                warn!(seed, "using a deterministic random generator");
                Box::new(StdRng::seed_from_u64(*seed))
            }
        }
    }
}

impl FromStr for RandomAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "chacha20" | "chacha" => Ok(RandomAlgorithm::ChaCha20),
            "os" => Ok(RandomAlgorithm::Os),
            _ => match name.strip_prefix("seeded:") {
                Some(seed) => seed
                    .parse()
                    .map(RandomAlgorithm::Seeded)
                    .map_err(|_| ConfigError::InvalidSeed(s.to_string())),
                None => Err(ConfigError::UnknownRandomAlgorithm(s.to_string())),
            },
        }
    }
}

impl fmt::Display for RandomAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RandomAlgorithm::ChaCha20 => write!(f, "chacha20"),
            RandomAlgorithm::Os => write!(f, "os"),
            RandomAlgorithm::Seeded(seed) => write!(f, "seeded:{seed}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_algorithm_registry() {
        assert_eq!("chacha20".parse(), Ok(RandomAlgorithm::ChaCha20));
        assert_eq!(" OS ".parse(), Ok(RandomAlgorithm::Os));
        assert_eq!("seeded:17".parse(), Ok(RandomAlgorithm::Seeded(17)));
        assert_eq!(
            "seeded:x".parse::<RandomAlgorithm>(),
            Err(ConfigError::InvalidSeed("seeded:x".to_string()))
        );
        assert!(matches!(
            "mersenne".parse::<RandomAlgorithm>(),
            Err(ConfigError::UnknownRandomAlgorithm(_))
        ));
        for algorithm in [
            RandomAlgorithm::ChaCha20,
            RandomAlgorithm::Os,
            RandomAlgorithm::Seeded(5),
        ] {
            assert_eq!(algorithm.to_string().parse(), Ok(algorithm));
        }
    }

    #[test]
    fn seeded_generators_agree() {
        let mut a = RandomAlgorithm::Seeded(9).build();
        let mut b = RandomAlgorithm::Seeded(9).build();
        assert_eq!(a.next_u64(), b.next_u64());
    }

    #[test]
    fn defaults() {
        let config = SessionConfig::new(5);
        assert_eq!(config.protocol_threads(), 4);
        assert_eq!(config.random_algorithm(), Ok(RandomAlgorithm::ChaCha20));
        assert_eq!(
            config.sharing_params(),
            SharingParams::new(DEFAULT_FIELD_SIZE, None, 5)
        );
        assert_eq!(SessionConfig::new(1).protocol_threads(), 1);
        assert_eq!(config.receive_timeout(), Duration::from_secs(30));
    }
}
