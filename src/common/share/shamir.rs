//! This file contains the Shamir secret sharing scheme used by every operation of the engine.
//!
//! A secret `s` is the constant term of a random polynomial `f` of degree `t`; peer `i` holds
//! `f(α_i)` with the public evaluation point `α_i = i + 2`. Any `t + 1` shares reconstruct the
//! secret, products of two shares lie on a polynomial of degree `2t` and need `2t + 1`.
use crate::common::{field::PrimeField, share::ShareError, MISSING_SHARE};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::debug;

/// Parameters of a sharing instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingParams {
    /// The prime modulus `p`.
    pub field_size: i64,
    /// Degree `t` of the sharing polynomials. `None` selects `(m - 1) / 2`, the largest degree
    /// that still allows multiplications.
    pub degree: Option<usize>,
    /// Number of privacy peers `m`.
    pub peers: usize,
}

impl SharingParams {
    pub fn new(field_size: i64, degree: Option<usize>, peers: usize) -> Self {
        Self {
            field_size,
            degree,
            peers,
        }
    }
}

/// Canonical key of an availability bitmask: bit `i` is set iff the share of peer `i` is present.
type AvailabilityKey = Vec<u64>;

#[derive(Debug)]
pub struct ShamirSharing {
    params: SharingParams,
    field: PrimeField,
    degree: usize,
    alphas: Vec<i64>,
    /// `matrix[i][j] = α_i^j mod p`.
    matrix: Vec<Vec<i64>>,
    /// Lagrange weights per availability bitmask. Writes are idempotent, so concurrent
    /// computations of the same key are harmless.
    weights: RwLock<HashMap<AvailabilityKey, Arc<Vec<i64>>>>,
}

impl ShamirSharing {
    /// Creates and initializes a sharing instance.
    pub fn new(params: SharingParams) -> Result<Self, ShareError> {
        let mut sharing = Self {
            params,
            field: PrimeField::default(),
            degree: 0,
            alphas: Vec::new(),
            matrix: Vec::new(),
            weights: RwLock::new(HashMap::new()),
        };
        sharing.init()?;
        Ok(sharing)
    }

    /// Takes effect on the next call to [`ShamirSharing::init`].
    pub fn set_field_size(&mut self, field_size: i64) {
        self.params.field_size = field_size;
    }

    /// Takes effect on the next call to [`ShamirSharing::init`].
    pub fn set_degree(&mut self, degree: Option<usize>) {
        self.params.degree = degree;
    }

    /// Takes effect on the next call to [`ShamirSharing::init`].
    pub fn set_number_of_peers(&mut self, peers: usize) {
        self.params.peers = peers;
    }

    /// Validates the parameters and computes the alpha points and the sharing matrix. Cached
    /// Lagrange weights are dropped, since they belong to the previous peer set.
    ///
    /// # Errors
    /// - `ShareError::InvalidFieldSize` if the field size is out of range.
    /// - `ShareError::InvalidDegree` if `t >= m`.
    /// - `ShareError::InvalidInput` if there are no peers or the field is too small to give
    ///   every peer a distinct evaluation point.
    pub fn init(&mut self) -> Result<(), ShareError> {
        let field = PrimeField::new(self.params.field_size)?;
        let peers = self.params.peers;
        if peers == 0 {
            return Err(ShareError::InvalidInput(
                "at least one peer is required".to_string(),
            ));
        }
        let size = field.modulus();
        if peers as i64 + 1 >= size {
            return Err(ShareError::InvalidInput(format!(
                "field of size {size} is too small for {peers} peers"
            )));
        }
        let degree = self.params.degree.unwrap_or((peers - 1) / 2);
        if degree >= peers {
            return Err(ShareError::InvalidDegree { degree, peers });
        }

        let alphas: Vec<i64> = (0..peers).map(|i| i as i64 + 2).collect();
        let matrix = alphas
            .iter()
            .map(|alpha| {
                let mut row = Vec::with_capacity(peers);
                let mut power = 1;
                for _ in 0..peers {
                    row.push(power);
                    power = field.multiply(power, *alpha);
                }
                row
            })
            .collect();

        self.field = field;
        self.degree = degree;
        self.alphas = alphas;
        self.matrix = matrix;
        self.weights
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        debug!(
            field_size = self.field.modulus(),
            degree, peers, "initialized Shamir sharing"
        );
        Ok(())
    }

    pub fn params(&self) -> &SharingParams {
        &self.params
    }

    pub fn field(&self) -> &PrimeField {
        &self.field
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn peers(&self) -> usize {
        self.alphas.len()
    }

    pub fn alphas(&self) -> &[i64] {
        &self.alphas
    }

    pub fn matrix(&self) -> &[Vec<i64>] {
        &self.matrix
    }

    /// Degree-`2t` products can only be reduced again if `m >= 2t + 1`.
    pub fn supports_multiplication(&self) -> bool {
        self.peers() > 2 * self.degree
    }

    /// Generates `m` shares of `secret`, one per peer, using a random polynomial of degree `t`
    /// such that `f(0) = secret`.
    pub fn generate_share<R: Rng + ?Sized>(&self, secret: i64, rng: &mut R) -> Vec<i64> {
        let p = self.field.modulus();
        let mut coefficients = Vec::with_capacity(self.degree + 1);
        coefficients.push(self.field.reduce(secret));
        for _ in 0..self.degree {
            coefficients.push(rng.gen_range(0..p));
        }

        let field = &self.field;
        let mut shares = Vec::with_capacity(self.peers());
        for row in &self.matrix {
            let mut share = 0;
            for (power, coefficient) in row.iter().zip(&coefficients) {
                share = field.add(share, field.multiply(*power, *coefficient));
            }
            shares.push(share);
        }
        shares
    }

    /// Shares several secrets at once. The result is indexed `[peer][secret]`, i.e. row `i` is
    /// everything peer `i` receives.
    pub fn generate_shares<R: Rng + ?Sized>(&self, secrets: &[i64], rng: &mut R) -> Vec<Vec<i64>> {
        let mut per_peer = vec![Vec::with_capacity(secrets.len()); self.peers()];
        for secret in secrets {
            for (peer, share) in self.generate_share(*secret, rng).into_iter().enumerate() {
                per_peer[peer].push(share);
            }
        }
        per_peer
    }

    /// Reconstructs the secret from one share per peer, [`MISSING_SHARE`] marking absent ones.
    ///
    /// # Errors
    /// - `ShareError::LengthMismatch` if `shares` does not hold exactly `m` entries.
    /// - `ShareError::InsufficientShares` if fewer than `t + 1` shares (`2t + 1` when
    ///   `is_multiplication` is set) are available.
    pub fn interpolate(&self, shares: &[i64], is_multiplication: bool) -> Result<i64, ShareError> {
        if shares.len() != self.peers() {
            return Err(ShareError::LengthMismatch {
                expected: self.peers(),
                actual: shares.len(),
            });
        }
        let available: Vec<bool> = shares.iter().map(|s| *s != MISSING_SHARE).collect();
        let count = available.iter().filter(|a| **a).count();
        let required = if is_multiplication {
            2 * self.degree + 1
        } else {
            self.degree + 1
        };
        if count < required {
            return Err(ShareError::InsufficientShares {
                available: count,
                required,
            });
        }

        let weights = self.lagrange_weights(&available)?;
        let field = &self.field;
        let mut secret = 0;
        for (share, weight) in shares.iter().zip(weights.iter()) {
            if *share != MISSING_SHARE {
                secret = field.add(secret, field.multiply(field.reduce(*share), *weight));
            }
        }
        Ok(secret)
    }

    /// Lagrange weights for evaluating at zero the polynomial through the available points.
    /// Unavailable peers get weight zero.
    pub fn lagrange_weights(&self, available: &[bool]) -> Result<Arc<Vec<i64>>, ShareError> {
        if available.len() != self.peers() {
            return Err(ShareError::LengthMismatch {
                expected: self.peers(),
                actual: available.len(),
            });
        }
        let key = availability_key(available);
        if let Some(weights) = self
            .weights
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Ok(Arc::clone(weights));
        }

        let weights = Arc::new(self.compute_weights(available)?);
        self.weights
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&weights));
        Ok(weights)
    }

    fn compute_weights(&self, available: &[bool]) -> Result<Vec<i64>, ShareError> {
        let field = &self.field;
        let mut weights = vec![0; self.peers()];
        for i in (0..self.peers()).filter(|i| available[*i]) {
            let mut numerator = 1;
            let mut denominator = 1;
            for j in (0..self.peers()).filter(|j| *j != i && available[*j]) {
                numerator = field.multiply(numerator, self.alphas[j]);
                let difference = field.subtract(self.alphas[j], self.alphas[i]);
                denominator = field.multiply(denominator, difference);
            }
            weights[i] = field.multiply(numerator, field.inverse(denominator)?);
        }
        Ok(weights)
    }
}

fn availability_key(available: &[bool]) -> AvailabilityKey {
    let mut key = vec![0u64; available.len().div_ceil(64)];
    for (i, present) in available.iter().enumerate() {
        if *present {
            key[i / 64] |= 1 << (i % 64);
        }
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::field::DEFAULT_FIELD_SIZE;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    fn sharing(peers: usize, degree: usize) -> ShamirSharing {
        ShamirSharing::new(SharingParams::new(DEFAULT_FIELD_SIZE, Some(degree), peers)).unwrap()
    }

    fn keep(shares: &[i64], indices: &[usize]) -> Vec<i64> {
        let mut kept = vec![MISSING_SHARE; shares.len()];
        for i in indices {
            kept[*i] = shares[*i];
        }
        kept
    }

    #[test]
    fn should_recover_secret_from_subsets() {
        let sharing = sharing(5, 2);
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let shares = sharing.generate_share(42, &mut rng);
        assert_eq!(shares.len(), 5);
        assert_eq!(sharing.interpolate(&shares, false).unwrap(), 42);
        for indices in [[0, 2, 4], [1, 3, 4]] {
            let subset = keep(&shares, &indices);
            assert_eq!(sharing.interpolate(&subset, false).unwrap(), 42);
        }
    }

    #[test]
    fn insufficient_shares_boundary() {
        let sharing = sharing(5, 2);
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let shares = sharing.generate_share(42, &mut rng);
        assert_eq!(
            sharing.interpolate(&keep(&shares, &[0, 1]), false),
            Err(ShareError::InsufficientShares {
                available: 2,
                required: 3
            })
        );
        let subset = keep(&shares, &[0, 1, 2]);
        assert!(sharing.interpolate(&subset, false).is_ok());

        // degree 2t = 4 needs all five
        assert_eq!(
            sharing.interpolate(&keep(&shares, &[0, 1, 2, 3]), true),
            Err(ShareError::InsufficientShares {
                available: 4,
                required: 5
            })
        );
        assert_eq!(sharing.interpolate(&shares, true).unwrap(), 42);
    }

    #[test]
    fn local_product_reconstructs_with_multiplication_weights() {
        let sharing = sharing(5, 2);
        let field = sharing.field().clone();
        let mut rng = ChaCha20Rng::seed_from_u64(3);
        let a = sharing.generate_share(1234, &mut rng);
        let b = sharing.generate_share(5678, &mut rng);
        let product: Vec<i64> = (0..a.len()).map(|i| field.multiply(a[i], b[i])).collect();
        assert_eq!(
            sharing.interpolate(&product, true).unwrap(),
            field.multiply(1234, 5678)
        );
    }

    #[test]
    fn lagrange_weights_are_cached_and_deterministic() {
        let sharing = sharing(7, 3);
        let available = [true, false, true, true, false, true, true];
        let first = sharing.lagrange_weights(&available).unwrap();
        let second = sharing.lagrange_weights(&available).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first, second);
        assert_eq!(first[1], 0);
        assert_eq!(first[4], 0);
    }

    #[test]
    fn default_degree_and_validation() {
        let params = SharingParams::new(DEFAULT_FIELD_SIZE, None, 7);
        let sharing = ShamirSharing::new(params).unwrap();
        assert_eq!(sharing.degree(), 3);
        assert!(sharing.supports_multiplication());
        assert_eq!(sharing.alphas(), &[2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(sharing.matrix()[1][2], 9);

        assert_eq!(
            ShamirSharing::new(SharingParams::new(DEFAULT_FIELD_SIZE, Some(4), 4)).unwrap_err(),
            ShareError::InvalidDegree {
                degree: 4,
                peers: 4
            }
        );
        assert!(ShamirSharing::new(SharingParams::new(5, None, 4)).is_err());
        assert!(!self::sharing(4, 2).supports_multiplication());
    }

    #[test]
    fn reinit_applies_new_parameters() {
        let mut sharing = sharing(5, 2);
        let before = sharing.field().overflow_routing();
        sharing.init().unwrap();
        assert_eq!(sharing.field().overflow_routing(), before);

        sharing.set_number_of_peers(3);
        sharing.set_degree(None);
        sharing.set_field_size(1_000_003);
        sharing.init().unwrap();
        assert_eq!(sharing.peers(), 3);
        assert_eq!(sharing.degree(), 1);
        assert_eq!(sharing.field().modulus(), 1_000_003);
    }

    #[test]
    fn generate_shares_is_indexed_by_peer() {
        let sharing = sharing(4, 1);
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let per_peer = sharing.generate_shares(&[7, 8, 9], &mut rng);
        assert_eq!(per_peer.len(), 4);
        for (k, secret) in [7, 8, 9].iter().enumerate() {
            let column: Vec<i64> = per_peer.iter().map(|row| row[k]).collect();
            assert_eq!(sharing.interpolate(&column, false).unwrap(), *secret);
        }
    }

    proptest! {
        #[test]
        fn round_trip_with_any_sufficient_subset(
            secret in 0..DEFAULT_FIELD_SIZE,
            peers in 1usize..10,
            seed in any::<u64>(),
            drop_mask in any::<u16>(),
        ) {
            let sharing = sharing(peers, (peers - 1) / 2);
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let shares = sharing.generate_share(secret, &mut rng);
            prop_assert_eq!(sharing.interpolate(&shares, false).unwrap(), secret);

            let kept: Vec<usize> = (0..peers).filter(|i| drop_mask & (1 << i) == 0).collect();
            let subset = keep(&shares, &kept);
            if kept.len() > sharing.degree() {
                prop_assert_eq!(sharing.interpolate(&subset, false).unwrap(), secret);
            } else {
                let is_insufficient = matches!(
                    sharing.interpolate(&subset, false),
                    Err(ShareError::InsufficientShares { .. })
                );
                prop_assert!(is_insufficient);
            }
        }
    }
}
