//! Arithmetic in the prime field `Z_p` for a modulus chosen at runtime.
//!
//! Field elements are plain `i64` values in `[0, p)`. The modulus may be as large as the
//! largest 63-bit prime, in which case intermediate sums and products no longer fit into an
//! `i64`; those operations are routed through arbitrary precision integers instead. Whether
//! that is necessary is decided once, when the field is created.

use crate::common::share::ShareError;
use num_bigint_dig::{prime::probably_prime, BigUint};
use num_traits::ToPrimitive;
use tracing::warn;

/// Default field size used by privacy peers.
pub const DEFAULT_FIELD_SIZE: i64 = 1_401_085_391;

/// The largest prime below `2^63`, i.e. the largest field size that keeps every element
/// representable as a non-negative `i64`.
pub const LARGEST_63_BIT_PRIME: i64 = 9_223_372_036_854_775_783;

/// Number of Miller-Rabin rounds used when validating a field size.
const PRIMALITY_ROUNDS: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrimeField {
    p: i64,
    /// `(p-1) + (p-1)` does not fit into an `i64`.
    wide_addition: bool,
    /// `(p-1) * (p-1)` does not fit into an `i64`.
    wide_multiplication: bool,
}

impl PrimeField {
    /// Creates the field `Z_p`.
    ///
    /// The primality of `p` is only checked on a best-effort basis: a composite modulus is
    /// logged but accepted, since square roots and inverses are merely undefined for it.
    ///
    /// # Errors
    /// - `ShareError::InvalidFieldSize` if `p` is not in `(2, LARGEST_63_BIT_PRIME]`.
    pub fn new(p: i64) -> Result<Self, ShareError> {
        if p <= 2 || p > LARGEST_63_BIT_PRIME {
            return Err(ShareError::InvalidFieldSize(p));
        }
        if !probably_prime(&BigUint::from(p as u64), PRIMALITY_ROUNDS) {
            warn!(field_size = p, "field size is not prime");
        }

        let max = p - 1;
        Ok(Self {
            p,
            wide_addition: max.checked_add(max).is_none(),
            wide_multiplication: max.checked_mul(max).is_none(),
        })
    }

    pub fn modulus(&self) -> i64 {
        self.p
    }

    /// Returns `(wide_addition, wide_multiplication)`, the cached overflow routing decision.
    pub fn overflow_routing(&self) -> (bool, bool) {
        (self.wide_addition, self.wide_multiplication)
    }

    /// Number of bits needed to represent `p - 1`.
    pub fn bit_length(&self) -> usize {
        (64 - ((self.p - 1) as u64).leading_zeros()) as usize
    }

    /// Maps any integer into `[0, p)`.
    pub fn reduce(&self, value: i64) -> i64 {
        value.rem_euclid(self.p)
    }

    pub fn add(&self, a: i64, b: i64) -> i64 {
        if self.wide_addition {
            self.reduce_wide(BigUint::from(a as u64) + BigUint::from(b as u64))
        } else {
            (a + b) % self.p
        }
    }

    pub fn subtract(&self, a: i64, b: i64) -> i64 {
        // a - b lies in (-p, p) for reduced operands, which never overflows.
        let difference = a - b;
        if difference < 0 {
            difference + self.p
        } else {
            difference
        }
    }

    pub fn negate(&self, a: i64) -> i64 {
        self.subtract(0, a)
    }

    pub fn multiply(&self, a: i64, b: i64) -> i64 {
        if self.wide_multiplication {
            self.reduce_wide(BigUint::from(a as u64) * BigUint::from(b as u64))
        } else {
            (a * b) % self.p
        }
    }

    /// Sums a sequence of field elements.
    pub fn sum(&self, values: impl IntoIterator<Item = i64>) -> i64 {
        values.into_iter().fold(0, |acc, v| self.add(acc, v))
    }

    /// Binary exponentiation `base^exponent mod p`.
    pub fn pow(&self, base: i64, mut exponent: u64) -> i64 {
        let mut result = 1 % self.p;
        let mut square = self.reduce(base);
        while exponent > 0 {
            if exponent & 1 == 1 {
                result = self.multiply(result, square);
            }
            square = self.multiply(square, square);
            exponent >>= 1;
        }
        result
    }

    /// Multiplicative inverse using the extended Euclidean algorithm.
    ///
    /// # Errors
    /// - `ShareError::NoInverse` if `a ≡ 0 (mod p)` or `a` shares a factor with a composite `p`.
    pub fn inverse(&self, a: i64) -> Result<i64, ShareError> {
        let a = self.reduce(a);
        let (mut old_r, mut r) = (a as i128, self.p as i128);
        let (mut old_s, mut s) = (1i128, 0i128);
        while r != 0 {
            let quotient = old_r / r;
            (old_r, r) = (r, old_r - quotient * r);
            (old_s, s) = (s, old_s - quotient * s);
        }
        if old_r != 1 {
            return Err(ShareError::NoInverse(a));
        }
        Ok(old_s.rem_euclid(self.p as i128) as i64)
    }

    /// Euler's criterion `a^((p-1)/2)`: `1` for quadratic residues, `p-1` for non-residues and
    /// `0` for zero.
    pub fn legendre(&self, a: i64) -> i64 {
        self.pow(a, ((self.p - 1) / 2) as u64)
    }

    /// Square root using Tonelli-Shanks. Returns `0` if `a` has no square root, or if `p` is a
    /// composite modulus without a non-residue to seed the search.
    ///
    /// Of the two roots `r` and `p - r` the one produced is deterministic, so every peer
    /// computing the root of the same public value obtains the same result.
    pub fn sqrt(&self, a: i64) -> i64 {
        let a = self.reduce(a);
        if a == 0 || self.legendre(a) != 1 {
            return 0;
        }
        if self.p % 4 == 3 {
            return self.pow(a, ((self.p + 1) / 4) as u64);
        }

        // p - 1 = q * 2^s with q odd
        let mut q = self.p - 1;
        let mut s = 0u32;
        while q % 2 == 0 {
            q /= 2;
            s += 1;
        }
        let Some(z) = (2..self.p).find(|z| self.legendre(*z) == self.p - 1) else {
            return 0;
        };

        let mut m = s;
        let mut c = self.pow(z, q as u64);
        let mut t = self.pow(a, q as u64);
        let mut r = self.pow(a, ((q + 1) / 2) as u64);
        while t != 1 {
            let mut i = 0;
            let mut t_pow = t;
            while t_pow != 1 {
                t_pow = self.multiply(t_pow, t_pow);
                i += 1;
                if i == m {
                    return 0;
                }
            }
            let b = self.pow(c, 1u64 << (m - i - 1));
            m = i;
            c = self.multiply(b, b);
            t = self.multiply(t, c);
            r = self.multiply(r, b);
        }
        r
    }

    fn reduce_wide(&self, value: BigUint) -> i64 {
        let reduced = value % BigUint::from(self.p as u64);
        // always in [0, p) and p fits into an i64
        reduced.to_i64().unwrap_or_default()
    }
}

impl Default for PrimeField {
    fn default() -> Self {
        Self {
            p: DEFAULT_FIELD_SIZE,
            wide_addition: false,
            wide_multiplication: false,
        }
    }
}
