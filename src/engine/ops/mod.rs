//! Concrete operation kinds. The communication primitives ([`Reconstruction`],
//! [`Multiplication`], [`RandomSharing`]) exchange shares directly; every other kind is a
//! composite of them.
pub mod bitwise;
pub mod bloom;
pub mod less_than;
pub mod multiplication;
pub mod power;
pub mod random_bits;
pub mod random_sharing;
pub mod reconstruction;

pub use bitwise::{BitwiseCompare, CompareDirection};
pub use bloom::{BloomCardinality, BloomCombine, BloomMode};
pub use less_than::{LessThan, LessThanKeys, Lsb};
pub use multiplication::Multiplication;
pub use power::{Equal, Power};
pub use random_bits::{
    split_numbers, BatchGenerateBitwiseRandomNumbers, BitwiseRandomNumbers, RandomBits,
};
pub use random_sharing::RandomSharing;
pub use reconstruction::Reconstruction;
