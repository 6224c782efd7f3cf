//! Generation of shared random bits and of bitwise shared random field elements.
use crate::{
    common::FAILED_RESULT,
    engine::{
        operation::{composite_operation, Composite, Operation, StepContext, SubOperations},
        ops::{
            bitwise::{BitwiseCompare, CompareDirection},
            multiplication::Multiplication,
            random_sharing::RandomSharing,
            reconstruction::Reconstruction,
        },
        EngineError,
    },
};
use itertools::izip;
use tracing::debug;

/// Margin applied on top of the expected number of draws per attempt.
const OVERSAMPLING: f64 = 1.1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BitsStage {
    Start,
    Shared,
    Squared,
    Opened,
}

/// Shares of uniformly random bits.
///
/// For a random shared `a`, `a²` is opened and `b = √(a²)` computed in the clear. `a / b` is
/// then `±1` with equal probability, so `(a / b + 1) / 2` is a shared random bit. A draw where
/// `a² = 0` cannot be used and yields [`FAILED_RESULT`].
pub struct RandomBits {
    count: usize,
    stage: BitsStage,
    values: Vec<i64>,
    children: SubOperations,
    result: Option<Vec<i64>>,
}

impl RandomBits {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            stage: BitsStage::Start,
            values: Vec::new(),
            children: SubOperations::default(),
            result: None,
        }
    }
}

impl Composite for RandomBits {
    fn children(&self) -> &SubOperations {
        &self.children
    }

    fn children_mut(&mut self) -> &mut SubOperations {
        &mut self.children
    }

    fn advance(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        let field = ctx.sharing.field();
        match self.stage {
            BitsStage::Start => {
                // 1. Jointly random a.
                self.children.set(RandomSharing::new(self.count));
                self.stage = BitsStage::Shared;
            }
            BitsStage::Shared => {
                // 2. a².
                self.values = self.children.result(0).to_vec();
                self.children
                    .set(Multiplication::from_vectors(&self.values, &self.values));
                self.stage = BitsStage::Squared;
            }
            BitsStage::Squared => {
                // 3. Open a².
                let squares = self.children.result(0).to_vec();
                self.children.set(Reconstruction::new(squares));
                self.stage = BitsStage::Opened;
            }
            BitsStage::Opened => {
                // 4. (a / √(a²) + 1) / 2
                let two_inverse = field.inverse(2)?;
                let mut bits = Vec::with_capacity(self.count);
                for (a, square) in izip!(&self.values, self.children.result(0)) {
                    let root = field.sqrt(*square);
                    if root == 0 {
                        bits.push(FAILED_RESULT);
                        continue;
                    }
                    let sign = field.multiply(*a, field.inverse(root)?);
                    bits.push(field.multiply(field.add(sign, 1), two_inverse));
                }
                self.children.clear();
                self.result = Some(bits);
            }
        }
        Ok(())
    }

    fn result(&self) -> Option<&[i64]> {
        self.result.as_deref()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NumbersStage {
    Start,
    Bits,
    Compared,
    Opened,
}

/// One attempt at generating `count` bitwise shared random numbers below `p`.
///
/// Draws `l` random bits per number, where `l` is the bit length of `p`, and keeps the numbers
/// whose bits are all valid and whose value is below `p`. The result holds the accepted numbers
/// one after the other as `[r, r_0, ..., r_{l-1}]`; it may be shorter than requested.
pub struct BitwiseRandomNumbers {
    count: usize,
    stage: NumbersStage,
    width: usize,
    candidates: Vec<Vec<i64>>,
    children: SubOperations,
    result: Option<Vec<i64>>,
}

impl BitwiseRandomNumbers {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            stage: NumbersStage::Start,
            width: 0,
            candidates: Vec::new(),
            children: SubOperations::default(),
            result: None,
        }
    }
}

impl Composite for BitwiseRandomNumbers {
    fn children(&self) -> &SubOperations {
        &self.children
    }

    fn children_mut(&mut self) -> &mut SubOperations {
        &mut self.children
    }

    fn advance(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        let field = ctx.sharing.field();
        match self.stage {
            NumbersStage::Start => {
                self.width = field.bit_length();
                let bits = self.count * self.width;
                self.children.set(RandomBits::new(bits));
                self.stage = NumbersStage::Bits;
            }
            NumbersStage::Bits => {
                self.candidates = self
                    .children
                    .result(0)
                    .chunks(self.width)
                    .filter(|bits| !bits.contains(&FAILED_RESULT))
                    .map(<[i64]>::to_vec)
                    .collect();
                let comparisons = self
                    .candidates
                    .iter()
                    .map(|bits| {
                        Box::new(BitwiseCompare::new(
                            bits.clone(),
                            field.modulus(),
                            CompareDirection::SharedLessThanPublic,
                        )) as Box<dyn Operation>
                    })
                    .collect();
                self.children.replace(comparisons);
                self.stage = NumbersStage::Compared;
            }
            NumbersStage::Compared => {
                let below_modulus = self.children.first_results();
                self.children.set(Reconstruction::new(below_modulus));
                self.stage = NumbersStage::Opened;
            }
            NumbersStage::Opened => {
                let accepted = self.children.result(0).to_vec();
                let mut numbers = Vec::new();
                for (bits, valid) in izip!(&self.candidates, &accepted) {
                    if *valid != 1 {
                        continue;
                    }
                    let value = bits
                        .iter()
                        .rev()
                        .fold(0, |acc, bit| field.add(field.add(acc, acc), *bit));
                    numbers.push(value);
                    numbers.extend_from_slice(bits);
                }
                debug!(
                    requested = self.count,
                    accepted = numbers.len() / (self.width + 1),
                    "bitwise random number attempt finished"
                );
                self.children.clear();
                self.candidates.clear();
                self.result = Some(numbers);
            }
        }
        Ok(())
    }

    fn result(&self) -> Option<&[i64]> {
        self.result.as_deref()
    }
}

/// Generates at least `count` bitwise shared random numbers, repeating attempts until enough
/// have been accepted. Each attempt oversamples by the expected rejection rate.
pub struct BatchGenerateBitwiseRandomNumbers {
    count: usize,
    width: usize,
    collected: Vec<Vec<i64>>,
    attempts: usize,
    children: SubOperations,
    result: Option<Vec<i64>>,
}

impl BatchGenerateBitwiseRandomNumbers {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            width: 0,
            collected: Vec::new(),
            attempts: 0,
            children: SubOperations::default(),
            result: None,
        }
    }
}

impl Composite for BatchGenerateBitwiseRandomNumbers {
    fn children(&self) -> &SubOperations {
        &self.children
    }

    fn children_mut(&mut self) -> &mut SubOperations {
        &mut self.children
    }

    fn advance(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        let field = ctx.sharing.field();
        self.width = field.bit_length();
        if !self.children.is_empty() {
            self.collected
                .extend(split_numbers(self.children.result(0), self.width));
        }

        if self.collected.len() >= self.count {
            self.collected.truncate(self.count);
            debug!(
                count = self.count,
                attempts = self.attempts, "bitwise random numbers generated"
            );
            self.children.clear();
            self.result = Some(std::mem::take(&mut self.collected).concat());
            return Ok(());
        }

        let missing = self.count - self.collected.len();
        let draws = (missing as f64 * 2f64.powi(self.width as i32) / field.modulus() as f64
            * OVERSAMPLING)
            .ceil() as usize
            + 1;
        self.attempts += 1;
        self.children.set(BitwiseRandomNumbers::new(draws));
        Ok(())
    }

    fn result(&self) -> Option<&[i64]> {
        self.result.as_deref()
    }
}

/// Splits a flat result of [`BitwiseRandomNumbers`] into `[r, r_0, ..., r_{l-1}]` entries.
pub fn split_numbers(flat: &[i64], width: usize) -> Vec<Vec<i64>> {
    flat.chunks_exact(width + 1).map(<[i64]>::to_vec).collect()
}

composite_operation!(
    RandomBits,
    BitwiseRandomNumbers,
    BatchGenerateBitwiseRandomNumbers,
);
