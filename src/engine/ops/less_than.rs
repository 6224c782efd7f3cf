//! Comparison of shared values.
//!
//! `[a < b]` is derived from three half-range predicates `w = [a < p/2]`, `x = [b < p/2]` and
//! `y = [(a - b) mod p < p/2]`. Each predicate is computed from the least significant bit of
//! `2v mod p`, which is zero exactly when `v < p/2` since `p` is odd.
use crate::{
    common::FAILED_RESULT,
    engine::{
        operation::{composite_operation, Composite, Operation, StepContext, SubOperations},
        ops::{
            bitwise::{BitwiseCompare, CompareDirection},
            multiplication::Multiplication,
            random_bits::BitwiseRandomNumbers,
            reconstruction::Reconstruction,
        },
        predicate_cache::PredicateCache,
        EngineError,
    },
};

/// Random numbers a [`LessThan`] asks for at most, one per predicate it has to compute.
pub const NUMBERS_PER_COMPARISON: usize = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LsbStage {
    Start,
    AwaitingNumber,
    Masked,
    Compared,
    Multiplied,
}

/// Shares the predicate `[v < p/2]` of a shared `v`.
///
/// With a bitwise shared random `r`, `c = 2v + r` is opened. Over the integers
/// `2v = c - r + p·[c < r]`, so the least significant bit of `2v` is `c_0 ⊕ r_0 ⊕ [c < r]`.
/// Without a supplied random number a single generation attempt is made, whose failure makes
/// the result [`FAILED_RESULT`].
pub struct Lsb {
    value: i64,
    number: Option<Vec<i64>>,
    stage: LsbStage,
    bit_xor: i64,
    comparison: i64,
    children: SubOperations,
    result: Option<Vec<i64>>,
}

impl Lsb {
    pub fn new(value: i64, number: Option<Vec<i64>>) -> Self {
        Self {
            value,
            number,
            stage: LsbStage::Start,
            bit_xor: 0,
            comparison: 0,
            children: SubOperations::default(),
            result: None,
        }
    }

    fn mask(&mut self, ctx: &mut StepContext<'_>) {
        let field = ctx.sharing.field();
        match self.number.as_deref() {
            Some([r, _first_bit, ..]) => {
                let doubled = field.add(field.reduce(self.value), field.reduce(self.value));
                let masked = field.add(doubled, *r);
                self.children.set(Reconstruction::new(vec![masked]));
                self.stage = LsbStage::Masked;
            }
            _ => {
                self.children.clear();
                self.result = Some(vec![FAILED_RESULT]);
            }
        }
    }
}

impl Composite for Lsb {
    fn children(&self) -> &SubOperations {
        &self.children
    }

    fn children_mut(&mut self) -> &mut SubOperations {
        &mut self.children
    }

    fn advance(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        match self.stage {
            LsbStage::Start => {
                if self.number.is_some() {
                    self.mask(ctx);
                } else {
                    self.children.set(BitwiseRandomNumbers::new(1));
                    self.stage = LsbStage::AwaitingNumber;
                }
            }
            LsbStage::AwaitingNumber => {
                let generated = self.children.result(0);
                self.number = (!generated.is_empty()).then(|| generated.to_vec());
                self.mask(ctx);
            }
            LsbStage::Masked => {
                let field = ctx.sharing.field();
                let masked = self.children.first_results()[0];
                let bits = self
                    .number
                    .as_deref()
                    .map_or(&[][..], |number| &number[1..]);
                // c_0 ⊕ r_0 is linear in r_0 for a public c_0
                self.bit_xor = if masked & 1 == 1 {
                    field.subtract(1, bits[0])
                } else {
                    bits[0]
                };
                self.children.set(BitwiseCompare::new(
                    bits.to_vec(),
                    masked,
                    CompareDirection::PublicLessThanShared,
                ));
                self.stage = LsbStage::Compared;
            }
            LsbStage::Compared => {
                self.comparison = self.children.first_results()[0];
                self.children
                    .set(Multiplication::new(vec![(self.bit_xor, self.comparison)]));
                self.stage = LsbStage::Multiplied;
            }
            LsbStage::Multiplied => {
                let field = ctx.sharing.field();
                let product = self.children.first_results()[0];
                // lsb = a ⊕ b = a + b - 2ab
                let lsb = field.subtract(
                    field.add(self.bit_xor, self.comparison),
                    field.add(product, product),
                );
                self.children.clear();
                self.result = Some(vec![field.subtract(1, lsb)]);
            }
        }
        Ok(())
    }

    fn result(&self) -> Option<&[i64]> {
        self.result.as_deref()
    }
}

/// Opaque caller identifiers of the compared secrets. Predicates of keyed values are cached
/// and reused by later comparisons with the same key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LessThanKeys {
    pub left: Option<u64>,
    pub right: Option<u64>,
    pub difference: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LessThanStage {
    Start,
    Predicates,
    Product,
    Combined,
}

/// Shares `[a < b]` for shared `a` and `b`.
pub struct LessThan {
    left: i64,
    right: i64,
    keys: LessThanKeys,
    numbers: Vec<Vec<i64>>,
    stage: LessThanStage,
    /// `[w, x, y]`, `None` while still being computed by a child.
    predicates: [Option<i64>; 3],
    /// Predicate index computed by each child.
    computing: Vec<usize>,
    /// `w ⊕ x`
    halves_differ: i64,
    product: i64,
    children: SubOperations,
    result: Option<Vec<i64>>,
}

impl LessThan {
    pub fn new(left: i64, right: i64, keys: LessThanKeys) -> Self {
        Self {
            left,
            right,
            keys,
            numbers: Vec::new(),
            stage: LessThanStage::Start,
            predicates: [None; 3],
            computing: Vec::new(),
            halves_differ: 0,
            product: 0,
            children: SubOperations::default(),
            result: None,
        }
    }

    fn key(&self, index: usize) -> Option<u64> {
        match index {
            0 => self.keys.left,
            1 => self.keys.right,
            _ => self.keys.difference,
        }
    }

    /// Committed share of predicate `index`, if its operand is keyed and already known.
    fn cached(&self, index: usize, predicates: &PredicateCache) -> Option<i64> {
        self.key(index).and_then(|key| predicates.get(key))
    }

    fn finish(&mut self, value: i64) {
        self.children.clear();
        self.result = Some(vec![value]);
    }
}

impl Composite for LessThan {
    fn children(&self) -> &SubOperations {
        &self.children
    }

    fn children_mut(&mut self) -> &mut SubOperations {
        &mut self.children
    }

    fn advance(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        let field = ctx.sharing.field();
        match self.stage {
            LessThanStage::Start => {
                let left = field.reduce(self.left);
                let right = field.reduce(self.right);
                let inputs = [left, right, field.subtract(left, right)];
                let mut numbers = std::mem::take(&mut self.numbers).into_iter();
                let mut children: Vec<Box<dyn Operation>> = Vec::new();
                for (index, input) in inputs.into_iter().enumerate() {
                    self.predicates[index] = self.cached(index, ctx.predicates);
                    if self.predicates[index].is_none() {
                        self.computing.push(index);
                        children.push(Box::new(Lsb::new(input, numbers.next())));
                    }
                }
                self.children.replace(children);
                self.stage = LessThanStage::Predicates;
            }
            LessThanStage::Predicates => {
                let computing = std::mem::take(&mut self.computing);
                for (child, index) in computing.into_iter().enumerate() {
                    let predicate = self
                        .children
                        .result(child)
                        .first()
                        .copied()
                        .unwrap_or(FAILED_RESULT);
                    if predicate == FAILED_RESULT {
                        self.finish(FAILED_RESULT);
                        return Ok(());
                    }
                    if let Some(key) = self.key(index) {
                        ctx.predicates.insert(key, ctx.operation, predicate);
                    }
                    self.predicates[index] = Some(predicate);
                }
                let [Some(w), Some(x), Some(_)] = self.predicates else {
                    self.finish(FAILED_RESULT);
                    return Ok(());
                };
                self.children.set(Multiplication::new(vec![(w, x)]));
                self.stage = LessThanStage::Product;
            }
            LessThanStage::Product => {
                let (w, x, y) = self.known_predicates();
                self.product = self.children.first_results()[0];
                self.halves_differ =
                    field.subtract(field.add(w, x), field.add(self.product, self.product));
                self.children
                    .set(Multiplication::new(vec![(self.halves_differ, y)]));
                self.stage = LessThanStage::Combined;
            }
            LessThanStage::Combined => {
                let (w, _, y) = self.known_predicates();
                let c = self.halves_differ;
                let cy = self.children.first_results()[0];
                // w(1 - x) + (1 - c)(1 - y)
                let value = field.sum([
                    field.subtract(w, self.product),
                    1,
                    field.negate(y),
                    field.negate(c),
                    cy,
                ]);
                self.finish(value);
            }
        }
        Ok(())
    }

    fn result(&self) -> Option<&[i64]> {
        self.result.as_deref()
    }

    fn numbers_needed(&self, predicates: &PredicateCache) -> usize {
        if self.stage != LessThanStage::Start || !self.numbers.is_empty() {
            return 0;
        }
        (0..NUMBERS_PER_COMPARISON)
            .filter(|index| self.cached(*index, predicates).is_none())
            .count()
    }

    fn accept_numbers(&mut self, numbers: Vec<Vec<i64>>) {
        if self.stage == LessThanStage::Start {
            self.numbers = numbers;
        }
    }
}

impl LessThan {
    fn known_predicates(&self) -> (i64, i64, i64) {
        let [w, x, y] = self.predicates.map(|p| p.unwrap_or(0));
        (w, x, y)
    }
}

composite_operation!(Lsb, LessThan);
