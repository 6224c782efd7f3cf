//! Set operations on shared Bloom filters. A filter is a vector of shared bits.
use crate::{
    common::FAILED_RESULT,
    engine::{
        operation::{composite_operation, Composite, StepContext, SubOperations},
        ops::{multiplication::Multiplication, reconstruction::Reconstruction},
        EngineError,
    },
};
use itertools::Itertools;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BloomMode {
    /// Slot-wise OR, `a + b - ab`.
    Union,
    /// Slot-wise AND, `ab`.
    Intersection,
}

/// Combines several filters pairwise in a tree, one round per level.
pub struct BloomCombine {
    filters: Vec<Vec<i64>>,
    mode: BloomMode,
    /// Filter carried to the next level when a level has an odd count.
    carried: Option<Vec<i64>>,
    /// Pairs multiplied in the current level.
    level: Vec<(Vec<i64>, Vec<i64>)>,
    children: SubOperations,
    result: Option<Vec<i64>>,
}

impl BloomCombine {
    pub fn new(filters: Vec<Vec<i64>>, mode: BloomMode) -> Self {
        Self {
            filters,
            mode,
            carried: None,
            level: Vec::new(),
            children: SubOperations::default(),
            result: None,
        }
    }
}

impl Composite for BloomCombine {
    fn children(&self) -> &SubOperations {
        &self.children
    }

    fn children_mut(&mut self) -> &mut SubOperations {
        &mut self.children
    }

    fn advance(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        let field = ctx.sharing.field();
        if !self.level.is_empty() {
            let products = self.children.result(0);
            let mut offset = 0;
            for (left, right) in std::mem::take(&mut self.level) {
                let combined = left
                    .iter()
                    .zip(&right)
                    .zip(&products[offset..offset + left.len()])
                    .map(|((a, b), ab)| match self.mode {
                        BloomMode::Union => field.subtract(field.add(*a, *b), *ab),
                        BloomMode::Intersection => *ab,
                    })
                    .collect();
                offset += left.len();
                self.filters.push(combined);
            }
            if let Some(carried) = self.carried.take() {
                self.filters.push(carried);
            }
        }

        if self.filters.len() <= 1 {
            self.children.clear();
            self.result = Some(self.filters.pop().unwrap_or_default());
            return Ok(());
        }

        let mut filters = std::mem::take(&mut self.filters);
        if filters.len() % 2 == 1 {
            self.carried = filters.pop();
        }
        let mut pairs = Vec::new();
        for (left, right) in filters.into_iter().tuples() {
            pairs.extend(left.iter().copied().zip(right.iter().copied()));
            self.level.push((left, right));
        }
        self.children.set(Multiplication::new(pairs));
        Ok(())
    }

    fn result(&self) -> Option<&[i64]> {
        self.result.as_deref()
    }
}

/// Estimates the number of elements inserted into a shared filter with `hashes` hash
/// functions: `-(s / k) · ln(1 - X / s)` for `X` set bits out of `s`. The estimate is public.
/// A saturated filter yields [`FAILED_RESULT`].
pub struct BloomCardinality {
    filter: Vec<i64>,
    hashes: usize,
    started: bool,
    children: SubOperations,
    result: Option<Vec<i64>>,
}

impl BloomCardinality {
    pub fn new(filter: Vec<i64>, hashes: usize) -> Self {
        Self {
            filter,
            hashes,
            started: false,
            children: SubOperations::default(),
            result: None,
        }
    }
}

impl Composite for BloomCardinality {
    fn children(&self) -> &SubOperations {
        &self.children
    }

    fn children_mut(&mut self) -> &mut SubOperations {
        &mut self.children
    }

    fn advance(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        let field = ctx.sharing.field();
        if !self.started {
            self.started = true;
            let set_bits = field.sum(self.filter.iter().copied());
            self.children.set(Reconstruction::new(vec![set_bits]));
            return Ok(());
        }

        let set_bits = self.children.first_results()[0] as f64;
        let size = self.filter.len() as f64;
        let estimate = if set_bits >= size {
            FAILED_RESULT
        } else {
            (-(size / self.hashes as f64) * (1.0 - set_bits / size).ln()).round() as i64
        };
        self.children.clear();
        self.result = Some(vec![estimate]);
        Ok(())
    }

    fn result(&self) -> Option<&[i64]> {
        self.result.as_deref()
    }
}

composite_operation!(BloomCombine, BloomCardinality);
