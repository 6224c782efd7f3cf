use crate::engine::{
    operation::{composite_operation, Composite, StepContext, SubOperations},
    ops::multiplication::Multiplication,
    EngineError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareDirection {
    /// `[r < c]`
    SharedLessThanPublic,
    /// `[c < r]`
    PublicLessThanShared,
}

/// Compares a bitwise shared value `r` with a public value `c`.
///
/// Scans from the most significant bit down: the result is the sum over `i` of
/// `prefix_i · term_i`, where `prefix_i` shares whether all higher bits are equal and `term_i`
/// whether bit `i` decides the comparison. Both `term_i` and the equality of bit `i` are linear
/// in the shared bit, so each bit after the first costs one round.
pub struct BitwiseCompare {
    /// Shared bits, least significant first.
    bits: Vec<i64>,
    public: i64,
    direction: CompareDirection,
    started: bool,
    position: usize,
    sum: i64,
    prefix: i64,
    pending_prefix: bool,
    children: SubOperations,
    result: Option<Vec<i64>>,
}

impl BitwiseCompare {
    pub fn new(bits: Vec<i64>, public: i64, direction: CompareDirection) -> Self {
        Self {
            bits,
            public,
            direction,
            started: false,
            position: 0,
            sum: 0,
            prefix: 1,
            pending_prefix: false,
            children: SubOperations::default(),
            result: None,
        }
    }

    fn public_bit(&self, i: usize) -> bool {
        i < 63 && (self.public >> i) & 1 == 1
    }

    /// Share of `[r_i == c_i]`.
    fn equal_bit(&self, ctx: &StepContext<'_>, i: usize) -> i64 {
        if self.public_bit(i) {
            self.bits[i]
        } else {
            ctx.sharing.field().subtract(1, self.bits[i])
        }
    }

    /// Share of `[r_i != c_i]` restricted to the bit pattern that makes the comparison true.
    fn deciding_bit(&self, ctx: &StepContext<'_>, i: usize) -> i64 {
        match (self.direction, self.public_bit(i)) {
            (CompareDirection::SharedLessThanPublic, true) => {
                ctx.sharing.field().subtract(1, self.bits[i])
            }
            (CompareDirection::PublicLessThanShared, false) => self.bits[i],
            _ => 0,
        }
    }
}

impl Composite for BitwiseCompare {
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
            let width = self.bits.len();
            let out_of_range = if self.public < 0 {
                Some(false)
            } else if width < 63 && self.public >> width != 0 {
                Some(true)
            } else {
                None
            };
            // c lies outside the range the bits can represent
            if let Some(shared_is_smaller) = out_of_range {
                let decided = match self.direction {
                    CompareDirection::SharedLessThanPublic => shared_is_smaller,
                    CompareDirection::PublicLessThanShared => !shared_is_smaller,
                };
                self.result = Some(vec![i64::from(decided)]);
                return Ok(());
            }
            if width == 0 {
                self.result = Some(vec![0]);
                return Ok(());
            }
            self.position = width - 1;
            self.sum = self.deciding_bit(ctx, self.position);
            self.prefix = self.equal_bit(ctx, self.position);
        } else {
            let products = self.children.result(0);
            self.sum = field.add(self.sum, products.first().copied().unwrap_or(0));
            if self.pending_prefix {
                self.prefix = products.get(1).copied().unwrap_or(0);
            }
        }

        if self.position == 0 {
            self.children.clear();
            self.result = Some(vec![self.sum]);
            return Ok(());
        }

        self.position -= 1;
        let mut pairs = vec![(self.prefix, self.deciding_bit(ctx, self.position))];
        self.pending_prefix = self.position > 0;
        if self.pending_prefix {
            pairs.push((self.prefix, self.equal_bit(ctx, self.position)));
        }
        self.children.set(Multiplication::new(pairs));
        Ok(())
    }

    fn result(&self) -> Option<&[i64]> {
        self.result.as_deref()
    }
}

composite_operation!(BitwiseCompare);
