use crate::engine::{
    operation::{composite_operation, Composite, StepContext, SubOperations},
    ops::multiplication::Multiplication,
    EngineError,
};

/// Raises a shared value to a public exponent by square-and-multiply. Updating the accumulator
/// and squaring share one round, so `x^e` takes `⌊log2 e⌋` rounds, plus one unless `e` is a
/// power of two.
pub struct Power {
    square: i64,
    exponent: u64,
    /// `None` stands for the public constant 1.
    accumulator: Option<i64>,
    pending_accumulator: bool,
    pending_square: bool,
    children: SubOperations,
    result: Option<Vec<i64>>,
}

impl Power {
    pub fn new(base: i64, exponent: u64) -> Self {
        Self {
            square: base,
            exponent,
            accumulator: None,
            pending_accumulator: false,
            pending_square: false,
            children: SubOperations::default(),
            result: None,
        }
    }
}

impl Composite for Power {
    fn children(&self) -> &SubOperations {
        &self.children
    }

    fn children_mut(&mut self) -> &mut SubOperations {
        &mut self.children
    }

    fn advance(&mut self, _ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        let mut products = self.children.result(0).iter().copied();
        if self.pending_accumulator {
            self.accumulator = products.next();
        }
        if self.pending_square {
            if let Some(square) = products.next() {
                self.square = square;
            }
        }
        self.pending_accumulator = false;
        self.pending_square = false;

        if self.exponent == 0 {
            self.children.clear();
            self.result = Some(vec![self.accumulator.unwrap_or(1)]);
            return Ok(());
        }

        let bit = self.exponent & 1;
        self.exponent >>= 1;
        let mut pairs = Vec::with_capacity(2);
        if bit == 1 {
            match self.accumulator {
                None => self.accumulator = Some(self.square),
                Some(accumulator) => {
                    pairs.push((accumulator, self.square));
                    self.pending_accumulator = true;
                }
            }
        }
        if self.exponent > 0 {
            pairs.push((self.square, self.square));
            self.pending_square = true;
        }

        if pairs.is_empty() {
            self.children.clear();
        } else {
            self.children.set(Multiplication::new(pairs));
        }
        Ok(())
    }

    fn result(&self) -> Option<&[i64]> {
        self.result.as_deref()
    }
}

/// Shares `[a == b]` using Fermat's little theorem: `1 - (a - b)^(p-1)`.
pub struct Equal {
    left: i64,
    right: i64,
    started: bool,
    children: SubOperations,
    result: Option<Vec<i64>>,
}

impl Equal {
    pub fn new(left: i64, right: i64) -> Self {
        Self {
            left,
            right,
            started: false,
            children: SubOperations::default(),
            result: None,
        }
    }
}

impl Composite for Equal {
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
            let difference = field.subtract(field.reduce(self.left), field.reduce(self.right));
            self.children
                .set(Power::new(difference, (field.modulus() - 1) as u64));
            return Ok(());
        }

        let power = self.children.first_results()[0];
        self.result = Some(vec![field.subtract(1, power)]);
        Ok(())
    }

    fn result(&self) -> Option<&[i64]> {
        self.result.as_deref()
    }
}

composite_operation!(Power, Equal);
