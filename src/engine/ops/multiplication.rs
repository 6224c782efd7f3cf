use crate::{
    common::PartyId,
    engine::{
        operation::{Operation, ShareExchange, StepContext},
        EngineError,
    },
};

/// Multiplies pairs of shared values.
///
/// The local product of two shares is a share of degree `2t`. Every peer reshares its product
/// with degree `t` and recombines the received subshares with the degree-`2t` Lagrange
/// weights, which yields a degree-`t` share of the product after one round.
pub struct Multiplication {
    pairs: Vec<(i64, i64)>,
    exchange: ShareExchange,
    started: bool,
    result: Option<Vec<i64>>,
}

impl Multiplication {
    pub fn new(pairs: Vec<(i64, i64)>) -> Self {
        Self {
            pairs,
            exchange: ShareExchange::default(),
            started: false,
            result: None,
        }
    }

    pub fn from_vectors(left: &[i64], right: &[i64]) -> Self {
        Self::new(left.iter().copied().zip(right.iter().copied()).collect())
    }
}

impl Operation for Multiplication {
    fn do_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        if self.result.is_some() {
            return Ok(());
        }
        if !self.started {
            self.started = true;
            if self.pairs.is_empty() {
                self.result = Some(Vec::new());
                return Ok(());
            }
            let field = ctx.sharing.field();
            let products: Vec<i64> = std::mem::take(&mut self.pairs)
                .into_iter()
                .map(|(a, b)| field.multiply(field.reduce(a), field.reduce(b)))
                .collect();
            let per_peer = ctx.sharing.generate_shares(&products, &mut *ctx.rng);
            self.exchange.distribute(ctx.party, per_peer);
            return Ok(());
        }

        let products = self
            .exchange
            .take_gathered()
            .iter()
            .map(|subshares| ctx.sharing.interpolate(subshares, true))
            .collect::<Result<Vec<_>, _>>()?;
        self.result = Some(products);
        Ok(())
    }

    fn is_completed(&self) -> bool {
        self.result.is_some()
    }

    fn final_result(&self) -> Option<&[i64]> {
        self.result.as_deref()
    }

    fn shares_for_peer_count(&self, peer: PartyId) -> usize {
        self.exchange.shares_for_peer_count(peer)
    }

    fn copy_shares_for_peer(&self, peer: PartyId, out: &mut Vec<i64>) {
        self.exchange.copy_for(peer, out);
    }

    fn copy_shares_from_peer(&mut self, peer: PartyId, input: &[i64], offset: usize) -> usize {
        self.exchange.copy_from(peer, input, offset)
    }
}
