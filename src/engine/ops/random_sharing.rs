use crate::{
    common::{PartyId, MISSING_SHARE},
    engine::{
        operation::{Operation, ShareExchange, StepContext},
        EngineError,
    },
};
use rand::Rng;

/// Produces shares of values no single peer knows: every peer shares fresh random values and
/// adds up the shares it receives.
pub struct RandomSharing {
    count: usize,
    exchange: ShareExchange,
    started: bool,
    result: Option<Vec<i64>>,
}

impl RandomSharing {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            exchange: ShareExchange::default(),
            started: false,
            result: None,
        }
    }
}

impl Operation for RandomSharing {
    fn do_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        if self.result.is_some() {
            return Ok(());
        }
        if !self.started {
            self.started = true;
            if self.count == 0 {
                self.result = Some(Vec::new());
                return Ok(());
            }
            let p = ctx.sharing.field().modulus();
            let secrets: Vec<i64> = (0..self.count).map(|_| ctx.rng.gen_range(0..p)).collect();
            let per_peer = ctx.sharing.generate_shares(&secrets, &mut *ctx.rng);
            self.exchange.distribute(ctx.party, per_peer);
            return Ok(());
        }

        let field = ctx.sharing.field();
        let sums = self
            .exchange
            .take_gathered()
            .into_iter()
            .map(|column| {
                let present = column.into_iter().filter(|share| *share != MISSING_SHARE);
                field.sum(present)
            })
            .collect();
        self.result = Some(sums);
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
