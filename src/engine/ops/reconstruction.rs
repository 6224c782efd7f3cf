use crate::{
    common::PartyId,
    engine::{
        operation::{Operation, ShareExchange, StepContext},
        EngineError,
    },
};

/// Opens a vector of shared values in one round.
pub struct Reconstruction {
    shares: Vec<i64>,
    exchange: ShareExchange,
    started: bool,
    result: Option<Vec<i64>>,
}

impl Reconstruction {
    pub fn new(shares: Vec<i64>) -> Self {
        Self {
            shares,
            exchange: ShareExchange::default(),
            started: false,
            result: None,
        }
    }
}

impl Operation for Reconstruction {
    fn do_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        if self.result.is_some() {
            return Ok(());
        }
        if !self.started {
            self.started = true;
            if self.shares.is_empty() {
                self.result = Some(Vec::new());
            } else {
                let shares = std::mem::take(&mut self.shares);
                self.exchange.broadcast(ctx.party, ctx.peers(), shares);
            }
            return Ok(());
        }

        let secrets = self
            .exchange
            .take_gathered()
            .iter()
            .map(|column| ctx.sharing.interpolate(column, false))
            .collect::<Result<Vec<_>, _>>()?;
        self.result = Some(secrets);
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
