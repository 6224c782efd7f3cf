//! The contract every operation of the engine satisfies, plus the building blocks shared by
//! the concrete kinds: the per-round share buffers and the sub-operation driver.
use crate::{
    common::{share::shamir::ShamirSharing, PartyId, MISSING_SHARE},
    engine::{predicate_cache::PredicateCache, EngineError},
};
use rand_chacha::ChaCha20Rng;

/// Everything an operation may use while it advances by one round.
pub struct StepContext<'a> {
    pub sharing: &'a ShamirSharing,
    /// Index of the local privacy peer.
    pub party: PartyId,
    /// Caller id of the top-level operation being stepped.
    pub operation: usize,
    pub rng: &'a mut ChaCha20Rng,
    pub predicates: &'a PredicateCache,
}

impl StepContext<'_> {
    pub fn peers(&self) -> usize {
        self.sharing.peers()
    }
}

/// A unit of MPC computation that consumes zero or more rounds of share exchange.
///
/// A round consists of a call to [`Operation::do_step`], which consumes the shares delivered
/// since the previous step and prepares the outgoing shares of the next round, followed by
/// the exchange itself through the `copy_*` methods. An operation that is completed has
/// nothing to send and expects nothing.
pub trait Operation: Send {
    fn do_step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError>;

    fn is_completed(&self) -> bool;

    /// Only available once the operation is completed.
    fn final_result(&self) -> Option<&[i64]>;

    /// Number of elements this operation sends to (and expects from) `peer` this round.
    fn shares_for_peer_count(&self, peer: PartyId) -> usize;

    /// Appends the elements destined to `peer` to `out`.
    fn copy_shares_for_peer(&self, peer: PartyId, out: &mut Vec<i64>);

    /// Reads the elements this operation expects from `peer`, starting at `offset`, and returns
    /// the offset right after them. Elements beyond the end of `input` are treated as missing.
    fn copy_shares_from_peer(&mut self, peer: PartyId, input: &[i64], offset: usize) -> usize;

    /// Bitwise shared random numbers this operation would like to be supplied with before its
    /// first step. Predicates already in `predicates` need none.
    fn random_numbers_needed(&self, _predicates: &PredicateCache) -> usize {
        0
    }

    /// Each number is laid out as `[r, r_0, ..., r_{l-1}]`, bits least significant first.
    fn supply_random_numbers(&mut self, _numbers: Vec<Vec<i64>>) {}
}

/// Outgoing and incoming share buffers of one round.
#[derive(Debug, Default)]
pub struct ShareExchange {
    party: PartyId,
    outgoing: Vec<Vec<i64>>,
    gathered: Vec<Option<Vec<i64>>>,
    expected: usize,
}

impl ShareExchange {
    /// Sends `per_peer[i]` to peer `i`. Every row must have the same length; the local row is
    /// delivered directly.
    pub fn distribute(&mut self, party: PartyId, mut per_peer: Vec<Vec<i64>>) {
        let peers = per_peer.len();
        self.party = party;
        self.expected = per_peer.get(party).map_or(0, Vec::len);
        self.gathered = vec![None; peers];
        if party < peers {
            self.gathered[party] = Some(std::mem::take(&mut per_peer[party]));
        }
        self.outgoing = per_peer;
    }

    /// Sends the same values to every peer.
    pub fn broadcast(&mut self, party: PartyId, peers: usize, values: Vec<i64>) {
        self.distribute(party, vec![values; peers]);
    }

    pub fn is_pending(&self) -> bool {
        !self.gathered.is_empty()
    }

    pub fn shares_for_peer_count(&self, peer: PartyId) -> usize {
        if peer == self.party {
            return 0;
        }
        self.outgoing.get(peer).map_or(0, Vec::len)
    }

    pub fn copy_for(&self, peer: PartyId, out: &mut Vec<i64>) {
        if peer == self.party {
            return;
        }
        if let Some(values) = self.outgoing.get(peer) {
            out.extend_from_slice(values);
        }
    }

    pub fn copy_from(&mut self, peer: PartyId, input: &[i64], offset: usize) -> usize {
        if peer == self.party || peer >= self.gathered.len() {
            return offset;
        }
        let end = offset + self.expected;
        self.gathered[peer] = Some(
            (offset..end)
                .map(|i| input.get(i).copied().unwrap_or(MISSING_SHARE))
                .collect(),
        );
        end
    }

    /// Returns the gathered shares as `[position][peer]`, with [`MISSING_SHARE`] for peers that
    /// did not deliver, and resets the exchange.
    pub fn take_gathered(&mut self) -> Vec<Vec<i64>> {
        let gathered = std::mem::take(&mut self.gathered);
        let columns = (0..self.expected)
            .map(|position| {
                gathered
                    .iter()
                    .map(|row| {
                        row.as_ref()
                            .and_then(|values| values.get(position))
                            .copied()
                            .unwrap_or(MISSING_SHARE)
                    })
                    .collect()
            })
            .collect();
        self.outgoing.clear();
        self.expected = 0;
        columns
    }
}

/// Child operations of a composite operation, stepped together.
#[derive(Default)]
pub struct SubOperations {
    operations: Vec<Box<dyn Operation>>,
}

impl SubOperations {
    pub fn replace(&mut self, operations: Vec<Box<dyn Operation>>) {
        self.operations = operations;
    }

    pub fn set(&mut self, operation: impl Operation + 'static) {
        self.operations = vec![Box::new(operation)];
    }

    pub fn clear(&mut self) {
        self.operations.clear();
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Steps every child that is not completed yet.
    pub fn step(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError> {
        for operation in self
            .operations
            .iter_mut()
            .filter(|operation| !operation.is_completed())
        {
            operation.do_step(ctx)?;
        }
        Ok(())
    }

    pub fn is_completed(&self) -> bool {
        self.operations
            .iter()
            .all(|operation| operation.is_completed())
    }

    /// Result of child `index`, empty if the child does not exist or is not completed.
    pub fn result(&self, index: usize) -> &[i64] {
        self.operations
            .get(index)
            .and_then(|operation| operation.final_result())
            .unwrap_or(&[])
    }

    /// First element of the result of every child.
    pub fn first_results(&self) -> Vec<i64> {
        (0..self.len())
            .map(|i| self.result(i).first().copied().unwrap_or(MISSING_SHARE))
            .collect()
    }

    pub fn shares_for_peer_count(&self, peer: PartyId) -> usize {
        self.operations
            .iter()
            .map(|operation| operation.shares_for_peer_count(peer))
            .sum()
    }

    pub fn copy_shares_for_peer(&self, peer: PartyId, out: &mut Vec<i64>) {
        for operation in &self.operations {
            operation.copy_shares_for_peer(peer, out);
        }
    }

    pub fn copy_shares_from_peer(&mut self, peer: PartyId, input: &[i64], offset: usize) -> usize {
        let mut offset = offset;
        for operation in &mut self.operations {
            offset = operation.copy_shares_from_peer(peer, input, offset);
        }
        offset
    }
}

/// An operation built from child operations. Each phase schedules children; once they all
/// complete, [`Composite::advance`] consumes their results and either schedules the next phase
/// or sets the final result.
pub trait Composite: Send {
    fn children(&self) -> &SubOperations;

    fn children_mut(&mut self) -> &mut SubOperations;

    /// Must either schedule new children or finish the operation.
    fn advance(&mut self, ctx: &mut StepContext<'_>) -> Result<(), EngineError>;

    fn result(&self) -> Option<&[i64]>;

    fn numbers_needed(&self, _predicates: &PredicateCache) -> usize {
        0
    }

    fn accept_numbers(&mut self, _numbers: Vec<Vec<i64>>) {}
}

/// Steps the children of `operation`, advancing through every phase that completes without
/// another round of communication.
pub fn drive<C: Composite>(
    operation: &mut C,
    ctx: &mut StepContext<'_>,
) -> Result<(), EngineError> {
    operation.children_mut().step(ctx)?;
    while operation.children().is_completed() && operation.result().is_none() {
        operation.advance(ctx)?;
        operation.children_mut().step(ctx)?;
    }
    Ok(())
}

/// Implements [`Operation`] for types implementing [`Composite`].
macro_rules! composite_operation {
    ($($ty:ty),+ $(,)?) => {$(
        impl $crate::engine::operation::Operation for $ty {
            fn do_step(
                &mut self,
                ctx: &mut $crate::engine::operation::StepContext<'_>,
            ) -> Result<(), $crate::engine::EngineError> {
                $crate::engine::operation::drive(self, ctx)
            }

            fn is_completed(&self) -> bool {
                $crate::engine::operation::Composite::result(self).is_some()
            }

            fn final_result(&self) -> Option<&[i64]> {
                $crate::engine::operation::Composite::result(self)
            }

            fn shares_for_peer_count(&self, peer: $crate::common::PartyId) -> usize {
                $crate::engine::operation::Composite::children(self).shares_for_peer_count(peer)
            }

            fn copy_shares_for_peer(&self, peer: $crate::common::PartyId, out: &mut Vec<i64>) {
                $crate::engine::operation::Composite::children(self).copy_shares_for_peer(peer, out)
            }

            fn copy_shares_from_peer(
                &mut self,
                peer: $crate::common::PartyId,
                input: &[i64],
                offset: usize,
            ) -> usize {
                $crate::engine::operation::Composite::children_mut(self)
                    .copy_shares_from_peer(peer, input, offset)
            }

            fn random_numbers_needed(
                &self,
                predicates: &$crate::engine::predicate_cache::PredicateCache,
            ) -> usize {
                $crate::engine::operation::Composite::numbers_needed(self, predicates)
            }

            fn supply_random_numbers(&mut self, numbers: Vec<Vec<i64>>) {
                $crate::engine::operation::Composite::accept_numbers(self, numbers)
            }
        }
    )+};
}

pub(crate) use composite_operation;
