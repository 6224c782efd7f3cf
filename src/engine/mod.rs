pub mod batch;
pub mod operation;
pub mod ops;
pub mod predicate_cache;

use crate::{
    common::{
        share::{shamir::ShamirSharing, ShareError},
        PartyId,
    },
    engine::{
        batch::{partition_range, Batch, QueuePosition, StepEnvironment},
        operation::Operation,
        ops::{
            BatchGenerateBitwiseRandomNumbers, BloomCardinality, BloomCombine, BloomMode, Equal,
            LessThan, LessThanKeys, Multiplication, Power, RandomBits, Reconstruction,
        },
        predicate_cache::PredicateCache,
    },
};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use thiserror::Error;
use tokio::sync::Barrier;
use tracing::{debug, info, warn};

/// Error that occurs while scheduling or running operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A scheduling call was made with malformed arguments. No operation was created.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("operation id {id} is out of range for a batch of {total} operations")]
    IdOutOfRange { id: usize, total: usize },
    #[error("operation id {0} is already scheduled")]
    DuplicateId(usize),
    #[error("only {scheduled} of {total} operations have been scheduled")]
    IncompleteBatch { scheduled: usize, total: usize },
    #[error("the batch is not completed")]
    BatchNotCompleted,
    #[error("there is no saved batch to restore")]
    EmptyStack,
    #[error("received {actual} elements from peer {peer}, expected {expected}")]
    UnexpectedData {
        peer: PartyId,
        expected: usize,
        actual: usize,
    },
    #[error("the batch was aborted by another worker")]
    BatchAborted,
    #[error("processing was stopped")]
    Stopped,
    #[error("share error: {0:?}")]
    Share(#[from] ShareError),
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Runs the operations of one batch for a privacy peer.
///
/// The engine is shared by the round protocols of all links of the peer. Exactly `threads`
/// of them call [`OperationEngine::process_received_data`] once per round; the calls meet at a
/// barrier and each steps a disjoint partition of the slots, chosen by arrival order.
pub struct OperationEngine {
    party: PartyId,
    sharing: Arc<ShamirSharing>,
    threads: usize,
    batch: RwLock<Batch>,
    /// Suspended batches, most recent last.
    saved: Mutex<Vec<Batch>>,
    barrier: Barrier,
    arrivals: AtomicUsize,
    rng: Mutex<Box<dyn RngCore + Send>>,
    predicates: PredicateCache,
    offline: Vec<AtomicBool>,
    aborted: AtomicBool,
    /// Caller-owned flag requesting a stop.
    stopper: Arc<AtomicBool>,
    /// The stopper as sampled at the start of the current round, identical for all workers.
    stopped: AtomicBool,
}

impl OperationEngine {
    /// Creates an engine for `party` driven by `threads` round protocols. `rng` seeds the
    /// per-round generators of the workers.
    pub fn new(
        party: PartyId,
        sharing: Arc<ShamirSharing>,
        threads: usize,
        rng: Box<dyn RngCore + Send>,
    ) -> Result<Self, EngineError> {
        if party >= sharing.peers() {
            return Err(EngineError::InvalidArguments(format!(
                "party {party} is not one of the {} peers",
                sharing.peers()
            )));
        }
        if threads == 0 {
            return Err(EngineError::InvalidArguments(
                "at least one protocol thread is required".to_string(),
            ));
        }
        let offline = (0..sharing.peers())
            .map(|_| AtomicBool::new(false))
            .collect();
        Ok(Self {
            party,
            sharing,
            threads,
            batch: RwLock::new(Batch::empty()),
            saved: Mutex::new(Vec::new()),
            barrier: Barrier::new(threads),
            arrivals: AtomicUsize::new(0),
            rng: Mutex::new(rng),
            predicates: PredicateCache::new(),
            offline,
            aborted: AtomicBool::new(false),
            stopper: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
        })
    }

    /// Makes [`OperationEngine::process_received_data`] fail with `EngineError::Stopped` once
    /// `stopper` is set. The flag is sampled once per round, so all workers stop together.
    pub fn with_stopper(mut self, stopper: Arc<AtomicBool>) -> Self {
        self.stopper = stopper;
        self
    }

    pub fn party(&self) -> PartyId {
        self.party
    }

    pub fn sharing(&self) -> &Arc<ShamirSharing> {
        &self.sharing
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn predicates(&self) -> &PredicateCache {
        &self.predicates
    }

    /// Replaces the current batch with an empty one of `total` operations, of which at most
    /// `parallel` run at the same time.
    pub fn initialize(&self, parallel: usize, total: usize) -> Result<(), EngineError> {
        let batch = Batch::new(parallel, total).inspect_err(|e| {
            warn!(party = self.party, parallel, total, "rejected batch: {e}");
        })?;
        *write(&self.batch) = batch;
        self.aborted.store(false, Ordering::SeqCst);
        debug!(party = self.party, parallel, total, "initialized batch");
        Ok(())
    }

    /// Runs all `total` operations in parallel.
    pub fn initialize_all(&self, total: usize) -> Result<(), EngineError> {
        self.initialize(total, total)
    }

    /// Schedules `operation` under the caller id `id`.
    pub fn schedule(&self, id: usize, operation: Box<dyn Operation>) -> Result<(), EngineError> {
        let position = read(&self.batch)
            .schedule(id, operation)
            .inspect_err(|e| warn!(party = self.party, id, "rejected operation: {e}"))?;
        if let QueuePosition::Queue(index) = position {
            debug!(party = self.party, id, index, "queued operation");
        }
        Ok(())
    }

    pub fn reconstruct(&self, id: usize, shares: Vec<i64>) -> Result<(), EngineError> {
        self.check_shares(id, "reconstruct", &shares)?;
        self.schedule(id, Box::new(Reconstruction::new(shares)))
    }

    /// Multiplies `left[i]` with `right[i]` for every `i`.
    pub fn multiply(&self, id: usize, left: &[i64], right: &[i64]) -> Result<(), EngineError> {
        self.require_multiplication(id, "multiply")?;
        if left.len() != right.len() {
            return Err(self.reject(
                id,
                "multiply",
                format!("factor lengths differ ({} and {})", left.len(), right.len()),
            ));
        }
        self.check_shares(id, "multiply", left)?;
        self.check_shares(id, "multiply", right)?;
        self.schedule(id, Box::new(Multiplication::from_vectors(left, right)))
    }

    pub fn power(&self, id: usize, base: i64, exponent: u64) -> Result<(), EngineError> {
        self.require_multiplication(id, "power")?;
        self.check_shares(id, "power", &[base])?;
        self.schedule(id, Box::new(Power::new(base, exponent)))
    }

    pub fn equal(&self, id: usize, left: i64, right: i64) -> Result<(), EngineError> {
        self.require_multiplication(id, "equal")?;
        self.check_shares(id, "equal", &[left, right])?;
        self.schedule(id, Box::new(Equal::new(left, right)))
    }

    /// Shares `[left < right]`. Without supplied random numbers the comparison may fail, in
    /// which case its result is [`crate::FAILED_RESULT`].
    pub fn less_than(
        &self,
        id: usize,
        left: i64,
        right: i64,
        keys: LessThanKeys,
    ) -> Result<(), EngineError> {
        self.require_multiplication(id, "less_than")?;
        self.check_shares(id, "less_than", &[left, right])?;
        self.schedule(id, Box::new(LessThan::new(left, right, keys)))
    }

    pub fn generate_random_bits(&self, id: usize, count: usize) -> Result<(), EngineError> {
        self.require_multiplication(id, "generate_random_bits")?;
        self.schedule(id, Box::new(RandomBits::new(count)))
    }

    /// Generates `count` bitwise shared random numbers, see
    /// [`ops::random_bits::split_numbers`] for the layout of the result.
    pub fn generate_bitwise_random_numbers(
        &self,
        id: usize,
        count: usize,
    ) -> Result<(), EngineError> {
        self.require_multiplication(id, "generate_bitwise_random_numbers")?;
        let bits = count.checked_mul(self.sharing.field().bit_length());
        if bits.map_or(true, |bits| bits > i32::MAX as usize) {
            return Err(self.reject(
                id,
                "generate_bitwise_random_numbers",
                format!("{count} numbers need too many random bits"),
            ));
        }
        self.schedule(id, Box::new(BatchGenerateBitwiseRandomNumbers::new(count)))
    }

    pub fn bloom_union(&self, id: usize, filters: Vec<Vec<i64>>) -> Result<(), EngineError> {
        self.check_filters(id, "bloom_union", &filters)?;
        self.schedule(id, Box::new(BloomCombine::new(filters, BloomMode::Union)))
    }

    pub fn bloom_intersection(
        &self,
        id: usize,
        filters: Vec<Vec<i64>>,
    ) -> Result<(), EngineError> {
        self.check_filters(id, "bloom_intersection", &filters)?;
        let combine = BloomCombine::new(filters, BloomMode::Intersection);
        self.schedule(id, Box::new(combine))
    }

    pub fn bloom_cardinality(
        &self,
        id: usize,
        filter: Vec<i64>,
        hashes: usize,
    ) -> Result<(), EngineError> {
        if hashes == 0 {
            let reason = "no hash functions".to_string();
            return Err(self.reject(id, "bloom_cardinality", reason));
        }
        self.check_shares(id, "bloom_cardinality", &filter)?;
        self.schedule(id, Box::new(BloomCardinality::new(filter, hashes)))
    }

    /// Advances every operation of the batch by one round. Must be called by all `threads`
    /// workers.
    ///
    /// # Errors
    /// Share errors, such as too few shares for a reconstruction, abort the batch. The worker
    /// that hit the error returns it, the others return `EngineError::BatchAborted`.
    pub async fn process_received_data(&self) -> Result<(), EngineError> {
        if self.barrier.wait().await.is_leader() {
            self.stopped
                .store(self.stopper.load(Ordering::SeqCst), Ordering::SeqCst);
        }
        let partition = self.arrivals.fetch_add(1, Ordering::SeqCst) % self.threads;
        let outcome = self.step_partition(partition);
        if outcome.is_err() {
            self.aborted.store(true, Ordering::SeqCst);
        }

        if self.barrier.wait().await.is_leader() {
            self.predicates.commit();
        }
        outcome?;
        if self.aborted.load(Ordering::SeqCst) {
            return Err(EngineError::BatchAborted);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Stopped);
        }
        Ok(())
    }

    fn step_partition(&self, partition: usize) -> Result<(), EngineError> {
        let batch = read(&self.batch);
        if batch.scheduled_count() < batch.total() {
            return Err(EngineError::IncompleteBatch {
                scheduled: batch.scheduled_count(),
                total: batch.total(),
            });
        }
        let slots = partition_range(batch.parallel(), self.threads, partition);
        let seed: [u8; 32] = lock(&self.rng).gen();
        let mut rng = ChaCha20Rng::from_seed(seed);
        let mut env = StepEnvironment {
            sharing: &self.sharing,
            party: self.party,
            rng: &mut rng,
            predicates: &self.predicates,
        };
        let completed = batch
            .step_range(slots.clone(), &mut env)
            .inspect_err(|e| {
                warn!(party = self.party, partition, "aborting batch: {e}");
            })?;
        batch.record_completed(completed);
        debug!(
            party = self.party,
            partition,
            slots = ?slots,
            completed,
            "stepped partition"
        );
        Ok(())
    }

    /// The elements to send to `peer` this round.
    pub fn get_data_to_send(&self, peer: PartyId) -> Vec<i64> {
        read(&self.batch).data_for_peer(peer)
    }

    /// Delivers the elements received from `peer` this round. `None` stands for a dummy
    /// message: the peer is offline and its shares are missing from now on.
    pub fn set_received_data(
        &self,
        peer: PartyId,
        data: Option<Vec<i64>>,
    ) -> Result<(), EngineError> {
        if peer >= self.offline.len() {
            let reason = format!("unknown peer {peer}");
            return Err(EngineError::InvalidArguments(reason));
        }
        if peer == self.party {
            return Ok(());
        }
        if data.is_none() && !self.offline[peer].swap(true, Ordering::SeqCst) {
            warn!(party = self.party, peer, "peer went offline");
        }

        let batch = read(&self.batch);
        match data {
            Some(data) if !self.is_peer_offline(peer) => {
                let expected = batch.expected_from_peer(peer);
                if data.len() != expected {
                    return Err(EngineError::UnexpectedData {
                        peer,
                        expected,
                        actual: data.len(),
                    });
                }
                batch.receive_from_peer(peer, &data);
            }
            _ => {
                batch.receive_from_peer(peer, &[]);
            }
        }
        Ok(())
    }

    pub fn is_peer_offline(&self, peer: PartyId) -> bool {
        self.offline
            .get(peer)
            .is_some_and(|offline| offline.load(Ordering::SeqCst))
    }

    pub fn offline_peers(&self) -> Vec<PartyId> {
        (0..self.offline.len())
            .filter(|peer| self.is_peer_offline(*peer))
            .collect()
    }

    pub fn are_operations_completed(&self) -> bool {
        read(&self.batch).is_completed()
    }

    /// Result of operation `id`, available once the whole batch is completed.
    pub fn result(&self, id: usize) -> Result<Vec<i64>, EngineError> {
        read(&self.batch).result(id)
    }

    /// Suspends the current batch. The engine is left with an empty batch.
    pub fn push_operations(&self) {
        let suspended = std::mem::replace(&mut *write(&self.batch), Batch::empty());
        let mut saved = lock(&self.saved);
        saved.push(suspended);
        info!(party = self.party, depth = saved.len(), "suspended batch");
    }

    /// Restores the most recently suspended batch, discarding the current one.
    pub fn pop_operations(&self) -> Result<(), EngineError> {
        let mut saved = lock(&self.saved);
        let restored = saved.pop().ok_or(EngineError::EmptyStack)?;
        *write(&self.batch) = restored;
        info!(party = self.party, depth = saved.len(), "restored batch");
        Ok(())
    }

    /// Random numbers the pending operations ask for. Comparisons whose predicates are already
    /// cached ask for fewer.
    pub fn random_numbers_needed(&self) -> usize {
        read(&self.batch).random_numbers_needed(&self.predicates)
    }

    pub fn supply_random_numbers(&self, numbers: Vec<Vec<i64>>) {
        read(&self.batch).supply_random_numbers(numbers, &self.predicates);
    }

    /// Aborts the current batch for every worker.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Waits until all `threads` workers arrive. Exactly one of them gets `true`.
    pub async fn synchronize(&self) -> bool {
        self.barrier.wait().await.is_leader()
    }

    fn reject(&self, id: usize, operation: &str, reason: String) -> EngineError {
        warn!(party = self.party, id, "rejected {operation}: {reason}");
        EngineError::InvalidArguments(reason)
    }

    fn require_multiplication(&self, id: usize, operation: &str) -> Result<(), EngineError> {
        if self.sharing.supports_multiplication() {
            return Ok(());
        }
        let degree = self.sharing.degree();
        let peers = self.sharing.peers();
        let reason = format!("degree {degree} is too large to multiply with {peers} peers");
        Err(self.reject(id, operation, reason))
    }

    fn check_shares(&self, id: usize, operation: &str, shares: &[i64]) -> Result<(), EngineError> {
        let p = self.sharing.field().modulus();
        match shares.iter().find(|share| !(0..p).contains(*share)) {
            Some(share) => Err(self.reject(
                id,
                operation,
                format!("share {share} is not a field element"),
            )),
            None => Ok(()),
        }
    }

    fn check_filters(
        &self,
        id: usize,
        operation: &str,
        filters: &[Vec<i64>],
    ) -> Result<(), EngineError> {
        self.require_multiplication(id, operation)?;
        let Some(first) = filters.first() else {
            return Err(self.reject(id, operation, "no filters".to_string()));
        };
        if filters.iter().any(|filter| filter.len() != first.len()) {
            let reason = "filter lengths differ".to_string();
            return Err(self.reject(id, operation, reason));
        }
        filters
            .iter()
            .try_for_each(|filter| self.check_shares(id, operation, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{field::DEFAULT_FIELD_SIZE, share::shamir::SharingParams};
    use rand::rngs::StdRng;

    fn engine(peers: usize, degree: usize) -> OperationEngine {
        let params = SharingParams::new(DEFAULT_FIELD_SIZE, Some(degree), peers);
        let sharing = Arc::new(ShamirSharing::new(params).unwrap());
        let rng = Box::new(StdRng::seed_from_u64(1));
        OperationEngine::new(0, sharing, 1, rng).unwrap()
    }

    #[test]
    fn malformed_calls_create_no_state() {
        let engine = engine(3, 1);
        engine.initialize(1, 2).unwrap();
        assert!(matches!(
            engine.multiply(0, &[1, 2], &[3]),
            Err(EngineError::InvalidArguments(_))
        ));
        assert!(matches!(
            engine.reconstruct(0, vec![DEFAULT_FIELD_SIZE]),
            Err(EngineError::InvalidArguments(_))
        ));
        assert!(matches!(
            engine.reconstruct(2, vec![1]),
            Err(EngineError::IdOutOfRange { id: 2, total: 2 })
        ));
        assert!(matches!(
            engine.bloom_union(1, vec![]),
            Err(EngineError::InvalidArguments(_))
        ));

        // id 0 is still free after the rejections
        engine.reconstruct(0, vec![1]).unwrap();
        assert!(matches!(
            engine.reconstruct(0, vec![1]),
            Err(EngineError::DuplicateId(0))
        ));
    }

    #[test]
    fn multiplication_requires_enough_peers() {
        let engine = engine(4, 2);
        engine.initialize_all(1).unwrap();
        assert!(engine.multiply(0, &[1], &[2]).is_err());
        assert!(engine.reconstruct(0, vec![5]).is_ok());
    }

    #[test]
    fn too_many_random_bits_are_rejected() {
        let engine = engine(3, 1);
        engine.initialize_all(1).unwrap();
        assert!(engine
            .generate_bitwise_random_numbers(0, i32::MAX as usize)
            .is_err());
        assert!(engine.generate_bitwise_random_numbers(0, 10).is_ok());
    }

    #[test]
    fn push_and_pop_restore_the_batch() {
        let engine = engine(3, 1);
        engine.initialize_all(1).unwrap();
        engine.reconstruct(0, vec![7]).unwrap();
        assert!(!engine.are_operations_completed());

        engine.push_operations();
        assert!(engine.are_operations_completed());
        engine.initialize_all(2).unwrap();
        engine.pop_operations().unwrap();

        assert!(!engine.are_operations_completed());
        assert!(matches!(
            engine.reconstruct(0, vec![7]),
            Err(EngineError::DuplicateId(0))
        ));
        assert!(matches!(
            engine.pop_operations(),
            Err(EngineError::EmptyStack)
        ));
    }

    #[tokio::test]
    async fn unscheduled_batches_do_not_run() {
        let engine = engine(3, 1);
        engine.initialize(1, 2).unwrap();
        engine.reconstruct(0, vec![7]).unwrap();
        assert!(matches!(
            engine.process_received_data().await,
            Err(EngineError::IncompleteBatch {
                scheduled: 1,
                total: 2
            })
        ));
    }

    #[tokio::test]
    async fn unexpected_data_is_rejected() {
        let engine = engine(3, 1);
        engine.initialize_all(1).unwrap();
        engine.reconstruct(0, vec![7, 8]).unwrap();
        engine.process_received_data().await.unwrap();
        assert_eq!(engine.get_data_to_send(1), vec![7, 8]);
        assert!(engine.get_data_to_send(0).is_empty());
        assert!(matches!(
            engine.set_received_data(1, Some(vec![1])),
            Err(EngineError::UnexpectedData {
                peer: 1,
                expected: 2,
                actual: 1
            })
        ));
        engine.set_received_data(2, None).unwrap();
        assert_eq!(engine.offline_peers(), vec![2]);
    }
}
