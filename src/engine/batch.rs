//! A batch of operations: `parallel` active slots fed from a queue of not yet started
//! operations.
//!
//! Slot `i` runs the operations with ids `i, i + parallel, i + 2·parallel, ...` one after the
//! other, so the operation with id `id >= parallel` waits at queue position `id - parallel`
//! and is promoted when its predecessor `id - parallel` completes.
use crate::{
    common::{share::shamir::ShamirSharing, PartyId},
    engine::{
        lock,
        operation::{Operation, StepContext},
        predicate_cache::PredicateCache,
        EngineError,
    },
};
use rand_chacha::ChaCha20Rng;
use std::{
    ops::Range,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
};

/// Where an operation waits until it runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePosition {
    Slot(usize),
    Queue(usize),
}

/// Maps a caller id to its place in a batch of `total` operations with `parallel` slots.
///
/// # Errors
/// - `EngineError::IdOutOfRange` if `id >= total`.
pub fn queue_position(
    id: usize,
    parallel: usize,
    total: usize,
) -> Result<QueuePosition, EngineError> {
    if id >= total {
        return Err(EngineError::IdOutOfRange { id, total });
    }
    if id < parallel {
        Ok(QueuePosition::Slot(id))
    } else {
        Ok(QueuePosition::Queue(id - parallel))
    }
}

/// Splits `parallel` slots into `threads` contiguous partitions and returns partition `index`.
pub fn partition_range(parallel: usize, threads: usize, index: usize) -> Range<usize> {
    let chunk = parallel.div_ceil(threads.max(1));
    let start = (index * chunk).min(parallel);
    let end = (start + chunk).min(parallel);
    start..end
}

pub(crate) struct ScheduledOperation {
    id: usize,
    operation: Box<dyn Operation>,
}

/// Shared parts of the context every operation in a partition is stepped with.
pub(crate) struct StepEnvironment<'a> {
    pub sharing: &'a ShamirSharing,
    pub party: PartyId,
    pub rng: &'a mut ChaCha20Rng,
    pub predicates: &'a PredicateCache,
}

impl StepEnvironment<'_> {
    fn step(&mut self, scheduled: &mut ScheduledOperation) -> Result<(), EngineError> {
        let mut ctx = StepContext {
            sharing: self.sharing,
            party: self.party,
            operation: scheduled.id,
            rng: &mut *self.rng,
            predicates: self.predicates,
        };
        scheduled.operation.do_step(&mut ctx)
    }
}

pub struct Batch {
    parallel: usize,
    total: usize,
    slots: Vec<Mutex<Option<ScheduledOperation>>>,
    queue: Vec<Mutex<Option<Box<dyn Operation>>>>,
    scheduled: Vec<AtomicBool>,
    scheduled_count: AtomicUsize,
    results: Mutex<Vec<Option<Vec<i64>>>>,
    completed: Mutex<usize>,
}

impl Batch {
    /// # Errors
    /// - `EngineError::InvalidArguments` if `parallel > total`, or if there are operations but
    ///   no slot to run them in.
    pub fn new(parallel: usize, total: usize) -> Result<Self, EngineError> {
        if parallel > total {
            return Err(EngineError::InvalidArguments(format!(
                "{parallel} parallel operations exceed the batch size {total}"
            )));
        }
        if parallel == 0 && total > 0 {
            return Err(EngineError::InvalidArguments(
                "a non-empty batch needs at least one parallel slot".to_string(),
            ));
        }
        Ok(Self {
            parallel,
            total,
            slots: (0..parallel).map(|_| Mutex::new(None)).collect(),
            queue: (parallel..total).map(|_| Mutex::new(None)).collect(),
            scheduled: (0..total).map(|_| AtomicBool::new(false)).collect(),
            scheduled_count: AtomicUsize::new(0),
            results: Mutex::new(vec![None; total]),
            completed: Mutex::new(0),
        })
    }

    /// A batch without operations, which is completed from the start.
    pub fn empty() -> Self {
        Self {
            parallel: 0,
            total: 0,
            slots: Vec::new(),
            queue: Vec::new(),
            scheduled: Vec::new(),
            scheduled_count: AtomicUsize::new(0),
            results: Mutex::new(Vec::new()),
            completed: Mutex::new(0),
        }
    }

    pub fn parallel(&self) -> usize {
        self.parallel
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn scheduled_count(&self) -> usize {
        self.scheduled_count.load(Ordering::SeqCst)
    }

    pub fn schedule(
        &self,
        id: usize,
        operation: Box<dyn Operation>,
    ) -> Result<QueuePosition, EngineError> {
        let position = queue_position(id, self.parallel, self.total)?;
        if self.scheduled[id].swap(true, Ordering::SeqCst) {
            return Err(EngineError::DuplicateId(id));
        }
        match position {
            QueuePosition::Slot(slot) => {
                *lock(&self.slots[slot]) = Some(ScheduledOperation { id, operation });
            }
            QueuePosition::Queue(index) => {
                *lock(&self.queue[index]) = Some(operation);
            }
        }
        self.scheduled_count.fetch_add(1, Ordering::SeqCst);
        Ok(position)
    }

    /// Advances the operations in `slots` by one round and returns how many completed.
    ///
    /// Every active operation is stepped first. Then each completed operation's result is
    /// recorded and its successor in the queue is moved into the freed slot and stepped right
    /// away, repeatedly while successors complete without communication.
    pub(crate) fn step_range(
        &self,
        slots: Range<usize>,
        env: &mut StepEnvironment<'_>,
    ) -> Result<usize, EngineError> {
        // 1. Step the active operations.
        for slot in slots.clone() {
            let mut guard = lock(&self.slots[slot]);
            if let Some(scheduled) = guard.as_mut() {
                if !scheduled.operation.is_completed() {
                    env.step(scheduled)?;
                }
            }
        }

        // 2. Record results and promote successors.
        let mut completed = 0;
        for slot in slots {
            let mut guard = lock(&self.slots[slot]);
            while guard
                .as_ref()
                .is_some_and(|scheduled| scheduled.operation.is_completed())
            {
                let Some(finished) = guard.take() else {
                    break;
                };
                let result = finished
                    .operation
                    .final_result()
                    .map(<[i64]>::to_vec)
                    .unwrap_or_default();
                lock(&self.results)[finished.id] = Some(result);
                completed += 1;

                let next = finished.id + self.parallel;
                if next >= self.total {
                    break;
                }
                let operation = lock(&self.queue[finished.id])
                    .take()
                    .ok_or(EngineError::IncompleteBatch {
                        scheduled: self.scheduled_count(),
                        total: self.total,
                    })?;
                let mut promoted = ScheduledOperation {
                    id: next,
                    operation,
                };
                env.step(&mut promoted)?;
                *guard = Some(promoted);
            }
        }
        Ok(completed)
    }

    pub fn record_completed(&self, count: usize) {
        *lock(&self.completed) += count;
    }

    pub fn completed(&self) -> usize {
        *lock(&self.completed)
    }

    pub fn is_completed(&self) -> bool {
        self.completed() >= self.total
    }

    pub fn result(&self, id: usize) -> Result<Vec<i64>, EngineError> {
        if id >= self.total {
            return Err(EngineError::IdOutOfRange {
                id,
                total: self.total,
            });
        }
        if !self.is_completed() {
            return Err(EngineError::BatchNotCompleted);
        }
        lock(&self.results)[id]
            .clone()
            .ok_or(EngineError::BatchNotCompleted)
    }

    pub fn expected_from_peer(&self, peer: PartyId) -> usize {
        let mut expected = 0;
        for slot in &self.slots {
            if let Some(scheduled) = lock(slot).as_ref() {
                expected += scheduled.operation.shares_for_peer_count(peer);
            }
        }
        expected
    }

    /// Concatenates, in slot order, what every active operation sends to `peer`.
    pub fn data_for_peer(&self, peer: PartyId) -> Vec<i64> {
        let mut data = Vec::with_capacity(self.expected_from_peer(peer));
        for slot in &self.slots {
            if let Some(scheduled) = lock(slot).as_ref() {
                scheduled.operation.copy_shares_for_peer(peer, &mut data);
            }
        }
        data
    }

    /// Hands `data` to the active operations in slot order and returns the number of elements
    /// they consumed.
    pub fn receive_from_peer(&self, peer: PartyId, data: &[i64]) -> usize {
        let mut offset = 0;
        for slot in &self.slots {
            if let Some(scheduled) = lock(slot).as_mut() {
                let operation = &mut scheduled.operation;
                offset = operation.copy_shares_from_peer(peer, data, offset);
            }
        }
        offset
    }

    /// Random numbers the operations that have not started yet ask for, given the committed
    /// `predicates`.
    pub fn random_numbers_needed(&self, predicates: &PredicateCache) -> usize {
        let mut needed = 0;
        for slot in &self.slots {
            if let Some(scheduled) = lock(slot).as_ref() {
                needed += scheduled.operation.random_numbers_needed(predicates);
            }
        }
        for entry in &self.queue {
            if let Some(operation) = lock(entry).as_ref() {
                needed += operation.random_numbers_needed(predicates);
            }
        }
        needed
    }

    /// Distributes `numbers` in id order, counting what each operation needs the same way as
    /// [`Batch::random_numbers_needed`]. Operations left without enough numbers keep generating
    /// their own.
    pub fn supply_random_numbers(&self, numbers: Vec<Vec<i64>>, predicates: &PredicateCache) {
        let mut numbers = numbers.into_iter();
        let mut supply = |operation: &mut Box<dyn Operation>| {
            let needed = operation.random_numbers_needed(predicates);
            if needed > 0 {
                let supplied = numbers.by_ref().take(needed).collect();
                operation.supply_random_numbers(supplied);
            }
        };
        for slot in &self.slots {
            if let Some(scheduled) = lock(slot).as_mut() {
                supply(&mut scheduled.operation);
            }
        }
        for entry in &self.queue {
            if let Some(operation) = lock(entry).as_mut() {
                supply(operation);
            }
        }
    }
}
