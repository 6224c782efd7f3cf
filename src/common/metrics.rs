//! Round statistics of one session.
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared by the round protocols of one session. Each session owns its own instance.
#[derive(Debug, Default)]
pub struct RoundMetrics {
    rounds: AtomicU64,
    elements_sent: AtomicU64,
    elements_received: AtomicU64,
    dummies: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub rounds: u64,
    pub elements_sent: u64,
    pub elements_received: u64,
    pub dummies: u64,
}

impl RoundMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_round(&self) {
        self.rounds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sent(&self, elements: usize) {
        self.elements_sent
            .fetch_add(elements as u64, Ordering::Relaxed);
    }

    pub fn record_received(&self, elements: usize) {
        self.elements_received
            .fetch_add(elements as u64, Ordering::Relaxed);
    }

    pub fn record_dummy(&self) {
        self.dummies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            rounds: self.rounds.load(Ordering::Relaxed),
            elements_sent: self.elements_sent.load(Ordering::Relaxed),
            elements_received: self.elements_received.load(Ordering::Relaxed),
            dummies: self.dummies.load(Ordering::Relaxed),
        }
    }
}
