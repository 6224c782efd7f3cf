//! A privacy peer session: one engine shared by the round protocols of all links.
use crate::{
    common::{
        config::SessionConfig,
        metrics::{MetricsSnapshot, RoundMetrics},
        share::shamir::ShamirSharing,
        PartyId,
    },
    engine::OperationEngine,
    network::ConnectionManager,
    protocol::{ProtocolError, RoundProtocol},
};
use futures::future::{join_all, try_join_all};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::mpsc::Sender;
use tracing::{debug, info, warn};

/// What a session reports to its owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionEvent {
    /// Reported once per counterpart, after the batch in which it went offline.
    CounterpartOffline(PartyId),
    BatchCompleted { batch: u64 },
    /// Reported at most once. The session accepts no further batches.
    Failed(String),
    /// Every counterpart has said goodbye.
    AllPeersOffline,
}

pub struct PrivacyPeerSession<C: ConnectionManager> {
    party: PartyId,
    engine: Arc<OperationEngine>,
    links: Vec<RoundProtocol<C>>,
    metrics: Arc<RoundMetrics>,
    stopper: Arc<AtomicBool>,
    events: Sender<SessionEvent>,
    reported_offline: Vec<bool>,
    batches: u64,
    failed: bool,
    closed: bool,
}

impl<C: ConnectionManager> PrivacyPeerSession<C> {
    /// Sets up the engine of the peer behind `connection` and one round protocol per
    /// counterpart. Each round protocol is one worker of the engine, so `protocol_threads`
    /// must be `peers - 1`.
    pub fn new(
        config: &SessionConfig,
        connection: Arc<C>,
        events: Sender<SessionEvent>,
    ) -> Result<Self, ProtocolError> {
        let party = connection.id();
        if config.peers < 2 {
            return Err(ProtocolError::InvalidConfiguration(format!(
                "a session needs at least two peers, got {}",
                config.peers
            )));
        }
        let threads = config.protocol_threads();
        let counterparts = config.peers - 1;
        if threads != counterparts {
            return Err(ProtocolError::InvalidConfiguration(format!(
                "got {threads} protocol threads, expected one per counterpart ({counterparts})"
            )));
        }

        let sharing = ShamirSharing::new(config.sharing_params())?;
        let rng = config.random_algorithm()?.build();
        let stopper = Arc::new(AtomicBool::new(false));
        let engine = OperationEngine::new(party, Arc::new(sharing), counterparts, rng)?;
        let engine = Arc::new(engine.with_stopper(stopper.clone()));
        let metrics = Arc::new(RoundMetrics::new());
        let mut links = Vec::with_capacity(counterparts);
        for counterpart in (0..config.peers).filter(|counterpart| *counterpart != party) {
            let link = RoundProtocol::new(
                counterpart,
                engine.clone(),
                connection.clone(),
                metrics.clone(),
            );
            links.push(link.with_receive_timeout(config.receive_timeout()));
        }

        info!(party, peers = config.peers, "privacy peer session created");
        Ok(Self {
            party,
            engine,
            links,
            metrics,
            stopper,
            events,
            reported_offline: vec![false; config.peers],
            batches: 0,
            failed: false,
            closed: false,
        })
    }

    pub fn party(&self) -> PartyId {
        self.party
    }

    /// Operations are scheduled on the engine before [`PrivacyPeerSession::run_batch`].
    pub fn engine(&self) -> &Arc<OperationEngine> {
        &self.engine
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Setting the returned flag stops the session at the start of the next round.
    pub fn stopper(&self) -> Arc<AtomicBool> {
        self.stopper.clone()
    }

    pub fn stop(&self) {
        self.stopper.store(true, Ordering::SeqCst);
    }

    pub fn batches_completed(&self) -> u64 {
        self.batches
    }

    /// Runs the batch scheduled on the engine to completion over all links.
    pub async fn run_batch(&mut self) -> Result<(), ProtocolError> {
        if self.failed || self.closed {
            return Err(ProtocolError::SessionClosed);
        }
        let outcome = try_join_all(self.links.iter_mut().map(|link| link.run())).await;
        self.report_offline().await;

        match outcome {
            Ok(_) => {
                self.batches += 1;
                debug!(party = self.party, batch = self.batches, "batch completed");
                let event = SessionEvent::BatchCompleted {
                    batch: self.batches,
                };
                self.emit(event).await;
                Ok(())
            }
            Err(e) => {
                warn!(party = self.party, "session failed: {e}");
                self.failed = true;
                self.emit(SessionEvent::Failed(e.to_string())).await;
                Err(e)
            }
        }
    }

    /// Says goodbye to every counterpart and waits for theirs.
    pub async fn close(&mut self) -> Result<(), ProtocolError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        for link in &mut self.links {
            link.say_goodbye().await?;
        }
        join_all(self.links.iter_mut().map(|link| link.await_goodbye()))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        info!(party = self.party, "all counterparts are offline");
        self.emit(SessionEvent::AllPeersOffline).await;
        Ok(())
    }

    async fn report_offline(&mut self) {
        let offline: Vec<PartyId> = self
            .links
            .iter()
            .filter(|link| link.is_counterpart_offline())
            .map(|link| link.counterpart())
            .filter(|counterpart| !self.reported_offline[*counterpart])
            .collect();
        for counterpart in offline {
            self.reported_offline[counterpart] = true;
            let event = SessionEvent::CounterpartOffline(counterpart);
            self.emit(event).await;
        }
    }

    async fn emit(&self, event: SessionEvent) {
        if self.events.send(event).await.is_err() {
            debug!(party = self.party, "session events are no longer received");
        }
    }
}
