#![allow(dead_code)]

use once_cell::sync::Lazy;
use rand::{rngs::StdRng, SeedableRng};
use shamir_rounds::{
    common::field::DEFAULT_FIELD_SIZE,
    engine::ops::split_numbers,
    network::{
        fake_network::{FakeNetwork, FakeNetworkConfig, FakeNode},
        ConnectionManager,
    },
    EngineError, OperationEngine, PartyId, PrivacyPeerSession, ProtocolError, SessionConfig,
    SessionEvent, ShamirSharing, SharingParams, MISSING_SHARE,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::mpsc::{self, Receiver},
    task::JoinSet,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

//--------------------------TRACING--------------------------

static TRACING_INIT: Lazy<()> = Lazy::new(|| {
    let filter = EnvFilter::from_default_env().add_directive("info".parse().unwrap());
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .pretty()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let old_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        old_hook(info);
        tracing::error!("{}", info);
        std::process::exit(1);
    }));
});

pub fn setup_tracing() {
    Lazy::force(&TRACING_INIT);
}

//--------------------------SHARING--------------------------

pub fn test_rng() -> StdRng {
    StdRng::seed_from_u64(0x5eed)
}

pub fn test_sharing(peers: usize, degree: Option<usize>) -> Arc<ShamirSharing> {
    let params = SharingParams::new(DEFAULT_FIELD_SIZE, degree, peers);
    let sharing = ShamirSharing::new(params).expect("valid sharing parameters");
    Arc::new(sharing)
}

/// Shares every secret among the peers of `sharing`. The result is indexed `[peer][secret]`.
pub fn share_secrets(sharing: &ShamirSharing, secrets: &[i64]) -> Vec<Vec<i64>> {
    sharing.generate_shares(secrets, &mut test_rng())
}

//--------------------------LOCAL ENGINES--------------------------

/// One single-worker engine per peer, driven in lock step without a network.
pub struct LocalParties {
    pub sharing: Arc<ShamirSharing>,
    pub engines: Vec<OperationEngine>,
    /// Peers that never deliver anything.
    pub dead: Vec<PartyId>,
    /// `(party, last round)`: the party stops delivering after its last round and is no longer
    /// driven.
    pub dropouts: Vec<(PartyId, usize)>,
}

impl LocalParties {
    pub fn new(peers: usize, degree: Option<usize>) -> Self {
        let sharing = test_sharing(peers, degree);
        let engines = (0..peers)
            .map(|party| {
                let rng = Box::new(StdRng::seed_from_u64(party as u64 + 1));
                OperationEngine::new(party, sharing.clone(), 1, rng).expect("valid engine")
            })
            .collect();
        Self {
            sharing,
            engines,
            dead: Vec::new(),
            dropouts: Vec::new(),
        }
    }

    pub fn with_dead(mut self, dead: &[PartyId]) -> Self {
        self.dead = dead.to_vec();
        self
    }

    /// `party` takes part in every round up to `last_round` and drops out afterwards.
    pub fn with_dropout(mut self, party: PartyId, last_round: usize) -> Self {
        self.dropouts.push((party, last_round));
        self
    }

    /// Every peer that is not dead, including the ones that drop out later.
    pub fn alive(&self) -> impl Iterator<Item = (PartyId, &OperationEngine)> {
        self.engines
            .iter()
            .enumerate()
            .filter(|(party, _)| !self.dead.contains(party))
    }

    /// Whether `party` delivers its data of `round`.
    fn delivers(&self, party: PartyId, round: usize) -> bool {
        let dropped = self
            .dropouts
            .iter()
            .any(|(dropout, last)| *dropout == party && round > *last);
        !self.dead.contains(&party) && !dropped
    }

    /// Whether `party` runs the batch to completion.
    fn finishes(&self, party: PartyId) -> bool {
        !self.dead.contains(&party) && self.dropouts.iter().all(|(dropout, _)| *dropout != party)
    }

    fn active(&self, round: usize) -> impl Iterator<Item = (PartyId, &OperationEngine)> {
        self.alive()
            .filter(move |(party, _)| self.delivers(*party, round))
    }

    fn all_completed(&self, round: usize) -> bool {
        self.active(round)
            .all(|(_, engine)| engine.are_operations_completed())
    }

    /// Calls `schedule` with the engine and index of every live peer.
    pub fn schedule<F>(&self, schedule: F)
    where
        F: Fn(&OperationEngine, PartyId) -> Result<(), EngineError>,
    {
        for (party, engine) in self.alive() {
            schedule(engine, party).expect("scheduling failed");
        }
    }

    /// Random numbers the first live peer asks for before its next run.
    pub fn random_numbers_needed(&self) -> usize {
        self.alive()
            .next()
            .map_or(0, |(_, engine)| engine.random_numbers_needed())
    }

    /// Runs the scheduled batch on every live peer to completion and returns the number of
    /// rounds it took.
    pub async fn run(&self) -> Result<usize, EngineError> {
        self.supply_random_numbers().await?;
        self.run_batch().await
    }

    async fn supply_random_numbers(&self) -> Result<(), EngineError> {
        let needed = self.random_numbers_needed();
        if needed == 0 {
            return Ok(());
        }
        for (_, engine) in self.alive() {
            engine.push_operations();
            engine.initialize_all(1)?;
            engine.generate_bitwise_random_numbers(0, needed)?;
        }
        self.run_batch().await?;
        for (_, engine) in self.alive() {
            let numbers = engine.result(0)?;
            engine.pop_operations()?;
            let width = engine.sharing().field().bit_length();
            engine.supply_random_numbers(split_numbers(&numbers, width));
        }
        Ok(())
    }

    /// Runs the scheduled batch without supplying random numbers first.
    pub async fn run_batch(&self) -> Result<usize, EngineError> {
        for (_, engine) in self.active(0) {
            engine.process_received_data().await?;
        }
        let mut rounds = 0;
        while !self.all_completed(rounds + 1) {
            rounds += 1;
            let mut outgoing = Vec::with_capacity(self.engines.len());
            for from in 0..self.engines.len() {
                let delivered = self.delivers(from, rounds).then(|| self.outgoing(from));
                outgoing.push(delivered);
            }
            for (to, engine) in self.active(rounds) {
                for (from, data) in outgoing.iter().enumerate() {
                    if from != to {
                        let received = data.as_ref().map(|data| data[to].clone());
                        engine.set_received_data(from, received)?;
                    }
                }
            }
            for (_, engine) in self.active(rounds) {
                engine.process_received_data().await?;
            }
        }
        Ok(rounds)
    }

    /// What `from` sends to every peer this round.
    fn outgoing(&self, from: PartyId) -> Vec<Vec<i64>> {
        let engine = &self.engines[from];
        (0..self.engines.len())
            .map(|to| engine.get_data_to_send(to))
            .collect()
    }

    /// Result `id` of every peer that finished, which must agree.
    pub fn agreed_result(&self, id: usize) -> Vec<i64> {
        let mut results = self
            .alive()
            .filter(|(party, _)| self.finishes(*party))
            .map(|(_, engine)| engine.result(id).expect("result available"));
        let first = results.next().expect("at least one live peer");
        for other in results {
            assert_eq!(first, other, "peers disagree on result {id}");
        }
        first
    }

    /// Opens the shared result `id` from the shares of the peers that finished.
    pub fn open(&self, id: usize) -> Vec<i64> {
        let mut per_peer = Vec::with_capacity(self.engines.len());
        for (party, engine) in self.engines.iter().enumerate() {
            if self.finishes(party) {
                per_peer.push(Some(engine.result(id).expect("result available")));
            } else {
                per_peer.push(None);
            }
        }
        let width = per_peer.iter().flatten().map(Vec::len).max().unwrap_or(0);
        let mut opened = Vec::with_capacity(width);
        for position in 0..width {
            let mut column = Vec::with_capacity(per_peer.len());
            for shares in &per_peer {
                let share = shares.as_ref().and_then(|shares| shares.get(position));
                column.push(share.copied().unwrap_or(MISSING_SHARE));
            }
            let secret = self.sharing.interpolate(&column, false);
            opened.push(secret.expect("enough shares to open"));
        }
        opened
    }
}

//--------------------------SESSIONS--------------------------

pub struct Peer {
    pub session: PrivacyPeerSession<FakeNode>,
    pub events: Receiver<SessionEvent>,
}

impl Peer {
    pub fn party(&self) -> PartyId {
        self.session.party()
    }

    /// Events emitted so far.
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

pub fn test_config(peers: usize) -> SessionConfig {
    SessionConfig {
        receive_timeout_ms: 5_000,
        ..SessionConfig::new(peers)
    }
}

/// Nodes of a fresh fake network, one per peer.
pub fn test_nodes(peers: usize) -> Vec<Arc<FakeNode>> {
    let config = FakeNetworkConfig::new(500, Duration::from_secs(10));
    FakeNetwork::new(peers, config)
        .into_iter()
        .map(Arc::new)
        .collect()
}

/// Creates one session per node.
pub fn sessions_over(config: &SessionConfig, nodes: Vec<Arc<FakeNode>>) -> Vec<Peer> {
    let mut peers = Vec::with_capacity(nodes.len());
    for node in nodes {
        let (sender, events) = mpsc::channel(64);
        let session = PrivacyPeerSession::new(config, node, sender)
            .expect("valid session configuration");
        peers.push(Peer { session, events });
    }
    peers
}

/// Creates one session per peer over a fresh fake network. The nodes of `dead` peers are
/// dropped right away, so the others see their links closed.
pub fn test_sessions(config: &SessionConfig, dead: &[PartyId]) -> Vec<Peer> {
    let nodes = test_nodes(config.peers)
        .into_iter()
        .filter(|node| !dead.contains(&node.id()))
        .collect();
    sessions_over(config, nodes)
}

/// Runs the scheduled batch of every session concurrently. Peers are returned in party order
/// along with their outcome.
pub async fn run_sessions(peers: Vec<Peer>) -> Vec<(Peer, Result<(), ProtocolError>)> {
    let mut set = JoinSet::new();
    for mut peer in peers {
        set.spawn(async move {
            let outcome = peer.session.run_batch().await;
            (peer, outcome)
        });
    }
    let mut finished = Vec::new();
    while let Some(joined) = set.join_next().await {
        finished.push(joined.expect("session task panicked"));
    }
    finished.sort_by_key(|(peer, _)| peer.party());
    info!(peers = finished.len(), "sessions finished");
    finished
}

/// Closes every session concurrently.
pub async fn close_sessions(peers: Vec<Peer>) -> Vec<Peer> {
    let mut set = JoinSet::new();
    for mut peer in peers {
        set.spawn(async move {
            peer.session.close().await.expect("close failed");
            peer
        });
    }
    let mut closed = Vec::new();
    while let Some(joined) = set.join_next().await {
        closed.push(joined.expect("close task panicked"));
    }
    closed.sort_by_key(|peer| peer.party());
    closed
}
