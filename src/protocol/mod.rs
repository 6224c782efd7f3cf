//! The round protocol run by a privacy peer for each of its counterparts.
pub mod session;

use crate::{
    common::{metrics::RoundMetrics, PartyId},
    engine::{ops::split_numbers, EngineError, OperationEngine},
    network::{ConnectionManager, Message, NetworkError},
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Error that occurs while running the round protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("engine error: {0:?}")]
    Engine(EngineError),
    /// The error occurs when communicating using the network.
    #[error("there was an error in the network: {0:?}")]
    Network(#[from] NetworkError),
    #[error("error while (de)serializing a round message: {0:?}")]
    Serialization(#[from] bincode::Error),
    #[error("share error: {0:?}")]
    Share(#[from] crate::common::share::ShareError),
    #[error("configuration error: {0:?}")]
    Config(#[from] crate::common::config::ConfigError),
    #[error("invalid session configuration: {0}")]
    InvalidConfiguration(String),
    #[error("the session has failed or was closed")]
    SessionClosed,
    #[error("the protocol was stopped")]
    Stopped,
    #[error("peer {peer} sent round {received} while in round {expected}")]
    RoundMismatch {
        peer: PartyId,
        expected: u64,
        received: u64,
    },
}

impl From<EngineError> for ProtocolError {
    fn from(error: EngineError) -> Self {
        match error {
            EngineError::Stopped => ProtocolError::Stopped,
            error => ProtocolError::Engine(error),
        }
    }
}

/// Message exchanged between two privacy peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundMessage {
    /// The flat share buffer of one round.
    Shares {
        sender: PartyId,
        round: u64,
        shares: Vec<i64>,
    },
    /// The sender will not send anything else.
    Goodbye { sender: PartyId },
}

/// Drives the engine across the link between the local peer and one counterpart.
pub struct RoundProtocol<C: ConnectionManager> {
    party: PartyId,
    counterpart: PartyId,
    engine: Arc<OperationEngine>,
    connection: Arc<C>,
    /// The lower id sends first in every round, so both ends never wait on each other.
    sends_first: bool,
    round: u64,
    counterpart_offline: bool,
    receive_timeout: Duration,
    metrics: Arc<RoundMetrics>,
}

impl<C: ConnectionManager> RoundProtocol<C> {
    pub fn new(
        counterpart: PartyId,
        engine: Arc<OperationEngine>,
        connection: Arc<C>,
        metrics: Arc<RoundMetrics>,
    ) -> Self {
        let party = engine.party();
        Self {
            party,
            counterpart,
            engine,
            connection,
            sends_first: party < counterpart,
            round: 0,
            counterpart_offline: false,
            receive_timeout: Duration::from_secs(30),
            metrics,
        }
    }

    /// A receive blocking longer than `receive_timeout` counts as a dummy.
    pub fn with_receive_timeout(mut self, receive_timeout: Duration) -> Self {
        self.receive_timeout = receive_timeout;
        self
    }

    pub fn counterpart(&self) -> PartyId {
        self.counterpart
    }

    pub fn is_counterpart_offline(&self) -> bool {
        self.counterpart_offline
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Runs the current batch of the engine to completion, generating the random numbers its
    /// comparisons need first.
    pub async fn run(&mut self) -> Result<(), ProtocolError> {
        self.prepare_random_numbers().await?;
        self.run_batch().await
    }

    /// Suspends the batch, generates the bitwise shared random numbers it asks for in a batch
    /// of its own and hands them over once the batch is restored.
    async fn prepare_random_numbers(&mut self) -> Result<(), ProtocolError> {
        let needed = self.engine.random_numbers_needed();
        if needed == 0 {
            return Ok(());
        }

        // 1. Suspend the batch and schedule the generation.
        if self.engine.synchronize().await {
            info!(party = self.party, needed, "generating random numbers");
            self.engine.push_operations();
            let scheduled = self
                .engine
                .initialize_all(1)
                .and_then(|_| self.engine.generate_bitwise_random_numbers(0, needed));
            if let Err(e) = scheduled {
                warn!(party = self.party, "cannot schedule random numbers: {e}");
                self.engine.abort();
            }
        }
        self.engine.synchronize().await;
        if self.engine.is_aborted() {
            return Err(EngineError::BatchAborted.into());
        }

        // 2. Generate.
        self.run_batch().await?;

        // 3. Restore the batch and distribute the numbers.
        if self.engine.synchronize().await {
            let width = self.engine.sharing().field().bit_length();
            let generated = self.engine.result(0);
            let restored = generated.and_then(|numbers| {
                self.engine.pop_operations()?;
                Ok(numbers)
            });
            match restored {
                Ok(numbers) => {
                    let numbers = split_numbers(&numbers, width);
                    self.engine.supply_random_numbers(numbers);
                }
                Err(e) => {
                    warn!(party = self.party, "could not restore the batch: {e}");
                    self.engine.abort();
                }
            }
        }
        self.engine.synchronize().await;
        if self.engine.is_aborted() {
            return Err(EngineError::BatchAborted.into());
        }
        Ok(())
    }

    async fn run_batch(&mut self) -> Result<(), ProtocolError> {
        self.engine.process_received_data().await?;
        while !self.engine.are_operations_completed() {
            self.exchange().await?;
            self.engine.process_received_data().await?;
        }
        debug!(
            party = self.party,
            counterpart = self.counterpart, round = self.round, "batch completed"
        );
        Ok(())
    }

    /// Exchanges the share buffers of one round with the counterpart.
    async fn exchange(&mut self) -> Result<(), ProtocolError> {
        let outgoing = self.engine.get_data_to_send(self.counterpart);
        self.round += 1;
        self.metrics.record_round();
        if self.counterpart_offline {
            self.engine.set_received_data(self.counterpart, None)?;
            return Ok(());
        }

        let received = if self.sends_first {
            self.send(outgoing).await?;
            self.receive().await?
        } else {
            let received = self.receive().await?;
            self.send(outgoing).await?;
            received
        };
        self.engine.set_received_data(self.counterpart, received)?;
        Ok(())
    }

    async fn send(&mut self, shares: Vec<i64>) -> Result<(), ProtocolError> {
        if self.counterpart_offline {
            return Ok(());
        }
        let elements = shares.len();
        let message = RoundMessage::Shares {
            sender: self.party,
            round: self.round,
            shares,
        };
        let payload = bincode::serialize(&message)?;
        match self.connection.send(self.counterpart, payload).await {
            Ok(_) => {
                self.metrics.record_sent(elements);
                Ok(())
            }
            Err(NetworkError::NotConnected(_)) => {
                self.mark_offline();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Returns `None` once the counterpart is offline.
    async fn receive(&mut self) -> Result<Option<Vec<i64>>, ProtocolError> {
        if self.counterpart_offline {
            return Ok(None);
        }
        let payload = match self.receive_message().await? {
            Message::Data(payload) => payload,
            Message::Dummy => {
                self.metrics.record_dummy();
                self.mark_offline();
                return Ok(None);
            }
        };
        match bincode::deserialize::<RoundMessage>(&payload)? {
            RoundMessage::Shares { round, shares, .. } => {
                if round != self.round {
                    return Err(ProtocolError::RoundMismatch {
                        peer: self.counterpart,
                        expected: self.round,
                        received: round,
                    });
                }
                self.metrics.record_received(shares.len());
                Ok(Some(shares))
            }
            RoundMessage::Goodbye { .. } => {
                self.mark_offline();
                Ok(None)
            }
        }
    }

    async fn receive_message(&self) -> Result<Message, ProtocolError> {
        let receive = self.connection.receive(self.counterpart);
        match timeout(self.receive_timeout, receive).await {
            Ok(message) => Ok(message?),
            Err(_) => {
                debug!(
                    party = self.party,
                    counterpart = self.counterpart, round = self.round, "receive timed out"
                );
                Ok(Message::Dummy)
            }
        }
    }

    fn mark_offline(&mut self) {
        if !self.counterpart_offline {
            warn!(
                party = self.party,
                counterpart = self.counterpart, round = self.round, "counterpart went offline"
            );
            self.counterpart_offline = true;
        }
    }

    /// Tells the counterpart that nothing else will be sent.
    pub async fn say_goodbye(&mut self) -> Result<(), ProtocolError> {
        if self.counterpart_offline {
            return Ok(());
        }
        let message = RoundMessage::Goodbye { sender: self.party };
        let payload = bincode::serialize(&message)?;
        match self.connection.send(self.counterpart, payload).await {
            Ok(_) | Err(NetworkError::NotConnected(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Waits for the goodbye of the counterpart. A dummy counts as one.
    pub async fn await_goodbye(&mut self) -> Result<(), ProtocolError> {
        while !self.counterpart_offline {
            match self.receive_message().await? {
                Message::Dummy => self.mark_offline(),
                Message::Data(payload) => {
                    let message: RoundMessage = bincode::deserialize(&payload)?;
                    if let RoundMessage::Goodbye { sender } = message {
                        debug!(party = self.party, sender, "received goodbye");
                        self.counterpart_offline = true;
                    }
                }
            }
        }
        Ok(())
    }
}
