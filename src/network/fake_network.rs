//! In-memory network for tests. Every directed pair of peers is connected by a `tokio` channel.
use crate::{
    common::PartyId,
    network::{ConnectionManager, Message, NetworkError},
};
use async_trait::async_trait;
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        PoisonError, RwLock,
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc::{self, Receiver, Sender},
        Mutex,
    },
    time::timeout,
};
use tracing::debug;

/// Configuration for the fake network.
#[derive(Clone, Debug)]
pub struct FakeNetworkConfig {
    /// Size of the buffer for the channels in the fake network.
    pub channel_buff_size: usize,
    /// How long a receive waits before yielding a dummy.
    pub receive_timeout: Duration,
}

impl FakeNetworkConfig {
    /// Creates a new configuration for the fake network.
    pub fn new(channel_buff_size: usize, receive_timeout: Duration) -> Self {
        Self {
            channel_buff_size,
            receive_timeout,
        }
    }
}

impl Default for FakeNetworkConfig {
    fn default() -> Self {
        Self::new(500, Duration::from_secs(30))
    }
}

pub struct FakeNetwork;

impl FakeNetwork {
    /// Creates `n_nodes` fully connected nodes. Dropping a node (or calling
    /// [`FakeNode::disconnect`]) closes its outgoing channels, which is how a dead peer is
    /// simulated.
    pub fn new(n_nodes: usize, config: FakeNetworkConfig) -> Vec<FakeNode> {
        let mut senders: Vec<Vec<Option<Sender<Vec<u8>>>>> = (0..n_nodes)
            .map(|_| (0..n_nodes).map(|_| None).collect())
            .collect();
        let mut receivers: Vec<Vec<Option<Mutex<Receiver<Vec<u8>>>>>> = (0..n_nodes)
            .map(|_| (0..n_nodes).map(|_| None).collect())
            .collect();

        for from in 0..n_nodes {
            for to in (0..n_nodes).filter(|to| *to != from) {
                let (sender, receiver) = mpsc::channel(config.channel_buff_size);
                senders[from][to] = Some(sender);
                receivers[to][from] = Some(Mutex::new(receiver));
            }
        }

        senders
            .into_iter()
            .zip(receivers)
            .enumerate()
            .map(|(id, (senders, receivers))| FakeNode {
                id,
                senders: senders.into_iter().map(RwLock::new).collect(),
                receivers,
                receive_timeout: config.receive_timeout,
                disconnected: AtomicBool::new(false),
                sends_left: AtomicUsize::new(usize::MAX),
            })
            .collect()
    }
}

/// Represents a node in the FakeNetwork.
pub struct FakeNode {
    id: PartyId,
    /// `senders[peer]` delivers to `peer`.
    senders: Vec<RwLock<Option<Sender<Vec<u8>>>>>,
    /// `receivers[peer]` yields what `peer` sent.
    receivers: Vec<Option<Mutex<Receiver<Vec<u8>>>>>,
    receive_timeout: Duration,
    disconnected: AtomicBool,
    /// Successful sends left before the node disconnects, `usize::MAX` for never.
    sends_left: AtomicUsize,
}

impl FakeNode {
    pub fn peers(&self) -> usize {
        self.senders.len()
    }

    /// Closes the outgoing channels of this node. Counterparts still receive what was sent
    /// before and dummies afterwards. Later sends of the node fail and its receives yield
    /// dummies.
    pub fn disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(id = self.id, "disconnecting fake node");
        for sender in &self.senders {
            *sender.write().unwrap_or_else(PoisonError::into_inner) = None;
        }
    }

    /// Disconnects once `sends` more sends have succeeded, right away for zero.
    pub fn disconnect_after(&self, sends: usize) {
        if sends == 0 {
            self.disconnect();
        } else {
            self.sends_left.store(sends, Ordering::SeqCst);
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn count_send(&self) {
        let previous = self
            .sends_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 | usize::MAX => None,
                left => Some(left - 1),
            });
        if previous == Ok(1) {
            self.disconnect();
        }
    }
}

#[async_trait]
impl ConnectionManager for FakeNode {
    fn id(&self) -> PartyId {
        self.id
    }

    async fn send(&self, peer: PartyId, payload: Vec<u8>) -> Result<usize, NetworkError> {
        let sender = self
            .senders
            .get(peer)
            .ok_or(NetworkError::PartyNotFound(peer))?
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(NetworkError::NotConnected(peer))?;
        let length = payload.len();
        sender
            .send(payload)
            .await
            .map_err(|_| NetworkError::NotConnected(peer))?;
        self.count_send();
        Ok(length)
    }

    async fn receive(&self, peer: PartyId) -> Result<Message, NetworkError> {
        let Some(receiver) = self
            .receivers
            .get(peer)
            .ok_or(NetworkError::PartyNotFound(peer))?
        else {
            return Ok(Message::Dummy);
        };
        if self.is_disconnected() {
            return Ok(Message::Dummy);
        }
        let mut receiver = receiver.lock().await;
        match timeout(self.receive_timeout, receiver.recv()).await {
            Ok(Some(payload)) => Ok(Message::Data(payload)),
            Ok(None) => {
                debug!(id = self.id, peer, "channel closed, substituting a dummy");
                Ok(Message::Dummy)
            }
            Err(_) => {
                debug!(id = self.id, peer, "receive timed out");
                Ok(Message::Dummy)
            }
        }
    }
}
