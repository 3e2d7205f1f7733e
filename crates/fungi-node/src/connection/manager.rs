//! Connection manager.
//!
//! A single task owns the connection table and the read side of the node
//! socket. It turns discovery events into per-peer tasks, answers probes
//! statelessly, and routes every datagram from a known peer (probes
//! included) to the peer task named by the header's sender hash. Peer tasks report state back over a channel;
//! the table is published to observers as a watch snapshot.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use fungi_core::record::PeerEndpoint;
use fungi_core::wire::{self, NodeHash, ProbeKind, MAX_PAYLOAD};

use crate::discovery::DiscoveryEvent;
use crate::socket::{NodeSocket, READ_SLICE};

use super::peer::{PeerInput, PeerTask, StatusUpdate};
use super::{
    ConnectionError, ConnectionInfo, ConnectionSnapshot, ConnectionState, InboundData,
    ProbeTiming,
};

const PEER_QUEUE: usize = 64;
const INBOUND_QUEUE: usize = 256;
const COMMAND_QUEUE: usize = 64;
const RECV_BUF: usize = 2048;

enum Command {
    Send {
        peer_id: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), ConnectionError>>,
    },
    Close {
        peer_id: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle for sending to and closing connections.
#[derive(Clone)]
pub struct ConnectionControl {
    tx: mpsc::Sender<Command>,
}

impl ConnectionControl {
    /// Queue a payload for a connected peer.
    pub async fn send(&self, peer_id: &str, payload: Vec<u8>) -> Result<(), ConnectionError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(ConnectionError::PayloadTooLarge(payload.len()));
        }
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Send {
                peer_id: peer_id.to_string(),
                payload,
                reply,
            })
            .await
            .map_err(|_| ConnectionError::Stopped)?;
        rx.await.map_err(|_| ConnectionError::Stopped)?
    }

    /// Close a connection. Returns false if it was unknown or already closed.
    pub async fn close(&self, peer_id: &str) -> Result<bool, ConnectionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Close {
                peer_id: peer_id.to_string(),
                reply,
            })
            .await
            .map_err(|_| ConnectionError::Stopped)?;
        rx.await.map_err(|_| ConnectionError::Stopped)
    }
}

struct Link {
    tx: mpsc::Sender<PeerInput>,
    task: JoinHandle<()>,
}

struct Slot {
    info: ConnectionInfo,
    hash: NodeHash,
    /// Distinguishes this connection from earlier ones to the same peer.
    generation: u64,
    /// None once closed.
    link: Option<Link>,
}

pub struct ConnectionManager {
    node_id: String,
    local_hash: NodeHash,
    socket: NodeSocket,
    timing: ProbeTiming,
    slots: HashMap<String, Slot>,
    by_hash: HashMap<NodeHash, String>,
    next_generation: u64,
    events: mpsc::Receiver<DiscoveryEvent>,
    commands_tx: mpsc::Sender<Command>,
    commands: mpsc::Receiver<Command>,
    status_tx: mpsc::UnboundedSender<StatusUpdate>,
    status: mpsc::UnboundedReceiver<StatusUpdate>,
    inbound_tx: mpsc::Sender<InboundData>,
    inbound_rx: Option<mpsc::Receiver<InboundData>>,
    snapshot: watch::Sender<ConnectionSnapshot>,
    shutdown: broadcast::Receiver<()>,
}

impl ConnectionManager {
    pub fn new(
        node_id: String,
        socket: NodeSocket,
        timing: ProbeTiming,
        events: mpsc::Receiver<DiscoveryEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (status_tx, status) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (snapshot, _) = watch::channel(ConnectionSnapshot::new());
        Self {
            local_hash: wire::node_hash(&node_id),
            node_id,
            socket,
            timing,
            slots: HashMap::new(),
            by_hash: HashMap::new(),
            next_generation: 0,
            events,
            commands_tx,
            commands,
            status_tx,
            status,
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            snapshot,
            shutdown,
        }
    }

    pub fn control(&self) -> ConnectionControl {
        ConnectionControl {
            tx: self.commands_tx.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Payloads received from connected peers. Can be taken once.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<InboundData>> {
        self.inbound_rx.take()
    }

    pub async fn run(mut self) {
        let mut buf = vec![0u8; RECV_BUF];
        let mut events_open = true;

        tracing::info!(
            node_id = %self.node_id,
            local = %self.socket.local_addr(),
            "connection manager starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("connection manager shutting down");
                    break;
                }

                event = self.events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event),
                    None => events_open = false,
                },

                Some(command) = self.commands.recv() => self.handle_command(command),

                Some(update) = self.status.recv() => self.apply_status(update),

                received = self.socket.recv_slice(&mut buf, READ_SLICE) => match received {
                    Ok(Some((len, from))) => self.handle_datagram(&buf[..len], from).await,
                    Ok(None) => {}
                    Err(e) => tracing::debug!(error = %e, "recv_from failed"),
                },
            }
        }

        self.close_all();
    }

    // ── Discovery events ──────────────────────────────────────────────────────

    fn handle_event(&mut self, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::Discovered(peer) => self.open(peer),
            DiscoveryEvent::Removed(peer_id) => self.forget(&peer_id),
        }
    }

    /// Destroy a connection outright, dropping any closed entry with it.
    fn forget(&mut self, peer_id: &str) {
        let Some(slot) = self.slots.remove(peer_id) else {
            return;
        };
        self.by_hash.remove(&slot.hash);
        if let Some(link) = slot.link {
            link.task.abort();
        }
        tracing::info!(peer = %peer_id, "peer left registry, connection dropped");
        self.publish();
    }

    /// Start a connection attempt, superseding any existing connection.
    fn open(&mut self, peer: PeerEndpoint) {
        if peer.node_id == self.node_id {
            return;
        }
        self.close(&peer.node_id, "superseded");

        self.next_generation += 1;
        let generation = self.next_generation;
        let hash = wire::node_hash(&peer.node_id);
        let (tx, rx) = mpsc::channel(PEER_QUEUE);

        tracing::debug!(peer = %peer.node_id, remote = %peer.addr, generation, "peer discovered");

        let task = tokio::spawn(
            PeerTask::new(
                peer.clone(),
                generation,
                self.local_hash,
                self.socket.clone(),
                self.timing.clone(),
                rx,
                self.status_tx.clone(),
                self.inbound_tx.clone(),
            )
            .run(),
        );

        self.by_hash.insert(hash, peer.node_id.clone());
        self.slots.insert(
            peer.node_id.clone(),
            Slot {
                info: ConnectionInfo {
                    peer_id: peer.node_id,
                    remote: peer.addr,
                    state: ConnectionState::Discovered,
                    retry_count: 0,
                    last_attempt: None,
                },
                hash,
                generation,
                link: Some(Link { tx, task }),
            },
        );
        self.publish();
    }

    /// Tear down a connection, leaving it visible as `Closed` until the peer
    /// leaves the view. Closing an unknown or closed peer is a no-op.
    fn close(&mut self, peer_id: &str, reason: &str) -> bool {
        let Some(slot) = self.slots.get_mut(peer_id) else {
            return false;
        };
        let Some(link) = slot.link.take() else {
            return false;
        };

        link.task.abort();
        self.by_hash.remove(&slot.hash);
        slot.info.state = ConnectionState::Closed;
        tracing::info!(peer = %peer_id, reason, "connection closed");
        self.publish();
        true
    }

    fn close_all(&mut self) {
        for slot in self.slots.values_mut() {
            if let Some(link) = slot.link.take() {
                link.task.abort();
                slot.info.state = ConnectionState::Closed;
            }
        }
        self.by_hash.clear();
        self.publish();
    }

    // ── Commands and peer reports ─────────────────────────────────────────────

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send {
                peer_id,
                payload,
                reply,
            } => {
                let _ = reply.send(self.forward(&peer_id, payload));
            }
            Command::Close { peer_id, reply } => {
                let _ = reply.send(self.close(&peer_id, "closed locally"));
            }
        }
    }

    fn forward(&self, peer_id: &str, payload: Vec<u8>) -> Result<(), ConnectionError> {
        let slot = self
            .slots
            .get(peer_id)
            .ok_or_else(|| ConnectionError::UnknownPeer(peer_id.to_string()))?;
        let link = slot
            .link
            .as_ref()
            .filter(|_| slot.info.state == ConnectionState::Connected)
            .ok_or_else(|| ConnectionError::NotConnected(peer_id.to_string()))?;

        link.tx
            .try_send(PeerInput::Send(payload))
            .map_err(|e| match e {
                TrySendError::Full(_) => ConnectionError::Backpressure(peer_id.to_string()),
                TrySendError::Closed(_) => ConnectionError::NotConnected(peer_id.to_string()),
            })
    }

    fn apply_status(&mut self, update: StatusUpdate) {
        let Some(slot) = self.slots.get_mut(&update.peer_id) else {
            return;
        };
        if slot.generation != update.generation || slot.link.is_none() {
            return;
        }
        slot.info.state = update.state;
        slot.info.retry_count = update.retry_count;
        slot.info.last_attempt = update.last_attempt;
        self.publish();
    }

    // ── Datagrams ─────────────────────────────────────────────────────────────

    async fn handle_datagram(&mut self, datagram: &[u8], from: SocketAddr) {
        let Some((header, payload)) = wire::decode(datagram) else {
            tracing::trace!(from = %from, len = datagram.len(), "ignoring foreign datagram");
            return;
        };
        if header.target != self.local_hash {
            tracing::trace!(from = %from, "datagram not addressed to us");
            return;
        }

        let input = match header.kind() {
            Some(ProbeKind::Probe) => {
                // Stateless responder: ack to wherever the probe came from.
                let ack = wire::encode(&header.ack(), &[]);
                if let Err(e) = self.socket.send_to(&ack, from).await {
                    tracing::debug!(to = %from, error = %e, "ack send failed");
                }
                PeerInput::Probe { from }
            }
            Some(ProbeKind::Ack) => PeerInput::Ack {
                nonce: header.nonce(),
                from,
            },
            Some(ProbeKind::Keepalive) => PeerInput::Keepalive,
            Some(ProbeKind::Data) => PeerInput::Data(payload.to_vec()),
            None => return,
        };

        let Some(link) = self
            .by_hash
            .get(&header.sender)
            .and_then(|peer_id| self.slots.get(peer_id))
            .and_then(|slot| slot.link.as_ref())
        else {
            tracing::trace!(
                from = %from,
                sender = %wire::short_hash(&header.sender),
                "datagram from unknown peer"
            );
            return;
        };

        if let Err(TrySendError::Full(_)) = link.tx.try_send(input) {
            tracing::debug!(from = %from, "peer queue full, dropping datagram");
        }
    }

    fn publish(&self) {
        let snapshot: ConnectionSnapshot = self
            .slots
            .iter()
            .map(|(id, slot)| (id.clone(), slot.info.clone()))
            .collect();
        self.snapshot.send_replace(snapshot);
    }
}
