//! Per-peer task: hole-punching probe rounds, then keepalive and data.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use fungi_core::backoff::Backoff;
use fungi_core::record::PeerEndpoint;
use fungi_core::wire::{self, NodeHash, ProbeHeader, ProbeKind};

use crate::socket::NodeSocket;

use super::{ConnectionState, InboundData, ProbeTiming};

/// Routed to a peer task by the connection manager.
#[derive(Debug)]
pub(crate) enum PeerInput {
    /// Probe from the peer. The manager has already acked it.
    Probe { from: SocketAddr },
    /// Ack datagram from the peer.
    Ack { nonce: u64, from: SocketAddr },
    Keepalive,
    /// Data datagram payload from the peer.
    Data(Vec<u8>),
    /// Local payload to send to the peer.
    Send(Vec<u8>),
}

/// State report from a peer task back to the manager.
#[derive(Debug)]
pub(crate) struct StatusUpdate {
    pub peer_id: String,
    pub generation: u64,
    pub state: ConnectionState,
    pub retry_count: u32,
    pub last_attempt: Option<Instant>,
}

enum ProbeOutcome {
    /// Our probe was acked and the peer's traffic reached us.
    Established,
    Exhausted,
    /// The manager dropped the connection mid-probe.
    Closed,
}

pub(crate) struct PeerTask {
    peer: PeerEndpoint,
    generation: u64,
    local_hash: NodeHash,
    peer_hash: NodeHash,
    socket: NodeSocket,
    timing: ProbeTiming,
    input: mpsc::Receiver<PeerInput>,
    status: mpsc::UnboundedSender<StatusUpdate>,
    inbound: mpsc::Sender<InboundData>,
    nonce: u64,
    retry_count: u32,
    last_attempt: Option<Instant>,
}

impl PeerTask {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        peer: PeerEndpoint,
        generation: u64,
        local_hash: NodeHash,
        socket: NodeSocket,
        timing: ProbeTiming,
        input: mpsc::Receiver<PeerInput>,
        status: mpsc::UnboundedSender<StatusUpdate>,
        inbound: mpsc::Sender<InboundData>,
    ) -> Self {
        let peer_hash = wire::node_hash(&peer.node_id);
        Self {
            peer,
            generation,
            local_hash,
            peer_hash,
            socket,
            timing,
            input,
            status,
            inbound,
            nonce: rand::random(),
            retry_count: 0,
            last_attempt: None,
        }
    }

    pub(crate) async fn run(mut self) {
        match self.probe().await {
            ProbeOutcome::Established => {
                tracing::info!(
                    peer = %self.peer.node_id,
                    remote = %self.peer.addr,
                    rounds = self.retry_count,
                    "peer connected"
                );
                self.report(ConnectionState::Connected);
                self.connected().await;
            }
            ProbeOutcome::Exhausted => {
                tracing::info!(
                    peer = %self.peer.node_id,
                    remote = %self.peer.addr,
                    rounds = self.retry_count,
                    "peer unreachable"
                );
                self.report(ConnectionState::Unreachable);
            }
            ProbeOutcome::Closed => {}
        }
    }

    /// Send one probe per round, doubling the wait each round, until the
    /// path is proven both ways: an ack echoing our nonce shows our probes
    /// reach the peer, and a probe, keepalive or data datagram from the peer
    /// shows its traffic reaches us. An ack alone only proves the outbound
    /// path, since acks go to wherever the probe came from.
    async fn probe(&mut self) -> ProbeOutcome {
        let mut backoff = Backoff::new(self.timing.base_delay, Duration::MAX);
        let mut acked = false;
        let mut heard = false;

        for round in 0..self.timing.max_rounds {
            let wire_round = u16::try_from(round).unwrap_or(u16::MAX);
            self.send(ProbeKind::Probe, wire_round, &[]).await;
            self.retry_count = round + 1;
            self.last_attempt = Some(Instant::now());
            self.report(ConnectionState::Probing);

            let wait = tokio::time::sleep(backoff.next_delay());
            tokio::pin!(wait);

            loop {
                tokio::select! {
                    _ = &mut wait => break,

                    input = self.input.recv() => {
                        match input {
                            Some(PeerInput::Ack { nonce, from }) if nonce == self.nonce => {
                                tracing::debug!(peer = %self.peer.node_id, from = %from, round, "probe acked");
                                acked = true;
                            }
                            Some(PeerInput::Ack { from, .. }) => {
                                tracing::trace!(peer = %self.peer.node_id, from = %from, "stale ack");
                            }
                            Some(PeerInput::Probe { from }) => {
                                tracing::debug!(peer = %self.peer.node_id, from = %from, round, "probe received");
                                heard = true;
                            }
                            Some(PeerInput::Keepalive) => heard = true,
                            Some(PeerInput::Data(payload)) => {
                                heard = true;
                                self.deliver(payload);
                            }
                            Some(PeerInput::Send(_)) => {}
                            None => return ProbeOutcome::Closed,
                        }
                        if acked && heard {
                            return ProbeOutcome::Established;
                        }
                    }
                }
            }
        }

        ProbeOutcome::Exhausted
    }

    async fn connected(&mut self) {
        let mut keepalive = tokio::time::interval(self.timing.keepalive);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = keepalive.tick() => self.send(ProbeKind::Keepalive, 0, &[]).await,

                input = self.input.recv() => match input {
                    Some(PeerInput::Send(payload)) => self.send(ProbeKind::Data, 0, &payload).await,
                    Some(PeerInput::Data(payload)) => self.deliver(payload),
                    // Peer is still probing and has to hear from us.
                    Some(PeerInput::Probe { .. }) => self.send(ProbeKind::Keepalive, 0, &[]).await,
                    Some(PeerInput::Ack { .. }) | Some(PeerInput::Keepalive) => {}
                    None => return,
                },
            }
        }
    }

    async fn send(&self, kind: ProbeKind, round: u16, payload: &[u8]) {
        let header = ProbeHeader::new(kind, round, self.nonce, self.local_hash, self.peer_hash);
        if let Err(e) = self.socket.send_to(&wire::encode(&header, payload), self.peer.addr).await {
            tracing::debug!(peer = %self.peer.node_id, kind = ?kind, error = %e, "send failed");
        }
    }

    fn deliver(&self, payload: Vec<u8>) {
        let data = InboundData {
            peer_id: self.peer.node_id.clone(),
            payload,
        };
        match self.inbound.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(peer = %self.peer.node_id, "inbound queue full, dropping payload");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    fn report(&self, state: ConnectionState) {
        let _ = self.status.send(StatusUpdate {
            peer_id: self.peer.node_id.clone(),
            generation: self.generation,
            state,
            retry_count: self.retry_count,
            last_attempt: self.last_attempt,
        });
    }
}
