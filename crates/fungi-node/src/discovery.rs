//! Discovery loop: polls the signaling server and diffs the active peer set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use fungi_core::record::PeerEndpoint;

use crate::signaling::SignalingApi;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Discovered(PeerEndpoint),
    Removed(String),
}

/// Last fetched active peer set.
#[derive(Debug, Default, Clone)]
pub struct PeerView {
    peers: HashMap<String, SocketAddr>,
}

impl PeerView {
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, node_id: &str) -> Option<SocketAddr> {
        self.peers.get(node_id).copied()
    }

    /// Replace the view with `fresh` and return what changed.
    ///
    /// Removals come first. A peer whose endpoint moved is reported as
    /// removed and then discovered again. `own_id` is never part of the view.
    pub fn update(&mut self, fresh: Vec<PeerEndpoint>, own_id: &str) -> Vec<DiscoveryEvent> {
        let next: HashMap<String, SocketAddr> = fresh
            .into_iter()
            .filter(|p| p.node_id != own_id)
            .map(|p| (p.node_id, p.addr))
            .collect();

        let mut events = Vec::new();
        for (id, addr) in &self.peers {
            if next.get(id) != Some(addr) {
                events.push(DiscoveryEvent::Removed(id.clone()));
            }
        }
        for (id, addr) in &next {
            if self.peers.get(id) != Some(addr) {
                events.push(DiscoveryEvent::Discovered(PeerEndpoint::new(id.clone(), *addr)));
            }
        }

        self.peers = next;
        events
    }
}

pub struct Discovery {
    node_id: String,
    signaling: Arc<dyn SignalingApi>,
    poll_interval: Duration,
    view: PeerView,
    events: mpsc::Sender<DiscoveryEvent>,
    shutdown: broadcast::Receiver<()>,
}

impl Discovery {
    pub fn new(
        node_id: String,
        signaling: Arc<dyn SignalingApi>,
        poll_interval: Duration,
        events: mpsc::Sender<DiscoveryEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            node_id,
            signaling,
            poll_interval,
            view: PeerView::default(),
            events,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("discovery loop shutting down");
                    return;
                }

                _ = interval.tick() => {
                    if !self.poll().await {
                        tracing::debug!("connection manager gone, discovery stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One poll. Returns false once nobody is listening for events.
    async fn poll(&mut self) -> bool {
        let peers = match self.signaling.list_peers(&self.node_id).await {
            Ok(peers) => peers,
            Err(e) => {
                tracing::warn!(error = %e, known = self.view.len(), "peer poll failed, keeping last view");
                return true;
            }
        };

        let events = self.view.update(peers, &self.node_id);
        if !events.is_empty() {
            tracing::debug!(changes = events.len(), peers = self.view.len(), "peer view updated");
        }
        for event in events {
            if self.events.send(event).await.is_err() {
                return false;
            }
        }
        true
    }
}
