//! Node wiring: one socket, one registration loop, one discovery loop and
//! one connection manager, all sharing a shutdown signal.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use fungi_core::config::FungiConfig;
use fungi_core::record::validate_node_id;

use crate::connection::{
    ConnectionControl, ConnectionError, ConnectionInfo, ConnectionManager, ConnectionSnapshot,
    InboundData, ProbeTiming,
};
use crate::discovery::Discovery;
use crate::error::NodeError;
use crate::registration::{Registration, RegistrationState, RegistrationTiming};
use crate::resolver::{EndpointResolver, LocalResolver, StunResolver};
use crate::signaling::{HttpSignalingClient, SignalingApi};
use crate::socket::NodeSocket;

const EVENT_QUEUE: usize = 64;
const SIGNALING_TIMEOUT: Duration = Duration::from_secs(5);
/// How long shutdown waits for the loops to wind down before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

pub struct Node;

impl Node {
    /// Start with the resolver and signaling client the config asks for:
    /// STUN when `stun.server` is set, the bound address otherwise.
    pub async fn from_config(config: &FungiConfig) -> Result<NodeHandle, NodeError> {
        let resolver: Arc<dyn EndpointResolver> = if config.stun.server.is_empty() {
            let advertise_ip = parse_advertise_ip(&config.node.advertise_ip)?;
            Arc::new(LocalResolver::new(advertise_ip))
        } else {
            Arc::new(StunResolver::from_config(&config.stun))
        };
        let signaling = Arc::new(HttpSignalingClient::new(
            &config.node.server_url,
            SIGNALING_TIMEOUT,
        )?);
        Self::start(config, resolver, signaling).await
    }

    /// Bind the socket, resolve the public endpoint, and spawn the loops.
    /// Fails on a config the loops cannot run with, or if the endpoint
    /// cannot be resolved at all.
    pub async fn start(
        config: &FungiConfig,
        resolver: Arc<dyn EndpointResolver>,
        signaling: Arc<dyn SignalingApi>,
    ) -> Result<NodeHandle, NodeError> {
        config.validate()?;

        let node_id = config.node.node_id.clone();
        validate_node_id(&node_id)?;

        let bind_addr: SocketAddr =
            config
                .node
                .bind_addr
                .parse()
                .map_err(|_| NodeError::Config {
                    field: "node.bind_addr",
                    value: config.node.bind_addr.clone(),
                })?;
        let socket =
            NodeSocket::bind(bind_addr).map_err(|source| NodeError::Bind { addr: bind_addr, source })?;

        if config.heartbeat_is_tight() {
            tracing::warn!(
                heartbeat_secs = config.node.heartbeat_interval_secs,
                ttl_secs = config.registry.ttl_secs,
                "heartbeat leaves fewer than three refreshes per ttl"
            );
        }

        let registration = Registration::new(
            node_id.clone(),
            socket.clone(),
            resolver,
            signaling.clone(),
            RegistrationTiming {
                heartbeat: config.node.heartbeat_interval(),
                ttl: config.registry.ttl(),
                retry_base: config.stun.base_delay(),
            },
        );
        registration.resolve_initial().await?;

        let endpoint = registration.subscribe_endpoint();
        let registration_state = registration.subscribe_state();

        // ── Shutdown channel ─────────────────────────────────────────────────
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        // ── Spawn tasks ──────────────────────────────────────────────────────
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

        let mut manager = ConnectionManager::new(
            node_id.clone(),
            socket.clone(),
            ProbeTiming::from_config(&config.probe, &config.node),
            events_rx,
            shutdown_tx.subscribe(),
        );
        let control = manager.control();
        let connections = manager.subscribe();
        let inbound = manager.take_inbound();

        let tasks = vec![
            tokio::spawn(registration.run(shutdown_tx.subscribe())),
            tokio::spawn(
                Discovery::new(
                    node_id.clone(),
                    signaling,
                    config.node.poll_interval(),
                    events_tx,
                    shutdown_tx.subscribe(),
                )
                .run(),
            ),
            tokio::spawn(manager.run()),
        ];

        tracing::info!(
            node_id = %node_id,
            local = %socket.local_addr(),
            public = ?*endpoint.borrow(),
            "node started"
        );

        Ok(NodeHandle {
            node_id,
            local_addr: socket.local_addr(),
            endpoint,
            registration_state,
            connections,
            control,
            inbound,
            shutdown_tx,
            tasks,
        })
    }
}

fn parse_advertise_ip(value: &str) -> Result<Option<IpAddr>, NodeError> {
    if value.is_empty() {
        return Ok(None);
    }
    value.parse().map(Some).map_err(|_| NodeError::Config {
        field: "node.advertise_ip",
        value: value.to_string(),
    })
}

/// A running node.
pub struct NodeHandle {
    node_id: String,
    local_addr: SocketAddr,
    endpoint: watch::Receiver<Option<SocketAddr>>,
    registration_state: watch::Receiver<RegistrationState>,
    connections: watch::Receiver<ConnectionSnapshot>,
    control: ConnectionControl,
    inbound: Option<mpsc::Receiver<InboundData>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Last resolved public endpoint.
    pub fn public_endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.borrow()
    }

    pub fn subscribe_endpoint(&self) -> watch::Receiver<Option<SocketAddr>> {
        self.endpoint.clone()
    }

    pub fn registration_state(&self) -> RegistrationState {
        *self.registration_state.borrow()
    }

    pub fn subscribe_connections(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.connections.clone()
    }

    pub fn connection(&self, peer_id: &str) -> Option<ConnectionInfo> {
        self.connections.borrow().get(peer_id).cloned()
    }

    pub fn control(&self) -> ConnectionControl {
        self.control.clone()
    }

    pub async fn send(&self, peer_id: &str, payload: Vec<u8>) -> Result<(), ConnectionError> {
        self.control.send(peer_id, payload).await
    }

    pub async fn close(&self, peer_id: &str) -> Result<bool, ConnectionError> {
        self.control.close(peer_id).await
    }

    /// Payloads from connected peers. Can be taken once.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<InboundData>> {
        self.inbound.take()
    }

    /// Signal every loop to stop, deregister, and wait for them to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            let abort = task.abort_handle();
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                abort.abort();
            }
        }
        tracing::info!(node_id = %self.node_id, "node stopped");
    }
}
