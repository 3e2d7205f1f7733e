//! The node's single UDP socket, shared by STUN resolution and peer traffic.
//!
//! Sends are unrestricted. Reads go through a read gate: the connection
//! manager reads in short slices, and the resolver holds the gate for the
//! whole of a STUN exchange so the manager never swallows a STUN response.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, MutexGuard};

/// Longest time a reader holds the gate waiting for a datagram.
pub const READ_SLICE: Duration = Duration::from_millis(250);

#[derive(Clone)]
pub struct NodeSocket {
    inner: Arc<UdpSocket>,
    read_gate: Arc<Mutex<()>>,
    local_addr: SocketAddr,
}

impl NodeSocket {
    /// Bind a UDP socket. An address already in use is an error. Must be
    /// called inside a runtime.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let inner = UdpSocket::from_std(socket.into())?;
        let local_addr = inner.local_addr()?;
        Ok(Self {
            inner: Arc::new(inner),
            read_gate: Arc::new(Mutex::new(())),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.inner.send_to(buf, target).await
    }

    /// Take exclusive read access. Other readers wait until the guard drops.
    pub async fn lock_reads(&self) -> MutexGuard<'_, ()> {
        self.read_gate.lock().await
    }

    /// Raw socket, for callers already holding the read gate.
    pub fn udp(&self) -> &UdpSocket {
        &self.inner
    }

    /// Wait up to `slice` for one datagram. `Ok(None)` when nothing arrived.
    pub async fn recv_slice(
        &self,
        buf: &mut [u8],
        slice: Duration,
    ) -> io::Result<Option<(usize, SocketAddr)>> {
        let _gate = self.read_gate.lock().await;
        match tokio::time::timeout(slice, self.inner.recv_from(buf)).await {
            Ok(Ok(received)) => Ok(Some(received)),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }
}
