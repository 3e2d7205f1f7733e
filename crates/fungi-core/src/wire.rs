//! Fungi probe wire format: the datagrams exchanged directly between peers.
//!
//! Every datagram starts with a fixed 80-byte `ProbeHeader`. Data datagrams
//! carry an application payload after the header; all other kinds carry
//! nothing. Multi-byte integers are big-endian on the wire.
//!
//! The same UDP socket also receives STUN traffic, so the leading magic is
//! what tells a Fungi datagram apart from anything else.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Leading bytes of every Fungi datagram.
pub const PROBE_MAGIC: [u8; 4] = *b"FNGI";

/// Current wire version. Datagrams with another version are dropped.
pub const WIRE_VERSION: u8 = 1;

/// Largest payload carried by a single Data datagram.
pub const MAX_PAYLOAD: usize = 1200;

/// Identity on the wire: BLAKE3 hash of the node id string.
pub type NodeHash = [u8; 32];

/// Hash a node id for use in probe headers.
pub fn node_hash(node_id: &str) -> NodeHash {
    *blake3::hash(node_id.as_bytes()).as_bytes()
}

/// First four bytes of a hash as hex, for log fields.
pub fn short_hash(hash: &NodeHash) -> String {
    hex::encode(&hash[..4])
}

// ── Kinds ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeKind {
    /// Hole-punching probe, sent once per round to the peer's public endpoint.
    Probe = 0x01,
    /// Reply to a probe, echoing its nonce.
    Ack = 0x02,
    /// Sent on connected links to keep the NAT mapping alive.
    Keepalive = 0x03,
    /// Application payload follows the header.
    Data = 0x04,
}

impl TryFrom<u8> for ProbeKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Probe),
            0x02 => Ok(Self::Ack),
            0x03 => Ok(Self::Keepalive),
            0x04 => Ok(Self::Data),
            other => Err(other),
        }
    }
}

// ── Header ────────────────────────────────────────────────────────────────────

/// Wire size: 80 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ProbeHeader {
    /// Always `PROBE_MAGIC`.
    pub magic: [u8; 4],
    pub version: u8,
    /// `ProbeKind` discriminant.
    pub kind: u8,
    /// Probe round, big-endian. Echoed in acks.
    round: [u8; 2],
    /// Random per-attempt nonce, big-endian. Acks must echo it.
    nonce: [u8; 8],
    /// Hash of the sending node's id.
    pub sender: NodeHash,
    /// Hash of the node this datagram is meant for.
    pub target: NodeHash,
}

assert_eq_size!(ProbeHeader, [u8; 80]);

/// Size of `ProbeHeader` on the wire.
pub const HEADER_LEN: usize = std::mem::size_of::<ProbeHeader>();

impl ProbeHeader {
    pub fn new(kind: ProbeKind, round: u16, nonce: u64, sender: NodeHash, target: NodeHash) -> Self {
        Self {
            magic: PROBE_MAGIC,
            version: WIRE_VERSION,
            kind: kind as u8,
            round: round.to_be_bytes(),
            nonce: nonce.to_be_bytes(),
            sender,
            target,
        }
    }

    /// The ack answering this probe: same round and nonce, roles swapped.
    pub fn ack(&self) -> Self {
        Self::new(ProbeKind::Ack, self.round(), self.nonce(), self.target, self.sender)
    }

    pub fn round(&self) -> u16 {
        u16::from_be_bytes(self.round)
    }

    pub fn nonce(&self) -> u64 {
        u64::from_be_bytes(self.nonce)
    }

    pub fn kind(&self) -> Option<ProbeKind> {
        ProbeKind::try_from(self.kind).ok()
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Serialize a header followed by an optional payload.
pub fn encode(header: &ProbeHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Parse a datagram. Returns None for anything that is not a current-version
/// Fungi datagram with a known kind.
pub fn decode(datagram: &[u8]) -> Option<(ProbeHeader, &[u8])> {
    let header = ProbeHeader::read_from_prefix(datagram)?;
    if header.magic != PROBE_MAGIC || header.version != WIRE_VERSION {
        return None;
    }
    header.kind()?;
    Some((header, &datagram[HEADER_LEN..]))
}
