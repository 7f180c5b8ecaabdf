//! Control-channel wire format.
//!
//! Every push and shutdown notification is a single framed datagram: a
//! fixed 7-byte header followed by a serialized payload. The header is
//! `#[repr(C, packed)]` with network-endian integers and zerocopy derives,
//! so it can be read straight off the datagram without allocation. The
//! payload encoding (bincode) is deterministic and length-prefixed; the
//! same encoding feeds the convergence hashes.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use zerocopy::byteorder::{NetworkEndian, U16};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::event::{PongEvent, RegisterEvent};
use crate::Vertex;

// ── Frame header ─────────────────────────────────────────────────────────────

/// Fixed header preceding every control datagram.
///
/// Wire size: 7 bytes, network byte order.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// Sender's logical vertex. The supernode uses [`crate::SUPER_ID`].
    pub src: U16<NetworkEndian>,
    /// Target's logical vertex.
    pub dst: U16<NetworkEndian>,
    /// Always zero for supernode-originated control traffic.
    pub ttl: u8,
    /// Payload length in bytes, not including this header.
    pub length: U16<NetworkEndian>,
}

assert_eq_size!(FrameHeader, [u8; 7]);

/// Header length in bytes.
pub const FRAME_HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

/// Largest payload a frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

// ── Control payload ──────────────────────────────────────────────────────────

/// What a server-originated control message asks the edge to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateAction {
    /// Pull the next-hop table named by `params`.
    UpdateNhTable,
    /// Pull the peer roster named by `params`.
    UpdatePeer,
    /// Pull this peer's runtime parameters named by `params`.
    UpdateSuperParams,
    /// The peer has been removed; tear the tunnel down.
    Shutdown,
}

/// Error code carried by shutdown notifications for removed peers (ENOENT).
pub const CODE_PEER_REMOVED: i32 = 2;

/// A server-originated control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCommand {
    pub node_id: Vertex,
    pub action: UpdateAction,
    pub code: i32,
    /// Hash of the artifact to pull, or a human-readable reason for
    /// `Shutdown`.
    pub params: String,
}

/// Everything that can ride inside a control frame, in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlPayload {
    /// Edge → supernode liveness/state report.
    Register(RegisterEvent),
    /// Edge → supernode latency measurement.
    Pong(PongEvent),
    /// Supernode → edge push or shutdown notification.
    Update(ServerCommand),
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("payload length {0} exceeds maximum {MAX_FRAME_PAYLOAD}")]
    PayloadTooLarge(usize),

    #[error("datagram too short: {0} bytes")]
    Truncated(usize),

    #[error("header declares {declared} payload bytes, datagram carries {carried}")]
    LengthMismatch { declared: usize, carried: usize },

    #[error("payload codec: {0}")]
    Codec(#[from] bincode::Error),
}

// ── Encode / decode ──────────────────────────────────────────────────────────

/// Frame an already-encoded payload.
pub fn frame(src: Vertex, dst: Vertex, payload: &[u8]) -> Result<Bytes, WireError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(WireError::PayloadTooLarge(payload.len()));
    }
    let header = FrameHeader {
        src: U16::new(src),
        dst: U16::new(dst),
        ttl: 0,
        length: U16::new(payload.len() as u16),
    };
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Encode and frame a control payload in one step.
pub fn encode_frame(src: Vertex, dst: Vertex, payload: &ControlPayload) -> Result<Bytes, WireError> {
    let body = bincode::serialize(payload)?;
    frame(src, dst, &body)
}

/// Split a datagram into its header and decoded payload.
pub fn decode_frame(datagram: &[u8]) -> Result<(FrameHeader, ControlPayload), WireError> {
    let header = FrameHeader::read_from_prefix(datagram)
        .ok_or(WireError::Truncated(datagram.len()))?;
    let declared = header.length.get() as usize;
    let carried = datagram.len() - FRAME_HEADER_LEN;
    if declared != carried {
        return Err(WireError::LengthMismatch { declared, carried });
    }
    let payload = bincode::deserialize(&datagram[FRAME_HEADER_LEN..])?;
    Ok((header, payload))
}

// ── Tests ────────────────────────────────────────────────────────────────────
