//! UDP-backed control device.
//!
//! One per enabled address family. Peer endpoints start unresolved and are
//! learned from ingress traffic; until then next-hop pushes to that family
//! are skipped. Sends go through a bounded egress queue — a full queue or a
//! socket error just drops the datagram, convergence is restored by the
//! ticker fabric.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use meshplane_core::crypto::{PresharedKey, PublicKey};
use meshplane_core::Vertex;
use meshplane_services::{AddrFamily, DeviceError, EdgeDevice};

const EGRESS_QUEUE_DEPTH: usize = 1024;

struct DevicePeer {
    node_id: Vertex,
    endpoint: Option<SocketAddr>,
}

pub struct UdpDevice {
    family: AddrFamily,
    peers: DashMap<String, DevicePeer>,
    ids: DashMap<Vertex, String>,
    outbound: mpsc::Sender<(SocketAddr, Bytes)>,
}

impl UdpDevice {
    /// Wrap a bound socket and spawn its egress task.
    pub fn spawn(family: AddrFamily, socket: Arc<UdpSocket>) -> Arc<Self> {
        let (outbound, mut rx) = mpsc::channel::<(SocketAddr, Bytes)>(EGRESS_QUEUE_DEPTH);

        let egress_socket = socket;
        let label = family.label();
        tokio::spawn(async move {
            while let Some((addr, packet)) = rx.recv().await {
                if let Err(e) = egress_socket.send_to(&packet, addr).await {
                    tracing::debug!(family = label, %addr, error = %e, "control send failed");
                }
            }
        });

        Arc::new(Self {
            family,
            peers: DashMap::new(),
            ids: DashMap::new(),
            outbound,
        })
    }

    /// Remember where a peer last spoke from on this family.
    pub fn learn_endpoint(&self, node_id: Vertex, addr: SocketAddr) {
        let Some(pubkey) = self.ids.get(&node_id) else {
            return;
        };
        if let Some(mut peer) = self.peers.get_mut(pubkey.value()) {
            if peer.endpoint != Some(addr) {
                tracing::debug!(family = self.family.label(), node_id, %addr, "endpoint learned");
                peer.endpoint = Some(addr);
            }
        }
    }
}

impl EdgeDevice for UdpDevice {
    fn family(&self) -> AddrFamily {
        self.family
    }

    fn add_peer(
        &self,
        node_id: Vertex,
        pubkey: &PublicKey,
        _psk: Option<&PresharedKey>,
    ) -> Result<(), DeviceError> {
        let key = pubkey.to_base64();
        self.ids.insert(node_id, key.clone());
        self.peers.insert(
            key,
            DevicePeer {
                node_id,
                endpoint: None,
            },
        );
        Ok(())
    }

    fn remove_peer(&self, node_id: Vertex, pubkey: &str) {
        self.ids.remove(&node_id);
        self.peers.remove(pubkey);
    }

    fn knows_peer(&self, pubkey: &str) -> bool {
        self.peers.contains_key(pubkey)
    }

    fn endpoint_resolved(&self, pubkey: &str) -> bool {
        self.peers
            .get(pubkey)
            .map(|p| p.endpoint.is_some())
            .unwrap_or(false)
    }

    fn send_control(&self, pubkey: &str, packet: Bytes) {
        let Some(peer) = self.peers.get(pubkey) else {
            return;
        };
        let Some(addr) = peer.endpoint else {
            tracing::trace!(
                family = self.family.label(),
                node_id = peer.node_id,
                "no endpoint yet, control datagram skipped"
            );
            return;
        };
        if self.outbound.try_send((addr, packet)).is_err() {
            tracing::debug!(
                family = self.family.label(),
                node_id = peer.node_id,
                "egress queue full, control datagram dropped"
            );
        }
    }
}
