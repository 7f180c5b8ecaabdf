//! The push engine.
//!
//! Three categories of update, each delivered to every alive peer whose
//! acked hash diverges from the current artifact (or unconditionally under
//! `force`). A push is one framed datagram per device; next-hop pushes only
//! go out on a family with a resolved endpoint. Everything here is
//! best-effort and fire-and-forget — convergence is restored by the ticker
//! fabric and the edges' own register retries.
//!
//! All three entry points take the registry read guard by reference: the
//! caller already holds the supernode lock shared, and nothing here
//! re-enters it.

use bytes::Bytes;

use meshplane_core::wire::{encode_frame, ControlPayload, ServerCommand, UpdateAction};
use meshplane_core::SUPER_ID;

use crate::registry::Registry;
use crate::supernode::Supernode;

impl Supernode {
    /// Push the next-hop table hash to peers that have not acked it.
    pub fn push_nh_table(&self, registry: &Registry, force: bool) {
        let hash = self.nh_hash();
        let Some(packet) = update_packet(UpdateAction::UpdateNhTable, &hash) else {
            return;
        };
        let mut sent = 0usize;
        for (pubkey, record) in registry.records() {
            if !self.is_alive(record) {
                continue;
            }
            if !force && record.nh_hash_acked() == hash {
                continue;
            }
            for device in self.devices() {
                if device.endpoint_resolved(pubkey) {
                    device.send_control(pubkey, packet.clone());
                    sent += 1;
                }
            }
        }
        if sent > 0 {
            tracing::debug!(sent, force, hash = %hash, "pushed next-hop table");
        }
    }

    /// Push the roster hash to peers that have not acked it.
    pub fn push_peer_info(&self, registry: &Registry, force: bool) {
        let hash = self.peer_hash();
        let Some(packet) = update_packet(UpdateAction::UpdatePeer, &hash) else {
            return;
        };
        let mut sent = 0usize;
        for (pubkey, record) in registry.records() {
            if !self.is_alive(record) {
                continue;
            }
            if !force && record.peer_hash_acked() == hash {
                continue;
            }
            for device in self.devices() {
                if device.knows_peer(pubkey) {
                    device.send_control(pubkey, packet.clone());
                    sent += 1;
                }
            }
        }
        if sent > 0 {
            tracing::debug!(sent, force, hash = %hash, "pushed peer info");
        }
    }

    /// Push each peer's runtime-parameter hash where it diverges from what
    /// the peer last acked. The packet is per-peer here.
    pub fn push_super_params(&self, registry: &Registry, force: bool) {
        let mut sent = 0usize;
        for (pubkey, record) in registry.records() {
            if !self.is_alive(record) {
                continue;
            }
            let hash = record.params_hash();
            if !force && record.params_hash_acked() == hash {
                continue;
            }
            let Some(packet) = update_packet(UpdateAction::UpdateSuperParams, &hash) else {
                return;
            };
            for device in self.devices() {
                if device.knows_peer(pubkey) {
                    device.send_control(pubkey, packet.clone());
                    sent += 1;
                }
            }
        }
        if sent > 0 {
            tracing::debug!(sent, force, "pushed runtime parameters");
        }
    }
}

/// Build one framed update naming the target hash. Encoding failures are
/// logged and swallowed; the next ticker pass retries.
fn update_packet(action: UpdateAction, hash: &str) -> Option<Bytes> {
    let command = ServerCommand {
        node_id: SUPER_ID,
        action,
        code: 0,
        params: hash.to_string(),
    };
    match encode_frame(SUPER_ID, SUPER_ID, &ControlPayload::Update(command)) {
        Ok(packet) => Some(packet),
        Err(e) => {
            tracing::warn!(?action, error = %e, "failed to encode update packet");
            None
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::testing::MemoryDevice;
    use crate::device::AddrFamily;
    use meshplane_core::config::{PeerConfig, SuperConfig};
    use meshplane_core::crypto::Keypair;
    use meshplane_core::wire::decode_frame;

    fn peer(node_id: u16) -> PeerConfig {
        PeerConfig {
            node_id,
            name: format!("node_{node_id:02}"),
            pubkey: Keypair::generate().public.to_base64(),
            psk: None,
            additional_cost: 0.0,
        }
    }

    fn build() -> (Arc<Supernode>, Arc<MemoryDevice>, Arc<MemoryDevice>, String) {
        let v4 = Arc::new(MemoryDevice::new(AddrFamily::V4));
        let v6 = Arc::new(MemoryDevice::new(AddrFamily::V6));
        let cfg = SuperConfig {
            peers: vec![peer(1)],
            ..SuperConfig::default()
        };
        let node = Supernode::new(cfg, vec![v4.clone(), v6.clone()]).unwrap();
        let pubkey = node.registry().peer(1).unwrap().pubkey.clone();
        (node, v4, v6, pubkey)
    }

    fn actions(device: &MemoryDevice) -> Vec<UpdateAction> {
        device
            .sent()
            .iter()
            .map(|(_, packet)| match decode_frame(packet).unwrap().1 {
                ControlPayload::Update(cmd) => cmd.action,
                other => panic!("unexpected payload: {other:?}"),
            })
            .collect()
    }

    #[test]
    fn dead_peers_get_nothing_even_under_force() {
        let (node, v4, _, pubkey) = build();
        v4.resolve(&pubkey);

        let registry = node.registry();
        node.push_nh_table(&registry, true);
        node.push_peer_info(&registry, true);
        node.push_super_params(&registry, true);
        assert!(v4.sent().is_empty());
    }

    #[test]
    fn nh_push_requires_a_resolved_endpoint() {
        let (node, v4, v6, pubkey) = build();
        node.registry().record_for_id(1).unwrap().touch();

        // No endpoint anywhere: nothing goes out.
        let registry = node.registry();
        node.push_nh_table(&registry, false);
        assert!(v4.sent().is_empty());
        assert!(v6.sent().is_empty());

        // Endpoint on one family only: exactly that family sends.
        v4.resolve(&pubkey);
        node.push_nh_table(&registry, false);
        assert_eq!(actions(&v4), vec![UpdateAction::UpdateNhTable]);
        assert!(v6.sent().is_empty());
    }

    #[test]
    fn peer_info_and_params_send_wherever_the_peer_exists() {
        let (node, v4, v6, _) = build();
        node.registry().record_for_id(1).unwrap().touch();

        let registry = node.registry();
        node.push_peer_info(&registry, false);
        node.push_super_params(&registry, false);
        assert_eq!(
            actions(&v4),
            vec![UpdateAction::UpdatePeer, UpdateAction::UpdateSuperParams]
        );
        assert_eq!(
            actions(&v6),
            vec![UpdateAction::UpdatePeer, UpdateAction::UpdateSuperParams]
        );
    }

    #[test]
    fn acked_hashes_suppress_repeat_pushes() {
        let (node, v4, _v6, pubkey) = build();
        let registry = node.registry();
        let record = registry.record_for_id(1).unwrap();
        record.touch();
        v4.resolve(&pubkey);

        node.push_nh_table(&registry, false);
        node.push_peer_info(&registry, false);
        node.push_super_params(&registry, false);
        let first_burst = v4.sent().len();
        assert!(first_burst > 0);

        // The edge acks everything (as a register would store it).
        record.set_nh_hash_acked(node.nh_hash());
        record.set_peer_hash_acked(node.peer_hash());
        record.set_params_hash_acked(record.params_hash());

        v4.clear_sent();
        node.push_nh_table(&registry, false);
        node.push_peer_info(&registry, false);
        node.push_super_params(&registry, false);
        assert!(v4.sent().is_empty(), "converged peer gets no pushes");

        // Force overrides convergence.
        node.push_nh_table(&registry, true);
        assert_eq!(v4.sent().len(), 1);
    }

    #[test]
    fn params_push_names_the_per_peer_hash() {
        let (node, v4, _v6, _) = build();
        let registry = node.registry();
        let record = registry.record_for_id(1).unwrap();
        record.touch();

        node.push_super_params(&registry, false);
        let (_, packet) = &v4.sent()[0];
        match decode_frame(packet).unwrap().1 {
            ControlPayload::Update(cmd) => assert_eq!(cmd.params, record.params_hash()),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
