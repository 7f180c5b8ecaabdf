//! End-to-end scenarios: events in through the dispatcher, packets out
//! through an in-memory device pair.

use std::sync::Arc;
use std::time::Duration;

use meshplane_core::config::{PeerConfig, SuperConfig};
use meshplane_core::crypto::Keypair;
use meshplane_core::event::{PongEvent, RegisterEvent};
use meshplane_core::wire::{decode_frame, ControlPayload, UpdateAction};
use meshplane_core::{NextHopTable, Vertex};
use meshplane_services::device::testing::MemoryDevice;
use meshplane_services::{event_channels, AddrFamily, Dispatcher, EdgeDevice, EventChannels, Supernode};

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    node: Arc<Supernode>,
    device: Arc<MemoryDevice>,
    channels: EventChannels,
}

fn peer_cfg(node_id: Vertex) -> PeerConfig {
    PeerConfig {
        node_id,
        name: format!("node_{node_id:02}"),
        pubkey: Keypair::generate().public.to_base64(),
        psk: None,
        additional_cost: 0.0,
    }
}

/// Build a supernode over one in-memory v4 device, register nothing, spawn
/// the dispatcher.
fn start(mut cfg: SuperConfig, peers: Vec<PeerConfig>) -> Harness {
    cfg.peers = peers;
    let device = Arc::new(MemoryDevice::new(AddrFamily::V4));
    let devices: Vec<Arc<dyn EdgeDevice>> = vec![device.clone()];
    let node = Supernode::new(cfg, devices).unwrap();

    let (channels, receivers) = event_channels();
    tokio::spawn(Dispatcher::new(node.clone(), receivers).run());

    Harness {
        node,
        device,
        channels,
    }
}

fn dynamic_config(cooldown: f64, jitter: f64, multiplier: f64) -> SuperConfig {
    let mut cfg = SuperConfig::default();
    cfg.graph.recalculate_cooldown = cooldown;
    cfg.graph.jitter_tolerance = jitter;
    cfg.graph.jitter_tolerance_multiplier = multiplier;
    cfg
}

fn register_event(node_id: Vertex, nh: &str, peer: &str, params: &str) -> RegisterEvent {
    RegisterEvent {
        node_id,
        http_post_count: 7,
        nh_state_hash: nh.into(),
        peer_state_hash: peer.into(),
        super_param_state_hash: params.into(),
        version: "test".into(),
        ..RegisterEvent::default()
    }
}

fn pong_event(src: Vertex, dst: Vertex, latency: f64) -> PongEvent {
    PongEvent {
        request_id: 0,
        src_node_id: src,
        dst_node_id: dst,
        timediff: latency,
        time_to_alive: 600.0,
        additional_cost: 0.0,
    }
}

fn sent_actions(device: &MemoryDevice, pubkey: &str) -> Vec<UpdateAction> {
    device
        .sent_to(pubkey)
        .iter()
        .map(|packet| match decode_frame(packet).unwrap().1 {
            ControlPayload::Update(cmd) => cmd.action,
            other => panic!("unexpected payload: {other:?}"),
        })
        .collect()
}

fn count_action(device: &MemoryDevice, pubkey: &str, action: UpdateAction) -> usize {
    sent_actions(device, pubkey)
        .into_iter()
        .filter(|a| *a == action)
        .count()
}

fn hop(table: &NextHopTable, src: Vertex, dst: Vertex) -> Option<Vertex> {
    table.get(&src).and_then(|row| row.get(&dst)).copied()
}

async fn eventually(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Give the dispatcher a moment to process anything in flight.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(120)).await;
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn two_node_bootstrap_pushes_each_category_once() {
    let mut cfg = SuperConfig::default();
    cfg.graph.static_mode = true;
    cfg.next_hop_table = Some(NextHopTable::from([
        (1, [(2, 2)].into()),
        (2, [(1, 1)].into()),
    ]));

    let h = start(cfg, vec![peer_cfg(1), peer_cfg(2)]);
    let pk1 = h.node.registry().peer(1).unwrap().pubkey.clone();
    let pk2 = h.node.registry().peer(2).unwrap().pubkey.clone();
    h.device.resolve(&pk1);
    h.device.resolve(&pk2);

    for (id, pk) in [(1, &pk1), (2, &pk2)] {
        // First register with out-of-date hashes: all three categories push.
        h.channels
            .offer_register(register_event(id, "stale", "stale", "stale"));
        eventually(
            || h.device.sent_to(pk).len() == 3,
            "three pushes after first register",
        )
        .await;

        // Register echoing the current hashes: converged, no push.
        let params = h.node.registry().record_for_id(id).unwrap().params_hash();
        h.channels.offer_register(register_event(
            id,
            &h.node.nh_hash(),
            &h.node.peer_hash(),
            &params,
        ));
        settle().await;
        assert_eq!(h.device.sent_to(pk).len(), 3);
    }

    for pk in [&pk1, &pk2] {
        assert_eq!(count_action(&h.device, pk, UpdateAction::UpdateNhTable), 1);
        assert_eq!(count_action(&h.device, pk, UpdateAction::UpdatePeer), 1);
        assert_eq!(
            count_action(&h.device, pk, UpdateAction::UpdateSuperParams),
            1
        );
    }

    // Static mode: the configured table is served verbatim.
    assert_eq!(hop(&h.node.nh_table(), 1, 2), Some(2));
    assert_eq!(hop(&h.node.nh_table(), 2, 1), Some(1));

    // A ticker sentinel mutates no record.
    h.channels.offer_register(RegisterEvent::sentinel());
    settle().await;
    assert_eq!(
        h.node.registry().record_for_id(1).unwrap().http_post_count(),
        7
    );
}

#[tokio::test]
async fn jittery_samples_cause_no_recompute_or_push() {
    let h = start(
        dynamic_config(0.0, 5.0, 1.01),
        vec![peer_cfg(1), peer_cfg(2), peer_cfg(3)],
    );
    // Converged registers so every peer is alive without provoking pushes.
    for id in [1, 2, 3] {
        let pk = h.node.registry().peer(id).unwrap().pubkey.clone();
        h.device.resolve(&pk);
        let params = h.node.registry().record_for_id(id).unwrap().params_hash();
        h.channels.offer_register(register_event(
            id,
            &h.node.nh_hash(),
            &h.node.peer_hash(),
            &params,
        ));
    }
    settle().await;
    assert!(h.device.sent().is_empty());

    // Direct path 1 -> 2 at 100 beats the relay through 3 at 110.
    h.channels.offer_pong(pong_event(1, 3, 10.0));
    h.channels.offer_pong(pong_event(3, 2, 100.0));
    h.channels.offer_pong(pong_event(1, 2, 100.0));
    eventually(
        || hop(&h.node.nh_table(), 1, 2) == Some(2),
        "direct route established",
    )
    .await;
    settle().await;
    let first_hash = h.node.nh_hash();
    h.device.clear_sent();

    // 101 sits inside [100/1.01 - 5, 100*1.01 + 5]: suppressed entirely.
    h.channels.offer_pong(pong_event(1, 2, 101.0));
    settle().await;
    assert!(h.device.sent().is_empty());
    assert_eq!(h.node.nh_hash(), first_hash);
    assert_eq!(hop(&h.node.nh_table(), 1, 2), Some(2));

    // 120 falls outside the window: the relay wins, the hash moves, and
    // every alive peer gets a push.
    h.channels.offer_pong(pong_event(1, 2, 120.0));
    eventually(|| h.device.sent().len() == 3, "push after real change").await;
    assert_ne!(h.node.nh_hash(), first_hash);
    assert_eq!(hop(&h.node.nh_table(), 1, 2), Some(3));
}

#[tokio::test]
async fn cooldown_defers_recompute_until_sentinel_sweep() {
    let h = start(
        dynamic_config(0.3, 0.0, 1.0),
        vec![peer_cfg(1), peer_cfg(2), peer_cfg(3)],
    );
    for id in [1, 2, 3] {
        let pk = h.node.registry().peer(id).unwrap().pubkey.clone();
        h.device.resolve(&pk);
        let params = h.node.registry().record_for_id(id).unwrap().params_hash();
        h.channels.offer_register(register_event(
            id,
            &h.node.nh_hash(),
            &h.node.peer_hash(),
            &params,
        ));
    }
    settle().await;
    h.device.clear_sent();

    // First measurement recomputes immediately: direct hop 1 -> 2.
    h.channels.offer_pong(pong_event(1, 2, 1.0));
    eventually(|| h.device.sent().len() == 3, "push after first measurement").await;
    assert_eq!(hop(&h.node.nh_table(), 1, 2), Some(2));

    // A faster relay path arrives inside the cooldown: edges stored, but the
    // recompute is deferred and nothing is pushed.
    h.channels.offer_pong(pong_event(1, 3, 0.1));
    h.channels.offer_pong(pong_event(3, 2, 0.1));
    settle().await;
    assert_eq!(h.device.sent().len(), 3);
    assert_eq!(hop(&h.node.nh_table(), 1, 2), Some(2));

    // Once the cooldown has passed, the timeout sentinel drives the deferred
    // recompute; now the relay wins and the new table is pushed.
    tokio::time::sleep(Duration::from_millis(400)).await;
    h.channels.offer_pong(PongEvent::sentinel());
    eventually(|| h.device.sent().len() == 6, "push after sentinel sweep").await;
    assert_eq!(hop(&h.node.nh_table(), 1, 2), Some(3));
}

#[tokio::test]
async fn removed_peer_is_notified_and_leaves_the_graph() {
    let h = start(dynamic_config(0.0, 0.0, 1.0), vec![peer_cfg(1), peer_cfg(2)]);
    let pk1 = h.node.registry().peer(1).unwrap().pubkey.clone();
    let pk2 = h.node.registry().peer(2).unwrap().pubkey.clone();
    h.device.resolve(&pk1);
    h.device.resolve(&pk2);

    h.channels.offer_pong(pong_event(1, 2, 0.1));
    h.channels.offer_pong(pong_event(2, 1, 0.1));
    eventually(
        || hop(&h.node.nh_table(), 2, 1) == Some(1),
        "both edges in the table",
    )
    .await;

    assert!(h.node.remove_peer(2));
    // The burst is 10 notices at 100 ms spacing.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    assert_eq!(count_action(&h.device, &pk2, UpdateAction::Shutdown), 10);
    assert!(!h.device.knows_peer(&pk2));

    // Vertex 2 is gone from the cached table and stays out after the sweep.
    let table = h.node.nh_table();
    assert!(table.get(&2).is_none());
    assert!(!table
        .values()
        .any(|row| row.contains_key(&2) || row.values().any(|hop| *hop == 2)));

    h.channels.offer_pong(PongEvent::sentinel());
    settle().await;
    assert!(h.node.nh_table().get(&2).is_none());

    // Later events for the removed id are dropped on lookup: the only
    // traffic peer 2 ever saw is the shutdown burst.
    h.channels
        .offer_register(register_event(2, "stale", "stale", "stale"));
    settle().await;
    assert_eq!(h.device.sent_to(&pk2).len(), 10);
}

#[tokio::test]
async fn stale_peers_are_skipped_even_by_forced_pushes() {
    let mut cfg = dynamic_config(0.0, 0.0, 1.0);
    cfg.peer_alive_timeout = 0.2;
    let h = start(cfg, vec![peer_cfg(1)]);
    let pk1 = h.node.registry().peer(1).unwrap().pubkey.clone();
    h.device.resolve(&pk1);

    h.channels
        .offer_register(register_event(1, "stale", "stale", "stale"));
    eventually(|| !h.device.sent().is_empty(), "push while alive").await;

    // Let the liveness horizon pass with no further registers.
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.device.clear_sent();

    let registry = h.node.registry();
    h.node.push_nh_table(&registry, true);
    h.node.push_peer_info(&registry, true);
    h.node.push_super_params(&registry, true);
    assert!(h.device.sent().is_empty(), "stale peer got a push");
}
