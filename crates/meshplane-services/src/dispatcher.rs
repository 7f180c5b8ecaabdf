//! The event dispatcher.
//!
//! Single consumer of the two bounded event channels. Every registry or
//! graph mutation in steady state flows through here, one event at a time,
//! under the shared registry lock — the ticker fabric reuses the same
//! channels with SUPER_ID sentinels, so there is no second lock protocol
//! for periodic sweeps. Events for unknown peers are dropped; processing
//! errors are logged and never fatal.

use std::sync::Arc;

use tokio::sync::mpsc;

use meshplane_core::event::{PongEvent, RegisterEvent};
use meshplane_core::NextHopTable;

use crate::supernode::Supernode;

/// Event queue depth. Producers drop when full; the re-push tickers and the
/// edges' own retries restore convergence.
pub const EVENT_QUEUE_DEPTH: usize = 32;

/// Producer side of the event fabric, shared by UDP ingress and tickers.
#[derive(Clone)]
pub struct EventChannels {
    register: mpsc::Sender<RegisterEvent>,
    pong: mpsc::Sender<PongEvent>,
}

impl EventChannels {
    /// Non-blocking enqueue. Returns false when the queue was full and the
    /// event was dropped.
    pub fn offer_register(&self, event: RegisterEvent) -> bool {
        match self.register.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "register queue full, event dropped");
                false
            }
        }
    }

    pub fn offer_pong(&self, event: PongEvent) -> bool {
        match self.pong.try_send(event) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(error = %e, "pong queue full, event dropped");
                false
            }
        }
    }
}

/// Consumer side, owned by the dispatcher.
pub struct EventReceivers {
    register: mpsc::Receiver<RegisterEvent>,
    pong: mpsc::Receiver<PongEvent>,
}

/// Build the bounded event channel pair.
pub fn event_channels() -> (EventChannels, EventReceivers) {
    let (register_tx, register_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (pong_tx, pong_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    (
        EventChannels {
            register: register_tx,
            pong: pong_tx,
        },
        EventReceivers {
            register: register_rx,
            pong: pong_rx,
        },
    )
}

pub struct Dispatcher {
    node: Arc<Supernode>,
    rx: EventReceivers,
}

impl Dispatcher {
    pub fn new(node: Arc<Supernode>, rx: EventReceivers) -> Self {
        Self { node, rx }
    }

    /// Consume events until the channels close, then drain and exit.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.rx.register.recv() => match event {
                    Some(event) => self.handle_register(event),
                    None => break,
                },
                event = self.rx.pong.recv() => match event {
                    Some(event) => self.handle_pong(event),
                    None => break,
                },
            }
        }
        tracing::debug!("event channels closed, dispatcher exiting");
    }

    /// Fold a register into the record's cells, then push whichever
    /// categories diverged. Sentinels skip the record entirely and only
    /// drive the roster sweep.
    fn handle_register(&self, event: RegisterEvent) {
        let registry = self.node.registry();
        let mut push_nh = false;
        let mut push_peer = false;
        let mut push_params = false;

        if !event.is_sentinel() {
            let Some(record) = registry.record_for_id(event.node_id) else {
                tracing::debug!(node_id = event.node_id, "register for unknown peer dropped");
                return;
            };
            tracing::trace!(node_id = event.node_id, version = %event.version, "register");
            record.touch();
            record.set_jwt_secret(event.jwt_secret);
            record.set_http_post_count(event.http_post_count);

            if record.nh_hash_acked() != event.nh_state_hash {
                record.set_nh_hash_acked(event.nh_state_hash);
                push_nh = true;
            }
            if record.peer_hash_acked() != event.peer_state_hash {
                record.set_peer_hash_acked(event.peer_state_hash);
                push_peer = true;
            }
            if record.params_hash_acked() != event.super_param_state_hash {
                record.set_params_hash_acked(event.super_param_state_hash);
                push_params = true;
            }
        }

        let roster_changed = self.node.refresh_roster(&registry);
        if push_peer || roster_changed {
            self.node.push_peer_info(&registry, false);
        }
        if push_nh {
            self.node.push_nh_table(&registry, false);
        }
        if push_params {
            self.node.push_super_params(&registry, false);
        }
    }

    /// Fold a measurement into the graph, or run the sentinel sweep. When
    /// the next-hop table changes, re-hash it and push — the push always
    /// observes a graph state that includes the provoking measurement.
    fn handle_pong(&self, event: PongEvent) {
        let registry = self.node.registry();

        let changed_table: Option<NextHopTable> = {
            let mut graph = self.node.graph.lock().unwrap();
            let changed = if !event.is_sentinel()
                && registry.contains_id(event.src_node_id)
                && registry.contains_id(event.dst_node_id)
            {
                let configured = registry
                    .peer(event.dst_node_id)
                    .map(|p| p.additional_cost)
                    .unwrap_or(0.0);
                let effective_cost = if configured >= 0.0 {
                    configured
                } else {
                    event.additional_cost
                };
                graph.update_latency(
                    event.src_node_id,
                    event.dst_node_id,
                    event.timediff,
                    event.time_to_alive,
                    effective_cost,
                    true,
                )
            } else if graph.check_any_should_update() {
                graph.recompute(true)
            } else {
                false
            };
            changed.then(|| graph.nh_table().clone())
        };

        if let Some(table) = changed_table {
            match self.node.store_nh_artifact(&table) {
                Ok(hash) => {
                    tracing::debug!(hash = %hash, "next-hop table re-hashed");
                    self.node.push_nh_table(&registry, false);
                }
                Err(e) => tracing::warn!(error = %e, "failed to hash next-hop table"),
            }
        }
    }
}
