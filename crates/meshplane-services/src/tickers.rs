//! The ticker fabric.
//!
//! Two periodic tasks: a one-second re-push loop that escalates to a forced
//! full push at most once per `re_push_interval`, and a timeout ticker that
//! injects SUPER_ID sentinels into both event channels so stale-edge sweeps
//! and deferred recomputations run through the dispatcher's own
//! serialisation boundary.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use meshplane_core::event::{PongEvent, RegisterEvent};

use crate::dispatcher::EventChannels;
use crate::supernode::Supernode;

/// Re-push loop: every second, push all three categories; the next-hop push
/// is forced once per `re_push_interval` (including the very first pass, so
/// a restarted supernode re-announces itself promptly).
pub async fn repush_ticker(node: Arc<Supernode>) {
    let repush_every = Duration::from_secs_f64(node.cfg.re_push_interval);
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut last_forced: Option<Instant> = None;

    loop {
        interval.tick().await;
        let force = last_forced.map_or(true, |t| t.elapsed() >= repush_every);
        if force {
            last_forced = Some(Instant::now());
            tracing::debug!("forced full re-push");
        }

        let registry = node.registry();
        node.push_nh_table(&registry, force);
        node.push_peer_info(&registry, false);
        node.push_super_params(&registry, false);
    }
}

/// Timeout ticker: every `timeout_check_interval`, offer one sentinel of
/// each kind. A full queue just skips the sweep — the next tick retries.
pub async fn timeout_ticker(node: Arc<Supernode>, channels: EventChannels) {
    let period = Duration::from_secs_f64(node.cfg.graph.timeout_check_interval.max(0.1));
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        channels.offer_register(RegisterEvent::sentinel());
        channels.offer_pong(PongEvent::sentinel());
    }
}
