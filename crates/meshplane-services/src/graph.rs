//! The latency graph and its next-hop table.
//!
//! Edges carry a smoothed latency plus an expiry instant; expired edges are
//! treated as absent. Two mechanisms keep the table from thrashing: a
//! hysteresis window around the stored value swallows jittery samples, and
//! a cooldown bounds how often the all-pairs recomputation may run. The
//! timeout ticker drives deferred recomputations and expiry sweeps through
//! [`LatencyGraph::check_any_should_update`].

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use meshplane_core::config::GraphSettings;
use meshplane_core::{NextHopTable, Vertex, SUPER_ID};

/// Slack for floating-point path-length comparisons.
const EPS: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
struct Edge {
    latency: f64,
    expires_at: Instant,
}

pub struct LatencyGraph {
    static_mode: bool,
    jitter_tolerance: f64,
    jitter_multiplier: f64,
    cooldown: Duration,
    edges: HashMap<(Vertex, Vertex), Edge>,
    nh_table: NextHopTable,
    dirty: bool,
    last_recompute: Instant,
}

impl LatencyGraph {
    pub fn new(settings: &GraphSettings) -> Self {
        let now = Instant::now();
        Self {
            static_mode: settings.static_mode,
            jitter_tolerance: settings.jitter_tolerance,
            jitter_multiplier: settings.jitter_tolerance_multiplier,
            cooldown: Duration::from_secs_f64(settings.recalculate_cooldown.max(0.0)),
            edges: HashMap::new(),
            nh_table: NextHopTable::new(),
            dirty: false,
            last_recompute: now - Duration::from_secs(3600),
        }
    }

    /// Seed or replace the cached table. In static mode this is the table
    /// for the life of the process.
    pub fn set_nh_table(&mut self, table: NextHopTable) {
        self.nh_table = table;
    }

    pub fn nh_table(&self) -> &NextHopTable {
        &self.nh_table
    }

    /// Fold one measurement into the graph.
    ///
    /// `additional_cost` is added to the sample before the hysteresis check.
    /// Returns whether the next-hop table changed as a result; a recompute
    /// only runs when `recalc_ok` is set and the cooldown has elapsed —
    /// otherwise the graph stays dirty and the timeout ticker picks the
    /// recomputation up later.
    pub fn update_latency(
        &mut self,
        src: Vertex,
        dst: Vertex,
        latency: f64,
        ttl: f64,
        additional_cost: f64,
        recalc_ok: bool,
    ) -> bool {
        self.update_latency_at(Instant::now(), src, dst, latency, ttl, additional_cost, recalc_ok)
    }

    fn update_latency_at(
        &mut self,
        now: Instant,
        src: Vertex,
        dst: Vertex,
        latency: f64,
        ttl: f64,
        additional_cost: f64,
        recalc_ok: bool,
    ) -> bool {
        let sample = latency + additional_cost;

        if let Some(edge) = self.edges.get(&(src, dst)) {
            if edge.expires_at > now {
                let lo = edge.latency / self.jitter_multiplier - self.jitter_tolerance;
                let hi = edge.latency * self.jitter_multiplier + self.jitter_tolerance;
                if sample >= lo && sample <= hi {
                    tracing::trace!(src, dst, sample, "sample inside hysteresis window, kept old value");
                    return false;
                }
            }
        }

        self.edges.insert(
            (src, dst),
            Edge {
                latency: sample,
                expires_at: now + Duration::from_secs_f64(ttl.max(0.0)),
            },
        );
        self.dirty = true;
        tracing::debug!(src, dst, latency = sample, ttl, "edge updated");

        if recalc_ok && self.cooldown_elapsed(now) {
            return self.recompute_at(now);
        }
        false
    }

    /// Cheap predicate for the timeout ticker: is there pending work and is
    /// the cooldown over? Pending means a deferred update, or an edge that
    /// was live at the last recomputation and has expired since.
    pub fn check_any_should_update(&self) -> bool {
        self.check_any_should_update_at(Instant::now())
    }

    fn check_any_should_update_at(&self, now: Instant) -> bool {
        if self.static_mode || !self.cooldown_elapsed(now) {
            return false;
        }
        self.dirty
            || self
                .edges
                .values()
                .any(|e| e.expires_at <= now && e.expires_at > self.last_recompute)
    }

    /// Recompute the all-pairs next-hop table. `force` bypasses the
    /// cooldown. Returns whether the table changed. A no-op in static mode.
    pub fn recompute(&mut self, force: bool) -> bool {
        let now = Instant::now();
        if !force && !self.cooldown_elapsed(now) {
            return false;
        }
        self.recompute_at(now)
    }

    fn recompute_at(&mut self, now: Instant) -> bool {
        if self.static_mode {
            return false;
        }
        self.dirty = false;
        self.last_recompute = now;

        let table = self.shortest_paths(now);
        if table == self.nh_table {
            return false;
        }
        tracing::debug!(vertices = table.len(), "next-hop table changed");
        self.nh_table = table;
        true
    }

    /// Floyd–Warshall over the non-expired edge set. Ties are broken toward
    /// the lower neighbour vertex so the result is deterministic.
    fn shortest_paths(&self, now: Instant) -> NextHopTable {
        let live: Vec<(&(Vertex, Vertex), &Edge)> = self
            .edges
            .iter()
            .filter(|(_, e)| e.expires_at > now)
            .collect();

        let verts: BTreeSet<Vertex> = live
            .iter()
            .flat_map(|((s, d), _)| [*s, *d])
            .filter(|v| *v < SUPER_ID)
            .collect();
        let verts: Vec<Vertex> = verts.into_iter().collect();
        let index: HashMap<Vertex, usize> =
            verts.iter().enumerate().map(|(i, v)| (*v, i)).collect();
        let n = verts.len();

        let mut dist = vec![vec![f64::INFINITY; n]; n];
        let mut next: Vec<Vec<Option<usize>>> = vec![vec![None; n]; n];
        for i in 0..n {
            dist[i][i] = 0.0;
        }
        for ((s, d), e) in live {
            if let (Some(&si), Some(&di)) = (index.get(s), index.get(d)) {
                dist[si][di] = e.latency;
                next[si][di] = Some(di);
            }
        }

        for k in 0..n {
            for i in 0..n {
                if dist[i][k].is_infinite() {
                    continue;
                }
                for j in 0..n {
                    let alt = dist[i][k] + dist[k][j];
                    if alt + EPS < dist[i][j] {
                        dist[i][j] = alt;
                        next[i][j] = next[i][k];
                    } else if (alt - dist[i][j]).abs() <= EPS {
                        if let (Some(cur), Some(cand)) = (next[i][j], next[i][k]) {
                            if verts[cand] < verts[cur] {
                                next[i][j] = Some(cand);
                            }
                        }
                    }
                }
            }
        }

        let mut table = NextHopTable::new();
        for i in 0..n {
            for j in 0..n {
                if i == j {
                    continue;
                }
                if let Some(hop) = next[i][j] {
                    table
                        .entry(verts[i])
                        .or_default()
                        .insert(verts[j], verts[hop]);
                }
            }
        }
        table
    }

    /// Drop all edges incident to a vertex and scrub it from the cached
    /// table. The next sentinel sweep recomputes the rest.
    pub fn remove_vertex(&mut self, vertex: Vertex) {
        self.edges.retain(|(s, d), _| *s != vertex && *d != vertex);
        if self.static_mode {
            return;
        }
        self.nh_table.remove(&vertex);
        for row in self.nh_table.values_mut() {
            row.retain(|dst, hop| *dst != vertex && *hop != vertex);
        }
        self.dirty = true;
    }

    fn cooldown_elapsed(&self, now: Instant) -> bool {
        now.duration_since(self.last_recompute) >= self.cooldown
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
