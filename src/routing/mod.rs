//! Route table with adaptive scoring and congestion tracking.
//!
//! Per destination the table keeps up to three candidate routes sorted by
//! score. Scores blend EWMA latency, delivery reliability, hop count, and
//! freshness; selection additionally divides by the congestion level of the
//! next hop so traffic shifts away from hot links without forgetting them.

pub mod on_demand;

use std::collections::{HashMap, VecDeque};

use crate::protocol::NodeId;
use crate::transport::TransportKind;

/// Candidate routes kept per destination
pub const ROUTES_PER_DESTINATION: usize = 3;

/// Latency samples kept per destination for congestion detection
const LATENCY_WINDOW: usize = 10;

/// EWMA smoothing factor for route latency
const LATENCY_ALPHA: f64 = 0.3;

/// A route is probed after this much silence
pub const PROBE_SILENCE_MS: u64 = 60_000;

/// One candidate path to a destination
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub destination: NodeId,
    pub next_hop: NodeId,
    pub hop_count: u8,
    pub ewma_latency_ms: f64,
    /// Delivery reliability, 0..100
    pub reliability: f64,
    pub last_updated_ms: u64,
    pub transport: TransportKind,
    pub bandwidth_kbps: u32,
}

impl Route {
    /// Composite quality score, higher is better.
    pub fn score(&self, now_ms: u64) -> f64 {
        let latency_score = (100.0 - self.ewma_latency_ms / 10.0).max(0.0);
        let hop_score = (100.0 - 20.0 * self.hop_count as f64).max(0.0);
        let age_ms = now_ms.saturating_sub(self.last_updated_ms) as f64;
        let freshness_score = (100.0 - age_ms / 60_000.0).max(0.0);
        0.30 * latency_score
            + 0.40 * self.reliability.clamp(0.0, 100.0)
            + 0.20 * hop_score
            + 0.10 * freshness_score
    }
}

/// QoS constraints a packet puts on route selection
#[derive(Debug, Clone, Copy, Default)]
pub struct QosRequirements {
    pub priority: u8,
    pub max_latency_ms: Option<f64>,
    pub min_bandwidth_kbps: Option<u32>,
}

impl QosRequirements {
    pub fn emergency() -> Self {
        Self {
            priority: crate::protocol::constants::PRIORITY_EMERGENCY,
            max_latency_ms: None,
            min_bandwidth_kbps: None,
        }
    }

    pub fn is_emergency(&self) -> bool {
        self.priority >= crate::protocol::constants::PRIORITY_EMERGENCY
    }
}

/// The per-destination routing table. Owned by the pipeline worker;
/// readers take short-lived snapshots through the surrounding lock.
pub struct RoutingTable {
    route_stale_ms: u64,
    routes: HashMap<NodeId, Vec<Route>>,
    congestion: HashMap<NodeId, f64>,
    latency_window: HashMap<NodeId, VecDeque<f64>>,
}

impl RoutingTable {
    pub fn new(route_stale_ms: u64) -> Self {
        Self {
            route_stale_ms,
            routes: HashMap::new(),
            congestion: HashMap::new(),
            latency_window: HashMap::new(),
        }
    }

    /// Install or refresh a route. With `only_if_better` (duplicate RREPs)
    /// an existing route through the same next hop survives unless the new
    /// one scores strictly higher. Returns true when the table changed.
    pub fn install(&mut self, route: Route, now_ms: u64, only_if_better: bool) -> bool {
        let candidates = self.routes.entry(route.destination).or_default();

        if let Some(pos) = candidates
            .iter()
            .position(|r| r.next_hop == route.next_hop && r.transport == route.transport)
        {
            if only_if_better && route.score(now_ms) <= candidates[pos].score(now_ms) {
                return false;
            }
            candidates[pos] = route;
        } else {
            candidates.push(route);
        }

        candidates.sort_by(|a, b| {
            b.score(now_ms)
                .partial_cmp(&a.score(now_ms))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates.truncate(ROUTES_PER_DESTINATION);
        true
    }

    pub fn routes_to(&self, destination: &NodeId) -> Vec<Route> {
        self.routes.get(destination).cloned().unwrap_or_default()
    }

    pub fn best(&self, destination: &NodeId, now_ms: u64) -> Option<Route> {
        self.routes
            .get(destination)?
            .iter()
            .max_by(|a, b| {
                a.score(now_ms)
                    .partial_cmp(&b.score(now_ms))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    pub fn has_route(&self, destination: &NodeId) -> bool {
        self.routes
            .get(destination)
            .map_or(false, |routes| !routes.is_empty())
    }

    /// Route selection per QoS. Filters by latency and bandwidth bounds;
    /// emergencies fall back to the most reliable candidate when the
    /// filters empty the list; otherwise the congestion-weighted best
    /// candidate wins. `None` means on-demand discovery is needed.
    pub fn select(
        &self,
        destination: &NodeId,
        qos: &QosRequirements,
        now_ms: u64,
    ) -> Option<Route> {
        let candidates = self.routes.get(destination)?;
        if candidates.is_empty() {
            return None;
        }

        let filtered: Vec<&Route> = candidates
            .iter()
            .filter(|r| {
                qos.max_latency_ms
                    .map_or(true, |max| r.ewma_latency_ms <= max)
                    && qos
                        .min_bandwidth_kbps
                        .map_or(true, |min| r.bandwidth_kbps >= min)
            })
            .collect();

        if filtered.is_empty() {
            if qos.is_emergency() {
                return candidates
                    .iter()
                    .max_by(|a, b| {
                        a.reliability
                            .partial_cmp(&b.reliability)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .cloned();
            }
            return None;
        }

        filtered
            .into_iter()
            .max_by(|a, b| {
                let wa = self.congestion_weight(a, qos, now_ms);
                let wb = self.congestion_weight(b, qos, now_ms);
                wa.partial_cmp(&wb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .cloned()
    }

    fn congestion_weight(&self, route: &Route, qos: &QosRequirements, now_ms: u64) -> f64 {
        let score = route.score(now_ms);
        if qos.is_emergency() {
            // Emergencies ignore congestion.
            return score;
        }
        let congestion = self.congestion.get(&route.next_hop).copied().unwrap_or(0.0);
        score / (1.0 + congestion)
    }

    /// Feed a measured round-trip latency for a destination. Updates the
    /// carrying route's EWMA and runs congestion detection over the sample
    /// ring.
    pub fn record_latency(
        &mut self,
        destination: &NodeId,
        next_hop: &NodeId,
        latency_ms: f64,
        now_ms: u64,
    ) {
        if let Some(candidates) = self.routes.get_mut(destination) {
            for route in candidates.iter_mut() {
                if route.next_hop == *next_hop {
                    route.ewma_latency_ms =
                        route.ewma_latency_ms * (1.0 - LATENCY_ALPHA) + latency_ms * LATENCY_ALPHA;
                    route.last_updated_ms = now_ms;
                }
            }
        }

        let window = self.latency_window.entry(*destination).or_default();
        window.push_back(latency_ms);
        while window.len() > LATENCY_WINDOW {
            window.pop_front();
        }

        // Congestion: mean of the newest 3 samples against the mean of
        // everything before them.
        if window.len() >= 4 {
            let recent: f64 = window.iter().rev().take(3).sum::<f64>() / 3.0;
            let prior_count = window.len() - 3;
            let prior: f64 =
                window.iter().take(prior_count).sum::<f64>() / prior_count as f64;
            if prior > 0.0 {
                let increase = (recent - prior) / prior;
                if increase > 0.5 {
                    self.congestion.insert(*next_hop, increase);
                }
            }
        }
    }

    /// Touch a route's freshness without a latency sample (RREP, ACK pass,
    /// probe response).
    pub fn refresh(&mut self, destination: &NodeId, next_hop: &NodeId, now_ms: u64) {
        if let Some(candidates) = self.routes.get_mut(destination) {
            for route in candidates.iter_mut() {
                if route.next_hop == *next_hop {
                    route.last_updated_ms = now_ms;
                }
            }
        }
    }

    /// Reliability penalty for every route through a failing next hop.
    pub fn penalize_next_hop(&mut self, next_hop: &NodeId, amount: f64) {
        for candidates in self.routes.values_mut() {
            for route in candidates.iter_mut() {
                if route.next_hop == *next_hop {
                    route.reliability = (route.reliability - amount).max(0.0);
                }
            }
        }
    }

    /// Multiplicative congestion decay, dropping negligible entries.
    pub fn decay_congestion(&mut self) {
        self.congestion.retain(|_, level| {
            *level *= 0.9;
            *level > 0.05
        });
    }

    pub fn congestion_level(&self, next_hop: &NodeId) -> f64 {
        self.congestion.get(next_hop).copied().unwrap_or(0.0)
    }

    /// Drop routes not refreshed inside the stale window. Returns the
    /// destinations that lost all routes.
    pub fn sweep_stale(&mut self, now_ms: u64) -> Vec<NodeId> {
        let stale_ms = self.route_stale_ms;
        let mut emptied = Vec::new();
        self.routes.retain(|destination, candidates| {
            candidates
                .retain(|r| now_ms.saturating_sub(r.last_updated_ms) <= stale_ms);
            if candidates.is_empty() {
                emptied.push(*destination);
                false
            } else {
                true
            }
        });
        emptied
    }

    pub fn remove_destination(&mut self, destination: &NodeId) {
        self.routes.remove(destination);
        self.latency_window.remove(destination);
    }

    /// Routes silent long enough to deserve a probe.
    pub fn silent_routes(&self, now_ms: u64) -> Vec<Route> {
        self.routes
            .values()
            .flatten()
            .filter(|r| now_ms.saturating_sub(r.last_updated_ms) >= PROBE_SILENCE_MS)
            .cloned()
            .collect()
    }

    pub fn destination_count(&self) -> usize {
        self.routes.len()
    }

    /// Mean latency and reliability across every installed route, for the
    /// status snapshot.
    pub fn aggregates(&self) -> (f64, f64) {
        let all: Vec<&Route> = self.routes.values().flatten().collect();
        if all.is_empty() {
            return (0.0, 0.0);
        }
        let latency = all.iter().map(|r| r.ewma_latency_ms).sum::<f64>() / all.len() as f64;
        let reliability = all.iter().map(|r| r.reliability).sum::<f64>() / all.len() as f64;
        (latency, reliability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(dest: u8, hop: u8, latency: f64, reliability: f64, now: u64) -> Route {
        Route {
            destination: [dest; 16],
            next_hop: [hop; 16],
            hop_count: 1,
            ewma_latency_ms: latency,
            reliability,
            last_updated_ms: now,
            transport: TransportKind::LocalBus,
            bandwidth_kbps: TransportKind::LocalBus.bandwidth_kbps(),
        }
    }

    #[test]
    fn score_prefers_low_latency_and_high_reliability() {
        let good = route(1, 2, 10.0, 95.0, 0);
        let bad = route(1, 3, 400.0, 40.0, 0);
        assert!(good.score(0) > bad.score(0));
    }

    #[test]
    fn score_monotonic_in_each_factor() {
        let base = route(1, 2, 50.0, 80.0, 1_000);
        let now = 2_000;

        let mut faster = base.clone();
        faster.ewma_latency_ms = 25.0;
        assert!(faster.score(now) >= base.score(now));

        let mut more_reliable = base.clone();
        more_reliable.reliability = 90.0;
        assert!(more_reliable.score(now) >= base.score(now));

        let mut fewer_hops = base.clone();
        fewer_hops.hop_count = 0;
        assert!(fewer_hops.score(now) >= base.score(now));

        let mut fresher = base.clone();
        fresher.last_updated_ms = now;
        assert!(fresher.score(now) >= base.score(now));
    }

    #[test]
    fn table_keeps_three_best() {
        let mut table = RoutingTable::new(300_000);
        for hop in 2..=6u8 {
            table.install(route(1, hop, hop as f64 * 10.0, 90.0, 0), 0, false);
        }
        let routes = table.routes_to(&[1u8; 16]);
        assert_eq!(routes.len(), ROUTES_PER_DESTINATION);
        // lowest-latency candidates survive
        assert!(routes.iter().all(|r| r.ewma_latency_ms <= 40.0));
    }

    #[test]
    fn only_if_better_keeps_superior_existing() {
        let mut table = RoutingTable::new(300_000);
        table.install(route(1, 2, 10.0, 95.0, 0), 0, false);
        let worse = route(1, 2, 300.0, 20.0, 0);
        assert!(!table.install(worse, 0, true));
        assert_eq!(table.routes_to(&[1u8; 16])[0].ewma_latency_ms, 10.0);
    }

    #[test]
    fn selection_filters_by_qos() {
        let mut table = RoutingTable::new(300_000);
        table.install(route(1, 2, 500.0, 95.0, 0), 0, false);
        let strict = QosRequirements {
            priority: 5,
            max_latency_ms: Some(100.0),
            min_bandwidth_kbps: None,
        };
        assert!(table.select(&[1u8; 16], &strict, 0).is_none());

        let emergency = QosRequirements::emergency();
        assert!(table.select(&[1u8; 16], &emergency, 0).is_some());
    }

    #[test]
    fn selection_avoids_congested_next_hop() {
        let mut table = RoutingTable::new(300_000);
        table.install(route(1, 2, 20.0, 90.0, 0), 0, false);
        table.install(route(1, 3, 25.0, 90.0, 0), 0, false);

        // Build congestion on hop 2: steady samples then a spike.
        for _ in 0..7 {
            table.record_latency(&[1u8; 16], &[2u8; 16], 20.0, 0);
        }
        for _ in 0..3 {
            table.record_latency(&[1u8; 16], &[2u8; 16], 200.0, 0);
        }
        assert!(table.congestion_level(&[2u8; 16]) > 0.5);

        let qos = QosRequirements {
            priority: 5,
            ..Default::default()
        };
        let selected = table.select(&[1u8; 16], &qos, 0).unwrap();
        assert_eq!(selected.next_hop, [3u8; 16]);
    }

    #[test]
    fn congestion_decays_away() {
        let mut table = RoutingTable::new(300_000);
        table.congestion.insert([2u8; 16], 1.0);
        for _ in 0..40 {
            table.decay_congestion();
        }
        assert_eq!(table.congestion_level(&[2u8; 16]), 0.0);
    }

    #[test]
    fn ewma_converges_toward_samples() {
        let mut table = RoutingTable::new(300_000);
        table.install(route(1, 2, 100.0, 90.0, 0), 0, false);
        for _ in 0..20 {
            table.record_latency(&[1u8; 16], &[2u8; 16], 10.0, 0);
        }
        let updated = table.routes_to(&[1u8; 16])[0].clone();
        assert!(updated.ewma_latency_ms < 15.0);
    }

    #[test]
    fn stale_sweep_empties_old_destinations() {
        let mut table = RoutingTable::new(300_000);
        table.install(route(1, 2, 10.0, 90.0, 0), 0, false);
        table.install(route(2, 3, 10.0, 90.0, 400_000), 400_000, false);
        let emptied = table.sweep_stale(400_000);
        assert_eq!(emptied, vec![[1u8; 16]]);
        assert!(table.has_route(&[2u8; 16]));
    }

    #[test]
    fn penalty_floors_at_zero() {
        let mut table = RoutingTable::new(300_000);
        table.install(route(1, 2, 10.0, 5.0, 0), 0, false);
        table.penalize_next_hop(&[2u8; 16], 10.0);
        assert_eq!(table.routes_to(&[1u8; 16])[0].reliability, 0.0);
    }
}
