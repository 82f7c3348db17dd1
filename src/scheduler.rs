//! Pure backend-selection logic (spec.md §4.4). The scheduler holds no
//! state of its own: round-robin's "last index" lives in the Dispatcher,
//! which calls back into this module with a starting offset.

use serde::{Deserialize, Serialize};

use crate::registry::BackendSnapshot;

/// Selection strategy, configurable at startup and live-switchable via
/// `POST /lb/scheduler/strategy/{strategy}` (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    LeastBusy,
    RoundRobin,
    Weighted,
}

impl Default for Strategy {
    fn default() -> Self {
        Strategy::LeastBusy
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "least_busy" => Ok(Strategy::LeastBusy),
            "round_robin" => Ok(Strategy::RoundRobin),
            "weighted" => Ok(Strategy::Weighted),
            other => Err(format!("unknown scheduler strategy '{other}'")),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Strategy::LeastBusy => "least_busy",
            Strategy::RoundRobin => "round_robin",
            Strategy::Weighted => "weighted",
        };
        f.write_str(s)
    }
}

/// Filter backends down to dispatch candidates (spec.md §4.4): enabled,
/// healthy, and with free capacity. When `prefer_idle` is set and at least
/// one candidate has zero load, the non-idle candidates are dropped first.
pub fn candidates(backends: &[BackendSnapshot], prefer_idle: bool) -> Vec<&BackendSnapshot> {
    let mut eligible: Vec<&BackendSnapshot> =
        backends.iter().filter(|b| b.has_capacity()).collect();

    if prefer_idle {
        let any_idle = eligible.iter().any(|b| b.load() == 0);
        if any_idle {
            eligible.retain(|b| b.load() == 0);
        }
    }

    eligible
}

/// Pick one backend from the pre-filtered candidate list. Returns `None`
/// when there are no candidates (spec.md §4.6 "no backend available").
///
/// `round_robin_cursor` is the Dispatcher-owned last-picked index; callers
/// own advancing it (this function is pure and takes it by value).
pub fn select<'a>(
    strategy: Strategy,
    candidates: &[&'a BackendSnapshot],
    round_robin_cursor: usize,
) -> Option<&'a BackendSnapshot> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        // Lowest current load wins; ties broken by higher weight, then
        // insertion order (the order `candidates` is already in, since the
        // registry snapshot preserves it) — spec.md §4.4 "least_busy".
        Strategy::LeastBusy => least_busy(candidates),

        // Stateless here: the Dispatcher advances its own cursor between
        // calls. Wrapping keeps this safe even if the candidate set shrank
        // since the cursor was last used.
        Strategy::RoundRobin => {
            let index = round_robin_cursor % candidates.len();
            Some(candidates[index])
        }

        // Minimise load/weight using real arithmetic, tie-break as
        // least_busy (spec.md §4.4 "weighted"). Deterministic, not a
        // random weighted draw: across many submissions this converges on
        // the same `reserved+pending+running` ratio the rule targets.
        Strategy::Weighted => candidates
            .iter()
            .copied()
            .min_by(|a, b| {
                let ratio_a = a.load() as f64 / a.weight as f64;
                let ratio_b = b.load() as f64 / b.weight as f64;
                ratio_a
                    .partial_cmp(&ratio_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.weight.cmp(&a.weight))
            }),
    }
}

/// Lowest `load()` wins; ties broken by higher `weight`, then by the
/// candidate's position in `candidates` (insertion order).
fn least_busy<'a>(candidates: &[&'a BackendSnapshot]) -> Option<&'a BackendSnapshot> {
    candidates
        .iter()
        .enumerate()
        .min_by(|(ia, a), (ib, b)| {
            a.load()
                .cmp(&b.load())
                .then_with(|| b.weight.cmp(&a.weight))
                .then_with(|| ia.cmp(ib))
        })
        .map(|(_, b)| *b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BackendStatus;

    fn snap(name: &str, weight: u32, max_queue: u32, load: u32) -> BackendSnapshot {
        BackendSnapshot {
            name: name.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8188,
            weight,
            max_queue,
            enabled: true,
            status: BackendStatus::Healthy,
            reserved: 0,
            pending: load,
            running: 0,
        }
    }

    #[test]
    fn test_candidates_filters_unhealthy_and_full() {
        let mut unhealthy = snap("a", 1, 5, 0);
        unhealthy.status = BackendStatus::Unhealthy;
        let full = snap("b", 1, 1, 1);
        let ok = snap("c", 1, 5, 2);

        let backends = vec![unhealthy, full, ok];
        let result = candidates(&backends, false);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "c");
    }

    #[test]
    fn test_candidates_prefer_idle_narrows_to_idle_only() {
        let busy = snap("a", 1, 5, 2);
        let idle = snap("b", 1, 5, 0);
        let backends = vec![busy, idle];

        let result = candidates(&backends, true);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].name, "b");
    }

    #[test]
    fn test_candidates_prefer_idle_falls_back_when_none_idle() {
        let a = snap("a", 1, 5, 1);
        let b = snap("b", 1, 5, 2);
        let backends = vec![a, b];

        let result = candidates(&backends, true);
        assert_eq!(result.len(), 2);
    }

    #[test]
    fn test_select_least_busy_picks_lowest_load() {
        let a = snap("a", 1, 5, 3);
        let b = snap("b", 1, 5, 1);
        let c = snap("c", 1, 5, 2);
        let backends = vec![a, b, c];
        let cands: Vec<&BackendSnapshot> = backends.iter().collect();

        let picked = select(Strategy::LeastBusy, &cands, 0).unwrap();
        assert_eq!(picked.name, "b");
    }

    #[test]
    fn test_select_round_robin_wraps() {
        let a = snap("a", 1, 5, 0);
        let b = snap("b", 1, 5, 0);
        let backends = vec![a, b];
        let cands: Vec<&BackendSnapshot> = backends.iter().collect();

        assert_eq!(select(Strategy::RoundRobin, &cands, 0).unwrap().name, "a");
        assert_eq!(select(Strategy::RoundRobin, &cands, 1).unwrap().name, "b");
        assert_eq!(select(Strategy::RoundRobin, &cands, 2).unwrap().name, "a");
    }

    #[test]
    fn test_select_weighted_minimises_load_over_weight() {
        // a: 2/1 = 2.0, b: 3/2 = 1.5, c: 3/3 = 1.0 -> c has the lowest ratio.
        let a = snap("a", 1, 10, 2);
        let b = snap("b", 2, 10, 3);
        let c = snap("c", 3, 10, 3);
        let backends = vec![a, b, c];
        let cands: Vec<&BackendSnapshot> = backends.iter().collect();

        assert_eq!(select(Strategy::Weighted, &cands, 0).unwrap().name, "c");
    }

    #[test]
    fn test_select_weighted_ties_prefer_higher_weight() {
        // a: 2/1 = 2.0, b: 4/2 = 2.0 -> tie, higher weight (b) wins.
        let a = snap("a", 1, 10, 2);
        let b = snap("b", 2, 10, 4);
        let backends = vec![a, b];
        let cands: Vec<&BackendSnapshot> = backends.iter().collect();

        assert_eq!(select(Strategy::Weighted, &cands, 0).unwrap().name, "b");
    }

    #[test]
    fn test_select_returns_none_for_empty_candidates() {
        let cands: Vec<&BackendSnapshot> = Vec::new();
        assert!(select(Strategy::LeastBusy, &cands, 0).is_none());
    }

    #[test]
    fn test_strategy_from_str_roundtrip() {
        assert_eq!("least_busy".parse::<Strategy>().unwrap(), Strategy::LeastBusy);
        assert_eq!("round_robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("weighted".parse::<Strategy>().unwrap(), Strategy::Weighted);
        assert!("bogus".parse::<Strategy>().is_err());
    }
}
