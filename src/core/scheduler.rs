use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

/// Start scheduling policy
///
/// Pure selection logic: given the queued set and the current occupancy,
/// decide which downloads to start next. Priority dominates, queue age
/// promotes so low-priority rows cannot starve, and per-host caps plus
/// breaker state gate the walk. The engine wraps the call in a short
/// critical section that also excludes ids already mid-start.
use crate::core::types::Priority;

/// A queued row, reduced to what scoring needs
#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub id: i64,
    pub host: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

/// Occupancy the scheduler must respect
#[derive(Debug, Default)]
pub struct ScheduleContext {
    /// Global slots still free
    pub free_slots: usize,
    /// Active + starting downloads per host
    pub active_per_host: HashMap<String, usize>,
    /// Per-host start cap
    pub max_per_host: usize,
    /// Hosts whose breaker is currently open
    pub blocked_hosts: HashSet<String>,
    /// Ids that are already mid-start and must not be picked again
    pub starting: HashSet<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct ScheduleWeights {
    pub priority_weight: f64,
    pub age_weight: f64,
}

/// Rank a queued item; higher starts sooner
fn score(item: &QueuedItem, now: DateTime<Utc>, weights: ScheduleWeights) -> f64 {
    let age_seconds = (now - item.created_at).num_seconds().max(0) as f64;
    item.priority.as_i64() as f64 * weights.priority_weight + age_seconds * weights.age_weight
}

/// Pick the ids to start, best first
pub fn select_starts(
    queued: &[QueuedItem],
    ctx: &ScheduleContext,
    weights: ScheduleWeights,
    now: DateTime<Utc>,
) -> Vec<i64> {
    if ctx.free_slots == 0 {
        return Vec::new();
    }

    let mut ranked: Vec<&QueuedItem> = queued
        .iter()
        .filter(|item| !ctx.starting.contains(&item.id))
        .collect();
    // descending by score, insertion order (id) breaks ties
    ranked.sort_by(|a, b| {
        score(b, now, weights)
            .partial_cmp(&score(a, now, weights))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });

    let mut picked = Vec::new();
    let mut host_load = ctx.active_per_host.clone();
    for item in ranked {
        if picked.len() >= ctx.free_slots {
            break;
        }
        if ctx.blocked_hosts.contains(&item.host) {
            continue;
        }
        let load = host_load.entry(item.host.clone()).or_insert(0);
        if *load >= ctx.max_per_host {
            continue;
        }
        *load += 1;
        picked.push(item.id);
    }
    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const WEIGHTS: ScheduleWeights = ScheduleWeights {
        priority_weight: 1000.0,
        age_weight: 1.0,
    };

    fn item(id: i64, host: &str, priority: Priority, age_secs: i64) -> QueuedItem {
        QueuedItem {
            id,
            host: host.to_string(),
            priority,
            created_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn ctx(free: usize) -> ScheduleContext {
        ScheduleContext {
            free_slots: free,
            active_per_host: HashMap::new(),
            max_per_host: 3,
            blocked_hosts: HashSet::new(),
            starting: HashSet::new(),
        }
    }

    #[test]
    fn test_priority_dominates() {
        let queued = vec![
            item(1, "h", Priority::Low, 0),
            item(2, "h", Priority::High, 0),
            item(3, "h", Priority::Normal, 0),
        ];
        let picked = select_starts(&queued, &ctx(3), WEIGHTS, Utc::now());
        assert_eq!(picked, vec![2, 3, 1]);
    }

    #[test]
    fn test_age_promotes_low_priority() {
        // a low-priority row old enough to outrank a fresh high one:
        // (3 - 1) * 1000 = 2000 seconds of age
        let queued = vec![
            item(1, "h", Priority::Low, 3000),
            item(2, "h", Priority::High, 0),
        ];
        let picked = select_starts(&queued, &ctx(1), WEIGHTS, Utc::now());
        assert_eq!(picked, vec![1]);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let queued = vec![
            item(5, "h", Priority::Normal, 0),
            item(2, "h", Priority::Normal, 0),
        ];
        let picked = select_starts(&queued, &ctx(2), WEIGHTS, Utc::now());
        assert_eq!(picked, vec![2, 5]);
    }

    #[test]
    fn test_respects_free_slots() {
        let queued = vec![
            item(1, "h", Priority::Normal, 0),
            item(2, "h", Priority::Normal, 0),
            item(3, "h", Priority::Normal, 0),
        ];
        let picked = select_starts(&queued, &ctx(2), WEIGHTS, Utc::now());
        assert_eq!(picked.len(), 2);
        assert!(select_starts(&queued, &ctx(0), WEIGHTS, Utc::now()).is_empty());
    }

    #[test]
    fn test_per_host_cap() {
        let mut context = ctx(4);
        context.max_per_host = 1;
        let queued = vec![
            item(1, "a", Priority::Normal, 0),
            item(2, "a", Priority::Normal, 0),
            item(3, "b", Priority::Normal, 0),
        ];
        let picked = select_starts(&queued, &context, WEIGHTS, Utc::now());
        assert_eq!(picked, vec![1, 3]);
    }

    #[test]
    fn test_existing_host_load_counts() {
        let mut context = ctx(4);
        context.max_per_host = 2;
        context.active_per_host.insert("a".to_string(), 2);
        let queued = vec![item(1, "a", Priority::High, 0), item(2, "b", Priority::Low, 0)];
        let picked = select_starts(&queued, &context, WEIGHTS, Utc::now());
        assert_eq!(picked, vec![2]);
    }

    #[test]
    fn test_blocked_host_skipped() {
        let mut context = ctx(4);
        context.blocked_hosts.insert("dead".to_string());
        let queued = vec![
            item(1, "dead", Priority::High, 0),
            item(2, "alive", Priority::Low, 0),
        ];
        let picked = select_starts(&queued, &context, WEIGHTS, Utc::now());
        assert_eq!(picked, vec![2]);
    }

    #[test]
    fn test_starting_set_excluded() {
        let mut context = ctx(4);
        context.starting.insert(1);
        let queued = vec![item(1, "h", Priority::High, 0), item(2, "h", Priority::Low, 0)];
        let picked = select_starts(&queued, &context, WEIGHTS, Utc::now());
        assert_eq!(picked, vec![2]);
    }
}
