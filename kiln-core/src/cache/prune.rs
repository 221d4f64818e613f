//! Eviction policy selection: given a snapshot of entries, decide which to
//! remove to satisfy size/age/count constraints.

use chrono::{DateTime, Utc};

use super::{CompressionKind, Entry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Lru,
    Lfu,
    Fifo,
    LargestFirst,
    Random,
    ExpiredOnly,
}

#[derive(Debug, Clone, Default)]
pub struct PrunePolicy {
    pub strategy: Option<Strategy>,
    pub max_age: Option<chrono::Duration>,
    pub max_size: Option<u64>,
    pub max_entries: Option<usize>,
    pub dry_run: bool,
}

/// Returns the keys of entries to remove, in the order they'd be evicted.
/// `access_counts` supplies hit counts for LFU; entries absent from it are
/// treated as never accessed.
#[must_use]
pub fn select_for_eviction(
    entries: &[Entry],
    policy: &PrunePolicy,
    now: DateTime<Utc>,
    access_counts: &std::collections::HashMap<String, u64>,
) -> Vec<String> {
    let expired: Vec<&Entry> = entries
        .iter()
        .filter(|e| e.expiry.is_some_and(|exp| exp <= now) || policy.max_age.is_some_and(|age| now - e.created_at > age))
        .collect();

    if policy.strategy == Some(Strategy::ExpiredOnly) {
        return expired.into_iter().map(|e| e.key.clone()).collect();
    }

    let mut remaining: Vec<&Entry> = entries.iter().filter(|e| !expired.iter().any(|x| x.key == e.key)).collect();

    match policy.strategy.unwrap_or(Strategy::Lru) {
        Strategy::Lru => remaining.sort_by_key(|e| e.last_access),
        Strategy::Fifo => remaining.sort_by_key(|e| e.created_at),
        Strategy::LargestFirst => remaining.sort_by(|a, b| b.size.cmp(&a.size)),
        Strategy::Lfu => remaining.sort_by_key(|e| access_counts.get(&e.key).copied().unwrap_or(0)),
        Strategy::Random => {
            let mut seed = now.timestamp_nanos_opt().unwrap_or_default() as u64;
            remaining.sort_by_key(|e| {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
                seed ^ u64::from_le_bytes(e.key.as_bytes()[..8.min(e.key.len())].try_into().unwrap_or_default())
            });
        }
        Strategy::ExpiredOnly => unreachable!("handled above"),
    }

    let mut evicted: Vec<String> = expired.iter().map(|e| e.key.clone()).collect();
    let mut total_size: u64 = remaining.iter().map(|e| e.size).sum::<u64>() + expired.iter().map(|e| e.size).sum::<u64>();
    let mut total_count = entries.len();

    for entry in remaining {
        let over_size = policy.max_size.is_some_and(|max| total_size > max);
        let over_count = policy.max_entries.is_some_and(|max| total_count > max);
        if !over_size && !over_count {
            break;
        }
        evicted.push(entry.key.clone());
        total_size = total_size.saturating_sub(entry.size);
        total_count -= 1;
    }

    evicted
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn entry(key: &str, size: u64, created_secs_ago: i64) -> Entry {
        let now = Utc::now();
        Entry {
            key: key.to_owned(),
            size,
            created_at: now - chrono::Duration::seconds(created_secs_ago),
            last_access: now - chrono::Duration::seconds(created_secs_ago),
            expiry: None,
            content_type: "application/octet-stream".to_owned(),
            compression: super::CompressionKind::None,
            platform: None,
            layer_digest: None,
            content_checksum: String::new(),
        }
    }

    #[test]
    fn max_size_evicts_lru_first() {
        let entries = vec![entry("old", 100, 100), entry("new", 100, 1)];
        let policy = PrunePolicy { strategy: Some(Strategy::Lru), max_size: Some(100), ..Default::default() };
        let evicted = select_for_eviction(&entries, &policy, Utc::now(), &HashMap::new());
        assert_eq!(evicted, vec!["old".to_owned()]);
    }

    #[test]
    fn expired_only_ignores_size() {
        let mut entries = vec![entry("fresh", 100, 1)];
        entries[0].expiry = Some(Utc::now() - chrono::Duration::seconds(1));
        let policy = PrunePolicy { strategy: Some(Strategy::ExpiredOnly), ..Default::default() };
        let evicted = select_for_eviction(&entries, &policy, Utc::now(), &HashMap::new());
        assert_eq!(evicted, vec!["fresh".to_owned()]);
    }

    #[test]
    fn eviction_budget_respected() {
        let entries = vec![entry("a", 40, 30), entry("b", 40, 20), entry("c", 40, 10)];
        let policy = PrunePolicy { strategy: Some(Strategy::Lru), max_size: Some(80), ..Default::default() };
        let evicted = select_for_eviction(&entries, &policy, Utc::now(), &HashMap::new());
        let remaining_size: u64 = entries.iter().filter(|e| !evicted.contains(&e.key)).map(|e| e.size).sum();
        assert!(remaining_size <= 80);
    }
}
