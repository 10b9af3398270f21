use std::time::Instant;

use super::{EntryMeta, EvictionRule, PolicyKind};

const MIN_SIZE: f64 = 0.1;
const MAX_TIME_FACTOR: f64 = 10.0;

/// Evicts the entry with the lowest retention score:
///
/// ```text
/// score = weight / (max(size, 0.1) * min(1 + hours_since_access, 10))
/// ```
#[derive(Debug, Default, Clone)]
pub struct WeightAware;

impl WeightAware {
    pub fn score(meta: &EntryMeta, now: Instant) -> f64 {
        let hours = now.saturating_duration_since(meta.last_access).as_secs_f64() / 3600.0;
        let time_factor = (1.0 + hours).min(MAX_TIME_FACTOR);
        meta.weight / (meta.size.max(MIN_SIZE) * time_factor)
    }
}

impl EvictionRule for WeightAware {
    fn kind(&self) -> PolicyKind {
        PolicyKind::WeightAware
    }

    fn on_admit(&mut self, _key: &str, meta: &mut EntryMeta, _existed: bool) {
        meta.access_count += 1;
    }

    fn on_hit(&mut self, _key: &str, meta: &mut EntryMeta) {
        meta.access_count += 1;
    }

    fn victim<'a, I>(&self, entries: I, now: Instant) -> Option<&'a str>
    where
        I: Iterator<Item = (&'a str, &'a EntryMeta)>,
    {
        entries
            .min_by(|(_, a), (_, b)| {
                Self::score(a, now)
                    .total_cmp(&Self::score(b, now))
                    .then_with(|| a.access_seq.cmp(&b.access_seq))
            })
            .map(|(k, _)| k)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::{AdmitOptions, CachePolicy, WeightAwarePolicy};
    use crate::clock::ManualClock;

    fn opts(size: f64, weight: f64) -> AdmitOptions {
        AdmitOptions { size, weight }
    }

    #[test]
    fn test_low_weight_large_size_evicted() {
        let clock = ManualClock::new();
        let mut policy: WeightAwarePolicy<u32> = WeightAwarePolicy::new(3, Arc::new(clock));
        policy.admit("heavy", 0, opts(1.0, 10.0));
        policy.admit("bulky", 0, opts(50.0, 1.0));
        policy.admit("plain", 0, opts(1.0, 1.0));
        assert_eq!(policy.admit("next", 0, opts(1.0, 1.0)), vec!["bulky"]);
    }

    #[test]
    fn test_idle_time_lowers_score() {
        let clock = ManualClock::new();
        let mut policy: WeightAwarePolicy<u32> =
            WeightAwarePolicy::new(2, Arc::new(clock.clone()));
        policy.admit("old", 0, opts(1.0, 2.0));
        clock.advance(Duration::from_secs(3 * 3600));
        policy.admit("fresh", 0, opts(1.0, 1.0));
        // old: 2 / 4 = 0.5, fresh: 1 / 1 = 1.0
        assert_eq!(policy.evict().as_deref(), Some("old"));
    }

    #[test]
    fn test_tiny_sizes_are_clamped() {
        let clock = ManualClock::new();
        let mut policy: WeightAwarePolicy<u32> = WeightAwarePolicy::new(2, Arc::new(clock));
        policy.admit("zero", 0, opts(0.0, 1.0));
        policy.admit("tenth", 0, opts(0.1, 1.0));
        // equal scores, oldest access loses
        assert_eq!(policy.evict().as_deref(), Some("zero"));
    }
}
