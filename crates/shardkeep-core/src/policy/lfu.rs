use std::time::Instant;

use super::{EntryMeta, EvictionRule, PolicyKind};

/// Least-frequently-used eviction; ties go to the oldest last access.
///
/// Admission resets the count to 1, including re-admission of a cached key.
#[derive(Debug, Default, Clone)]
pub struct Lfu;

impl EvictionRule for Lfu {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Lfu
    }

    fn on_admit(&mut self, _key: &str, meta: &mut EntryMeta, _existed: bool) {
        meta.access_count = 1;
    }

    fn on_hit(&mut self, _key: &str, meta: &mut EntryMeta) {
        meta.access_count += 1;
    }

    fn victim<'a, I>(&self, entries: I, _now: Instant) -> Option<&'a str>
    where
        I: Iterator<Item = (&'a str, &'a EntryMeta)>,
    {
        entries
            .min_by_key(|(_, meta)| (meta.access_count, meta.access_seq))
            .map(|(k, _)| k)
    }
}
