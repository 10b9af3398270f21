use std::time::Instant;

use super::{oldest_access, EntryMeta, EvictionRule, PolicyKind};

/// Least-recently-used eviction.
#[derive(Debug, Default, Clone)]
pub struct Lru;

impl EvictionRule for Lru {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Lru
    }

    fn on_admit(&mut self, _key: &str, meta: &mut EntryMeta, _existed: bool) {
        meta.access_count += 1;
    }

    fn on_hit(&mut self, _key: &str, meta: &mut EntryMeta) {
        meta.access_count += 1;
    }

    fn victim<'a, I>(&self, entries: I, _now: Instant) -> Option<&'a str>
    where
        I: Iterator<Item = (&'a str, &'a EntryMeta)>,
    {
        oldest_access(entries)
    }
}
