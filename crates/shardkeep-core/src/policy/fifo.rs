use std::time::Instant;

use super::{EntryMeta, EvictionRule, PolicyKind};

/// First-in-first-out eviction. Hits never change the order; re-admission
/// moves the key to the back.
#[derive(Debug, Default, Clone)]
pub struct Fifo;

impl EvictionRule for Fifo {
    fn kind(&self) -> PolicyKind {
        PolicyKind::Fifo
    }

    fn on_admit(&mut self, _key: &str, meta: &mut EntryMeta, existed: bool) {
        if existed {
            meta.insert_seq = meta.access_seq;
        }
        meta.access_count += 1;
    }

    fn on_hit(&mut self, _key: &str, meta: &mut EntryMeta) {
        meta.access_count += 1;
    }

    fn victim<'a, I>(&self, entries: I, _now: Instant) -> Option<&'a str>
    where
        I: Iterator<Item = (&'a str, &'a EntryMeta)>,
    {
        entries
            .min_by_key(|(_, meta)| meta.insert_seq)
            .map(|(k, _)| k)
    }
}
