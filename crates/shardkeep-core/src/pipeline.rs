//! Load path composition.
//!
//! A [`LoadPipeline`] runs a shard load through an ordered chain of
//! [`LoadInterceptor`]s before reaching the [`ShardSource`]. The order is
//! fixed by [`InterceptorStage`], independent of installation order:
//!
//! ```text
//! Observe (monitor) -> Recover (recovery) -> source
//! ```
//!
//! so the monitor times recovery-inclusive latency.

use std::fmt;
use std::sync::Arc;

use crate::error::ShardResult;

/// External storage collaborator that materialises shard payloads.
pub trait ShardSource<V>: Send + Sync {
    /// Load a shard. `Ok(None)` means the source produced nothing.
    fn load(&self, shard_id: &str) -> ShardResult<Option<V>>;

    /// Release a shard. `false` means the entry must stay cached.
    fn unload(&self, shard_id: &str) -> bool {
        let _ = shard_id;
        true
    }
}

/// [`ShardSource`] built from closures.
pub struct FnSource<L, U> {
    load: L,
    unload: U,
}

fn always_unload(_: &str) -> bool {
    true
}

impl<L> FnSource<L, fn(&str) -> bool> {
    pub fn new(load: L) -> Self {
        Self {
            load,
            unload: always_unload,
        }
    }
}

impl<L, U> FnSource<L, U> {
    pub fn with_unload<U2>(self, unload: U2) -> FnSource<L, U2> {
        FnSource {
            load: self.load,
            unload,
        }
    }
}

impl<V, L, U> ShardSource<V> for FnSource<L, U>
where
    L: Fn(&str) -> ShardResult<Option<V>> + Send + Sync,
    U: Fn(&str) -> bool + Send + Sync,
{
    fn load(&self, shard_id: &str) -> ShardResult<Option<V>> {
        (self.load)(shard_id)
    }

    fn unload(&self, shard_id: &str) -> bool {
        (self.unload)(shard_id)
    }
}

/// Position of an interceptor in the chain, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterceptorStage {
    Observe,
    Recover,
}

pub type LoadNext<'a, V> = &'a dyn Fn(&str) -> ShardResult<Option<V>>;
pub type UnloadNext<'a> = &'a dyn Fn(&str) -> bool;

/// Middleware wrapped around shard loads and unloads.
pub trait LoadInterceptor<V>: Send + Sync {
    fn name(&self) -> &'static str;

    fn stage(&self) -> InterceptorStage;

    fn around_load(&self, shard_id: &str, next: LoadNext<'_, V>) -> ShardResult<Option<V>>;

    fn around_unload(&self, shard_id: &str, next: UnloadNext<'_>) -> bool {
        next(shard_id)
    }
}

/// Source plus the interceptors wrapped around it.
pub struct LoadPipeline<V> {
    source: Arc<dyn ShardSource<V>>,
    interceptors: Vec<Arc<dyn LoadInterceptor<V>>>,
}

impl<V> LoadPipeline<V> {
    pub fn new(source: Arc<dyn ShardSource<V>>) -> Self {
        Self {
            source,
            interceptors: Vec::new(),
        }
    }

    /// Install an interceptor at its stage. Interceptors sharing a stage keep
    /// installation order.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn LoadInterceptor<V>>) -> Self {
        let stage = interceptor.stage();
        let pos = self
            .interceptors
            .iter()
            .position(|i| i.stage() > stage)
            .unwrap_or(self.interceptors.len());
        self.interceptors.insert(pos, interceptor);
        self
    }

    /// Interceptor names, outermost first.
    pub fn layers(&self) -> Vec<&'static str> {
        self.interceptors.iter().map(|i| i.name()).collect()
    }

    pub fn load(&self, shard_id: &str) -> ShardResult<Option<V>> {
        self.load_at(0, shard_id)
    }

    pub fn unload(&self, shard_id: &str) -> bool {
        self.unload_at(0, shard_id)
    }

    fn load_at(&self, depth: usize, shard_id: &str) -> ShardResult<Option<V>> {
        match self.interceptors.get(depth) {
            Some(interceptor) => {
                interceptor.around_load(shard_id, &|id: &str| self.load_at(depth + 1, id))
            }
            None => self.source.load(shard_id),
        }
    }

    fn unload_at(&self, depth: usize, shard_id: &str) -> bool {
        match self.interceptors.get(depth) {
            Some(interceptor) => {
                interceptor.around_unload(shard_id, &|id: &str| self.unload_at(depth + 1, id))
            }
            None => self.source.unload(shard_id),
        }
    }
}

impl<V> fmt::Debug for LoadPipeline<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadPipeline")
            .field("layers", &self.layers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ShardError;
    use parking_lot::Mutex;

    struct Recording {
        name: &'static str,
        stage: InterceptorStage,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl LoadInterceptor<u32> for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn stage(&self) -> InterceptorStage {
            self.stage
        }

        fn around_load(&self, shard_id: &str, next: LoadNext<'_, u32>) -> ShardResult<Option<u32>> {
            self.log.lock().push(format!("{}:enter", self.name));
            let out = next(shard_id);
            self.log.lock().push(format!("{}:exit", self.name));
            out
        }
    }

    fn recording(
        name: &'static str,
        stage: InterceptorStage,
        log: &Arc<Mutex<Vec<String>>>,
    ) -> Arc<dyn LoadInterceptor<u32>> {
        Arc::new(Recording {
            name,
            stage,
            log: log.clone(),
        })
    }

    #[test]
    fn test_stage_order_independent_of_install_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let source_log = log.clone();
        let source = FnSource::new(move |id: &str| -> ShardResult<Option<u32>> {
            source_log.lock().push(format!("source:{}", id));
            Ok(Some(7_u32))
        });

        let pipeline: LoadPipeline<u32> = LoadPipeline::new(Arc::new(source))
            .with_interceptor(recording("recovery", InterceptorStage::Recover, &log))
            .with_interceptor(recording("monitor", InterceptorStage::Observe, &log));

        assert_eq!(pipeline.layers(), vec!["monitor", "recovery"]);
        assert_eq!(pipeline.load("s1").unwrap(), Some(7));
        assert_eq!(
            *log.lock(),
            vec![
                "monitor:enter",
                "recovery:enter",
                "source:s1",
                "recovery:exit",
                "monitor:exit"
            ]
        );
    }

    #[test]
    fn test_errors_pass_through_and_unload_defaults() {
        let source = FnSource::new(|id: &str| -> ShardResult<Option<u32>> {
            Err(ShardError::LoadFailed {
                shard_id: id.to_string(),
                reason: "disk".to_string(),
            })
        })
        .with_unload(|id: &str| id != "pinned");

        let pipeline: LoadPipeline<u32> = LoadPipeline::new(Arc::new(source));
        assert!(pipeline.load("s1").is_err());
        assert!(pipeline.unload("s1"));
        assert!(!pipeline.unload("pinned"));
    }
}
