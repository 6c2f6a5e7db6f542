use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::{PoolConfig, PoolOverrides};
use crate::destination::Destination;
use crate::error::Error;
use crate::pool::PoolStatus;
use crate::util::lock_unpoisoned;

/// Pool handle the registry can hand out and shut down.
pub trait ManagedPool: Clone + Send + Sync {
    fn close(&self);

    fn status(&self) -> PoolStatus;
}

type PoolFactory<P> = dyn Fn(&Destination, PoolConfig) -> P + Send + Sync;

struct Entry<P> {
    pool: P,
    last_used: u64,
}

struct RegistryState<P> {
    tick: u64,
    entries: HashMap<Destination, Entry<P>>,
    recency: BTreeMap<u64, Destination>,
}

/// One slot pool per destination, at most `num_pools` of them. The least
/// recently looked-up pool is evicted and closed to make room.
pub struct PoolRegistry<P: ManagedPool> {
    num_pools: usize,
    defaults: PoolConfig,
    factory: Arc<PoolFactory<P>>,
    state: Mutex<RegistryState<P>>,
}

impl<P: ManagedPool> PoolRegistry<P> {
    pub(crate) fn new(
        num_pools: usize,
        defaults: PoolConfig,
        factory: impl Fn(&Destination, PoolConfig) -> P + Send + Sync + 'static,
    ) -> Self {
        Self {
            num_pools: num_pools.max(1),
            defaults,
            factory: Arc::new(factory),
            state: Mutex::new(RegistryState {
                tick: 0,
                entries: HashMap::new(),
                recency: BTreeMap::new(),
            }),
        }
    }

    pub fn num_pools(&self) -> usize {
        self.num_pools
    }

    pub fn defaults(&self) -> PoolConfig {
        self.defaults
    }

    pub fn lookup(&self, url: &str) -> Result<P, Error> {
        let destination = Destination::parse(url)?;
        Ok(self.pool_for(&destination, &PoolOverrides::default()))
    }

    pub fn lookup_with(&self, url: &str, overrides: &PoolOverrides) -> Result<P, Error> {
        let destination = Destination::parse(url)?;
        Ok(self.pool_for(&destination, overrides))
    }

    pub fn pool_for(&self, destination: &Destination, overrides: &PoolOverrides) -> P {
        let mut state = lock_unpoisoned(&self.state);
        state.tick += 1;
        let tick = state.tick;

        if let Some(entry) = state.entries.get_mut(destination) {
            let previous = entry.last_used;
            entry.last_used = tick;
            let pool = entry.pool.clone();
            state.recency.remove(&previous);
            state.recency.insert(tick, destination.clone());
            return pool;
        }

        while state.entries.len() >= self.num_pools {
            let Some((_, evicted)) = state.recency.pop_first() else {
                break;
            };
            if let Some(entry) = state.entries.remove(&evicted) {
                debug!(destination = %evicted, "evicting least recently used pool");
                entry.pool.close();
            }
        }

        let config = self.defaults.merged(overrides);
        let pool = (self.factory)(destination, config);
        debug!(
            destination = %destination,
            max_size = config.max_size,
            "created connection pool"
        );
        state.entries.insert(
            destination.clone(),
            Entry {
                pool: pool.clone(),
                last_used: tick,
            },
        );
        state.recency.insert(tick, destination.clone());
        pool
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, destination: &Destination) -> bool {
        lock_unpoisoned(&self.state).entries.contains_key(destination)
    }

    /// Destinations from least to most recently used.
    pub fn destinations(&self) -> Vec<Destination> {
        lock_unpoisoned(&self.state)
            .recency
            .values()
            .cloned()
            .collect()
    }

    pub fn status(&self, destination: &Destination) -> Option<PoolStatus> {
        lock_unpoisoned(&self.state)
            .entries
            .get(destination)
            .map(|entry| entry.pool.status())
    }

    /// Closes and forgets every pool.
    pub fn close_all(&self) {
        let entries: Vec<(Destination, Entry<P>)> = {
            let mut state = lock_unpoisoned(&self.state);
            state.recency.clear();
            state.entries.drain().collect()
        };
        for (destination, entry) in entries {
            debug!(destination = %destination, "closing connection pool");
            entry.pool.close();
        }
    }
}

impl<P: ManagedPool> std::fmt::Debug for PoolRegistry<P> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PoolRegistry")
            .field("num_pools", &self.num_pools)
            .field("defaults", &self.defaults)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::{ManagedPool, PoolRegistry};
    use crate::config::{BlockingPolicy, PoolConfig, PoolOverrides};
    use crate::destination::Destination;
    use crate::pool::PoolStatus;

    #[derive(Clone)]
    struct FakePool {
        config: PoolConfig,
        closed: Arc<AtomicBool>,
    }

    impl ManagedPool for FakePool {
        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn status(&self) -> PoolStatus {
            PoolStatus {
                max_size: self.config.max_size,
                live: 0,
                idle: 0,
                waiting: 0,
                closed: self.closed.load(Ordering::SeqCst),
            }
        }
    }

    fn registry(num_pools: usize) -> PoolRegistry<FakePool> {
        PoolRegistry::new(num_pools, PoolConfig::default(), |_, config| FakePool {
            config,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn destination(url: &str) -> Destination {
        Destination::parse(url).expect("destination")
    }

    #[test]
    fn same_destination_shares_one_pool() {
        let registry = registry(4);
        let first = registry.lookup("http://a.example.com/x").expect("pool");
        let second = registry.lookup("HTTP://A.example.com:80/y").expect("pool");
        assert!(Arc::ptr_eq(&first.closed, &second.closed));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn inserting_past_capacity_evicts_exactly_one_and_closes_it() {
        let registry = registry(2);
        let a = registry.lookup("http://a.example.com/").expect("pool");
        let _b = registry.lookup("http://b.example.com/").expect("pool");
        let _c = registry.lookup("http://c.example.com/").expect("pool");

        assert_eq!(registry.len(), 2);
        assert!(a.closed.load(Ordering::SeqCst));
        assert!(!registry.contains(&destination("http://a.example.com/")));
    }

    #[test]
    fn eviction_targets_least_recently_used() {
        let registry = registry(2);
        let a = registry.lookup("http://a.example.com/").expect("pool");
        let b = registry.lookup("http://b.example.com/").expect("pool");
        registry.lookup("http://a.example.com/again").expect("pool");
        registry.lookup("http://c.example.com/").expect("pool");

        assert!(!a.closed.load(Ordering::SeqCst));
        assert!(b.closed.load(Ordering::SeqCst));
        assert_eq!(
            registry.destinations(),
            vec![
                destination("http://a.example.com/"),
                destination("http://c.example.com/")
            ]
        );
    }

    #[test]
    fn overrides_apply_only_to_new_pools() {
        let registry = registry(2);
        let overrides = PoolOverrides::default()
            .with_max_size(3)
            .with_blocking_policy(BlockingPolicy::Block);
        let pool = registry
            .lookup_with("http://a.example.com/", &overrides)
            .expect("pool");
        assert_eq!(pool.config.max_size, 3);
        assert_eq!(pool.config.blocking_policy, BlockingPolicy::Block);

        let existing = registry
            .lookup_with("http://a.example.com/", &PoolOverrides::default().with_max_size(9))
            .expect("pool");
        assert_eq!(existing.config.max_size, 3);
    }

    #[test]
    fn close_all_closes_and_empties() {
        let registry = registry(3);
        let a = registry.lookup("http://a.example.com/").expect("pool");
        let b = registry.lookup("https://a.example.com/").expect("pool");
        registry.close_all();
        assert!(registry.is_empty());
        assert!(a.closed.load(Ordering::SeqCst));
        assert!(b.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn invalid_url_is_rejected() {
        assert!(registry(1).lookup("not a url").is_err());
    }
}
