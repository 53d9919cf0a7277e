//! Bounded LRU cache for L1/L2 translation tables.
//!
//! Every table the decoder touches is materialised through this cache,
//! keyed by `(file_offset, entry_count)`. Decoding is single-threaded,
//! so interior mutability is sufficient: a lookup either hits, or runs
//! its loader to completion before anything else can ask for the same
//! key, giving at-most-one load per key without locks.

use std::cell::RefCell;
use std::num::NonZeroUsize;
use std::rc::Rc;

use lru::LruCache;

use crate::error::Result;

/// Default cache capacity. Each table is roughly one cluster, so this
/// holds about 64 MiB of tables at 64 KiB clusters.
pub const MAX_CACHED_TABLES: usize = 1000;

/// Cache key: absolute file offset and decoded entry count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableKey {
    pub offset: u64,
    pub entries: usize,
}

/// LRU map from table location to its decoded 64-bit entries.
pub struct TableCache {
    tables: RefCell<LruCache<TableKey, Rc<Vec<u64>>>>,
}

impl TableCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            tables: RefCell::new(LruCache::new(capacity)),
        }
    }

    /// Fetch the table at `key`, running `load` on a miss. The loaded
    /// table is retained until evicted as least recently used.
    pub fn get_or_load(
        &self,
        key: TableKey,
        load: impl FnOnce() -> Result<Vec<u64>>,
    ) -> Result<Rc<Vec<u64>>> {
        if let Some(table) = self.tables.borrow_mut().get(&key) {
            return Ok(Rc::clone(table));
        }
        let table = Rc::new(load()?);
        self.tables.borrow_mut().put(key, Rc::clone(&table));
        Ok(table)
    }

    /// Drop every cached table.
    pub fn clear(&self) {
        self.tables.borrow_mut().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.tables.borrow().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::cell::Cell;

    #[test]
    fn test_loader_runs_once_per_key() {
        let cache = TableCache::new(8);
        let key = TableKey {
            offset: 4096,
            entries: 4,
        };
        let loads = Cell::new(0);

        for _ in 0..3 {
            let table = cache
                .get_or_load(key, || {
                    loads.set(loads.get() + 1);
                    Ok(vec![1, 2, 3, 4])
                })
                .unwrap();
            assert_eq!(*table, vec![1, 2, 3, 4]);
        }
        assert_eq!(loads.get(), 1);
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let cache = TableCache::new(8);
        let key = TableKey {
            offset: 0,
            entries: 1,
        };

        let err = cache.get_or_load(key, || Err(Error::qcow2("short table read")));
        assert!(err.is_err());

        let table = cache.get_or_load(key, || Ok(vec![7])).unwrap();
        assert_eq!(*table, vec![7]);
    }

    #[test]
    fn test_clear_empties_the_cache() {
        let cache = TableCache::new(4);
        cache
            .get_or_load(
                TableKey {
                    offset: 0,
                    entries: 1,
                },
                || Ok(vec![1]),
            )
            .unwrap();
        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = TableCache::new(2);
        for offset in 0..3u64 {
            cache
                .get_or_load(
                    TableKey {
                        offset,
                        entries: 1,
                    },
                    || Ok(vec![offset]),
                )
                .unwrap();
        }
        assert_eq!(cache.len(), 2);

        // Offset 0 was evicted; its loader must run again.
        let loads = Cell::new(0);
        cache
            .get_or_load(
                TableKey {
                    offset: 0,
                    entries: 1,
                },
                || {
                    loads.set(loads.get() + 1);
                    Ok(vec![0])
                },
            )
            .unwrap();
        assert_eq!(loads.get(), 1);
    }
}
