//! Memory accounting.
//!
//! Every live tensor holds a [`Lease`] on the bytes it occupies. Freed bytes
//! move to a cache, up to the cache limit, and are handed back out to later
//! allocations before new bytes are counted. Limits are recorded but never
//! enforced.

use std::sync::Arc;

use mlx_engine::{MemoryLimit, MemoryStat};
use parking_lot::Mutex;

const DEFAULT_LIMIT: usize = 1 << 34;

#[derive(Debug)]
struct State {
    active: usize,
    peak: usize,
    cache: usize,
    memory_limit: usize,
    cache_limit: usize,
    wired_limit: usize,
}

#[derive(Debug)]
pub struct Memory {
    state: Mutex<State>,
}

impl Default for Memory {
    fn default() -> Self {
        Memory {
            state: Mutex::new(State {
                active: 0,
                peak: 0,
                cache: 0,
                memory_limit: DEFAULT_LIMIT,
                cache_limit: DEFAULT_LIMIT,
                wired_limit: 0,
            }),
        }
    }
}

impl Memory {
    /// Account for `bytes` of new storage
    pub fn alloc(self: &Arc<Self>, bytes: usize) -> Lease {
        let mut s = self.state.lock();
        s.cache -= s.cache.min(bytes);
        s.active += bytes;
        s.peak = s.peak.max(s.active);
        Lease {
            memory: Arc::clone(self),
            bytes,
        }
    }

    fn free(&self, bytes: usize) {
        let mut s = self.state.lock();
        s.active -= s.active.min(bytes);
        s.cache = (s.cache + bytes).min(s.cache_limit);
    }

    pub fn stat(&self, stat: MemoryStat) -> usize {
        let s = self.state.lock();
        match stat {
            MemoryStat::Active => s.active,
            MemoryStat::Peak => s.peak,
            MemoryStat::Cache => s.cache,
        }
    }

    pub fn reset_peak(&self) {
        let mut s = self.state.lock();
        s.peak = s.active;
    }

    pub fn clear_cache(&self) {
        self.state.lock().cache = 0;
    }

    /// Store a limit, returning the previous one
    pub fn set_limit(&self, limit: MemoryLimit, bytes: usize) -> usize {
        let mut s = self.state.lock();
        let slot = match limit {
            MemoryLimit::Memory => &mut s.memory_limit,
            MemoryLimit::Cache => &mut s.cache_limit,
            MemoryLimit::Wired => &mut s.wired_limit,
        };
        let previous = std::mem::replace(slot, bytes);
        if limit == MemoryLimit::Cache {
            s.cache = s.cache.min(bytes);
        }
        previous
    }
}

/// Bytes held by one live tensor
#[derive(Debug)]
pub struct Lease {
    memory: Arc<Memory>,
    bytes: usize,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.memory.free(self.bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_alloc_and_free() {
        let memory = Arc::new(Memory::default());
        let a = memory.alloc(100);
        let b = memory.alloc(50);
        assert_eq!(memory.stat(MemoryStat::Active), 150);
        drop(a);
        assert_eq!(memory.stat(MemoryStat::Active), 50);
        assert_eq!(memory.stat(MemoryStat::Peak), 150);
        assert_eq!(memory.stat(MemoryStat::Cache), 100);

        // cached bytes are reused first
        let _c = memory.alloc(60);
        assert_eq!(memory.stat(MemoryStat::Cache), 40);
        drop(b);
        memory.reset_peak();
        assert_eq!(memory.stat(MemoryStat::Peak), 60);
        memory.clear_cache();
        assert_eq!(memory.stat(MemoryStat::Cache), 0);
    }

    #[test]
    fn test_limits_return_previous() {
        let memory = Memory::default();
        assert_eq!(memory.set_limit(MemoryLimit::Wired, 10), 0);
        assert_eq!(memory.set_limit(MemoryLimit::Wired, 20), 10);
        assert_eq!(memory.set_limit(MemoryLimit::Cache, 0), DEFAULT_LIMIT);
    }
}
