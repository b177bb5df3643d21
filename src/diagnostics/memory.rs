/*!
 * Tag-based allocation tracking
 *
 * Components register sizeable allocations under a tag and release them
 * when done; the tracker maintains live/peak statistics and exposes the
 * leak query (any record still active).
 */

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Coarse grouping for allocation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MemoryCategory {
    General,
    System,
    Graphics,
}

/// One tracked allocation.
#[derive(Debug, Clone, Serialize)]
pub struct AllocationRecord {
    pub id: u64,
    pub tag: String,
    pub size: usize,
    pub category: MemoryCategory,
    pub timestamp: DateTime<Utc>,
    pub active: bool,
}

/// Aggregated tracker statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStatistics {
    pub active_allocations: usize,
    pub total_allocations: u64,
    pub total_releases: u64,
    pub active_bytes: usize,
    pub peak_bytes: usize,
    pub category_bytes: HashMap<String, usize>,
}

struct Inner {
    next_id: u64,
    records: HashMap<u64, AllocationRecord>,
    statistics: MemoryStatistics,
}

/// Allocation tracking service.
pub struct MemoryTracker {
    inner: Mutex<Inner>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                records: HashMap::new(),
                statistics: MemoryStatistics::default(),
            }),
        }
    }

    /// Record an allocation; the returned id is passed to [`release`].
    ///
    /// [`release`]: Self::release
    pub fn track(&self, tag: &str, size: usize, category: MemoryCategory) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.records.insert(
            id,
            AllocationRecord {
                id,
                tag: tag.to_string(),
                size,
                category,
                timestamp: Utc::now(),
                active: true,
            },
        );
        inner.statistics.total_allocations += 1;
        inner.statistics.active_allocations += 1;
        inner.statistics.active_bytes += size;
        if inner.statistics.active_bytes > inner.statistics.peak_bytes {
            inner.statistics.peak_bytes = inner.statistics.active_bytes;
        }
        *inner
            .statistics
            .category_bytes
            .entry(format!("{category:?}"))
            .or_default() += size;
        id
    }

    /// Mark a tracked allocation inactive. Returns false for unknown or
    /// already released ids.
    pub fn release(&self, id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.records.get_mut(&id) else {
            return false;
        };
        if !record.active {
            return false;
        }
        record.active = false;
        let size = record.size;
        let category = record.category;
        inner.statistics.total_releases += 1;
        inner.statistics.active_allocations -= 1;
        inner.statistics.active_bytes -= size;
        if let Some(bytes) = inner.statistics.category_bytes.get_mut(&format!("{category:?}")) {
            *bytes -= size;
        }
        true
    }

    pub fn has_allocation(&self, id: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(&id)
            .map(|r| r.active)
            .unwrap_or(false)
    }

    /// The leak query: every record still active at call time.
    pub fn active_allocations(&self) -> Vec<AllocationRecord> {
        self.inner
            .lock()
            .unwrap()
            .records
            .values()
            .filter(|r| r.active)
            .cloned()
            .collect()
    }

    pub fn has_leaks(&self) -> bool {
        self.inner.lock().unwrap().statistics.active_allocations > 0
    }

    pub fn statistics(&self) -> MemoryStatistics {
        self.inner.lock().unwrap().statistics.clone()
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.records.clear();
        inner.statistics = MemoryStatistics::default();
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}
