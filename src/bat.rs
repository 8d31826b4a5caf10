//! Narrow handle API onto the buffer pool.
//!
//! The storage engine proper is an external collaborator; the VM consumes
//! it through opaque table handles with cached metadata and two reference
//! counts. The logical count tracks how many value slots hold the handle,
//! the physical count how many in-flight kernel operations pin the pages.
//! A table is reclaimed only when both reach zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use hashbrown::HashMap;

use crate::atom::AtomId;

/// Opaque table identifier. Zero is the nil handle.
pub type BatId = u64;

/// Cached metadata for a pooled table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatDescriptor {
    pub rows: u64,
    pub elem_type: AtomId,
    pub persistent: bool,
    /// Monotonically increasing change stamp.
    pub stamp: u64,
    /// Primary heap footprint in bytes.
    pub heap_bytes: u64,
    /// Variable-heap footprint in bytes.
    pub vheap_bytes: u64,
    /// Hash-index footprint in bytes.
    pub hash_bytes: u64,
    /// Views share their parent's heaps and are treated as free by the
    /// admission estimate.
    pub view: bool,
}

impl BatDescriptor {
    pub fn transient(elem_type: AtomId, rows: u64, heap_bytes: u64) -> Self {
        Self {
            rows,
            elem_type,
            persistent: false,
            stamp: 0,
            heap_bytes,
            vheap_bytes: 0,
            hash_bytes: 0,
            view: false,
        }
    }

    /// Combined footprint used by the admission estimate.
    pub fn footprint(&self) -> u64 {
        self.heap_bytes + self.vheap_bytes + self.hash_bytes
    }
}

struct BatEntry {
    desc: BatDescriptor,
    logical: u32,
    physical: u32,
}

/// In-memory buffer pool carrying the reference accounting the VM needs.
pub struct BufferPool {
    entries: Mutex<HashMap<BatId, BatEntry>>,
    next_id: AtomicU64,
    clock: AtomicU64,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            clock: AtomicU64::new(1),
        }
    }

    /// Creates a table and hands the caller the first logical reference.
    pub fn acquire(&self, mut desc: BatDescriptor) -> BatId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        desc.stamp = self.clock.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().expect("buffer pool lock poisoned");
        entries.insert(
            id,
            BatEntry {
                desc,
                logical: 1,
                physical: 0,
            },
        );
        id
    }

    /// Copies out the descriptor for `id`.
    pub fn descriptor(&self, id: BatId) -> Option<BatDescriptor> {
        let entries = self.entries.lock().expect("buffer pool lock poisoned");
        entries.get(&id).map(|e| e.desc)
    }

    /// Records a content change: bumps the table's stamp.
    pub fn touch(&self, id: BatId) {
        let stamp = self.clock.fetch_add(1, Ordering::SeqCst);
        let mut entries = self.entries.lock().expect("buffer pool lock poisoned");
        if let Some(e) = entries.get_mut(&id) {
            e.desc.stamp = stamp;
        }
    }

    /// Adds a logical reference (a value slot now holds the handle).
    pub fn incref(&self, id: BatId) {
        if id == 0 {
            return;
        }
        let mut entries = self.entries.lock().expect("buffer pool lock poisoned");
        if let Some(e) = entries.get_mut(&id) {
            e.logical += 1;
        }
    }

    /// Drops a logical reference; reclaims the table when no slot and no
    /// kernel operation holds it any more. Returns true on reclaim.
    pub fn decref(&self, id: BatId) -> bool {
        if id == 0 {
            return false;
        }
        let mut entries = self.entries.lock().expect("buffer pool lock poisoned");
        let reclaim = match entries.get_mut(&id) {
            Some(e) => {
                if e.logical > 0 {
                    e.logical -= 1;
                }
                e.logical == 0 && e.physical == 0
            }
            None => false,
        };
        if reclaim {
            entries.remove(&id);
            log::debug!("buffer pool: reclaimed bat {id}");
        }
        reclaim
    }

    /// Pins the table pages for an in-flight kernel operation.
    pub fn pin(&self, id: BatId) {
        let mut entries = self.entries.lock().expect("buffer pool lock poisoned");
        if let Some(e) = entries.get_mut(&id) {
            e.physical += 1;
        }
    }

    /// Releases a physical pin, reclaiming the table when it was already
    /// logically dead.
    pub fn unpin(&self, id: BatId) {
        let mut entries = self.entries.lock().expect("buffer pool lock poisoned");
        let reclaim = match entries.get_mut(&id) {
            Some(e) => {
                if e.physical > 0 {
                    e.physical -= 1;
                }
                e.logical == 0 && e.physical == 0
            }
            None => false,
        };
        if reclaim {
            entries.remove(&id);
            log::debug!("buffer pool: reclaimed bat {id} on unpin");
        }
    }

    pub fn logical_refs(&self, id: BatId) -> u32 {
        let entries = self.entries.lock().expect("buffer pool lock poisoned");
        entries.get(&id).map(|e| e.logical).unwrap_or(0)
    }

    pub fn exists(&self, id: BatId) -> bool {
        let entries = self.entries.lock().expect("buffer pool lock poisoned");
        entries.contains_key(&id)
    }

    /// Sum of all logical references, used by leak assertions.
    pub fn total_logical_refs(&self) -> u64 {
        let entries = self.entries.lock().expect("buffer pool lock poisoned");
        entries.values().map(|e| e.logical as u64).sum()
    }

    /// Number of live tables.
    pub fn live(&self) -> usize {
        let entries = self.entries.lock().expect("buffer pool lock poisoned");
        entries.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::TYPE_INT;

    #[test]
    fn test_acquire_and_refcounts() {
        let pool = BufferPool::new();
        let id = pool.acquire(BatDescriptor::transient(TYPE_INT, 100, 400));
        assert_eq!(pool.logical_refs(id), 1);

        pool.incref(id);
        assert_eq!(pool.logical_refs(id), 2);

        assert!(!pool.decref(id));
        assert!(pool.decref(id));
        assert!(!pool.exists(id));
    }

    #[test]
    fn test_physical_pin_defers_reclaim() {
        let pool = BufferPool::new();
        let id = pool.acquire(BatDescriptor::transient(TYPE_INT, 10, 40));
        pool.pin(id);

        // Logically dead but pinned: stays alive until unpin.
        assert!(!pool.decref(id));
        assert!(pool.exists(id));
        pool.unpin(id);
        assert!(!pool.exists(id));
    }

    #[test]
    fn test_stamp_is_monotonic() {
        let pool = BufferPool::new();
        let id = pool.acquire(BatDescriptor::transient(TYPE_INT, 10, 40));
        let s0 = pool.descriptor(id).unwrap().stamp;
        pool.touch(id);
        let s1 = pool.descriptor(id).unwrap().stamp;
        assert!(s1 > s0);
    }

    #[test]
    fn test_nil_handle_is_ignored() {
        let pool = BufferPool::new();
        pool.incref(0);
        assert!(!pool.decref(0));
        assert_eq!(pool.total_logical_refs(), 0);
    }
}
