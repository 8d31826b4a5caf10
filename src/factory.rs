//! The factory plant: persistent co-routine frames.
//!
//! A factory is a function whose frame survives across invocations and
//! that may pause at `yield`, resuming after it on the next call. The
//! plant table keeps at most one plant per factory block under the default
//! policy. A plant's frame is checked out for the duration of one dispatch
//! and checked back in at yield; concurrent invocations of the same
//! factory serialise at the checkout.

use std::sync::{Arc, Condvar, Mutex};

use crate::atom::AtomRegistry;
use crate::bat::BufferPool;
use crate::block::MalBlock;
use crate::exception::{ExceptionKind, MalException, MalResult};
use crate::stack::StackFrame;

/// Bound on concurrently existing plants.
pub const MAX_PLANTS: usize = 256;

struct PlantRecord {
    id: u64,
    block: Arc<MalBlock>,
    /// The persistent frame; absent while checked out.
    frame: Option<StackFrame>,
    /// Resume point: the instruction after the last yield.
    pc: usize,
    in_use: bool,
    /// Session that invoked the plant most recently.
    caller: Option<u64>,
}

/// A checked-out plant, returned to the table through
/// [`PlantTable::checkin`] or torn down through [`PlantTable::remove`].
pub struct PlantLease {
    pub id: u64,
    pub frame: StackFrame,
    pub resume_pc: usize,
    pub first_call: bool,
}

/// The process-wide plant table.
pub struct PlantTable {
    plants: Mutex<Vec<PlantRecord>>,
    idle: Condvar,
    next_id: Mutex<u64>,
}

impl PlantTable {
    pub fn new() -> Self {
        Self {
            plants: Mutex::new(Vec::new()),
            idle: Condvar::new(),
            next_id: Mutex::new(1),
        }
    }

    fn fresh_id(&self) -> u64 {
        let mut next = self.next_id.lock().expect("plant id lock poisoned");
        let id = *next;
        *next += 1;
        id
    }

    pub fn has_free_space(&self) -> bool {
        self.plants.lock().expect("plant table lock poisoned").len() < MAX_PLANTS
    }

    /// Number of live plants.
    pub fn plant_count(&self) -> usize {
        self.plants.lock().expect("plant table lock poisoned").len()
    }

    /// The session that most recently dispatched to the plant of `block`.
    pub fn caller_of(&self, block: &Arc<MalBlock>) -> Option<u64> {
        let plants = self.plants.lock().expect("plant table lock poisoned");
        plants
            .iter()
            .find(|p| Arc::ptr_eq(&p.block, block))
            .and_then(|p| p.caller)
    }

    /// Finds or creates the plant for `block` and checks its frame out,
    /// blocking while another thread holds it. Recently used plants move
    /// to the front of the table.
    pub fn checkout(&self, block: &Arc<MalBlock>, caller: u64) -> MalResult<PlantLease> {
        let mut plants = self.plants.lock().expect("plant table lock poisoned");
        loop {
            if let Some(pos) = plants.iter().position(|p| Arc::ptr_eq(&p.block, block)) {
                if plants[pos].in_use {
                    plants = self
                        .idle
                        .wait(plants)
                        .expect("plant table lock poisoned");
                    continue;
                }
                if pos > 0 {
                    plants.swap(pos - 1, pos);
                }
                let pos = pos.saturating_sub(1);
                let p = &mut plants[pos];
                p.in_use = true;
                p.caller = Some(caller);
                let frame = p.frame.take().ok_or_else(|| {
                    MalException::new(
                        ExceptionKind::Mal,
                        "factory.call",
                        "internal error, stack frame missing",
                    )
                })?;
                return Ok(PlantLease {
                    id: p.id,
                    frame,
                    resume_pc: p.pc,
                    first_call: false,
                });
            }

            // No plant yet: drop dead records and grow a new one.
            plants.retain(|p| p.in_use || p.frame.is_some());
            if plants.len() >= MAX_PLANTS {
                return Err(MalException::new(
                    ExceptionKind::Mal,
                    "factory.new",
                    "plant table exhausted",
                ));
            }
            let id = self.fresh_id();
            let mut frame = StackFrame::prepare(block, block.vtop());
            frame.keep_alive = true;
            plants.push(PlantRecord {
                id,
                block: Arc::clone(block),
                frame: None,
                pc: 1,
                in_use: true,
                caller: Some(caller),
            });
            log::debug!("factory: new plant {id} for {}", block.qualname());
            return Ok(PlantLease {
                id,
                frame,
                resume_pc: 1,
                first_call: true,
            });
        }
    }

    /// Returns a leased frame, recording where the next call resumes.
    pub fn checkin(&self, id: u64, frame: StackFrame, resume_pc: usize) {
        let mut plants = self.plants.lock().expect("plant table lock poisoned");
        if let Some(p) = plants.iter_mut().find(|p| p.id == id) {
            p.frame = Some(frame);
            p.pc = resume_pc;
            p.in_use = false;
            p.caller = None;
        }
        self.idle.notify_all();
    }

    /// Tears a leased plant down: releases everything the frame owns and
    /// removes the record, so the next call starts a fresh plant at pc 1.
    pub fn remove(
        &self,
        id: u64,
        mut frame: StackFrame,
        block: &MalBlock,
        pool: &BufferPool,
        registry: &AtomRegistry,
    ) {
        frame.keep_alive = false;
        frame.garbage_collect(block, pool, registry, true);
        frame.clear(pool, registry);
        let mut plants = self.plants.lock().expect("plant table lock poisoned");
        plants.retain(|p| p.id != id);
        log::debug!("factory: plant {id} shut down");
        self.idle.notify_all();
    }

    /// Administrative shutdown of every idle plant whose factory carries
    /// the given function name. Returns how many were removed.
    pub fn shutdown_by_name(
        &self,
        name: &str,
        pool: &BufferPool,
        registry: &AtomRegistry,
    ) -> usize {
        let mut plants = self.plants.lock().expect("plant table lock poisoned");
        let mut removed = 0;
        plants.retain_mut(|p| {
            if p.in_use || p.block.function.as_str() != name {
                return true;
            }
            if let Some(mut frame) = p.frame.take() {
                frame.keep_alive = false;
                frame.garbage_collect(&p.block, pool, registry, true);
                frame.clear(pool, registry);
            }
            removed += 1;
            false
        });
        if removed > 0 {
            self.idle.notify_all();
        }
        removed
    }
}

impl Default for PlantTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::TYPE_INT;
    use crate::block::BlockBuilder;
    use crate::namespace::Namespace;
    use crate::types::MalType;
    use crate::value::Value;

    fn factory_block() -> Arc<MalBlock> {
        let ns = Namespace::new();
        let mut b = BlockBuilder::new_factory(ns.intern("user"), ns.intern("seq"));
        let r = b.variable("r", MalType::atom(TYPE_INT));
        b.signature(vec![r], vec![]);
        b.freeze(None).unwrap()
    }

    #[test]
    fn test_first_checkout_creates_plant() {
        let table = PlantTable::new();
        let blk = factory_block();
        let lease = table.checkout(&blk, 1).unwrap();
        assert!(lease.first_call);
        assert_eq!(lease.resume_pc, 1);
        assert_eq!(table.plant_count(), 1);
        assert_eq!(table.caller_of(&blk), Some(1));
        table.checkin(lease.id, lease.frame, 3);
    }

    #[test]
    fn test_reentry_resumes_after_yield() {
        let table = PlantTable::new();
        let blk = factory_block();
        let lease = table.checkout(&blk, 1).unwrap();
        let id = lease.id;
        let mut frame = lease.frame;
        frame.set(0, Value::Int(10));
        table.checkin(id, frame, 4);

        let lease = table.checkout(&blk, 2).unwrap();
        assert!(!lease.first_call);
        assert_eq!(lease.resume_pc, 4);
        assert_eq!(*lease.frame.get(0), Value::Int(10));
        table.checkin(lease.id, lease.frame, 4);
    }

    #[test]
    fn test_remove_recreates_on_next_call() {
        let table = PlantTable::new();
        let blk = factory_block();
        let pool = BufferPool::new();
        let reg = AtomRegistry::new();

        let lease = table.checkout(&blk, 1).unwrap();
        table.remove(lease.id, lease.frame, &blk, &pool, &reg);
        assert_eq!(table.plant_count(), 0);

        let lease = table.checkout(&blk, 1).unwrap();
        assert!(lease.first_call);
        table.checkin(lease.id, lease.frame, 1);
    }

    #[test]
    fn test_shutdown_by_name() {
        let table = PlantTable::new();
        let blk = factory_block();
        let pool = BufferPool::new();
        let reg = AtomRegistry::new();
        let lease = table.checkout(&blk, 1).unwrap();
        table.checkin(lease.id, lease.frame, 2);

        assert_eq!(table.shutdown_by_name("seq", &pool, &reg), 1);
        assert_eq!(table.plant_count(), 0);
    }
}
