//! Per-invocation value stacks and their garbage-collection discipline.
//!
//! Each interpreter call owns a frame with one slot per block variable.
//! Constants are seeded at preparation; all other slots start as the typed
//! null of their declared type. Releasing a slot is driven by the owning
//! atom: table handles drop a logical reference in the buffer pool,
//! external payloads run their unfix callback, strings are simply freed.

use crate::atom::{AtomRegistry, BUILTIN_ATOMS};
use crate::bat::{BatId, BufferPool};
use crate::block::MalBlock;
use crate::value::Value;

/// Growth unit for reusable global frames.
pub const STACK_INCREMENT: usize = 128;

/// Frame status byte: execution is paused until resumed.
pub const STATUS_PAUSED: u8 = b'p';
/// Frame status byte: quit was requested; the loop exits at the next
/// instruction boundary.
pub const STATUS_QUIT: u8 = b'q';
/// Debug command byte forcing the loop to break out.
pub const CMD_EXIT: u8 = b'x';

/// A sized array of value slots bound to one block invocation.
pub struct StackFrame {
    slots: Vec<Value>,
    /// Cooperative debug/cancel byte, polled between instructions.
    pub status: u8,
    /// Debug stepping mode inherited from the session.
    pub cmd: u8,
    /// Nesting depth of this call chain.
    pub call_depth: usize,
    /// Estimated committed slot count of the whole chain.
    pub stk_depth: usize,
    /// Suppresses garbage collection on function exit (factory frames,
    /// global frames).
    pub keep_alive: bool,
    /// The caller's pc at the call site.
    pub pcup: usize,
}

impl StackFrame {
    /// Allocates a frame sized for `max(size, block.vtop())` and seeds it:
    /// constants are copied unless disabled, the rest become typed nulls.
    pub fn prepare(block: &MalBlock, size: usize) -> Self {
        let n = size.max(block.vtop());
        let mut frame = Self {
            slots: Vec::with_capacity(n),
            status: 0,
            cmd: 0,
            call_depth: 0,
            stk_depth: n,
            keep_alive: false,
            pcup: 0,
        };
        frame.slots.resize(n, Value::default());
        frame.init_from(block, 0);
        frame
    }

    /// (Re)initialises slots `from..vtop` from the block's variable table.
    /// Slots below `from` are left untouched, which is what factory
    /// re-entry relies on.
    pub fn init_from(&mut self, block: &MalBlock, from: usize) {
        for i in from..block.vtop() {
            let var = block.var(i);
            self.slots[i] = if var.is_constant() && !var.is_disabled() {
                var.constant.clone().unwrap_or_default()
            } else {
                Value::typed_nil(var.typ.storage_atom())
            };
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Grows a reusable frame to hold at least `size` slots.
    pub fn ensure(&mut self, size: usize) {
        if size > self.slots.len() {
            let target = ((size / STACK_INCREMENT) + 1) * STACK_INCREMENT;
            self.slots.resize(target, Value::default());
            self.stk_depth = self.stk_depth.max(target);
        }
    }

    pub fn get(&self, index: usize) -> &Value {
        &self.slots[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Value {
        &mut self.slots[index]
    }

    pub fn set(&mut self, index: usize, value: Value) {
        self.slots[index] = value;
    }

    /// Moves the value out, leaving the typed null behind.
    pub fn take(&mut self, index: usize) -> Value {
        let tag = self.slots[index].tag();
        std::mem::replace(&mut self.slots[index], Value::Nil(tag))
    }

    /// Releases whatever the slot owns and leaves the typed null behind.
    ///
    /// Table handles drop a logical reference; external atoms run their
    /// unfix callback before the payload is freed; inline primitives are
    /// cleared.
    pub fn release_slot(&mut self, index: usize, pool: &BufferPool, registry: &AtomRegistry) {
        let tag = self.slots[index].tag();
        let old = std::mem::replace(&mut self.slots[index], Value::Nil(tag));
        release_value(old, pool, registry);
    }

    /// Garbage collection over the frame. With `full` every cleanup-flagged
    /// variable is released; otherwise only temporaries.
    pub fn garbage_collect(
        &mut self,
        block: &MalBlock,
        pool: &BufferPool,
        registry: &AtomRegistry,
        full: bool,
    ) {
        for i in 0..block.vtop().min(self.slots.len()) {
            let var = block.var(i);
            if var.needs_cleanup() && (full || var.is_temporary()) {
                self.release_slot(i, pool, registry);
            }
        }
        log::trace!(
            "gc: {} pass over {} ({} slots)",
            if full { "full" } else { "partial" },
            block.qualname(),
            block.vtop()
        );
    }

    /// Releases every owning slot; used at session teardown where the
    /// frame outlived its block bookkeeping.
    pub fn clear(&mut self, pool: &BufferPool, registry: &AtomRegistry) {
        for i in 0..self.slots.len() {
            if self.slots[i].owns_heap() || self.slots[i].as_bat().is_some() {
                self.release_slot(i, pool, registry);
            }
        }
    }

    /// Clears every slot holding the given table handle, dropping the
    /// corresponding logical references.
    pub fn release_bat(&mut self, id: BatId, pool: &BufferPool, registry: &AtomRegistry) {
        for i in 0..self.slots.len() {
            if self.slots[i].as_bat() == Some(id) {
                self.release_slot(i, pool, registry);
            }
        }
    }
}

/// Releases a detached value (a shallow backup or a taken slot).
pub fn release_value(value: Value, pool: &BufferPool, registry: &AtomRegistry) {
    match value {
        Value::Bat(id) => {
            pool.decref(id);
        }
        Value::Ext {
            atom,
            payload: Some(payload),
        } => {
            if atom >= BUILTIN_ATOMS {
                if let Some(desc) = registry.descriptor(atom) {
                    if let Some(unfix) = desc.caps.unfix {
                        // Release failures cannot be routed from here.
                        let _ = unfix(&payload);
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{TYPE_BIT, TYPE_INT, TYPE_STR};
    use crate::bat::BatDescriptor;
    use crate::block::BlockBuilder;
    use crate::instruction::Instruction;
    use crate::namespace::Namespace;
    use crate::types::MalType;

    fn block_with_vars() -> (std::sync::Arc<MalBlock>, usize, usize, usize) {
        let ns = Namespace::new();
        let mut b = BlockBuilder::new(ns.intern("user"), ns.intern("main"));
        let c = b.constant(Value::Int(7));
        let s = b.variable("s", MalType::atom(TYPE_STR));
        let t = b.variable("t", MalType::atom(TYPE_BIT));
        b.push(Instruction::assign(vec![s], vec![c]));
        (b.freeze(None).unwrap(), c, s, t)
    }

    #[test]
    fn test_prepare_seeds_constants_and_nils() {
        let (blk, c, s, t) = block_with_vars();
        let frame = StackFrame::prepare(&blk, 0);
        assert_eq!(*frame.get(c), Value::Int(7));
        assert_eq!(*frame.get(s), Value::Nil(TYPE_STR));
        assert_eq!(*frame.get(t), Value::Nil(TYPE_BIT));
    }

    #[test]
    fn test_release_slot_decrefs_bats() {
        let (blk, _, s, _) = block_with_vars();
        let pool = BufferPool::new();
        let reg = AtomRegistry::new();
        let id = pool.acquire(BatDescriptor::transient(TYPE_INT, 10, 40));

        let mut frame = StackFrame::prepare(&blk, 0);
        frame.set(s, Value::Bat(id));
        frame.release_slot(s, &pool, &reg);
        assert!(!pool.exists(id));
        assert_eq!(*frame.get(s), Value::Nil(crate::atom::TYPE_BAT));
    }

    #[test]
    fn test_full_gc_balances_refcounts() {
        let (blk, _, s, _) = block_with_vars();
        let pool = BufferPool::new();
        let reg = AtomRegistry::new();
        let id = pool.acquire(BatDescriptor::transient(TYPE_INT, 10, 40));

        let mut frame = StackFrame::prepare(&blk, 0);
        frame.set(s, Value::Bat(id));
        frame.garbage_collect(&blk, &pool, &reg, true);
        assert_eq!(pool.total_logical_refs(), 0);
    }

    #[test]
    fn test_partial_gc_spares_named_variables() {
        let ns = Namespace::new();
        let mut b = BlockBuilder::new(ns.intern("user"), ns.intern("main"));
        let named = b.variable("result", MalType::atom(TYPE_STR));
        let tmp = b.temp(MalType::atom(TYPE_STR));
        b.push(Instruction::assign(vec![tmp], vec![named]));
        let blk = b.freeze(None).unwrap();

        let pool = BufferPool::new();
        let reg = AtomRegistry::new();
        let mut frame = StackFrame::prepare(&blk, 0);
        frame.set(named, Value::Str("keep".into()));
        frame.set(tmp, Value::Str("drop".into()));

        frame.garbage_collect(&blk, &pool, &reg, false);
        assert_eq!(frame.get(named).as_str(), Some("keep"));
        assert!(frame.get(tmp).is_nil());
    }

    #[test]
    fn test_ensure_grows_in_increments() {
        let (blk, ..) = block_with_vars();
        let mut frame = StackFrame::prepare(&blk, 0);
        frame.ensure(130);
        assert!(frame.len() >= 130);
        assert_eq!(frame.len() % STACK_INCREMENT, 0);
    }
}
