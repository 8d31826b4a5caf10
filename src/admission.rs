//! Admission control: keeps concurrent expensive instructions from
//! collectively exhausting memory.
//!
//! A process-wide pool is armed with a configured fraction of installed
//! memory. Before an expensive instruction starts, the worker deducts its
//! claim from the pool with a compare-and-swap; when the pool cannot cover
//! the claim and other work is in flight, the worker is told to delay. On
//! completion the claim is returned. A soft-fairness layer additionally
//! sleeps workers in small quanta under memory pressure, always keeping at
//! least one runnable.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::bat::BufferPool;
use crate::block::MalBlock;
use crate::instruction::Instruction;
use crate::stack::StackFrame;

/// The process-wide memory pool.
pub struct AdmissionPool {
    /// Bytes currently available.
    pool: AtomicI64,
    /// Number of claims in flight.
    claims: AtomicI64,
    /// Workers currently runnable, for the fairness layer.
    running: AtomicI64,
    capacity: i64,
    delay_quantum: Duration,
    timeslice: Duration,
}

impl AdmissionPool {
    pub fn new(capacity_bytes: u64, delay_quantum_ms: u64, timeslice_us: u64) -> Self {
        Self {
            pool: AtomicI64::new(capacity_bytes as i64),
            claims: AtomicI64::new(0),
            running: AtomicI64::new(0),
            capacity: capacity_bytes as i64,
            delay_quantum: Duration::from_millis(delay_quantum_ms),
            timeslice: Duration::from_micros(timeslice_us),
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    /// Bytes currently available. Equals the capacity whenever no
    /// instruction is in flight.
    pub fn available(&self) -> i64 {
        self.pool.load(Ordering::Acquire)
    }

    pub fn active_claims(&self) -> i64 {
        self.claims.load(Ordering::Acquire)
    }

    /// Sums the storage footprint of the instruction's table-typed
    /// arguments: primary heap, variable heap, and hash index. Views are
    /// counted as free. The estimate is clamped to the pool capacity.
    pub fn argument_claim(
        &self,
        buffers: &BufferPool,
        block: &MalBlock,
        frame: &StackFrame,
        pci: &Instruction,
    ) -> i64 {
        let _ = block;
        let mut total: i64 = 0;
        for &a in &pci.args {
            if let Some(id) = frame.get(a).as_bat() {
                if let Some(desc) = buffers.descriptor(id) {
                    if !desc.view {
                        total = total.saturating_add(desc.footprint() as i64);
                    }
                }
            }
        }
        total.min(self.capacity)
    }

    /// Attempts to start an instruction claiming `argclaim + hotclaim`
    /// bytes. Returns false when the caller should delay and retry.
    ///
    /// An instruction with no argument claim is always admitted, as is the
    /// single expensive instruction when nothing else is in flight.
    pub fn admit(&self, argclaim: i64, hotclaim: i64) -> bool {
        if argclaim <= 0 {
            return true;
        }
        let total = argclaim.saturating_add(hotclaim).min(self.capacity);
        loop {
            let current = self.pool.load(Ordering::Acquire);
            if self.claims.load(Ordering::Acquire) == 0 || current > total {
                let next = (current - total).max(0);
                match self.pool.compare_exchange(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        self.claims.fetch_add(1, Ordering::AcqRel);
                        log::trace!("admission: claimed {total} bytes, pool now {next}");
                        return true;
                    }
                    Err(_) => continue,
                }
            }
            log::debug!(
                "admission: delayed, pool {current} cannot cover claim {total} with {} in flight",
                self.claims.load(Ordering::Acquire)
            );
            return false;
        }
    }

    /// Returns a claim taken by [`AdmissionPool::admit`]. When the pool
    /// goes idle it re-arms to exactly the configured capacity.
    pub fn release(&self, argclaim: i64, hotclaim: i64) {
        if argclaim <= 0 {
            return;
        }
        let total = argclaim.saturating_add(hotclaim).min(self.capacity);
        let remaining = self.claims.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining <= 0 {
            self.claims.store(0, Ordering::Release);
            self.pool.store(self.capacity, Ordering::Release);
        } else {
            loop {
                let current = self.pool.load(Ordering::Acquire);
                let next = current.saturating_add(total).min(self.capacity);
                if self
                    .pool
                    .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }
    }

    /// Blocks until a claim is admitted, sleeping one delay quantum per
    /// attempt. Used by the sequential interpreter, which has no scheduler
    /// to hand the instruction back to.
    pub fn admit_blocking(&self, argclaim: i64, hotclaim: i64) {
        while !self.admit(argclaim, hotclaim) {
            std::thread::sleep(self.delay_quantum);
        }
    }

    /// Soft fairness: a worker that just spent `elapsed` on an instruction
    /// sleeps in small quanta while resident memory stays above the pool
    /// capacity and at least one other worker is runnable. Returns the
    /// number of quanta slept.
    pub fn fairness(&self, elapsed: Duration, resident_bytes: u64, threads: usize) -> u32 {
        if elapsed <= self.timeslice {
            return 0;
        }
        if (resident_bytes as i64) < self.capacity {
            return 0;
        }
        let threads = threads.max(1) as i64;
        let _ = self
            .running
            .compare_exchange(0, threads, Ordering::AcqRel, Ordering::Acquire);
        self.running.fetch_sub(1, Ordering::AcqRel);

        let quantum = self.delay_quantum.as_millis().max(1) as i64;
        let mut clock = elapsed.as_millis() as i64;
        let mut slept = 0u32;
        while clock > 0 && self.running.load(Ordering::Acquire) >= 2 {
            let share = (quantum * self.running.load(Ordering::Acquire)) / threads;
            if share > 0 {
                std::thread::sleep(Duration::from_millis(share as u64));
                slept += 1;
            }
            clock -= quantum;
        }
        self.running.fetch_add(1, Ordering::AcqRel);
        slept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(capacity: u64) -> AdmissionPool {
        AdmissionPool::new(capacity, 1, 2_000)
    }

    #[test]
    fn test_zero_claim_is_always_admitted() {
        let p = pool(100);
        assert!(p.admit(0, 50));
        assert_eq!(p.available(), 100);
        assert_eq!(p.active_claims(), 0);
    }

    #[test]
    fn test_single_expensive_instruction_is_admitted() {
        let p = pool(100);
        // Claim larger than the pool, but nothing else is in flight.
        assert!(p.admit(500, 0));
        assert_eq!(p.available(), 0);
        p.release(500, 0);
        assert_eq!(p.available(), 100);
    }

    #[test]
    fn test_second_claim_is_delayed() {
        let p = pool(1_000);
        assert!(p.admit(600, 0));
        assert!(!p.admit(600, 0));
        p.release(600, 0);
        assert!(p.admit(600, 0));
        p.release(600, 0);
        assert_eq!(p.available(), 1_000);
        assert_eq!(p.active_claims(), 0);
    }

    #[test]
    fn test_pool_never_negative() {
        let p = pool(100);
        assert!(p.admit(80, 40));
        assert!(p.available() >= 0);
        p.release(80, 40);
        assert_eq!(p.available(), 100);
    }

    #[test]
    fn test_fairness_skips_cheap_instructions() {
        let p = pool(100);
        assert_eq!(p.fairness(Duration::from_micros(10), u64::MAX, 4), 0);
    }

    #[test]
    fn test_fairness_skips_when_memory_is_ample() {
        let p = pool(1 << 30);
        assert_eq!(p.fairness(Duration::from_millis(50), 0, 4), 0);
    }
}
