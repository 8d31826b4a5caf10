//! Process and session configuration.

use bitflags::bitflags;

bitflags! {
    /// Per-session debug/trace bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct DebugFlags: u8 {
        /// Log every dispatched instruction.
        const TRACE = 1 << 0;
        /// Stop at each instruction boundary (cooperative stepping).
        const STEP = 1 << 1;
    }
}

/// The enumerated runtime options.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub struct VmConfig {
    /// Abort with StackOverflow when a call chain exceeds this depth.
    pub max_call_depth: usize,
    /// Committed-slot estimate across a call chain above which the frame
    /// preparation aborts with StackOverflow.
    pub max_stack_slots: usize,
    /// Fraction of `memory_bytes` the admission pool represents.
    pub memory_threshold: f64,
    /// Installed memory the admission controller budgets against.
    pub memory_bytes: u64,
    /// Unit of the fairness sleep, in milliseconds.
    pub delay_quantum_ms: u64,
    /// Instructions cheaper than this skip the fairness layer, in
    /// microseconds.
    pub timeslice_us: u64,
    /// Per-session hard deadline for a top-level call, in milliseconds.
    pub query_timeout_ms: Option<u64>,
    /// Bound on concurrently running top-level plans.
    pub max_parallel_plans: usize,
    #[cfg_attr(feature = "serde-types", serde(skip))]
    pub debug: DebugFlags,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            max_stack_slots: 1 << 20,
            memory_threshold: 0.8,
            memory_bytes: 8 << 30,
            delay_quantum_ms: 5,
            timeslice_us: 2_000,
            query_timeout_ms: None,
            max_parallel_plans: 8,
            debug: DebugFlags::empty(),
        }
    }
}

impl VmConfig {
    /// The admission pool capacity in bytes.
    pub fn pool_capacity(&self) -> u64 {
        (self.memory_bytes as f64 * self.memory_threshold) as u64
    }

    /// Pretty-printed option dump for diagnostics.
    #[cfg(feature = "serde-types")]
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}
