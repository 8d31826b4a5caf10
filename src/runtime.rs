//! The process-wide VM context.
//!
//! One atom registry, one namespace, one module scope, one plant table and
//! one admission pool exist per process. They are carried by an explicit
//! context struct threaded through sessions rather than ambient globals,
//! with an initialise-once/teardown-once lifecycle.

use std::sync::{Arc, Condvar, Mutex};

use crate::admission::AdmissionPool;
use crate::atom::AtomRegistry;
use crate::bat::BufferPool;
use crate::block::MalBlock;
use crate::config::VmConfig;
use crate::factory::PlantTable;
use crate::module::{CommandFn, Implementation, PatternFn, Scope, Symbol};
use crate::namespace::{Name, Namespace};
use crate::types::MalType;

/// Bounded gate on concurrently running top-level plans.
pub struct Parallelism {
    slots: Mutex<usize>,
    freed: Condvar,
}

impl Parallelism {
    fn new(limit: usize) -> Self {
        Self {
            slots: Mutex::new(limit.max(1)),
            freed: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let mut slots = self.slots.lock().expect("parallelism lock poisoned");
        while *slots == 0 {
            slots = self.freed.wait(slots).expect("parallelism lock poisoned");
        }
        *slots -= 1;
    }

    pub fn release(&self) {
        let mut slots = self.slots.lock().expect("parallelism lock poisoned");
        *slots += 1;
        self.freed.notify_one();
    }
}

/// The interpreter's process-wide state.
pub struct MalRuntime {
    pub config: VmConfig,
    pub namespace: Namespace,
    pub atoms: AtomRegistry,
    pub scope: Scope,
    pub buffers: BufferPool,
    pub admission: AdmissionPool,
    pub plants: PlantTable,
    pub parallelism: Parallelism,
}

impl MalRuntime {
    pub fn new(config: VmConfig) -> Arc<Self> {
        let namespace = Namespace::new();
        let root = namespace.intern("root");
        let admission = AdmissionPool::new(
            config.pool_capacity(),
            config.delay_quantum_ms,
            config.timeslice_us,
        );
        let parallelism = Parallelism::new(config.max_parallel_plans);
        Arc::new(Self {
            namespace,
            atoms: AtomRegistry::new(),
            scope: Scope::new(root),
            buffers: BufferPool::new(),
            admission,
            plants: PlantTable::new(),
            parallelism,
            config,
        })
    }

    pub fn with_defaults() -> Arc<Self> {
        Self::new(VmConfig::default())
    }

    /// Interns an identifier in the process namespace.
    pub fn name(&self, s: &str) -> Name {
        self.namespace.intern(s)
    }

    /// Registers a native command under `module.fcn`.
    pub fn register_command(
        &self,
        module: &str,
        fcn: &str,
        returns: Vec<MalType>,
        args: Vec<MalType>,
        implementation: CommandFn,
    ) {
        let module = self.name(module);
        let name = self.name(fcn);
        self.scope.register(
            &module,
            Symbol {
                name,
                returns,
                args,
                variadic: false,
                implementation: Implementation::Command(implementation),
            },
        );
    }

    /// Registers a pattern under `module.fcn`.
    pub fn register_pattern(
        &self,
        module: &str,
        fcn: &str,
        returns: Vec<MalType>,
        args: Vec<MalType>,
        implementation: PatternFn,
    ) {
        let module = self.name(module);
        let name = self.name(fcn);
        self.scope.register(
            &module,
            Symbol {
                name,
                returns,
                args,
                variadic: false,
                implementation: Implementation::Pattern(implementation),
            },
        );
    }

    /// Registers a frozen block as a callable function or factory.
    pub fn register_block(&self, block: Arc<MalBlock>) {
        let sig = block.signature();
        let returns: Vec<MalType> = sig.args[..sig.retc]
            .iter()
            .map(|&a| block.var_type(a).clone())
            .collect();
        let args: Vec<MalType> = sig.args[sig.retc..]
            .iter()
            .map(|&a| block.var_type(a).clone())
            .collect();
        let implementation = if block.is_factory() {
            Implementation::Factory(Arc::clone(&block))
        } else {
            Implementation::Function(Arc::clone(&block))
        };
        let module = block.module.clone();
        self.scope.register(
            &module,
            Symbol {
                name: block.function.clone(),
                returns,
                args,
                variadic: block.variadic,
                implementation,
            },
        );
    }
}
