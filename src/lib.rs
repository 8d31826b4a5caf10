//! # MAL Abstract Machine
//!
//! A stack-based bytecode interpreter for typed MAL dataflow programs over
//! a column-store buffer pool. This crate provides the instruction
//! interpreter, the structured control-flow model (barrier / catch / leave
//! / redo / exit / yield / raise), the per-invocation value stack with its
//! garbage-collection discipline, the atom (user-defined type) registry,
//! the module/symbol namespace, the factory (co-routine) plant, the
//! exception taxonomy, and the admission controller that throttles
//! parallel plan execution under memory pressure.
//!
//! ## Architecture
//!
//! - **Interpreter**: fetch/decode/dispatch over a frozen block, driving
//!   native callbacks, recursive calls and factory dispatch.
//! - **MalBlock / BlockBuilder**: the in-memory program model; freezing
//!   wires structured jumps and variable lifetimes.
//! - **StackFrame**: one value slot per block variable, garbage collected
//!   on every exit path.
//! - **AtomRegistry**: append-only table of value types with optional
//!   capability callbacks.
//! - **Scope / Module**: interned names and overload resolution.
//! - **PlantTable**: persistent co-routine frames resumed after `yield`.
//! - **AdmissionPool**: memory-claim accounting that delays expensive
//!   instructions.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mal_vm::{BlockBuilder, Client, Instruction, MalRuntime, Token, Value};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = MalRuntime::with_defaults();
//! let mut client = Client::new(runtime.clone());
//!
//! // r := "ok"; end;
//! let mut b = BlockBuilder::new(runtime.name("user"), runtime.name("main"));
//! let r = b.variable("r", mal_vm::MalType::atom(mal_vm::atom::TYPE_STR));
//! let c = b.constant(Value::Str("ok".into()));
//! b.push(Instruction::assign(vec![r], vec![c]));
//! let block = b.freeze(Some(&runtime.scope))?;
//!
//! client.run(&block)?;
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

/// Admission controller and fairness layer.
pub mod admission;
/// Atom registry and capability tables.
pub mod atom;
/// Buffer-pool handle API (table handles, reference counts).
pub mod bat;
/// MAL blocks, variable tables and the block builder.
pub mod block;
/// Client sessions and the top-level call surface.
pub mod client;
/// Runtime options.
pub mod config;
/// Exception taxonomy and formatting.
pub mod exception;
/// Factory plants (persistent co-routine frames).
pub mod factory;
/// Instruction representation.
pub mod instruction;
/// The interpreter loop.
pub mod interpreter;
/// Module tree and symbol resolution.
pub mod module;
/// Identifier interning.
pub mod namespace;
/// Per-invocation value stacks and garbage collection.
pub mod stack;
/// MAL type descriptors.
pub mod types;
/// The tagged value union.
pub mod value;
/// The process-wide runtime context.
pub mod runtime;

pub use admission::AdmissionPool;
pub use atom::{AtomDescriptor, AtomId, AtomRegistry, Capability, CapabilityKind};
pub use bat::{BatDescriptor, BatId, BufferPool};
pub use block::{BlockBuilder, MalBlock, VarFlags, VarRecord};
pub use client::{Client, ClientMode, SessionStatus};
pub use config::{DebugFlags, VmConfig};
pub use exception::{ExceptionKind, MalException, MalResult};
pub use factory::PlantTable;
pub use instruction::{Instruction, Token};
pub use interpreter::{call_mal, reenter_mal, run_mal, Flow};
pub use module::{CommandFn, Implementation, Module, PatternFn, Scope, Symbol};
pub use namespace::{Name, Namespace};
pub use runtime::MalRuntime;
pub use stack::StackFrame;
pub use types::MalType;
pub use value::Value;
