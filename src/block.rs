//! MAL blocks: the frozen unit of execution.
//!
//! A block is built through [`BlockBuilder`] (`create-block`,
//! `push-instruction`, `set-jump-target`, `freeze`). Freezing establishes
//! the structured control-flow invariants: every barrier and catch is
//! paired with its exit, leave/redo instructions are wired to their
//! enclosing region, end-of-life program counters are computed for the
//! garbage-collection discipline, and calls are bound to implementations
//! through the module scope.

use std::sync::Arc;

use bitflags::bitflags;

use crate::atom::BUILTIN_ATOMS;
use crate::atom::{TYPE_BAT, TYPE_STR};
use crate::exception::{ExceptionKind, MalException, MalResult};
use crate::instruction::{Instruction, Token, NO_JUMP};
use crate::module::{Implementation, Scope, MAX_COMMAND_ARGS};
use crate::namespace::Name;
use crate::types::MalType;
use crate::value::Value;

bitflags! {
    /// Properties of a block variable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VarFlags: u8 {
        /// Holds a constant seeded into the frame at preparation.
        const CONSTANT = 1 << 0;
        /// Constant exists but must not be seeded.
        const DISABLED = 1 << 1;
        /// Owns heap or table storage; released on exit.
        const CLEANUP = 1 << 2;
        /// Pinned: never garbage collected mid-block.
        const FIXED = 1 << 3;
        /// Carries a user-defined (registered) atom type.
        const UDF_TYPE = 1 << 4;
    }
}

/// A named slot of a block.
#[derive(Debug, Clone)]
pub struct VarRecord {
    pub name: String,
    pub typ: MalType,
    pub flags: VarFlags,
    pub constant: Option<Value>,
    /// Last pc that reads this variable; computed at freeze.
    pub eol: usize,
}

impl VarRecord {
    pub fn is_constant(&self) -> bool {
        self.flags.contains(VarFlags::CONSTANT)
    }

    pub fn is_disabled(&self) -> bool {
        self.flags.contains(VarFlags::DISABLED)
    }

    pub fn needs_cleanup(&self) -> bool {
        self.flags.contains(VarFlags::CLEANUP)
    }

    pub fn is_temporary(&self) -> bool {
        self.name.starts_with("X_") || self.name.starts_with("C_")
    }
}

/// A frozen sequence of typed instructions with its variable table.
pub struct MalBlock {
    pub module: Name,
    pub function: Name,
    instructions: Vec<Instruction>,
    vars: Vec<VarRecord>,
    /// One past the last executable instruction.
    pub stop: usize,
    pub errors: bool,
    /// Widest argument vector in the block.
    pub maxarg: usize,
    /// Whether any variable requires the GC discipline.
    pub gc: bool,
    /// The last formal of the signature absorbs trailing actuals.
    pub variadic: bool,
}

impl MalBlock {
    pub fn instr(&self, pc: usize) -> &Instruction {
        &self.instructions[pc]
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// The signature instruction at pc 0.
    pub fn signature(&self) -> &Instruction {
        &self.instructions[0]
    }

    pub fn is_factory(&self) -> bool {
        self.signature().token == Token::Factory
    }

    /// Number of variables; frames are sized to at least this.
    pub fn vtop(&self) -> usize {
        self.vars.len()
    }

    pub fn var(&self, index: usize) -> &VarRecord {
        &self.vars[index]
    }

    pub fn vars(&self) -> &[VarRecord] {
        &self.vars
    }

    pub fn var_type(&self, index: usize) -> &MalType {
        &self.vars[index].typ
    }

    /// Finds a variable by name.
    pub fn find_variable(&self, name: &str) -> Option<usize> {
        self.vars.iter().position(|v| v.name == name)
    }

    pub fn qualname(&self) -> String {
        format!("{}.{}", self.module, self.function)
    }
}

impl std::fmt::Debug for MalBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} ({} vars)", self.qualname(), self.vars.len())?;
        for (pc, p) in self.instructions.iter().enumerate() {
            writeln!(f, "  [{pc}] {p:?}")?;
        }
        Ok(())
    }
}

/// In-memory construction of a block.
pub struct BlockBuilder {
    module: Name,
    function: Name,
    factory: bool,
    variadic: bool,
    vars: Vec<VarRecord>,
    instructions: Vec<Instruction>,
    temps: usize,
}

impl BlockBuilder {
    pub fn new(module: Name, function: Name) -> Self {
        Self {
            module,
            function,
            factory: false,
            variadic: false,
            vars: Vec::new(),
            instructions: Vec::new(),
            temps: 0,
        }
    }

    pub fn new_factory(module: Name, function: Name) -> Self {
        Self {
            factory: true,
            ..Self::new(module, function)
        }
    }

    /// Marks the signature's last formal as variadic.
    pub fn set_variadic(&mut self) -> &mut Self {
        self.variadic = true;
        self
    }

    /// Declares a named variable.
    pub fn variable(&mut self, name: &str, typ: MalType) -> usize {
        let index = self.vars.len();
        self.vars.push(VarRecord {
            name: name.to_string(),
            typ,
            flags: VarFlags::empty(),
            constant: None,
            eol: 0,
        });
        index
    }

    /// Declares an anonymous temporary.
    pub fn temp(&mut self, typ: MalType) -> usize {
        self.temps += 1;
        let name = format!("X_{}", self.temps);
        self.variable(&name, typ)
    }

    /// Adds a constant to the pool, returning its slot.
    pub fn constant(&mut self, value: Value) -> usize {
        self.temps += 1;
        let name = format!("C_{}", self.temps);
        let index = self.variable(&name, MalType::atom(value.tag()));
        self.vars[index].flags |= VarFlags::CONSTANT;
        self.vars[index].constant = Some(value);
        index
    }

    /// Disables seeding of a constant without removing it from the pool.
    pub fn disable(&mut self, var: usize) {
        self.vars[var].flags |= VarFlags::DISABLED;
    }

    /// Pushes the signature. Must come before any other instruction.
    pub fn signature(&mut self, rets: Vec<usize>, params: Vec<usize>) -> usize {
        let token = if self.factory {
            Token::Factory
        } else {
            Token::Function
        };
        let retc = rets.len();
        let mut args = rets;
        args.extend(params);
        let pci = Instruction {
            module: Some(self.module.clone()),
            function: Some(self.function.clone()),
            retc,
            args,
            ..Instruction::new(token)
        };
        self.push(pci)
    }

    /// Appends an instruction, returning its pc.
    pub fn push(&mut self, pci: Instruction) -> usize {
        self.instructions.push(pci);
        self.instructions.len() - 1
    }

    /// Overrides the jump target of an already-pushed instruction.
    pub fn set_jump_target(&mut self, pc: usize, target: usize) {
        self.instructions[pc].jump = target;
    }

    /// Retrieval by pc before freezing, for structural round-trips.
    pub fn instr(&self, pc: usize) -> &Instruction {
        &self.instructions[pc]
    }

    /// Freezes the block: synthesises a missing signature and trailing
    /// `end`, wires control flow, computes lifetimes and GC flags, and
    /// binds calls through `scope` when one is given.
    pub fn freeze(mut self, scope: Option<&Scope>) -> MalResult<Arc<MalBlock>> {
        if self
            .instructions
            .first()
            .map(|p| !p.token.is_signature())
            .unwrap_or(true)
        {
            let token = if self.factory {
                Token::Factory
            } else {
                Token::Function
            };
            let mut sig = Instruction::new(token);
            sig.module = Some(self.module.clone());
            sig.function = Some(self.function.clone());
            self.instructions.insert(0, sig);
        }
        if !matches!(self.instructions.last().map(|p| p.token), Some(Token::End)) {
            self.instructions.push(Instruction::new(Token::End));
        }

        self.wire_control_flow()?;
        self.compute_lifetimes();
        if let Some(scope) = scope {
            self.bind_calls(scope)?;
        }

        let maxarg = self
            .instructions
            .iter()
            .map(Instruction::argc)
            .max()
            .unwrap_or(0);
        let gc = self.vars.iter().any(VarRecord::needs_cleanup);
        let stop = self.instructions.len();
        Ok(Arc::new(MalBlock {
            module: self.module,
            function: self.function,
            instructions: self.instructions,
            vars: self.vars,
            stop,
            errors: false,
            maxarg,
            gc,
            variadic: self.variadic,
        }))
    }

    /// Pairs barriers and catches with their exits and wires leave/redo to
    /// the enclosing region with the same control variable.
    fn wire_control_flow(&mut self) -> MalResult<()> {
        // (start pc, control var, end pc) per region, innermost matched
        // first through the open stack.
        let mut regions: Vec<(usize, usize, usize)> = Vec::new();
        let mut open: Vec<(usize, usize)> = Vec::new();

        for pc in 0..self.instructions.len() {
            let (token, var) = {
                let p = &self.instructions[pc];
                (p.token, p.args.first().copied())
            };
            match token {
                Token::Barrier | Token::Catch => {
                    let var = var.ok_or_else(|| self.flow_error(pc, "control variable missing"))?;
                    open.push((pc, var));
                }
                Token::Exit => {
                    let var = var.ok_or_else(|| self.flow_error(pc, "control variable missing"))?;
                    let (start, open_var) = open
                        .pop()
                        .ok_or_else(|| self.flow_error(pc, "exit without open region"))?;
                    if open_var != var {
                        return Err(self.flow_error(pc, "exit names a different control variable"));
                    }
                    if self.instructions[start].jump == NO_JUMP {
                        self.instructions[start].jump = pc;
                    }
                    regions.push((start, var, pc));
                }
                _ => {}
            }
        }
        if let Some((pc, _)) = open.pop() {
            return Err(self.flow_error(pc, "region never exited"));
        }

        for pc in 0..self.instructions.len() {
            let (token, var, preset) = {
                let p = &self.instructions[pc];
                (p.token, p.args.first().copied(), p.jump != NO_JUMP)
            };
            if preset || !matches!(token, Token::Leave | Token::Redo) {
                continue;
            }
            let var = var.ok_or_else(|| self.flow_error(pc, "control variable missing"))?;
            let region = regions
                .iter()
                .filter(|(start, rvar, end)| *rvar == var && *start < pc && pc < *end)
                .min_by_key(|(start, _, end)| end - start)
                .copied();
            let (start, _, end) =
                region.ok_or_else(|| self.flow_error(pc, "no enclosing region for this variable"))?;
            self.instructions[pc].jump = match token {
                Token::Leave => end,
                _ => start,
            };
        }
        Ok(())
    }

    fn flow_error(&self, pc: usize, what: &str) -> MalException {
        MalException::located(
            ExceptionKind::Syntax,
            &format!("{}.{}", self.module, self.function),
            pc,
            what,
        )
    }

    /// End-of-life pcs, cleanup flags, and the per-instruction gc flag.
    fn compute_lifetimes(&mut self) {
        for var in &mut self.vars {
            let storage = var.typ.storage_atom();
            if storage == TYPE_STR || storage == TYPE_BAT || storage >= BUILTIN_ATOMS {
                var.flags |= VarFlags::CLEANUP;
            }
            if storage >= BUILTIN_ATOMS {
                var.flags |= VarFlags::UDF_TYPE;
            }
        }
        for (pc, p) in self.instructions.iter().enumerate() {
            for &a in &p.args {
                self.vars[a].eol = pc;
            }
        }
        let cleanup: Vec<bool> = self.vars.iter().map(VarRecord::needs_cleanup).collect();
        for p in &mut self.instructions {
            p.gc = p.args.iter().any(|&a| cleanup[a]);
        }
    }

    /// Resolves call instructions to implementation handles.
    fn bind_calls(&mut self, scope: &Scope) -> MalResult<()> {
        for pc in 0..self.instructions.len() {
            let p = &self.instructions[pc];
            if !p.token.is_call() || p.implementation.is_some() || p.block.is_some() {
                continue;
            }
            let (module, function) = match (&p.module, &p.function) {
                (Some(m), Some(f)) => (m.clone(), f.clone()),
                _ => {
                    return Err(self.flow_error(pc, "call without a target"));
                }
            };
            if p.token == Token::CmdCall && p.argc() > MAX_COMMAND_ARGS {
                return Err(MalException::located(
                    ExceptionKind::Type,
                    &format!("{}.{}", self.module, self.function),
                    pc,
                    "too many arguments for command call",
                ));
            }
            let actuals: Vec<MalType> = p.args[p.retc..]
                .iter()
                .map(|&a| self.vars[a].typ.clone())
                .collect();
            let symbol = scope.resolve(&module, &function, &actuals)?;
            let p = &mut self.instructions[pc];
            match &symbol.implementation {
                Implementation::Function(b) | Implementation::Factory(b) => {
                    p.block = Some(Arc::clone(b));
                }
                _ => {}
            }
            p.implementation = Some(symbol.implementation);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::TYPE_INT;
    use crate::namespace::Namespace;

    fn builder(ns: &Namespace) -> BlockBuilder {
        BlockBuilder::new(ns.intern("user"), ns.intern("main"))
    }

    #[test]
    fn test_push_then_retrieve_is_structurally_equal() {
        let ns = Namespace::new();
        let mut b = builder(&ns);
        let x = b.variable("x", MalType::atom(TYPE_INT));
        let y = b.variable("y", MalType::atom(TYPE_INT));
        let pci = Instruction::assign(vec![x], vec![y]);
        let pc = b.push(pci.clone());
        assert_eq!(*b.instr(pc), pci);
    }

    #[test]
    fn test_freeze_pairs_barrier_with_exit() {
        let ns = Namespace::new();
        let mut b = builder(&ns);
        let c = b.variable("c", MalType::atom(crate::atom::TYPE_BIT));
        let barrier = b.push(Instruction::control(Token::Barrier, c));
        let redo = b.push(Instruction::control(Token::Redo, c));
        let exit = b.push(Instruction::control(Token::Exit, c));
        let blk = b.freeze(None).unwrap();

        // The builder had no signature, so everything shifted by one.
        assert_eq!(blk.instr(barrier + 1).jump, exit + 1);
        assert_eq!(blk.instr(redo + 1).jump, barrier + 1);
        assert!(blk.instr(barrier + 1).jump > barrier + 1);
    }

    #[test]
    fn test_unbalanced_region_is_rejected() {
        let ns = Namespace::new();
        let mut b = builder(&ns);
        let c = b.variable("c", MalType::atom(crate::atom::TYPE_BIT));
        b.push(Instruction::control(Token::Barrier, c));
        let err = b.freeze(None).unwrap_err();
        assert_eq!(err.kind(), ExceptionKind::Syntax);
    }

    #[test]
    fn test_lifetimes_and_gc_flags() {
        let ns = Namespace::new();
        let mut b = builder(&ns);
        let s = b.variable("s", MalType::atom(crate::atom::TYPE_STR));
        let t = b.variable("t", MalType::atom(TYPE_INT));
        b.push(Instruction::assign(vec![t], vec![s]));
        b.push(Instruction::assign(vec![t], vec![t]));
        let blk = b.freeze(None).unwrap();

        assert!(blk.var(s).needs_cleanup());
        assert!(!blk.var(t).needs_cleanup());
        // s dies at the first assignment (pc 1 after signature insertion).
        assert_eq!(blk.var(s).eol, 1);
        assert!(blk.instr(1).gc);
        assert!(!blk.instr(2).gc);
    }

    #[test]
    fn test_constants_live_in_the_pool() {
        let ns = Namespace::new();
        let mut b = builder(&ns);
        let c = b.constant(Value::Int(42));
        let blk = b.freeze(None).unwrap();
        assert!(blk.var(c).is_constant());
        assert_eq!(blk.var(c).constant, Some(Value::Int(42)));
    }
}
