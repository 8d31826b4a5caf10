//! Instruction representation.
//!
//! An instruction is a token class, an optional `module.function` target,
//! and an argument vector of variable indices whose first `retc` entries
//! are the return positions. Control-flow tokens carry the jump target
//! established when the owning block is frozen.

use std::fmt;
use std::sync::Arc;

use crate::block::MalBlock;
use crate::module::Implementation;
use crate::namespace::Name;

/// Token classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub enum Token {
    /// Copy right-hand values to the left-hand slots.
    Assign,
    /// Call a native command through slot references.
    CmdCall,
    /// Call a pattern with the full execution context.
    PatCall,
    /// Call a user-defined function block.
    FcnCall,
    /// Dispatch to a factory plant.
    FacCall,
    Barrier,
    Catch,
    Leave,
    Redo,
    Exit,
    Return,
    Yield,
    Raise,
    End,
    Noop,
    /// A remark; no effect.
    Rem,
    /// Signature of a user-defined function (pc 0 of its block).
    Function,
    /// Signature of a factory (pc 0 of its block).
    Factory,
}

impl Token {
    /// Tokens that open or steer a structured control-flow region.
    pub fn is_control(self) -> bool {
        matches!(
            self,
            Token::Barrier
                | Token::Catch
                | Token::Leave
                | Token::Redo
                | Token::Exit
                | Token::Raise
                | Token::Yield
                | Token::Return
        )
    }

    pub fn is_call(self) -> bool {
        matches!(
            self,
            Token::CmdCall | Token::PatCall | Token::FcnCall | Token::FacCall
        )
    }

    pub fn is_signature(self) -> bool {
        matches!(self, Token::Function | Token::Factory)
    }
}

/// No jump target assigned.
pub const NO_JUMP: usize = usize::MAX;

/// One instruction of a MAL block.
#[derive(Clone)]
pub struct Instruction {
    pub token: Token,
    pub module: Option<Name>,
    pub function: Option<Name>,
    /// Number of return positions; `args[..retc]` are outputs, the rest
    /// inputs.
    pub retc: usize,
    pub args: Vec<usize>,
    /// For control-flow tokens: the pc of the matching exit (barrier,
    /// catch, leave) or of the matching barrier (redo).
    pub jump: usize,
    /// Bound after resolution.
    pub implementation: Option<Implementation>,
    /// Nested block for function and factory calls.
    pub block: Option<Arc<MalBlock>>,
    /// Whether the GC discipline applies to this instruction's arguments.
    pub gc: bool,
    /// Index into the profiler's event table; -1 when unprofiled.
    pub profiler_index: i32,
}

impl Instruction {
    pub fn new(token: Token) -> Self {
        Self {
            token,
            module: None,
            function: None,
            retc: 0,
            args: Vec::new(),
            jump: NO_JUMP,
            implementation: None,
            block: None,
            gc: false,
            profiler_index: -1,
        }
    }

    /// An assignment `lhs... := rhs...`.
    pub fn assign(lhs: Vec<usize>, rhs: Vec<usize>) -> Self {
        let retc = lhs.len();
        let mut args = lhs;
        args.extend(rhs);
        Self {
            retc,
            args,
            ..Self::new(Token::Assign)
        }
    }

    /// A call `rets := module.function(args)` of the given token class.
    pub fn call(
        token: Token,
        module: Name,
        function: Name,
        rets: Vec<usize>,
        mut inputs: Vec<usize>,
    ) -> Self {
        let retc = rets.len();
        let mut args = rets;
        args.append(&mut inputs);
        Self {
            module: Some(module),
            function: Some(function),
            retc,
            args,
            ..Self::new(token)
        }
    }

    /// A control-flow instruction steered by `var`.
    pub fn control(token: Token, var: usize) -> Self {
        Self {
            retc: 1,
            args: vec![var],
            ..Self::new(token)
        }
    }

    pub fn argc(&self) -> usize {
        self.args.len()
    }

    /// The i-th argument's variable index.
    pub fn arg(&self, i: usize) -> usize {
        self.args[i]
    }

    /// The control/destination variable of a control-flow instruction.
    pub fn dest_var(&self) -> usize {
        self.args[0]
    }

    /// Whether variable `var` appears among arguments `start..`.
    pub fn uses_from(&self, start: usize, var: usize) -> bool {
        self.args[start.min(self.args.len())..].contains(&var)
    }
}

// Structural equality: the resolved handles are identity, not structure.
impl PartialEq for Instruction {
    fn eq(&self, other: &Self) -> bool {
        self.token == other.token
            && self.module == other.module
            && self.function == other.function
            && self.retc == other.retc
            && self.args == other.args
            && self.jump == other.jump
    }
}

impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.token)?;
        if let (Some(m), Some(fcn)) = (&self.module, &self.function) {
            write!(f, " {m}.{fcn}")?;
        }
        write!(f, " rets={:?}", &self.args[..self.retc])?;
        write!(f, " args={:?}", &self.args[self.retc..])?;
        if self.jump != NO_JUMP {
            write!(f, " jump={}", self.jump)?;
        }
        Ok(())
    }
}
