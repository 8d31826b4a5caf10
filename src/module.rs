//! Module tree and symbol resolution.
//!
//! Modules hold symbol tables bucketed by the first character of the
//! function name. Lookup starts at the requested module and walks the
//! outer chain to the root. Overload resolution first restricts by arity,
//! then checks argument types structurally, binding `:any_N` variables
//! consistently across the signature.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::block::MalBlock;
use crate::exception::{ExceptionKind, MalException, MalResult};
use crate::instruction::Instruction;
use crate::namespace::Name;
use crate::stack::StackFrame;
use crate::types::{MalType, MAX_TYPE_VARS};

/// Maximum arity a command callback accepts (returns plus arguments).
pub const MAX_COMMAND_ARGS: usize = 16;

/// A pattern callback: receives the full execution context and may
/// re-enter the interpreter.
pub type PatternFn =
    fn(&mut crate::client::Client, &Arc<MalBlock>, &mut StackFrame, &Instruction) -> MalResult<()>;

/// A command callback: reads its arguments from the frame by variable
/// index and writes its returns there. It may not re-enter the
/// interpreter; its arity is bounded by [`MAX_COMMAND_ARGS`].
pub type CommandFn = fn(&mut StackFrame, &Instruction) -> MalResult<()>;

/// A resolved implementation handle.
#[derive(Clone)]
pub enum Implementation {
    Command(CommandFn),
    Pattern(PatternFn),
    Function(Arc<MalBlock>),
    Factory(Arc<MalBlock>),
}

impl std::fmt::Debug for Implementation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Implementation::Command(_) => f.write_str("Command"),
            Implementation::Pattern(_) => f.write_str("Pattern"),
            Implementation::Function(b) => write!(f, "Function({})", b.qualname()),
            Implementation::Factory(b) => write!(f, "Factory({})", b.qualname()),
        }
    }
}

/// One overload of a function symbol.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: Name,
    pub returns: Vec<MalType>,
    pub args: Vec<MalType>,
    /// A variadic last formal absorbs any number of trailing actuals.
    pub variadic: bool,
    pub implementation: Implementation,
}

impl Symbol {
    /// Whether this overload accepts the given actual argument types.
    pub fn accepts(&self, actuals: &[MalType]) -> bool {
        if self.variadic {
            if actuals.len() + 1 < self.args.len() {
                return false;
            }
        } else if actuals.len() != self.args.len() {
            return false;
        }
        let mut bindings = vec![None; MAX_TYPE_VARS];
        for (i, actual) in actuals.iter().enumerate() {
            let formal = if i < self.args.len() {
                &self.args[i]
            } else {
                // Extra actuals re-match the variadic last formal.
                self.args.last().expect("variadic symbol has a last formal")
            };
            if !formal.matches(actual, &mut bindings) {
                return false;
            }
        }
        true
    }
}

const SYMBOL_BUCKETS: usize = 27;

fn bucket_of(name: &str) -> usize {
    match name.as_bytes().first() {
        Some(c) if c.is_ascii_alphabetic() => (c.to_ascii_lowercase() - b'a') as usize,
        _ => SYMBOL_BUCKETS - 1,
    }
}

/// A module: a named symbol table with an optional outer scope.
pub struct Module {
    pub name: Name,
    buckets: Vec<Vec<Symbol>>,
    outer: Option<Arc<Module>>,
}

impl Module {
    pub fn new(name: Name, outer: Option<Arc<Module>>) -> Self {
        Self {
            name,
            buckets: (0..SYMBOL_BUCKETS).map(|_| Vec::new()).collect(),
            outer,
        }
    }

    /// Inserts a symbol. Later insertions take precedence within a bucket.
    pub fn insert(&mut self, symbol: Symbol) {
        let b = bucket_of(symbol.name.as_str());
        self.buckets[b].insert(0, symbol);
    }

    /// All overloads of `fcn` in this module only.
    pub fn find_symbols<'a>(&'a self, fcn: &Name) -> impl Iterator<Item = &'a Symbol> + 'a {
        let fcn = fcn.clone();
        self.buckets[bucket_of(fcn.as_str())]
            .iter()
            .filter(move |s| s.name == fcn)
    }

    /// Walks this module and its outer chain for an overload matching the
    /// actual argument types.
    pub fn resolve(&self, fcn: &Name, actuals: &[MalType]) -> Option<&Symbol> {
        if let Some(s) = self.find_symbols(fcn).find(|s| s.accepts(actuals)) {
            return Some(s);
        }
        let mut scope = self.outer.as_deref();
        while let Some(m) = scope {
            if let Some(s) = m.find_symbols(fcn).find(|s| s.accepts(actuals)) {
                return Some(s);
            }
            scope = m.outer.as_deref();
        }
        None
    }

    /// Names of functions starting with `prefix`, cheap thanks to the
    /// first-character buckets.
    pub fn prefix_search(&self, prefix: &str) -> Vec<Name> {
        let mut out = Vec::new();
        for s in &self.buckets[bucket_of(prefix)] {
            if s.name.as_str().starts_with(prefix) && !out.contains(&s.name) {
                out.push(s.name.clone());
            }
        }
        out
    }
}

/// The module scope: every loaded module keyed by name, sharing one root.
pub struct Scope {
    modules: std::sync::RwLock<HashMap<Name, Arc<Module>>>,
    root: Arc<Module>,
}

impl Scope {
    pub fn new(root_name: Name) -> Self {
        let root = Arc::new(Module::new(root_name, None));
        Self {
            modules: std::sync::RwLock::new(HashMap::new()),
            root,
        }
    }

    pub fn root(&self) -> &Arc<Module> {
        &self.root
    }

    /// Finds a module, failing with a MAL exception when unresolved.
    pub fn find_module(&self, name: &Name) -> MalResult<Arc<Module>> {
        let modules = self.modules.read().expect("scope lock poisoned");
        modules.get(name).cloned().ok_or_else(|| {
            MalException::new(
                ExceptionKind::Mal,
                "scope.module",
                format!("Module '{name}' missing"),
            )
        })
    }

    /// Gets or creates a module chained to the root scope.
    pub fn fix_module(&self, name: &Name) -> Arc<Module> {
        if let Ok(m) = self.find_module(name) {
            return m;
        }
        let mut modules = self.modules.write().expect("scope lock poisoned");
        modules
            .entry(name.clone())
            .or_insert_with(|| Arc::new(Module::new(name.clone(), Some(Arc::clone(&self.root)))))
            .clone()
    }

    /// Registers a symbol under `module`, creating the module on demand.
    ///
    /// Modules are shared behind `Arc`; insertion briefly clones-on-write
    /// under the scope lock so concurrent readers keep their snapshot.
    pub fn register(&self, module: &Name, symbol: Symbol) {
        let mut modules = self.modules.write().expect("scope lock poisoned");
        let entry = modules.entry(module.clone()).or_insert_with(|| {
            Arc::new(Module::new(module.clone(), Some(Arc::clone(&self.root))))
        });
        Arc::make_mut(entry).insert(symbol);
    }

    /// Resolves `module.fcn(actuals)` to a symbol, reporting the precise
    /// missing layer.
    pub fn resolve(&self, module: &Name, fcn: &Name, actuals: &[MalType]) -> MalResult<Symbol> {
        let m = self.find_module(module)?;
        m.resolve(fcn, actuals).cloned().ok_or_else(|| {
            MalException::new(
                ExceptionKind::Mal,
                "scope.resolve",
                format!(
                    "Function '{module}.{fcn}' undefined for the given argument types"
                ),
            )
        })
    }

    /// Drops every overload of `module.fcn`.
    pub fn delete_symbol(&self, module: &Name, fcn: &Name) {
        let mut modules = self.modules.write().expect("scope lock poisoned");
        if let Some(entry) = modules.get_mut(module) {
            let m = Arc::make_mut(entry);
            for bucket in &mut m.buckets {
                bucket.retain(|s| s.name != *fcn);
            }
        }
    }

    pub fn module_names(&self) -> Vec<Name> {
        let modules = self.modules.read().expect("scope lock poisoned");
        modules.keys().cloned().collect()
    }
}

// `Arc::make_mut` copies the module on write while concurrent readers keep
// their snapshot; the outer chain stays shared.
impl Clone for Module {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            buckets: self.buckets.clone(),
            outer: self.outer.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{TYPE_INT, TYPE_STR};
    use crate::namespace::Namespace;

    fn noop_command(_: &mut StackFrame, _: &Instruction) -> MalResult<()> {
        Ok(())
    }

    fn sym(ns: &Namespace, name: &str, args: Vec<MalType>, variadic: bool) -> Symbol {
        Symbol {
            name: ns.intern(name),
            returns: vec![MalType::atom(TYPE_INT)],
            args,
            variadic,
            implementation: Implementation::Command(noop_command),
        }
    }

    #[test]
    fn test_resolution_by_arity_and_types() {
        let ns = Namespace::new();
        let scope = Scope::new(ns.intern("root"));
        let algebra = ns.intern("algebra");
        scope.register(&algebra, sym(&ns, "select", vec![MalType::atom(TYPE_INT)], false));
        scope.register(
            &algebra,
            sym(
                &ns,
                "select",
                vec![MalType::atom(TYPE_INT), MalType::atom(TYPE_STR)],
                false,
            ),
        );

        let fcn = ns.intern("select");
        let one = scope.resolve(&algebra, &fcn, &[MalType::atom(TYPE_INT)]).unwrap();
        assert_eq!(one.args.len(), 1);

        let two = scope
            .resolve(
                &algebra,
                &fcn,
                &[MalType::atom(TYPE_INT), MalType::atom(TYPE_STR)],
            )
            .unwrap();
        assert_eq!(two.args.len(), 2);

        let err = scope
            .resolve(&algebra, &fcn, &[MalType::atom(TYPE_STR)])
            .unwrap_err();
        assert!(err.text().contains("undefined"));
    }

    #[test]
    fn test_missing_module() {
        let ns = Namespace::new();
        let scope = Scope::new(ns.intern("root"));
        let err = scope
            .resolve(&ns.intern("nowhere"), &ns.intern("f"), &[])
            .unwrap_err();
        assert!(err.text().contains("missing"));
    }

    #[test]
    fn test_variadic_last_formal() {
        let ns = Namespace::new();
        let scope = Scope::new(ns.intern("root"));
        let io = ns.intern("io");
        scope.register(&io, sym(&ns, "printf", vec![MalType::atom(TYPE_STR), MalType::any()], true));

        let fcn = ns.intern("printf");
        assert!(scope
            .resolve(
                &io,
                &fcn,
                &[
                    MalType::atom(TYPE_STR),
                    MalType::atom(TYPE_INT),
                    MalType::atom(TYPE_INT),
                    MalType::atom(TYPE_STR),
                ],
            )
            .is_ok());
        // The variadic formal may also absorb zero actuals.
        assert!(scope.resolve(&io, &fcn, &[MalType::atom(TYPE_STR)]).is_ok());
    }

    #[test]
    fn test_outer_chain_reaches_root() {
        let ns = Namespace::new();
        let scope = Scope::new(ns.intern("root"));
        let m = ns.intern("m");
        scope.fix_module(&m);
        // Symbol registered in another module is not visible through m.
        let other = ns.intern("other");
        scope.register(&other, sym(&ns, "f", vec![], false));
        assert!(scope.resolve(&m, &ns.intern("f"), &[]).is_err());
    }

    #[test]
    fn test_prefix_search() {
        let ns = Namespace::new();
        let scope = Scope::new(ns.intern("root"));
        let m = ns.intern("bat");
        scope.register(&m, sym(&ns, "insert", vec![], false));
        scope.register(&m, sym(&ns, "inplace", vec![], false));
        scope.register(&m, sym(&ns, "delete", vec![], false));
        let module = scope.find_module(&m).unwrap();
        let hits = module.prefix_search("in");
        assert_eq!(hits.len(), 2);
    }
}
