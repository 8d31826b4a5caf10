//! MAL type descriptors and the structural match used by overload
//! resolution.

use std::fmt;

use crate::atom::{AtomId, TYPE_BAT, TYPE_VOID};

/// Number of distinct type variables a signature may bind (`:any_1` ..).
pub const MAX_TYPE_VARS: usize = 8;

/// A declared MAL type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MalType {
    /// A concrete atom, `:int`, `:str`, ...
    Atom(AtomId),
    /// A table over an element type, `:bat[:int]`.
    Bat(Box<MalType>),
    /// The unconstrained wildcard `:any`, or an indexed variable `:any_N`
    /// that must bind consistently across a signature.
    Any(Option<u8>),
}

impl MalType {
    pub fn atom(id: AtomId) -> Self {
        MalType::Atom(id)
    }

    pub fn bat_of(elem: MalType) -> Self {
        MalType::Bat(Box::new(elem))
    }

    pub fn any() -> Self {
        MalType::Any(None)
    }

    pub fn any_var(index: u8) -> Self {
        MalType::Any(Some(index))
    }

    pub fn is_polymorphic(&self) -> bool {
        match self {
            MalType::Any(_) => true,
            MalType::Bat(elem) => elem.is_polymorphic(),
            MalType::Atom(_) => false,
        }
    }

    pub fn is_bat(&self) -> bool {
        matches!(self, MalType::Bat(_))
    }

    /// The storage atom for slot initialisation: what a typed nil of this
    /// type carries at runtime.
    pub fn storage_atom(&self) -> AtomId {
        match self {
            MalType::Atom(id) => *id,
            MalType::Bat(_) => TYPE_BAT,
            MalType::Any(_) => TYPE_VOID,
        }
    }

    /// Structural match of this formal type against a concrete actual,
    /// binding indexed type variables consistently. `bindings` must span
    /// [`MAX_TYPE_VARS`] entries and persists across the arguments of one
    /// signature.
    pub fn matches(&self, actual: &MalType, bindings: &mut [Option<MalType>]) -> bool {
        match (self, actual) {
            (MalType::Any(None), _) => true,
            (MalType::Any(Some(i)), _) => {
                let slot = &mut bindings[*i as usize % MAX_TYPE_VARS];
                match slot {
                    Some(bound) => bound == actual,
                    None => {
                        *slot = Some(actual.clone());
                        true
                    }
                }
            }
            (MalType::Atom(a), MalType::Atom(b)) => a == b,
            (MalType::Bat(fe), MalType::Bat(ae)) => fe.matches(ae, bindings),
            _ => false,
        }
    }

    /// Substitutes bound type variables, yielding the concrete type a
    /// polymorphic return position takes for a given call.
    pub fn resolve(&self, bindings: &[Option<MalType>]) -> MalType {
        match self {
            MalType::Any(Some(i)) => bindings[*i as usize % MAX_TYPE_VARS]
                .clone()
                .unwrap_or(MalType::Any(Some(*i))),
            MalType::Bat(elem) => MalType::Bat(Box::new(elem.resolve(bindings))),
            other => other.clone(),
        }
    }
}

impl fmt::Display for MalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalType::Atom(id) => write!(f, ":#{id}"),
            MalType::Bat(elem) => write!(f, ":bat[{elem}]"),
            MalType::Any(None) => write!(f, ":any"),
            MalType::Any(Some(i)) => write!(f, ":any_{i}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::{TYPE_INT, TYPE_STR};

    #[test]
    fn test_concrete_match() {
        let mut b = vec![None; MAX_TYPE_VARS];
        assert!(MalType::atom(TYPE_INT).matches(&MalType::atom(TYPE_INT), &mut b));
        assert!(!MalType::atom(TYPE_INT).matches(&MalType::atom(TYPE_STR), &mut b));
    }

    #[test]
    fn test_wildcard_matches_anything() {
        let mut b = vec![None; MAX_TYPE_VARS];
        assert!(MalType::any().matches(&MalType::atom(TYPE_STR), &mut b));
        assert!(MalType::any().matches(&MalType::bat_of(MalType::atom(TYPE_INT)), &mut b));
    }

    #[test]
    fn test_indexed_variable_binds_consistently() {
        let mut b = vec![None; MAX_TYPE_VARS];
        let formal = MalType::any_var(1);
        assert!(formal.matches(&MalType::atom(TYPE_INT), &mut b));
        assert!(formal.matches(&MalType::atom(TYPE_INT), &mut b));
        assert!(!formal.matches(&MalType::atom(TYPE_STR), &mut b));
    }

    #[test]
    fn test_bat_element_binding() {
        let mut b = vec![None; MAX_TYPE_VARS];
        let formal = MalType::bat_of(MalType::any_var(0));
        assert!(formal.matches(&MalType::bat_of(MalType::atom(TYPE_STR)), &mut b));
        // The bound element flows into a bare :any_0 return.
        assert_eq!(
            MalType::any_var(0).resolve(&b),
            MalType::atom(TYPE_STR)
        );
    }
}
