//! Atom registry: user-defined value types and their kernel callbacks.
//!
//! The registry is a process-wide, append-only table of atom descriptors
//! keyed by a stable index. Built-in atoms occupy the low indices; module
//! load may register further atoms and attach capability callbacks to them.
//! Descriptors are never destroyed while the process lives.

use std::cmp::Ordering;
use std::io::{Read, Write};
use std::sync::RwLock;

use xxhash_rust::xxh3::xxh3_64;

use crate::exception::{ExceptionKind, MalException, MalResult};
use crate::namespace::MAX_IDENT_LEN;

/// Stable index of a registered atom.
pub type AtomId = usize;

pub const TYPE_VOID: AtomId = 0;
pub const TYPE_BIT: AtomId = 1;
pub const TYPE_BTE: AtomId = 2;
pub const TYPE_SHT: AtomId = 3;
pub const TYPE_INT: AtomId = 4;
pub const TYPE_LNG: AtomId = 5;
pub const TYPE_OID: AtomId = 6;
pub const TYPE_FLT: AtomId = 7;
pub const TYPE_DBL: AtomId = 8;
pub const TYPE_STR: AtomId = 9;
pub const TYPE_BAT: AtomId = 10;

/// Number of built-in atoms.
pub const BUILTIN_ATOMS: usize = 11;

/// Hard bound on the atom table.
pub const MAX_ATOMS: usize = 128;

/// Size of the indirection token stored for variable-sized atoms.
pub const VAR_TOKEN_SIZE: usize = std::mem::size_of::<u32>();

pub type CmpFn = fn(&[u8], &[u8]) -> Ordering;
pub type HashFn = fn(&[u8]) -> u64;
pub type ConvertFn = fn(&mut [u8]);
pub type FromStrFn = fn(&str) -> MalResult<Box<[u8]>>;
pub type ToStrFn = fn(&[u8]) -> String;
pub type NullFn = fn() -> Box<[u8]>;
pub type FixFn = fn(&[u8]) -> MalResult<()>;
pub type LengthFn = fn(&[u8]) -> usize;
pub type ReadFn = fn(&mut dyn Read) -> MalResult<Box<[u8]>>;
pub type WriteFn = fn(&[u8], &mut dyn Write) -> MalResult<()>;
pub type HeapFn = fn(usize) -> MalResult<()>;

/// The capability kinds an atom may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde-types", derive(serde::Serialize, serde::Deserialize))]
pub enum CapabilityKind {
    Cmp,
    Nequal,
    Convert,
    FromStr,
    ToStr,
    Null,
    Fix,
    Unfix,
    Put,
    Del,
    Heap,
    HeapConvert,
    HeapCheck,
    Read,
    Write,
    Length,
    Hash,
}

/// Optional callbacks attached to an atom. Absent entries fall back to
/// defaults tied to the storage class.
#[derive(Default, Clone)]
pub struct AtomCapabilities {
    pub cmp: Option<CmpFn>,
    pub convert: Option<ConvertFn>,
    pub from_str: Option<FromStrFn>,
    pub to_str: Option<ToStrFn>,
    pub fix: Option<FixFn>,
    pub unfix: Option<FixFn>,
    pub put: Option<FixFn>,
    pub del: Option<FixFn>,
    pub heap: Option<HeapFn>,
    pub heap_convert: Option<ConvertFn>,
    pub heap_check: Option<FixFn>,
    pub read: Option<ReadFn>,
    pub write: Option<WriteFn>,
    pub length: Option<LengthFn>,
    pub hash: Option<HashFn>,
}

/// One registered atom.
#[derive(Clone)]
pub struct AtomDescriptor {
    pub id: AtomId,
    pub name: String,
    /// Storage class: the built-in atom whose layout this one shares.
    pub storage: AtomId,
    /// Fixed payload size in bytes; [`VAR_TOKEN_SIZE`] once varsized.
    pub size: usize,
    pub align: usize,
    /// Whether values are linearly ordered (implied by a compare callback).
    pub linear: bool,
    pub varsized: bool,
    /// Canonical null payload, produced once at registration.
    pub null_value: Option<Box<[u8]>>,
    pub caps: AtomCapabilities,
}

impl AtomDescriptor {
    fn builtin(id: AtomId, name: &str, size: usize, linear: bool, varsized: bool) -> Self {
        Self {
            id,
            name: name.to_string(),
            storage: id,
            size,
            align: size.max(1),
            linear,
            varsized,
            null_value: None,
            caps: AtomCapabilities::default(),
        }
    }
}

/// The process-wide atom table.
pub struct AtomRegistry {
    atoms: RwLock<Vec<AtomDescriptor>>,
}

impl AtomRegistry {
    /// Creates a registry seeded with the built-in atoms.
    pub fn new() -> Self {
        let atoms = vec![
            AtomDescriptor::builtin(TYPE_VOID, "void", 0, false, false),
            AtomDescriptor::builtin(TYPE_BIT, "bit", 1, true, false),
            AtomDescriptor::builtin(TYPE_BTE, "bte", 1, true, false),
            AtomDescriptor::builtin(TYPE_SHT, "sht", 2, true, false),
            AtomDescriptor::builtin(TYPE_INT, "int", 4, true, false),
            AtomDescriptor::builtin(TYPE_LNG, "lng", 8, true, false),
            AtomDescriptor::builtin(TYPE_OID, "oid", 8, true, false),
            AtomDescriptor::builtin(TYPE_FLT, "flt", 4, true, false),
            AtomDescriptor::builtin(TYPE_DBL, "dbl", 8, true, false),
            AtomDescriptor::builtin(TYPE_STR, "str", VAR_TOKEN_SIZE, true, true),
            AtomDescriptor::builtin(TYPE_BAT, "bat", std::mem::size_of::<u64>(), false, false),
        ];
        Self {
            atoms: RwLock::new(atoms),
        }
    }

    /// Registers a new atom derived from `inherit`. Returns its index.
    ///
    /// Fails with a Type exception on redefinition, on an unknown base, or
    /// when the name exceeds the identifier bound.
    pub fn register_atom(&self, name: &str, inherit: AtomId) -> MalResult<AtomId> {
        if name.len() >= MAX_IDENT_LEN {
            return Err(MalException::new(
                ExceptionKind::Syntax,
                "atom.define",
                format!("Atom name '{name}' too long"),
            ));
        }
        let mut atoms = self.atoms.write().expect("atom registry lock poisoned");
        if atoms.iter().any(|a| a.name == name) {
            return Err(MalException::new(
                ExceptionKind::Type,
                "atom.define",
                format!("Redefinition of atom '{name}'"),
            ));
        }
        if inherit >= atoms.len() {
            return Err(MalException::new(
                ExceptionKind::Type,
                "atom.define",
                format!("Undefined atom inheritance '{name}'"),
            ));
        }
        if atoms.len() >= MAX_ATOMS {
            return Err(MalException::new(
                ExceptionKind::Loader,
                "atom.define",
                "Atom table exhausted",
            ));
        }
        let id = atoms.len();
        let mut desc = atoms[inherit].clone();
        desc.id = id;
        desc.name = name.to_string();
        desc.storage = if inherit == TYPE_VOID { id } else { atoms[inherit].storage };
        atoms.push(desc);
        Ok(id)
    }

    /// Registers a fixed-size atom. The size must be a power of two so
    /// element addressing can use shift arithmetic.
    pub fn register_fixed(&self, name: &str, size: usize, align: usize) -> MalResult<AtomId> {
        if size == 0 || !size.is_power_of_two() {
            return Err(MalException::new(
                ExceptionKind::Type,
                "atom.define",
                format!("Atom '{name}' size {size} is not a power of two"),
            ));
        }
        let id = self.register_atom(name, TYPE_BTE)?;
        let mut atoms = self.atoms.write().expect("atom registry lock poisoned");
        let desc = &mut atoms[id];
        desc.storage = id;
        desc.size = size;
        desc.align = align;
        desc.linear = false;
        Ok(id)
    }

    /// Attaches a capability callback. Attachment is idempotent for a given
    /// (atom, kind); the most recent callback wins.
    pub fn attach_capability(
        &self,
        id: AtomId,
        kind: CapabilityKind,
        cap: Capability,
    ) -> MalResult<()> {
        let mut atoms = self.atoms.write().expect("atom registry lock poisoned");
        let desc = atoms.get_mut(id).ok_or_else(|| {
            MalException::new(ExceptionKind::Type, "atom.property", "Unknown atom index")
        })?;
        match (kind, cap) {
            (CapabilityKind::Cmp, Capability::Cmp(f)) | (CapabilityKind::Nequal, Capability::Cmp(f)) => {
                desc.caps.cmp = Some(f);
                // Ordering is only meaningful once values can be compared.
                desc.linear = true;
            }
            (CapabilityKind::Convert, Capability::Convert(f)) => desc.caps.convert = Some(f),
            (CapabilityKind::FromStr, Capability::FromStr(f)) => desc.caps.from_str = Some(f),
            (CapabilityKind::ToStr, Capability::ToStr(f)) => desc.caps.to_str = Some(f),
            (CapabilityKind::Null, Capability::Null(f)) => desc.null_value = Some(f()),
            (CapabilityKind::Fix, Capability::Fix(f)) => desc.caps.fix = Some(f),
            (CapabilityKind::Unfix, Capability::Fix(f)) => desc.caps.unfix = Some(f),
            (CapabilityKind::Put, Capability::Fix(f)) => desc.caps.put = Some(f),
            (CapabilityKind::Del, Capability::Fix(f)) => desc.caps.del = Some(f),
            (CapabilityKind::Heap, Capability::Heap(f)) => {
                // A heap capability makes the atom variable-sized; the slot
                // then stores an indirection token.
                desc.caps.heap = Some(f);
                desc.varsized = true;
                desc.size = VAR_TOKEN_SIZE;
                desc.align = VAR_TOKEN_SIZE;
            }
            (CapabilityKind::HeapConvert, Capability::Convert(f)) => desc.caps.heap_convert = Some(f),
            (CapabilityKind::HeapCheck, Capability::Fix(f)) => desc.caps.heap_check = Some(f),
            (CapabilityKind::Read, Capability::Read(f)) => desc.caps.read = Some(f),
            (CapabilityKind::Write, Capability::Write(f)) => desc.caps.write = Some(f),
            (CapabilityKind::Length, Capability::Length(f)) => desc.caps.length = Some(f),
            (CapabilityKind::Hash, Capability::Hash(f)) => desc.caps.hash = Some(f),
            _ => {
                return Err(MalException::new(
                    ExceptionKind::Type,
                    "atom.property",
                    format!("Callback does not fit capability {kind:?}"),
                ))
            }
        }
        Ok(())
    }

    /// Resolves an atom name to its index.
    pub fn lookup(&self, name: &str) -> Option<AtomId> {
        self.atoms
            .read()
            .expect("atom registry lock poisoned")
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.id)
    }

    /// Copies out the descriptor for `id`.
    pub fn descriptor(&self, id: AtomId) -> Option<AtomDescriptor> {
        self.atoms
            .read()
            .expect("atom registry lock poisoned")
            .get(id)
            .cloned()
    }

    pub fn name(&self, id: AtomId) -> Option<String> {
        self.atoms
            .read()
            .expect("atom registry lock poisoned")
            .get(id)
            .map(|a| a.name.clone())
    }

    pub fn is_varsized(&self, id: AtomId) -> bool {
        self.atoms
            .read()
            .expect("atom registry lock poisoned")
            .get(id)
            .map(|a| a.varsized)
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.atoms.read().expect("atom registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compares two external payloads of the given atom: the attached
    /// compare when present, bytewise otherwise.
    pub fn compare(&self, id: AtomId, a: &[u8], b: &[u8]) -> Ordering {
        let cmp = self
            .atoms
            .read()
            .expect("atom registry lock poisoned")
            .get(id)
            .and_then(|d| d.caps.cmp);
        match cmp {
            Some(f) => f(a, b),
            None => a.cmp(b),
        }
    }

    /// Hashes an external payload: the attached hash when present, xxh3
    /// otherwise.
    pub fn hash_payload(&self, id: AtomId, payload: &[u8]) -> u64 {
        let hash = self
            .atoms
            .read()
            .expect("atom registry lock poisoned")
            .get(id)
            .and_then(|d| d.caps.hash);
        match hash {
            Some(f) => f(payload),
            None => xxh3_64(payload),
        }
    }

    /// The canonical null payload for `id`, when one was registered.
    pub fn null_payload(&self, id: AtomId) -> Option<Box<[u8]>> {
        self.atoms
            .read()
            .expect("atom registry lock poisoned")
            .get(id)
            .and_then(|d| d.null_value.clone())
    }

    /// Writes the comma-separated atom listing, mirroring the diagnostic
    /// output of the kernel.
    pub fn show_atoms(&self, out: &mut dyn Write) -> std::io::Result<()> {
        let atoms = self.atoms.read().expect("atom registry lock poisoned");
        let names: Vec<&str> = atoms.iter().map(|a| a.name.as_str()).collect();
        writeln!(out, "{}", names.join(","))
    }
}

impl Default for AtomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// A capability callback, tagged by shape.
#[derive(Clone, Copy)]
pub enum Capability {
    Cmp(CmpFn),
    Convert(ConvertFn),
    FromStr(FromStrFn),
    ToStr(ToStrFn),
    Null(NullFn),
    Fix(FixFn),
    Heap(HeapFn),
    Read(ReadFn),
    Write(WriteFn),
    Length(LengthFn),
    Hash(HashFn),
}
