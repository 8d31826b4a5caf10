//! The tagged value union carried by stack slots.
//!
//! A value is one atom instance: fixed-width scalars inline, strings and
//! external atom payloads owned by the slot, table handles as plain ids
//! whose logical reference count lives in the buffer pool. Copying a value
//! never touches reference counts; the interpreter bumps table references
//! explicitly at the points the GC discipline prescribes.

use std::fmt;
use std::io::{Read, Write};

use crate::atom::{
    AtomId, AtomRegistry, TYPE_BAT, TYPE_BIT, TYPE_BTE, TYPE_DBL, TYPE_FLT, TYPE_INT, TYPE_LNG,
    TYPE_OID, TYPE_SHT, TYPE_STR, TYPE_VOID,
};
use crate::bat::BatId;
use crate::exception::{ExceptionKind, MalException, MalResult};

/// One atom instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The typed null of the given atom.
    Nil(AtomId),
    Bit(bool),
    Bte(i8),
    Sht(i16),
    Int(i32),
    Lng(i64),
    Oid(u64),
    Flt(f32),
    Dbl(f64),
    Str(String),
    /// A table handle; the logical refcount lives in the buffer pool.
    Bat(BatId),
    /// A registered external atom with an exclusively owned payload.
    Ext {
        atom: AtomId,
        payload: Option<Box<[u8]>>,
    },
}

impl Value {
    /// The atom index this value carries.
    pub fn tag(&self) -> AtomId {
        match self {
            Value::Nil(t) => *t,
            Value::Bit(_) => TYPE_BIT,
            Value::Bte(_) => TYPE_BTE,
            Value::Sht(_) => TYPE_SHT,
            Value::Int(_) => TYPE_INT,
            Value::Lng(_) => TYPE_LNG,
            Value::Oid(_) => TYPE_OID,
            Value::Flt(_) => TYPE_FLT,
            Value::Dbl(_) => TYPE_DBL,
            Value::Str(_) => TYPE_STR,
            Value::Bat(_) => TYPE_BAT,
            Value::Ext { atom, .. } => *atom,
        }
    }

    /// The typed null for an atom.
    pub fn typed_nil(atom: AtomId) -> Value {
        Value::Nil(atom)
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil(_)) || matches!(self, Value::Ext { payload: None, .. })
    }

    /// Barrier test: the region is entered unless the control value is
    /// false, nil, or a null string.
    pub fn enters_barrier(&self) -> bool {
        match self {
            Value::Bit(b) => *b,
            Value::Nil(_) => false,
            Value::Ext { payload, .. } => payload.is_some(),
            _ => true,
        }
    }

    /// Leave/redo test: the jump is taken when the control value is truthy,
    /// i.e. a true bit or any non-nil value.
    pub fn takes_jump(&self) -> bool {
        match self {
            Value::Bit(b) => *b,
            Value::Nil(_) => false,
            Value::Ext { payload, .. } => payload.is_some(),
            _ => true,
        }
    }

    /// Whether this value owns heap storage that garbage collection must
    /// release (strings and external payloads).
    pub fn owns_heap(&self) -> bool {
        matches!(self, Value::Str(_)) || matches!(self, Value::Ext { payload: Some(_), .. })
    }

    pub fn as_bat(&self) -> Option<BatId> {
        match self {
            Value::Bat(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_bit(&self) -> Option<bool> {
        match self {
            Value::Bit(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_lng(&self) -> Option<i64> {
        match self {
            Value::Lng(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Serialises the value with the atom's write capability; built-in
    /// scalars and strings use their native encodings.
    pub fn write_to(&self, registry: &AtomRegistry, out: &mut dyn Write) -> MalResult<()> {
        let io_err = |e: std::io::Error| {
            MalException::new(ExceptionKind::Io, "value.write", e.to_string())
        };
        match self {
            Value::Int(v) => out.write_all(&v.to_le_bytes()).map_err(io_err),
            Value::Lng(v) => out.write_all(&v.to_le_bytes()).map_err(io_err),
            Value::Oid(v) => out.write_all(&v.to_le_bytes()).map_err(io_err),
            Value::Str(s) => {
                let len = s.len() as u32;
                out.write_all(&len.to_le_bytes()).map_err(io_err)?;
                out.write_all(s.as_bytes()).map_err(io_err)
            }
            Value::Ext {
                atom,
                payload: Some(payload),
            } => {
                let desc = registry.descriptor(*atom).ok_or_else(|| {
                    MalException::new(ExceptionKind::Type, "value.write", "Unknown atom")
                })?;
                match desc.caps.write {
                    Some(f) => f(payload, out),
                    None => {
                        let len = payload.len() as u32;
                        out.write_all(&len.to_le_bytes()).map_err(io_err)?;
                        out.write_all(payload).map_err(io_err)
                    }
                }
            }
            other => Err(MalException::new(
                ExceptionKind::Type,
                "value.write",
                format!("Value {other} has no serialised form"),
            )),
        }
    }

    /// Reads a value of atom `tag` written by [`Value::write_to`].
    pub fn read_from(registry: &AtomRegistry, tag: AtomId, input: &mut dyn Read) -> MalResult<Value> {
        let io_err = |e: std::io::Error| {
            MalException::new(ExceptionKind::Io, "value.read", e.to_string())
        };
        match tag {
            TYPE_INT => {
                let mut buf = [0u8; 4];
                input.read_exact(&mut buf).map_err(io_err)?;
                Ok(Value::Int(i32::from_le_bytes(buf)))
            }
            TYPE_LNG => {
                let mut buf = [0u8; 8];
                input.read_exact(&mut buf).map_err(io_err)?;
                Ok(Value::Lng(i64::from_le_bytes(buf)))
            }
            TYPE_OID => {
                let mut buf = [0u8; 8];
                input.read_exact(&mut buf).map_err(io_err)?;
                Ok(Value::Oid(u64::from_le_bytes(buf)))
            }
            TYPE_STR => {
                let mut len = [0u8; 4];
                input.read_exact(&mut len).map_err(io_err)?;
                let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
                input.read_exact(&mut buf).map_err(io_err)?;
                String::from_utf8(buf)
                    .map(Value::Str)
                    .map_err(|e| MalException::new(ExceptionKind::Parse, "value.read", e.to_string()))
            }
            atom => {
                let desc = registry.descriptor(atom).ok_or_else(|| {
                    MalException::new(ExceptionKind::Type, "value.read", "Unknown atom")
                })?;
                let payload = match desc.caps.read {
                    Some(f) => f(input)?,
                    None => {
                        let mut len = [0u8; 4];
                        input.read_exact(&mut len).map_err(io_err)?;
                        let mut buf = vec![0u8; u32::from_le_bytes(len) as usize];
                        input.read_exact(&mut buf).map_err(io_err)?;
                        buf.into_boxed_slice()
                    }
                };
                Ok(Value::Ext {
                    atom,
                    payload: Some(payload),
                })
            }
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil(TYPE_VOID)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil(_) => write!(f, "nil"),
            Value::Bit(b) => write!(f, "{b}"),
            Value::Bte(v) => write!(f, "{v}"),
            Value::Sht(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Lng(v) => write!(f, "{v}"),
            Value::Oid(v) => write!(f, "{v}@0"),
            Value::Flt(v) => write!(f, "{v}"),
            Value::Dbl(v) => write!(f, "{v}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bat(id) => write!(f, "<bat {id}>"),
            Value::Ext { atom, payload } => match payload {
                Some(p) => write!(f, "<atom {atom}:{} bytes>", p.len()),
                None => write!(f, "nil"),
            },
        }
    }
}
