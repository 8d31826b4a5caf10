//! Identifier interning.
//!
//! Module and function identifiers are interned once and compared by
//! pointer afterwards, which makes symbol resolution and overload matching
//! cheap. The table is append-only: insertion takes the namespace lock,
//! lookups are plain shared reads.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};

use xxhash_rust::xxh3::xxh3_64;

/// Upper bound on identifier length; longer names are truncated on intern.
pub const MAX_IDENT_LEN: usize = 64;

const BUCKETS: usize = 4096;

/// An interned identifier. Equality and hashing are by pointer.
#[derive(Clone)]
pub struct Name(Arc<str>);

impl Name {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Name {}

impl Hash for Name {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as *const u8 as usize).hash(state);
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", &self.0)
    }
}

impl std::ops::Deref for Name {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

/// The process-wide identifier table.
pub struct Namespace {
    buckets: Vec<RwLock<Vec<Arc<str>>>>,
}

impl Namespace {
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| RwLock::new(Vec::new())).collect(),
        }
    }

    fn bucket_of(&self, name: &str) -> usize {
        (xxh3_64(name.as_bytes()) as usize) & (BUCKETS - 1)
    }

    /// Looks up an identifier without inserting it.
    pub fn find(&self, name: &str) -> Option<Name> {
        if name.is_empty() {
            return None;
        }
        let name = clip(name);
        let bucket = self.buckets[self.bucket_of(name)]
            .read()
            .expect("namespace lock poisoned");
        bucket
            .iter()
            .find(|n| n.as_ref() == name)
            .map(|n| Name(Arc::clone(n)))
    }

    /// Interns an identifier, returning the canonical pointer-equal handle.
    /// Names longer than [`MAX_IDENT_LEN`] are clipped first.
    pub fn intern(&self, name: &str) -> Name {
        let name = clip(name);
        if let Some(found) = self.find(name) {
            return found;
        }
        let mut bucket = self.buckets[self.bucket_of(name)]
            .write()
            .expect("namespace lock poisoned");
        // A racing intern may have inserted the name between the read and
        // the write lock.
        if let Some(n) = bucket.iter().find(|n| n.as_ref() == name) {
            return Name(Arc::clone(n));
        }
        let entry: Arc<str> = Arc::from(name);
        bucket.push(Arc::clone(&entry));
        Name(entry)
    }

    /// Total number of interned identifiers.
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.read().expect("namespace lock poisoned").len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

fn clip(name: &str) -> &str {
    if name.len() < MAX_IDENT_LEN {
        name
    } else {
        let mut end = MAX_IDENT_LEN - 1;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        &name[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_pointer_equal() {
        let ns = Namespace::new();
        let a = ns.intern("algebra");
        let b = ns.intern("algebra");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "algebra");
    }

    #[test]
    fn test_distinct_names_differ() {
        let ns = Namespace::new();
        let a = ns.intern("select");
        let b = ns.intern("project");
        assert_ne!(a, b);
    }

    #[test]
    fn test_find_does_not_insert() {
        let ns = Namespace::new();
        assert!(ns.find("missing").is_none());
        assert_eq!(ns.len(), 0);
        ns.intern("present");
        assert!(ns.find("present").is_some());
        assert_eq!(ns.len(), 1);
    }

    #[test]
    fn test_long_names_are_clipped() {
        let ns = Namespace::new();
        let long = "x".repeat(200);
        let n = ns.intern(&long);
        assert_eq!(n.as_str().len(), MAX_IDENT_LEN - 1);
        // The clipped spelling resolves to the same handle.
        assert_eq!(ns.intern(&long), n);
    }
}
