//! String interning.
//!
//! A [`Symbol`] is a 4-byte handle to a string in the global table.
//! Procedure names, register names and local variable names all go
//! through here, so equality and hashing stay O(1). Interned strings are
//! leaked to obtain the `'static` lifetime; the table lives for the
//! whole process and entries are never removed.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::LazyLock;

use ahash::AHasher;
use dashmap::DashMap;

/// Global string table, initialised on first use.
static STRING_TABLE: LazyLock<StringTable> = LazyLock::new(StringTable::new);

/// An interned string identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Symbol {
    index: u32,
}

static_assertions::assert_eq_size!(Symbol, u32);

impl Symbol {
    /// Intern a string, returning its symbol. Thread-safe.
    pub fn intern(string: &str) -> Self {
        STRING_TABLE.intern(string)
    }

    /// The interned string. O(1) reverse lookup.
    pub fn as_str(self) -> &'static str {
        STRING_TABLE
            .get(self.index)
            .expect("symbol index not present in string table")
    }

    pub fn as_u32(self) -> u32 {
        self.index
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({:?})", self.as_str())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thread-safe string table.
///
/// Two lock-free maps: forward (hash of string to entry) and reverse
/// (index to string). The forward map is keyed by a 64-bit hash; on the
/// rare collision the lookup probes forward through adjacent hash
/// slots.
struct StringTable {
    forward: DashMap<u64, (&'static str, u32)>,
    reverse: DashMap<u32, &'static str>,
    next_index: AtomicU32,
}

impl StringTable {
    fn new() -> Self {
        Self {
            forward: DashMap::with_capacity(256),
            reverse: DashMap::with_capacity(256),
            next_index: AtomicU32::new(0),
        }
    }

    fn intern(&self, string: &str) -> Symbol {
        let mut hash = Self::hash_str(string);

        loop {
            if let Some(entry) = self.forward.get(&hash) {
                let (stored, index) = *entry;
                if stored == string {
                    return Symbol { index };
                }
                // Hash collision with a different string; probe the next slot.
                hash = hash.wrapping_add(1);
                continue;
            }

            let leaked: &'static str = Box::leak(string.to_owned().into_boxed_str());
            let index = self.next_index.fetch_add(1, Ordering::Relaxed);

            // Another thread may have raced us to this slot; retry if so.
            use dashmap::mapref::entry::Entry;
            match self.forward.entry(hash) {
                Entry::Vacant(slot) => {
                    slot.insert((leaked, index));
                    self.reverse.insert(index, leaked);
                    return Symbol { index };
                }
                Entry::Occupied(slot) => {
                    let (stored, existing) = *slot.get();
                    if stored == string {
                        return Symbol { index: existing };
                    }
                    hash = hash.wrapping_add(1);
                }
            }
        }
    }

    fn get(&self, index: u32) -> Option<&'static str> {
        self.reverse.get(&index).map(|entry| *entry)
    }

    fn hash_str(string: &str) -> u64 {
        let mut hasher = AHasher::default();
        string.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_string_same_symbol() {
        let a = Symbol::intern("eax");
        let b = Symbol::intern("eax");
        let c = Symbol::intern("ebx");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "eax");
    }

    #[test]
    fn concurrent_interning() {
        let handles: Vec<_> = (0..4)
            .map(|t| {
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| Symbol::intern(&format!("local{}", (t * 100 + i) % 50)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let all: Vec<Symbol> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        for sym in all {
            assert!(sym.as_str().starts_with("local"));
        }
        assert_eq!(Symbol::intern("local0"), Symbol::intern("local0"));
    }
}
