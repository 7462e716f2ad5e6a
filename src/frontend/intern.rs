use std::sync::RwLock;

use hashbrown::HashMap;
use once_cell::sync::Lazy;

/// Process wide string table. Names of symbols, record columns and object
/// members are interned once and compared by index afterwards. Strings are
/// leaked so an [`InternedSymbol`] can hand out `&'static str`.
#[derive(Debug, Default)]
struct InterningTable {
    strings: Vec<&'static str>,
    indices: HashMap<&'static str, u32>,
}

static INTERNING_TABLE: Lazy<RwLock<InterningTable>> = Lazy::new(Default::default);

impl InterningTable {
    fn get(&self, index: u32) -> Option<&'static str> {
        self.strings.get(index as usize).copied()
    }

    fn insert_if_absent(&mut self, string: &str) -> u32 {
        if let Some(index) = self.indices.get(string) {
            return *index;
        }

        let leaked: &'static str = Box::leak(string.to_owned().into_boxed_str());
        let index = self.strings.len() as u32;
        self.strings.push(leaked);
        self.indices.insert(leaked, index);
        index
    }
}

/// An index into the string interning table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InternedSymbol(u32);

impl InternedSymbol {
    pub fn new(value: &str) -> Self {
        if let Some(index) = INTERNING_TABLE
            .read()
            .unwrap()
            .indices
            .get(value)
            .copied()
        {
            return Self(index);
        }

        Self(INTERNING_TABLE.write().unwrap().insert_if_absent(value))
    }

    pub fn value(&self) -> &'static str {
        INTERNING_TABLE
            .read()
            .unwrap()
            .get(self.0)
            .expect("Once an interned symbol is created, the string it references should never be removed from the table")
    }

    /// HareScript names are case insensitive; symbol, column and member names
    /// are stored uppercased.
    pub fn uppercase(value: &str) -> Self {
        Self::new(&value.to_uppercase())
    }
}

impl core::fmt::Debug for InternedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("InternedSymbol")
            .field(&self.0)
            .field(&self.value())
            .finish()
    }
}

impl core::fmt::Display for InternedSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let a = InternedSymbol::new("__HS_SQL_GETACTION");
        let b = InternedSymbol::new("__HS_SQL_GETACTION");

        assert_eq!(a, b);
        assert_eq!(a.value(), "__HS_SQL_GETACTION");
        assert_ne!(a, InternedSymbol::new("__HS_SQL_OPENCURSOR2"));
    }

    #[test]
    fn uppercase_normalizes_names() {
        assert_eq!(InternedSymbol::uppercase("myVar"), InternedSymbol::new("MYVAR"));
    }
}
