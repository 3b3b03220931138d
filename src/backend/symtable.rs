//! A symbol table as a manually scoped stack of map frames.

use core::fmt::Debug;
use std::hash::Hash;

use hashbrown::HashMap;

/// A stack of scope frames, innermost first. `insert` always writes to the
/// innermost frame; lookups search outward and the first match wins.
#[derive(Debug)]
pub struct ScopedMap<K, V> {
    scopes: Vec<HashMap<K, V>>,
}

impl<K: Eq + Hash, V> ScopedMap<K, V> {
    pub fn new() -> Self {
        Self {
            scopes: vec![HashMap::new()],
        }
    }

    /// Pushes a fresh innermost frame.
    pub fn scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    /// Pops the innermost frame, dropping every symbol it holds.
    pub fn unscope(&mut self) {
        assert!(self.scopes.len() > 1, "cannot unscope the outermost frame");
        self.scopes.pop();
    }

    /// Drops every frame and starts over with a single empty one.
    pub fn clear(&mut self) {
        self.scopes.clear();
        self.scopes.push(HashMap::new());
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.scopes
            .last_mut()
            .expect("scope stack is never empty")
            .insert(key, value);
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.scopes.iter().rev().find_map(|scope| scope.get(key))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// True when the innermost frame holds the key; shadowed outer entries
    /// don't count.
    pub fn contains_in_current_scope(&self, key: &K) -> bool {
        self.scopes
            .last()
            .expect("scope stack is never empty")
            .contains_key(key)
    }
}

impl<K: Eq + Hash, V> Default for ScopedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Debug, V: Debug> core::fmt::Display for ScopedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (depth, scope) in self.scopes.iter().enumerate().rev() {
            writeln!(f, "scope {depth}:")?;
            for (key, value) in scope {
                writeln!(f, "  {key:?} -> {value:?}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_scopes_shadow_outer() {
        let mut table: ScopedMap<&str, i32> = ScopedMap::new();
        table.insert("x", 1);
        table.scope();
        table.insert("x", 2);
        assert_eq!(table.get(&"x"), Some(&2));
        table.unscope();
        assert_eq!(table.get(&"x"), Some(&1));
    }

    #[test]
    fn unscope_drops_inner_symbols() {
        let mut table: ScopedMap<&str, i32> = ScopedMap::new();
        table.scope();
        table.insert("i", 0);
        assert!(table.contains(&"i"));
        table.unscope();
        assert!(!table.contains(&"i"));
    }

    #[test]
    fn outer_symbols_visible_from_inner_scope() {
        let mut table: ScopedMap<&str, i32> = ScopedMap::new();
        table.insert("a", 7);
        table.scope();
        assert_eq!(table.get(&"a"), Some(&7));
        assert!(!table.contains_in_current_scope(&"a"));
    }

    #[test]
    fn clear_resets_to_one_empty_frame() {
        let mut table: ScopedMap<&str, i32> = ScopedMap::new();
        table.scope();
        table.insert("a", 1);
        table.clear();
        assert!(!table.contains(&"a"));
        table.insert("b", 2);
        assert_eq!(table.get(&"b"), Some(&2));
    }
}
