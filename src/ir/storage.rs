//! Tensor storage descriptors.
//!
//! Every tensor-typed variable used in a function body owns exactly one
//! [`TensorStorage`], registered in the function's [`Storage`] table before
//! code generation begins. The backend merges the tables of every function
//! in a call tree into one session-wide table, so lookups resolve regardless
//! of which function declared the variable. Lookups are by [`Var`] value
//! (name + type), never by reference.

use hashbrown::HashMap;

use crate::ir::{Expr, Var};

/// The physical layout of a tensor's backing buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorStorage {
    /// No storage has been assigned yet. Reaching the backend with this
    /// kind is a compiler bug.
    Undefined,
    /// Dense row-major order.
    DenseRowMajor,
    /// A system tensor stored sparsely: the `target_set`'s neighbor index
    /// determines the nonzero count, and the tensor holds one block per
    /// neighbor pair of the `storage_set`.
    SystemReduced { target_set: Expr, storage_set: Expr },
    /// A system tensor holding one block per element of its (square) outer
    /// dimension.
    SystemDiagonal,
    /// A system tensor that is never materialized; uses of it must have
    /// been fused away before code generation.
    SystemNone,
}

impl TensorStorage {
    /// True when the tensor's backing buffer must be heap-allocated before
    /// execution. Dense row-major locals are frame-allocated instead and
    /// need no global buffer.
    pub fn needs_initialization(&self) -> bool {
        matches!(
            self,
            TensorStorage::SystemReduced { .. } | TensorStorage::SystemDiagonal
        )
    }

    pub fn is_system(&self) -> bool {
        matches!(
            self,
            TensorStorage::SystemReduced { .. }
                | TensorStorage::SystemDiagonal
                | TensorStorage::SystemNone
        )
    }
}

impl core::fmt::Display for TensorStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TensorStorage::Undefined => write!(f, "Undefined"),
            TensorStorage::DenseRowMajor => write!(f, "Dense Row Major"),
            TensorStorage::SystemReduced {
                target_set,
                storage_set,
            } => write!(f, "System Reduced ({target_set}, {storage_set})"),
            TensorStorage::SystemDiagonal => write!(f, "System Diagonal"),
            TensorStorage::SystemNone => write!(f, "System None"),
        }
    }
}

/// A table assigning a [`TensorStorage`] to every tensor variable.
#[derive(Debug, Clone, Default)]
pub struct Storage {
    storage: HashMap<Var, TensorStorage>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, var: Var, storage: TensorStorage) {
        self.storage.insert(var, storage);
    }

    /// Merges every entry of `other` into this table.
    pub fn add_all(&mut self, other: &Storage) {
        for (var, storage) in &other.storage {
            self.storage.insert(var.clone(), storage.clone());
        }
    }

    pub fn has_storage(&self, var: &Var) -> bool {
        self.storage.contains_key(var)
    }

    pub fn get(&self, var: &Var) -> Option<&TensorStorage> {
        self.storage.get(var)
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{IndexSet, ScalarKind, Type};

    fn dense_matrix_var(name: &str) -> Var {
        Var::new(
            name,
            Type::tensor(
                ScalarKind::Float,
                vec![IndexSet::Range(3).into(), IndexSet::Range(3).into()],
            ),
        )
    }

    #[test]
    fn lookup_is_by_var_value() {
        let mut table = Storage::new();
        table.add(dense_matrix_var("A"), TensorStorage::DenseRowMajor);

        // A distinct Var value with the same name and type must hit.
        assert!(table.has_storage(&dense_matrix_var("A")));
        assert!(!table.has_storage(&dense_matrix_var("B")));
    }

    #[test]
    fn merged_tables_resolve_entries_from_both() {
        let mut a = Storage::new();
        a.add(dense_matrix_var("A"), TensorStorage::DenseRowMajor);
        let mut b = Storage::new();
        b.add(dense_matrix_var("B"), TensorStorage::SystemDiagonal);

        let mut merged = Storage::new();
        merged.add_all(&a);
        merged.add_all(&b);
        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged.get(&dense_matrix_var("B")),
            Some(&TensorStorage::SystemDiagonal)
        );
    }

    #[test]
    fn initialization_predicate_tracks_system_kinds() {
        assert!(!TensorStorage::DenseRowMajor.needs_initialization());
        assert!(!TensorStorage::Undefined.needs_initialization());
        assert!(!TensorStorage::SystemNone.needs_initialization());
        assert!(TensorStorage::SystemDiagonal.needs_initialization());
    }
}
