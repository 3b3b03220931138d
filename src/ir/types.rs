//! The Tess type system: tensors over index domains, elements, sets and
//! tuples.
//!
//! Types are shared, immutable values. A blocked tensor (a tensor of
//! tensors) is not a separate node: a dimension whose [`IndexDomain`] holds
//! more than one [`IndexSet`] is hierarchical, and the block type is derived
//! by stripping the outermost index set of every dimension.

use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::ir::Expr;

/// The component type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Int,
    Float,
    Boolean,
}

/// Width of the `Float` component type, chosen once per compilation session
/// and threaded through the backend (never a process-wide global).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FloatWidth {
    Single,
    #[default]
    Double,
}

impl ScalarKind {
    /// Byte width of one component under the given float-width policy.
    pub fn bytes(self, float_width: FloatWidth) -> usize {
        match self {
            ScalarKind::Int => 4,
            ScalarKind::Float => match float_width {
                FloatWidth::Single => 4,
                FloatWidth::Double => 8,
            },
            ScalarKind::Boolean => 1,
        }
    }
}

impl core::fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Float => write!(f, "float"),
            Self::Boolean => write!(f, "bool"),
        }
    }
}

/// One factor of a tensor dimension.
#[derive(Debug, Clone)]
pub enum IndexSet {
    /// A fixed-size range `0..n`.
    Range(i64),
    /// The elements of a runtime set, referenced through an expression
    /// (in practice a variable of set type).
    Set(Expr),
    /// A single index.
    Single,
    /// Unbounded.
    Dynamic,
}

impl IndexSet {
    /// The static size of this index set, defined only for ranges.
    pub fn size(&self) -> Option<i64> {
        match self {
            IndexSet::Range(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_range(&self) -> bool {
        matches!(self, IndexSet::Range(_))
    }
}

impl PartialEq for IndexSet {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (IndexSet::Range(a), IndexSet::Range(b)) => a == b,
            (IndexSet::Set(a), IndexSet::Set(b)) => a == b,
            (IndexSet::Single, IndexSet::Single) => true,
            (IndexSet::Dynamic, IndexSet::Dynamic) => true,
            _ => false,
        }
    }
}

impl Eq for IndexSet {}

impl Hash for IndexSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            IndexSet::Range(n) => n.hash(state),
            IndexSet::Set(e) => e.hash(state),
            IndexSet::Single | IndexSet::Dynamic => {}
        }
    }
}

impl core::fmt::Display for IndexSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexSet::Range(n) => write!(f, "{n}"),
            IndexSet::Set(e) => write!(f, "{e}"),
            IndexSet::Single => write!(f, "single"),
            IndexSet::Dynamic => write!(f, "*"),
        }
    }
}

/// An ordered product of index sets making up one tensor dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexDomain {
    index_sets: Vec<IndexSet>,
}

impl IndexDomain {
    pub fn new(index_sets: Vec<IndexSet>) -> Self {
        assert!(!index_sets.is_empty(), "an index domain has at least one index set");
        Self { index_sets }
    }

    pub fn index_sets(&self) -> &[IndexSet] {
        &self.index_sets
    }

    /// The static size of the whole dimension, defined only when every
    /// factor is a range.
    pub fn size(&self) -> Option<i64> {
        self.index_sets.iter().map(IndexSet::size).try_fold(1, |acc, s| Some(acc * s?))
    }
}

impl From<IndexSet> for IndexDomain {
    fn from(is: IndexSet) -> Self {
        IndexDomain::new(vec![is])
    }
}

impl core::fmt::Display for IndexDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, is) in self.index_sets.iter().enumerate() {
            if i > 0 {
                write!(f, "*")?;
            }
            write!(f, "{is}")?;
        }
        Ok(())
    }
}

/// A tensor type: a component kind and one index domain per dimension.
///
/// Invariant: `order() == dimensions.len()`, and a tensor is scalar exactly
/// when its order is zero.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TensorType {
    pub component: ScalarKind,
    pub dimensions: Vec<IndexDomain>,
    pub column_vector: bool,
}

impl TensorType {
    pub fn order(&self) -> usize {
        self.dimensions.len()
    }

    pub fn is_scalar(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// The outermost index set of every dimension.
    pub fn outer_dimensions(&self) -> Vec<&IndexSet> {
        self.dimensions.iter().map(|d| &d.index_sets()[0]).collect()
    }

    /// The nested block type: every dimension with its outermost index set
    /// stripped. A tensor whose dimensions each hold a single index set has
    /// a scalar block type.
    pub fn block_type(&self) -> TensorType {
        let block_dims: Vec<IndexDomain> = self
            .dimensions
            .iter()
            .filter(|d| d.index_sets().len() > 1)
            .map(|d| IndexDomain::new(d.index_sets()[1..].to_vec()))
            .collect();
        TensorType {
            component: self.component,
            dimensions: block_dims,
            column_vector: false,
        }
    }

    /// Total number of components, defined only for fully static shapes.
    pub fn static_size(&self) -> Option<i64> {
        self.dimensions.iter().map(IndexDomain::size).try_fold(1, |acc, s| Some(acc * s?))
    }
}

impl core::fmt::Display for TensorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_scalar() {
            return write!(f, "{}", self.component);
        }
        write!(f, "tensor[")?;
        for (i, dim) in self.dimensions.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{dim}")?;
        }
        write!(f, "]({})", self.component)?;
        if self.column_vector {
            write!(f, "'")?;
        }
        Ok(())
    }
}

/// An element type: a globally unique name and an ordered list of fields.
/// Equality and hashing are by name alone.
#[derive(Debug, Clone)]
pub struct ElementType {
    pub name: String,
    pub fields: Vec<(String, TensorType)>,
}

impl ElementType {
    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|(name, _)| name == field)
    }

    pub fn field_type(&self, field: &str) -> Option<&TensorType> {
        self.fields.iter().find(|(name, _)| name == field).map(|(_, ty)| ty)
    }
}

impl PartialEq for ElementType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ElementType {}

impl Hash for ElementType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

/// A set type: an element type plus the endpoint sets of an edge set. A set
/// with endpoints carries connectivity metadata at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SetType {
    pub element: Type,
    pub endpoints: Vec<Expr>,
}

impl SetType {
    pub fn is_edge_set(&self) -> bool {
        !self.endpoints.is_empty()
    }

    pub fn element_type(&self) -> &ElementType {
        match &*self.element {
            TypeKind::Element(e) => e,
            other => panic!("set element type must be an element type, not {other}"),
        }
    }
}

/// A tuple type: a homogeneous, fixed-arity collection of elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TupleType {
    pub element: Type,
    pub size: usize,
}

/// The closed sum of Tess types.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Tensor(TensorType),
    Element(ElementType),
    Set(SetType),
    Tuple(TupleType),
}

/// A shared handle to a [`TypeKind`]. Cheap to clone; equality is by value.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Type(Rc<TypeKind>);

impl Type {
    pub fn new(kind: TypeKind) -> Self {
        Self(Rc::new(kind))
    }

    /// An order-0 tensor of the given component kind.
    pub fn scalar(component: ScalarKind) -> Self {
        Self::tensor(component, vec![])
    }

    pub fn tensor(component: ScalarKind, dimensions: Vec<IndexDomain>) -> Self {
        Self::new(TypeKind::Tensor(TensorType {
            component,
            dimensions,
            column_vector: false,
        }))
    }

    pub fn column_vector(component: ScalarKind, dimension: IndexDomain) -> Self {
        Self::new(TypeKind::Tensor(TensorType {
            component,
            dimensions: vec![dimension],
            column_vector: true,
        }))
    }

    pub fn element(name: impl Into<String>, fields: Vec<(String, TensorType)>) -> Self {
        Self::new(TypeKind::Element(ElementType {
            name: name.into(),
            fields,
        }))
    }

    pub fn set(element: Type, endpoints: Vec<Expr>) -> Self {
        Self::new(TypeKind::Set(SetType { element, endpoints }))
    }

    pub fn tuple(element: Type, size: usize) -> Self {
        Self::new(TypeKind::Tuple(TupleType { element, size }))
    }

    pub fn is_tensor(&self) -> bool {
        matches!(&*self.0, TypeKind::Tensor(_))
    }

    pub fn is_scalar(&self) -> bool {
        matches!(&*self.0, TypeKind::Tensor(t) if t.is_scalar())
    }

    pub fn is_set(&self) -> bool {
        matches!(&*self.0, TypeKind::Set(_))
    }

    pub fn is_element(&self) -> bool {
        matches!(&*self.0, TypeKind::Element(_))
    }

    pub fn as_tensor(&self) -> Option<&TensorType> {
        match &*self.0 {
            TypeKind::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_set(&self) -> Option<&SetType> {
        match &*self.0 {
            TypeKind::Set(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_element(&self) -> Option<&ElementType> {
        match &*self.0 {
            TypeKind::Element(e) => Some(e),
            _ => None,
        }
    }
}

impl core::ops::Deref for Type {
    type Target = TypeKind;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl core::fmt::Debug for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Type").field(&self.0).finish()
    }
}

impl core::fmt::Display for TypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeKind::Tensor(t) => write!(f, "{t}"),
            TypeKind::Element(e) => write!(f, "{}", e.name),
            TypeKind::Set(s) => {
                write!(f, "set{{{}}}", s.element)?;
                if s.is_edge_set() {
                    write!(f, "(")?;
                    for (i, ep) in s.endpoints.iter().enumerate() {
                        if i > 0 {
                            write!(f, ",")?;
                        }
                        write!(f, "{ep}")?;
                    }
                    write!(f, ")")?;
                }
                Ok(())
            }
            TypeKind::Tuple(t) => write!(f, "({}*{})", t.element, t.size),
        }
    }
}

impl core::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", **self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_3x4() -> Type {
        Type::tensor(
            ScalarKind::Float,
            vec![IndexSet::Range(3).into(), IndexSet::Range(4).into()],
        )
    }

    #[test]
    fn scalar_has_order_zero() {
        let ty = Type::scalar(ScalarKind::Float);
        let tensor = ty.as_tensor().unwrap();
        assert!(tensor.is_scalar());
        assert_eq!(tensor.order(), 0);
        assert_eq!(tensor.static_size(), Some(1));
    }

    #[test]
    fn dense_matrix_static_size_is_dimension_product() {
        let ty = matrix_3x4();
        let tensor = ty.as_tensor().unwrap();
        assert_eq!(tensor.order(), 2);
        assert_eq!(tensor.static_size(), Some(12));
    }

    #[test]
    fn blocked_tensor_derives_block_type() {
        // A 3x3 matrix of 2x2 blocks: each dimension is a product of two
        // ranges.
        let ty = Type::tensor(
            ScalarKind::Float,
            vec![
                IndexDomain::new(vec![IndexSet::Range(3), IndexSet::Range(2)]),
                IndexDomain::new(vec![IndexSet::Range(3), IndexSet::Range(2)]),
            ],
        );
        let tensor = ty.as_tensor().unwrap();
        let block = tensor.block_type();
        assert_eq!(block.order(), 2);
        assert_eq!(block.static_size(), Some(4));
        assert_eq!(tensor.outer_dimensions().len(), 2);
        assert_eq!(tensor.outer_dimensions()[0].size(), Some(3));
        assert_eq!(tensor.static_size(), Some(36));
    }

    #[test]
    fn unblocked_tensor_has_scalar_block() {
        let ty = matrix_3x4();
        assert!(ty.as_tensor().unwrap().block_type().is_scalar());
    }

    #[test]
    fn element_types_compare_by_name() {
        let a = ElementType {
            name: "Point".into(),
            fields: vec![("x".into(), TensorType {
                component: ScalarKind::Float,
                dimensions: vec![],
                column_vector: false,
            })],
        };
        let b = ElementType {
            name: "Point".into(),
            fields: vec![],
        };
        assert_eq!(a, b);
        assert_eq!(a.field_index("x"), Some(0));
        assert_eq!(b.field_index("x"), None);
    }

    #[test]
    fn domain_size_undefined_with_dynamic_factor() {
        let dom = IndexDomain::new(vec![IndexSet::Range(3), IndexSet::Dynamic]);
        assert_eq!(dom.size(), None);
    }
}
