//! Host-side values bound to compiled functions: dense literal tensors and
//! graph sets with named fields and CSR connectivity arrays.

use crate::ir::types::ScalarKind;
use crate::ir::LiteralData;

/// A dense, row-major tensor literal owned by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseTensor {
    pub component: ScalarKind,
    pub dims: Vec<usize>,
    pub data: LiteralData,
}

impl DenseTensor {
    pub fn new(component: ScalarKind, dims: Vec<usize>, data: LiteralData) -> Self {
        let expected: usize = dims.iter().product();
        assert_eq!(
            data.len(),
            expected,
            "tensor data must hold exactly one value per component"
        );
        assert_eq!(component, data.scalar_kind());
        Self {
            component,
            dims,
            data,
        }
    }

    pub fn scalar_float(value: f64) -> Self {
        Self::new(ScalarKind::Float, vec![], LiteralData::Float(vec![value]))
    }

    pub fn scalar_int(value: i32) -> Self {
        Self::new(ScalarKind::Int, vec![], LiteralData::Int(vec![value]))
    }

    pub fn scalar_bool(value: bool) -> Self {
        Self::new(
            ScalarKind::Boolean,
            vec![],
            LiteralData::Boolean(vec![value]),
        )
    }

    pub fn vector_float(values: Vec<f64>) -> Self {
        let dims = vec![values.len()];
        Self::new(ScalarKind::Float, dims, LiteralData::Float(values))
    }

    pub fn vector_int(values: Vec<i32>) -> Self {
        let dims = vec![values.len()];
        Self::new(ScalarKind::Int, dims, LiteralData::Int(values))
    }

    pub fn matrix_float(rows: usize, columns: usize, values: Vec<f64>) -> Self {
        Self::new(
            ScalarKind::Float,
            vec![rows, columns],
            LiteralData::Float(values),
        )
    }

    /// A zero-filled tensor of the given shape, the fresh result value the
    /// verification harness binds before running.
    pub fn zeros(component: ScalarKind, dims: Vec<usize>) -> Self {
        let len = dims.iter().product();
        let data = match component {
            ScalarKind::Int => LiteralData::Int(vec![0; len]),
            ScalarKind::Float => LiteralData::Float(vec![0.0; len]),
            ScalarKind::Boolean => LiteralData::Boolean(vec![false; len]),
        };
        Self::new(component, dims, data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn order(&self) -> usize {
        self.dims.len()
    }

    /// Literal value equality: shapes and components must agree exactly;
    /// float components compare within a relative epsilon.
    pub fn equals(&self, other: &DenseTensor) -> bool {
        if self.component != other.component || self.dims != other.dims {
            return false;
        }
        match (&self.data, &other.data) {
            (LiteralData::Int(a), LiteralData::Int(b)) => a == b,
            (LiteralData::Boolean(a), LiteralData::Boolean(b)) => a == b,
            (LiteralData::Float(a), LiteralData::Float(b)) => a
                .iter()
                .zip(b)
                .all(|(x, y)| float_equals(*x, *y)),
            _ => false,
        }
    }
}

fn float_equals(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
}

/// A host-owned set value: a cardinality, optional edge connectivity, and
/// named per-element field data.
///
/// Field tensors are stored whole: a field declared with per-element shape
/// `d` on a set of `n` elements is a dense tensor of shape `[n, d...]`.
#[derive(Debug, Clone)]
pub struct GraphSet {
    pub size: usize,
    /// Flattened endpoint element indices, one group per edge. Empty for
    /// plain sets.
    pub endpoints: Vec<i32>,
    /// CSR neighbor-start offsets over the connected vertex set; its last
    /// entry is the total neighbor count.
    pub neighbors_start: Vec<i32>,
    /// CSR neighbor element indices.
    pub neighbors: Vec<i32>,
    fields: Vec<(String, DenseTensor)>,
}

impl GraphSet {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            endpoints: Vec::new(),
            neighbors_start: Vec::new(),
            neighbors: Vec::new(),
            fields: Vec::new(),
        }
    }

    pub fn edge_set(
        size: usize,
        endpoints: Vec<i32>,
        neighbors_start: Vec<i32>,
        neighbors: Vec<i32>,
    ) -> Self {
        Self {
            size,
            endpoints,
            neighbors_start,
            neighbors,
            fields: Vec::new(),
        }
    }

    pub fn is_edge_set(&self) -> bool {
        !self.neighbors_start.is_empty() || !self.endpoints.is_empty()
    }

    /// Attaches a field; the tensor's outermost dimension must match the
    /// set's cardinality.
    pub fn add_field(&mut self, name: impl Into<String>, tensor: DenseTensor) {
        assert_eq!(
            tensor.dims.first().copied().unwrap_or(0),
            self.size,
            "a set field holds one entry per element"
        );
        self.fields.push((name.into(), tensor));
    }

    pub fn field(&self, name: &str) -> Option<&DenseTensor> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut DenseTensor> {
        self.fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    pub fn fields(&self) -> &[(String, DenseTensor)] {
        &self.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_exact_for_ints_and_tolerant_for_floats() {
        let a = DenseTensor::vector_int(vec![1, 2, 3]);
        let b = DenseTensor::vector_int(vec![1, 2, 3]);
        assert!(a.equals(&b));

        let x = DenseTensor::scalar_float(2.0 + 4.1);
        let y = DenseTensor::scalar_float(6.1);
        assert!(x.equals(&y));

        let p = DenseTensor::scalar_float(6.1);
        let q = DenseTensor::scalar_float(6.11);
        assert!(!p.equals(&q));
    }

    #[test]
    fn equality_requires_matching_shape() {
        let v = DenseTensor::vector_float(vec![1.0, 2.0]);
        let m = DenseTensor::matrix_float(1, 2, vec![1.0, 2.0]);
        assert!(!v.equals(&m));
    }

    #[test]
    #[should_panic(expected = "one value per component")]
    fn construction_checks_component_count() {
        let _ = DenseTensor::new(
            ScalarKind::Float,
            vec![3],
            LiteralData::Float(vec![1.0, 2.0]),
        );
    }

    #[test]
    fn set_fields_hold_one_entry_per_element() {
        let mut points = GraphSet::new(3);
        points.add_field(
            "mass",
            DenseTensor::new(
                ScalarKind::Float,
                vec![3],
                LiteralData::Float(vec![1.0, 2.0, 3.0]),
            ),
        );
        assert_eq!(points.field("mass").unwrap().len(), 3);
        assert!(points.field("velocity").is_none());
        assert!(!points.is_edge_set());
    }
}
