//! The compiled artifact and its binding/execution state machine.
//!
//! A [`CompiledFunction`] starts unbound. `bind` attaches a host value to a
//! named formal, typechecking it eagerly; `run` marshals every bound value
//! into VM memory, runs the synthesized init function once if any global
//! buffer needs allocating, calls the compiled root, and copies results
//! back out into the bound host values. Re-binding at any time rebuilds the
//! marshalling work from scratch on the next run.
//!
//! Nothing here is internally synchronized: concurrent `bind`/`run` on one
//! artifact is undefined and must be serialized by the caller.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::{HashMap, HashSet};

use crate::backend::lir;
use crate::backend::lowering::SET_EDGE_INDEX_SLOTS;
use crate::backend::vm::{self, ExecutionContext, Ptr, Value};
use crate::backend::CodegenOptions;
use crate::diagnostics::internal_error;
use crate::host::{DenseTensor, GraphSet};
use crate::ir::types::{FloatWidth, ScalarKind, SetType, TensorType, TypeKind};
use crate::ir::{Func, LiteralData, Var};

/// A host value bound to one formal of a compiled function. Values are
/// shared with the caller, which reads results back through its own handle
/// after `run`.
#[derive(Debug, Clone)]
pub enum HostValue {
    Tensor(Rc<RefCell<DenseTensor>>),
    Set(Rc<RefCell<GraphSet>>),
}

impl HostValue {
    pub fn tensor(tensor: DenseTensor) -> (Self, Rc<RefCell<DenseTensor>>) {
        let handle = Rc::new(RefCell::new(tensor));
        (Self::Tensor(handle.clone()), handle)
    }

    pub fn set(set: GraphSet) -> (Self, Rc<RefCell<GraphSet>>) {
        let handle = Rc::new(RefCell::new(set));
        (Self::Set(handle.clone()), handle)
    }
}

/// A pending copy-back from VM memory into a host value after a run.
enum Writeback {
    Tensor {
        ptr: Ptr,
        component: lir::Component,
        host: Rc<RefCell<DenseTensor>>,
    },
    SetField {
        ptr: Ptr,
        component: lir::Component,
        host: Rc<RefCell<GraphSet>>,
        field: String,
    },
}

/// A compiled root function, its module, and the execution context they
/// share.
pub struct CompiledFunction {
    func: Func,
    module: lir::Module,
    requires_init: bool,
    options: CodegenOptions,
    ctx: ExecutionContext,
    bound: HashMap<String, HostValue>,
    formals: Vec<Var>,
    result_names: HashSet<String>,
    initialized: bool,
}

impl CompiledFunction {
    pub(crate) fn new(
        func: Func,
        module: lir::Module,
        requires_init: bool,
        options: CodegenOptions,
    ) -> Self {
        let formals: Vec<Var> = func
            .arguments()
            .iter()
            .chain(func.results())
            .cloned()
            .collect();
        let result_names = func.results().iter().map(|r| r.name.clone()).collect();
        let ctx = ExecutionContext::new(module.globals.len());
        Self {
            func,
            module,
            requires_init,
            options,
            ctx,
            bound: HashMap::new(),
            formals,
            result_names,
            initialized: false,
        }
    }

    pub fn name(&self) -> &str {
        self.func.name()
    }

    pub fn module(&self) -> &lir::Module {
        &self.module
    }

    /// True when the compile session registered global tensor buffers that
    /// must be allocated before the first run.
    pub fn requires_init(&self) -> bool {
        self.requires_init
    }

    /// Redirects everything the program prints into a shared string.
    pub fn capture_output(&mut self) -> Rc<RefCell<String>> {
        self.ctx.capture_output()
    }

    /// Binds a host value to the named formal, checking the name and the
    /// value's structure eagerly. Rebinding throws away init state so the
    /// next run allocates against the new values.
    pub fn bind(&mut self, name: &str, value: HostValue) -> Result<(), String> {
        let formal = self
            .formals
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| format!("function '{}' has no formal named '{name}'", self.name()))?;
        check_binding(formal, &value)?;
        if self.initialized {
            self.run_deinit();
        }
        self.bound.insert(name.to_string(), value);
        Ok(())
    }

    /// Runs the compiled function against the currently bound values.
    /// Results land in the host values bound to result formals; argument
    /// tensors see any writes the function performed, the same way a
    /// pointer argument would.
    pub fn run(&mut self) -> Result<(), String> {
        let mut args: Vec<Value> = Vec::with_capacity(self.formals.len());
        let mut writebacks: Vec<Writeback> = Vec::new();

        let formals = self.formals.clone();
        for formal in &formals {
            let value = self
                .bound
                .get(&formal.name)
                .ok_or_else(|| format!("formal '{}' is not bound", formal.name))?
                .clone();
            self.marshal(formal, &value, &mut args, &mut writebacks);
        }

        if self.requires_init && !self.initialized {
            vm::execute(
                &self.module,
                &format!("{}_init", self.name()),
                &args,
                &mut self.ctx,
            );
            self.initialized = true;
        }

        vm::execute(&self.module, self.func.name(), &args, &mut self.ctx);

        for writeback in writebacks {
            self.write_back(writeback);
        }
        Ok(())
    }

    fn component(&self, kind: ScalarKind) -> lir::Component {
        match kind {
            ScalarKind::Int => lir::Component::Int,
            ScalarKind::Boolean => lir::Component::Bool,
            ScalarKind::Float => match self.options.float_width {
                FloatWidth::Single => lir::Component::F32,
                FloatWidth::Double => lir::Component::F64,
            },
        }
    }

    /// Appends the VM value(s) for one formal: scalars by value for
    /// arguments, everything else through freshly marshalled buffers.
    fn marshal(
        &mut self,
        formal: &Var,
        value: &HostValue,
        args: &mut Vec<Value>,
        writebacks: &mut Vec<Writeback>,
    ) {
        let is_result = self.result_names.contains(&formal.name);
        match (&*formal.ty, value) {
            (TypeKind::Tensor(tensor), HostValue::Tensor(host)) => {
                if tensor.is_scalar() && !is_result {
                    args.push(scalar_value(&host.borrow()));
                    return;
                }
                let component = self.component(tensor.component);
                let ptr = self.marshal_tensor(&host.borrow(), component);
                args.push(Value::Ptr(ptr));
                writebacks.push(Writeback::Tensor {
                    ptr,
                    component,
                    host: host.clone(),
                });
            }
            (TypeKind::Set(set_type), HostValue::Set(host)) => {
                let record = self.marshal_set(set_type, host, writebacks);
                args.push(Value::Fields(Rc::new(record)));
            }
            _ => internal_error!("binding for '{}' passed the typecheck but cannot be marshalled", formal.name),
        }
    }

    fn marshal_tensor(&mut self, tensor: &DenseTensor, component: lir::Component) -> Ptr {
        let ptr = self
            .ctx
            .memory
            .alloc(tensor.len() * component.bytes());
        for index in 0..tensor.len() {
            let value = match &tensor.data {
                LiteralData::Int(v) => Value::Int(v[index]),
                LiteralData::Float(v) => Value::Float(v[index]),
                LiteralData::Boolean(v) => Value::Bool(v[index]),
            };
            self.ctx.memory.write(component, ptr, index as i64, &value);
        }
        ptr
    }

    fn marshal_ints(&mut self, values: &[i32]) -> Ptr {
        let ptr = self.ctx.memory.alloc(values.len() * 4);
        for (index, v) in values.iter().enumerate() {
            self.ctx
                .memory
                .write(lir::Component::Int, ptr, index as i64, &Value::Int(*v));
        }
        ptr
    }

    /// Builds a set's runtime record: cardinality, edge-index slots for
    /// edge sets, then one buffer pointer per declared field, in element
    /// declaration order.
    fn marshal_set(
        &mut self,
        set_type: &SetType,
        host: &Rc<RefCell<GraphSet>>,
        writebacks: &mut Vec<Writeback>,
    ) -> Vec<Value> {
        let set = host.borrow();
        let mut record = vec![Value::Int(set.size as i32)];
        if set_type.is_edge_set() {
            let endpoints = self.marshal_ints(&set.endpoints);
            let neighbors_start = self.marshal_ints(&set.neighbors_start);
            let neighbors = self.marshal_ints(&set.neighbors);
            record.push(Value::Ptr(endpoints));
            record.push(Value::Ptr(neighbors_start));
            record.push(Value::Ptr(neighbors));
            debug_assert_eq!(record.len(), 1 + SET_EDGE_INDEX_SLOTS);
        }
        for (field_name, field_type) in &set_type.element_type().fields {
            let field = set
                .field(field_name)
                .unwrap_or_else(|| internal_error!("checked binding lost field {field_name}"));
            let component = self.component(field_type.component);
            let ptr = self.marshal_tensor(field, component);
            record.push(Value::Ptr(ptr));
            writebacks.push(Writeback::SetField {
                ptr,
                component,
                host: host.clone(),
                field: field_name.clone(),
            });
        }
        record
    }

    fn write_back(&mut self, writeback: Writeback) {
        match writeback {
            Writeback::Tensor {
                ptr,
                component,
                host,
            } => {
                let mut tensor = host.borrow_mut();
                copy_out(&self.ctx, ptr, component, &mut tensor.data);
            }
            Writeback::SetField {
                ptr,
                component,
                host,
                field,
            } => {
                let mut set = host.borrow_mut();
                let tensor = set
                    .field_mut(&field)
                    .unwrap_or_else(|| internal_error!("bound set lost field {field}"));
                copy_out(&self.ctx, ptr, component, &mut tensor.data);
            }
        }
    }

    fn run_deinit(&mut self) {
        let name = format!("{}_deinit", self.name());
        let params = self
            .module
            .function(&name)
            .map(|f| f.params.len())
            .unwrap_or(0);
        // Deinit only touches the global buffer slots; its formals exist to
        // mirror the root's signature and are never read.
        let args = vec![Value::Undef; params];
        vm::execute(&self.module, &name, &args, &mut self.ctx);
        self.initialized = false;
    }
}

impl Drop for CompiledFunction {
    fn drop(&mut self) {
        if self.initialized {
            self.run_deinit();
        }
    }
}

fn scalar_value(tensor: &DenseTensor) -> Value {
    match &tensor.data {
        LiteralData::Int(v) => Value::Int(v[0]),
        LiteralData::Float(v) => Value::Float(v[0]),
        LiteralData::Boolean(v) => Value::Bool(v[0]),
    }
}

fn copy_out(ctx: &ExecutionContext, ptr: Ptr, component: lir::Component, data: &mut LiteralData) {
    for index in 0..data.len() {
        let value = ctx.memory.read(component, ptr, index as i64);
        match data {
            LiteralData::Int(v) => v[index] = value.as_int(),
            LiteralData::Float(v) => v[index] = value.as_float(),
            LiteralData::Boolean(v) => v[index] = value.as_bool(),
        }
    }
}

/// Eager structural typecheck of a host value against a formal's declared
/// type.
fn check_binding(formal: &Var, value: &HostValue) -> Result<(), String> {
    match (&*formal.ty, value) {
        (TypeKind::Tensor(tensor), HostValue::Tensor(host)) => {
            check_tensor(&formal.name, tensor, &host.borrow())
        }
        (TypeKind::Set(set_type), HostValue::Set(host)) => {
            check_set(&formal.name, set_type, &host.borrow())
        }
        (declared, _) => Err(format!(
            "cannot bind that value to formal '{}' of type {declared}",
            formal.name
        )),
    }
}

fn static_dims(tensor: &TensorType) -> Result<Vec<usize>, String> {
    tensor
        .dimensions
        .iter()
        .map(|d| {
            d.size()
                .map(|s| s as usize)
                .ok_or_else(|| "cannot bind a literal to a runtime-sized formal".to_string())
        })
        .collect()
}

fn check_tensor(name: &str, declared: &TensorType, host: &DenseTensor) -> Result<(), String> {
    if declared.component != host.component {
        return Err(format!(
            "component mismatch binding '{name}': declared {}, got {}",
            declared.component, host.component
        ));
    }
    let dims = static_dims(declared)?;
    if dims == host.dims {
        return Ok(());
    }
    // An n-element vector literal binds to a 1xN or Nx1 matrix formal via
    // an explicit shape cast, never a mismatch error.
    let total: usize = dims.iter().product();
    if declared.order() == 2
        && host.order() == 1
        && total == host.len()
        && dims.contains(&1)
    {
        return Ok(());
    }
    Err(format!(
        "shape mismatch binding '{name}': declared {dims:?}, got {:?}",
        host.dims
    ))
}

fn check_set(name: &str, declared: &SetType, host: &GraphSet) -> Result<(), String> {
    for (field_name, field_type) in &declared.element_type().fields {
        let field = host.field(field_name).ok_or_else(|| {
            format!("set bound to '{name}' is missing field '{field_name}'")
        })?;
        if field.component != field_type.component {
            return Err(format!(
                "component mismatch in field '{field_name}' of '{name}': declared {}, got {}",
                field_type.component, field.component
            ));
        }
        let mut expected = vec![host.size];
        expected.extend(static_dims(field_type)?);
        if field.dims != expected {
            return Err(format!(
                "shape mismatch in field '{field_name}' of '{name}': expected {expected:?}, got {:?}",
                field.dims
            ));
        }
    }
    if declared.is_edge_set() && host.neighbors_start.is_empty() {
        return Err(format!(
            "edge set bound to '{name}' is missing its neighbor index"
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{IndexSet, Type};

    fn float_scalar_formal(name: &str) -> Var {
        Var::new(name, Type::scalar(ScalarKind::Float))
    }

    #[test]
    fn binding_rejects_component_mismatch() {
        let formal = float_scalar_formal("a");
        let (value, _) = HostValue::tensor(DenseTensor::scalar_int(1));
        assert!(check_binding(&formal, &value).is_err());
    }

    #[test]
    fn binding_accepts_matching_vector() {
        let formal = Var::new(
            "v",
            Type::tensor(ScalarKind::Float, vec![IndexSet::Range(3).into()]),
        );
        let (value, _) = HostValue::tensor(DenseTensor::vector_float(vec![1.0, 2.0, 3.0]));
        assert!(check_binding(&formal, &value).is_ok());
    }

    #[test]
    fn vector_literal_binds_to_single_row_matrix() {
        let formal = Var::new(
            "m",
            Type::tensor(
                ScalarKind::Float,
                vec![IndexSet::Range(1).into(), IndexSet::Range(4).into()],
            ),
        );
        let (value, _) =
            HostValue::tensor(DenseTensor::vector_float(vec![1.0, 2.0, 3.0, 4.0]));
        assert!(check_binding(&formal, &value).is_ok());

        // A 2x2 formal is a genuine mismatch for a 4-vector.
        let square = Var::new(
            "m",
            Type::tensor(
                ScalarKind::Float,
                vec![IndexSet::Range(2).into(), IndexSet::Range(2).into()],
            ),
        );
        assert!(check_binding(&square, &value).is_err());
    }

    #[test]
    fn set_binding_checks_declared_fields() {
        let element = Type::element(
            "Particle",
            vec![(
                "mass".into(),
                TensorType {
                    component: ScalarKind::Float,
                    dimensions: vec![],
                    column_vector: false,
                },
            )],
        );
        let formal = Var::new("points", Type::set(element, vec![]));

        let empty = GraphSet::new(2);
        let (missing, _) = HostValue::set(empty);
        assert!(check_binding(&formal, &missing).is_err());

        let mut with_field = GraphSet::new(2);
        with_field.add_field(
            "mass",
            DenseTensor::new(
                ScalarKind::Float,
                vec![2],
                LiteralData::Float(vec![1.0, 2.0]),
            ),
        );
        let (ok, _) = HostValue::set(with_field);
        assert!(check_binding(&formal, &ok).is_ok());
    }
}
