//! Lowering from the typed IR to LIR.
//!
//! One [`Codegen`] pass consumes a root function, walks its call tree in
//! dependency order (callees first) and emits an LIR function per internal
//! function, followed by the synthesized `<root>_init`/`<root>_deinit`
//! companions that allocate and free the global tensor buffers registered
//! along the way.
//!
//! Input contract: the tree is fully lowered (no index-notation nodes, no
//! maps), every tensor variable has resolved storage, and the call graph is
//! acyclic. Violations are compiler bugs and fail fatally, never
//! recoverably.

use hashbrown::HashMap;

use crate::backend::intrinsics::{self, Intrinsic};
use crate::backend::lir::{
    self, Callee, Component, FunctionBuilder, GlobalId, Immediate, Instruction, Operand,
};
use crate::backend::symtable::ScopedMap;
use crate::backend::CodegenOptions;
use crate::diagnostics::{internal_error, unsupported};
use crate::ir::storage::{Storage, TensorStorage};
use crate::ir::types::{
    FloatWidth, IndexDomain, IndexSet, ScalarKind, TensorType, Type, TypeKind,
};
use crate::ir::{
    queries, BinaryOperator, CompoundOperator, Expr, ExprKind, ForDomain, Func, FuncKind,
    IndexReadKind, LiteralData, Stmt, StmtKind, Var,
};

/// Runtime layout of a set value: the cardinality comes first, edge sets
/// reserve three connectivity slots, and user fields follow.
pub const SET_CARDINALITY_SLOT: usize = 0;
pub const SET_ENDPOINTS_SLOT: usize = 1;
pub const SET_NEIGHBORS_START_SLOT: usize = 2;
pub const SET_NEIGHBORS_SLOT: usize = 3;
pub const SET_EDGE_INDEX_SLOTS: usize = 3;

/// Slot index of the first user field of a set of the given type.
pub fn set_fields_offset(set_type: &crate::ir::types::SetType) -> usize {
    1 + if set_type.is_edge_set() {
        SET_EDGE_INDEX_SLOTS
    } else {
        0
    }
}

/// Compiles `root` and every internal function it reaches into one LIR
/// module. Returns the module and whether any global buffer was registered
/// (the compiled artifact's `requires_init` flag).
pub fn compile(options: &CodegenOptions, root: &Func) -> (lir::Module, bool) {
    if root.kind() != FuncKind::Internal {
        internal_error!("cannot compile {} function '{}'", kind_name(root.kind()), root.name());
    }
    if root.body().is_none() {
        internal_error!("cannot compile an undefined function");
    }

    let mut codegen = Codegen::new(options, lir::Module::new(root.name()));

    // Callees come first, so by the time a caller emits a call its target
    // already exists in the module.
    let call_tree = queries::call_tree(root);
    for func in &call_tree {
        codegen.storage.add_all(func.storage());
    }
    for func in &call_tree {
        codegen.emit_function(func, func == root);
    }

    codegen.module.uses_allocator = !codegen.buffers.is_empty();
    let requires_init = !codegen.buffers.is_empty();
    codegen.emit_init(root);
    codegen.emit_deinit(root);

    (codegen.module, requires_init)
}

fn kind_name(kind: FuncKind) -> &'static str {
    match kind {
        FuncKind::Internal => "internal",
        FuncKind::Intrinsic => "intrinsic",
        FuncKind::External => "external",
    }
}

struct Codegen<'a> {
    options: &'a CodegenOptions,
    module: lir::Module,
    /// The function currently being emitted.
    func: Option<FunctionBuilder>,
    /// One instance per function body; cleared and reused across the call
    /// tree.
    symtable: ScopedMap<String, Operand>,
    /// Session-wide storage, merged from every function in the call tree.
    storage: Storage,
    /// Global buffers in registration order.
    buffers: Vec<(Var, GlobalId)>,
    buffer_ids: HashMap<Var, GlobalId>,
}

impl<'a> Codegen<'a> {
    fn new(options: &'a CodegenOptions, module: lir::Module) -> Self {
        Self {
            options,
            module,
            func: None,
            symtable: ScopedMap::new(),
            storage: Storage::new(),
            buffers: Vec::new(),
            buffer_ids: HashMap::new(),
        }
    }

    fn builder(&mut self) -> &mut FunctionBuilder {
        self.func
            .as_mut()
            .unwrap_or_else(|| internal_error!("no function under construction"))
    }

    fn push(&mut self, instruction: Instruction) {
        self.builder().push(instruction);
    }

    fn component(&self, kind: ScalarKind) -> Component {
        match kind {
            ScalarKind::Int => Component::Int,
            ScalarKind::Boolean => Component::Bool,
            ScalarKind::Float => match self.options.float_width {
                FloatWidth::Single => Component::F32,
                FloatWidth::Double => Component::F64,
            },
        }
    }

    fn scalar_type(&self, kind: ScalarKind) -> lir::Type {
        match kind {
            ScalarKind::Int => lir::Type::Int,
            ScalarKind::Float => lir::Type::Float,
            ScalarKind::Boolean => lir::Type::Bool,
        }
    }

    fn register_type_of(&self, kind: Component) -> lir::Type {
        match kind {
            Component::Int => lir::Type::Int,
            Component::F32 | Component::F64 => lir::Type::Float,
            Component::Bool => lir::Type::Bool,
        }
    }

    /* Function emission */

    /// Emits an empty function shell with `arguments` then `results` as its
    /// formal parameters and registers them in the symbol table. Scalar
    /// arguments are passed by value; results and tensors by pointer; sets
    /// as records.
    fn emit_shell(&mut self, name: &str, arguments: &[Var], results: &[Var], exported: bool) {
        let mut builder = FunctionBuilder::new(name, exported);
        for arg in arguments {
            let ty = match &*arg.ty {
                TypeKind::Tensor(t) if t.is_scalar() => self.scalar_type(t.component),
                TypeKind::Tensor(t) => lir::Type::Ptr(self.component(t.component)),
                TypeKind::Set(_) => lir::Type::Fields,
                TypeKind::Element(_) | TypeKind::Tuple(_) => {
                    unsupported!("{} formal arguments", arg.ty)
                }
            };
            let reg = builder.add_param(ty);
            self.symtable.insert(arg.name.clone(), Operand::Register(reg));
        }
        for result in results {
            let ty = match &*result.ty {
                TypeKind::Tensor(t) => lir::Type::Ptr(self.component(t.component)),
                other => unsupported!("{other} result formals"),
            };
            let reg = builder.add_param(ty);
            self.symtable
                .insert(result.name.clone(), Operand::Register(reg));
        }
        self.func = Some(builder);
    }

    fn finish_function(&mut self) {
        self.push(Instruction::Return);
        let builder = self
            .func
            .take()
            .unwrap_or_else(|| internal_error!("no function under construction"));
        self.module.functions.push(builder.finish());
    }

    fn emit_function(&mut self, func: &Func, is_root: bool) {
        let body = func
            .body()
            .unwrap_or_else(|| internal_error!("internal function '{}' has no body", func.name()))
            .clone();

        self.symtable.clear();
        self.symtable.scope();
        self.emit_shell(func.name(), func.arguments(), func.results(), is_root);

        // Global constants are compiled once and become ordinary symbols.
        let constants = func.environment().constants.clone();
        for (var, init) in &constants {
            let value = self.compile_expr(init);
            self.symtable.insert(var.name.clone(), value);
        }

        self.compile_stmt(&body);
        self.finish_function();
        self.symtable.unscope();
    }

    /// Synthesizes `<root>_init`: for every registered buffer, compute the
    /// tensor's length, scale it to bytes, allocate, and store the pointer
    /// into the buffer's global slot.
    fn emit_init(&mut self, root: &Func) {
        self.symtable.clear();
        self.symtable.scope();
        self.emit_shell(
            &format!("{}_init", root.name()),
            root.arguments(),
            root.results(),
            true,
        );
        for (var, global) in self.buffers.clone() {
            let tensor = var
                .ty
                .as_tensor()
                .unwrap_or_else(|| internal_error!("buffer {var} is not a tensor"));
            let storage = self.storage_of(&var);
            let len = self.emit_compute_len(&tensor.clone(), &storage);
            let component = self.component(tensor.component);
            let size = self.emit_mul_int(len, Operand::int(component.bytes() as i64));
            let mem = self.builder().create_register(lir::Type::Ptr(component));
            self.push(Instruction::Call {
                callee: Callee::Runtime("malloc".into()),
                arguments: vec![size],
                destination: Some(mem),
            });
            self.push(Instruction::GlobalStore {
                global,
                value: Operand::Register(mem),
            });
        }
        self.finish_function();
        self.symtable.unscope();
    }

    /// Synthesizes `<root>_deinit`, the mirror image of init.
    fn emit_deinit(&mut self, root: &Func) {
        self.symtable.clear();
        self.symtable.scope();
        self.emit_shell(
            &format!("{}_deinit", root.name()),
            root.arguments(),
            root.results(),
            true,
        );
        for (_, global) in self.buffers.clone() {
            let ptr = self.builder().create_register(lir::Type::Ptr(Component::Int));
            self.push(Instruction::GlobalLoad {
                destination: ptr,
                global,
            });
            self.push(Instruction::Call {
                callee: Callee::Runtime("free".into()),
                arguments: vec![Operand::Register(ptr)],
                destination: None,
            });
        }
        self.finish_function();
        self.symtable.unscope();
    }

    fn storage_of(&self, var: &Var) -> TensorStorage {
        self.storage
            .get(var)
            .cloned()
            .unwrap_or_else(|| internal_error!("{var} has no storage"))
    }

    /// Registers a global buffer slot for a tensor local and loads its
    /// current pointer. Registration is lazy and happens at most once per
    /// variable across the whole call tree.
    fn make_global_tensor(&mut self, var: &Var) -> Operand {
        let tensor = var
            .ty
            .as_tensor()
            .unwrap_or_else(|| internal_error!("{var} is not a tensor"));
        let component = self.component(tensor.component);
        let global = match self.buffer_ids.get(var) {
            Some(id) => *id,
            None => {
                let id = self.module.globals.push(lir::Global {
                    name: var.name.clone(),
                    component,
                });
                self.buffers.push((var.clone(), id));
                self.buffer_ids.insert(var.clone(), id);
                id
            }
        };
        let ptr = self.builder().create_register(lir::Type::Ptr(component));
        self.push(Instruction::GlobalLoad {
            destination: ptr,
            global,
        });
        Operand::Register(ptr)
    }

    /* Statements */

    fn compile_stmt(&mut self, stmt: &Stmt) {
        match stmt.kind() {
            StmtKind::VarDecl { var } => self.compile_var_decl(var),
            StmtKind::Assign { var, value, cop } => match cop {
                CompoundOperator::None => self.emit_assign(var, value),
                CompoundOperator::Add => {
                    let sum = Expr::add(Expr::var(var.clone()), value.clone());
                    self.emit_assign(var, &sum);
                }
            },
            StmtKind::Store {
                buffer,
                index,
                value,
                cop,
            } => self.compile_store(buffer, index, value, *cop),
            StmtKind::FieldWrite {
                elem_or_set,
                field,
                value,
                cop,
            } => self.compile_field_write(elem_or_set, field, value, *cop),
            StmtKind::Call {
                results,
                callee,
                actuals,
            } => self.compile_call(results, callee, actuals),
            StmtKind::For { var, domain, body } => self.compile_for(var, domain, body),
            StmtKind::ForRange {
                var,
                start,
                end,
                body,
            } => self.compile_for_range(var, start, end, body),
            StmtKind::While { condition, body } => self.compile_while(condition, body),
            StmtKind::IfThenElse {
                condition,
                then_body,
                else_body,
            } => self.compile_if(condition, then_body, else_body.as_ref()),
            StmtKind::Block(stmts) => {
                for stmt in stmts {
                    self.compile_stmt(stmt);
                }
            }
            StmtKind::Scope(inner) => {
                self.symtable.scope();
                self.compile_stmt(inner);
                self.symtable.unscope();
            }
            StmtKind::Pass => {}
            StmtKind::Print { expr } => self.compile_print(expr),
            StmtKind::TensorWrite { .. } => {
                internal_error!("unlowered tensor write reached code generation")
            }
            StmtKind::Map { .. } => internal_error!("unlowered map reached code generation"),
        }
    }

    fn compile_var_decl(&mut self, var: &Var) {
        // Do not duplicate variable storage, even on a duplicated
        // declaration.
        if self.symtable.contains(&var.name) {
            return;
        }
        let tensor = match var.ty.as_tensor() {
            Some(t) => t.clone(),
            None => unsupported!("{} declarations", var.ty),
        };
        if tensor.is_scalar() {
            let component = self.component(tensor.component);
            let slot = self.builder().create_register(lir::Type::Ptr(component));
            self.push(Instruction::Alloca {
                destination: slot,
                component,
                len: Operand::int(1),
            });
            self.symtable
                .insert(var.name.clone(), Operand::Register(slot));
            return;
        }

        let storage = self.storage_of(var);
        if storage.needs_initialization() {
            let ptr = self.make_global_tensor(var);
            self.symtable.insert(var.name.clone(), ptr);
            return;
        }
        match storage {
            TensorStorage::DenseRowMajor => {
                let len = self.emit_compute_len(&tensor, &storage);
                let component = self.component(tensor.component);
                let ptr = self.builder().create_register(lir::Type::Ptr(component));
                self.push(Instruction::Alloca {
                    destination: ptr,
                    component,
                    len,
                });
                self.symtable
                    .insert(var.name.clone(), Operand::Register(ptr));
            }
            TensorStorage::Undefined | TensorStorage::SystemNone => {
                internal_error!("cannot declare {var} with {storage} storage")
            }
            TensorStorage::SystemReduced { .. } | TensorStorage::SystemDiagonal => {
                unreachable!("system storage is initialized through a global buffer")
            }
        }
    }

    fn emit_assign(&mut self, var: &Var, value: &Expr) {
        // First assignment to an undeclared scalar declares it lazily.
        if !self.symtable.contains(&var.name) {
            if var.ty.is_scalar() {
                self.compile_var_decl(var);
            } else {
                internal_error!("tensor {var} assigned before being declared");
            }
        }

        let var_tensor = var
            .ty
            .as_tensor()
            .unwrap_or_else(|| internal_error!("cannot assign to {} variable {var}", var.ty));
        let value_tensor = value
            .ty()
            .as_tensor()
            .unwrap_or_else(|| internal_error!("cannot assign {} value to {var}", value.ty()));
        let target = *self
            .symtable
            .get(&var.name)
            .unwrap_or_else(|| internal_error!("{var} not found in symbol table"));

        // Scalar into scalar: a direct store.
        if var_tensor.is_scalar() && value_tensor.is_scalar() {
            let result = self.compile_expr(value);
            let Some(component) = self.builder().pointer_component(&target) else {
                internal_error!("cannot assign to non-addressable variable {var}")
            };
            self.push(Instruction::Store {
                component,
                ptr: target,
                index: Operand::int(0),
                value: result,
            });
            return;
        }

        let storage = self.storage_of(var);
        let var_tensor = var_tensor.clone();
        let len = self.emit_compute_len(&var_tensor, &storage);
        let component = self.component(var_tensor.component);
        let size = self.emit_mul_int(len, Operand::int(component.bytes() as i64));

        // Scalar into tensor: only the literal zero, as a memset.
        if value_tensor.is_scalar() {
            match value.kind() {
                ExprKind::Literal(data) if data.is_all_zero() => {
                    self.push(Instruction::MemSet {
                        ptr: target,
                        value: 0,
                        size,
                    });
                }
                _ => unsupported!(
                    "can only assign a literal zero scalar to tensor {var}, not {value}"
                ),
            }
            return;
        }

        // Tensor into tensor of the same type: a memcpy.
        if var.ty != *value.ty() {
            internal_error!(
                "variable and value types don't match: {} vs {}",
                var.ty,
                value.ty()
            );
        }
        let source = self.compile_expr(value);
        self.push(Instruction::MemCpy {
            destination: target,
            source,
            size,
        });
    }

    fn compile_store(&mut self, buffer: &Expr, index: &Expr, value: &Expr, cop: CompoundOperator) {
        let buffer_operand = self.compile_expr(buffer);
        let index_operand = self.compile_expr(index);
        let value_operand = match cop {
            CompoundOperator::None => self.compile_expr(value),
            CompoundOperator::Add => {
                let sum = Expr::add(Expr::load(buffer.clone(), index.clone()), value.clone());
                self.compile_expr(&sum)
            }
        };
        let Some(component) = self.builder().pointer_component(&buffer_operand) else {
            internal_error!("store into non-pointer value {buffer}")
        };
        self.push(Instruction::Store {
            component,
            ptr: buffer_operand,
            index: index_operand,
            value: value_operand,
        });
    }

    fn compile_field_write(
        &mut self,
        elem_or_set: &Expr,
        field: &str,
        value: &Expr,
        cop: CompoundOperator,
    ) {
        let read = Expr::field_read(elem_or_set.clone(), field);
        let field_tensor = read
            .ty()
            .as_tensor()
            .unwrap_or_else(|| internal_error!("field {field} is not tensor-typed"))
            .clone();
        let value_tensor = value
            .ty()
            .as_tensor()
            .unwrap_or_else(|| internal_error!("cannot write {} into field {field}", value.ty()));

        // Writing a scalar into an n-order field: only the literal zero.
        if field_tensor.order() > 0 && value_tensor.is_scalar() {
            if !matches!(cop, CompoundOperator::None) {
                internal_error!("compound write when assigning a scalar to n-order field {field}");
            }
            match value.kind() {
                ExprKind::Literal(data) if data.is_all_zero() => {
                    let ptr = self.emit_field_read(elem_or_set, field);
                    // Fields are always dense row major.
                    let len =
                        self.emit_compute_len(&field_tensor, &TensorStorage::DenseRowMajor);
                    let component = self.component(field_tensor.component);
                    let size =
                        self.emit_mul_int(len, Operand::int(component.bytes() as i64));
                    self.push(Instruction::MemSet {
                        ptr,
                        value: 0,
                        size,
                    });
                }
                _ => unsupported!("can only assign a literal zero scalar to field {field}"),
            }
            return;
        }

        let ptr = self.emit_field_read(elem_or_set, field);
        let value_operand = match cop {
            CompoundOperator::None => self.compile_expr(value),
            CompoundOperator::Add => {
                let sum = Expr::add(read, value.clone());
                self.compile_expr(&sum)
            }
        };

        if field_tensor.is_scalar() {
            let component = self.component(field_tensor.component);
            self.push(Instruction::Store {
                component,
                ptr,
                index: Operand::int(0),
                value: value_operand,
            });
            return;
        }

        let len = self.emit_compute_len(&field_tensor, &TensorStorage::DenseRowMajor);
        let component = self.component(field_tensor.component);
        let size = self.emit_mul_int(len, Operand::int(component.bytes() as i64));
        self.push(Instruction::MemCpy {
            destination: ptr,
            source: value_operand,
            size,
        });
    }

    /* Calls */

    fn compile_call(&mut self, results: &[Var], callee: &Func, actuals: &[Expr]) {
        match callee.kind() {
            FuncKind::Internal => self.emit_internal_call(results, callee, actuals),
            FuncKind::Intrinsic => self.emit_intrinsic_call(results, callee, actuals),
            FuncKind::External => self.emit_extern_call(results, callee, actuals),
        }
    }

    fn emit_internal_call(&mut self, results: &[Var], callee: &Func, actuals: &[Expr]) {
        // This lookup is what makes call-tree ordering a hard correctness
        // requirement: the callee must already have been emitted.
        if self.module.function(callee.name()).is_none() {
            internal_error!("function '{}' not found in module", callee.name());
        }

        let mut arguments: Vec<Operand> =
            actuals.iter().map(|a| self.compile_expr(a)).collect();
        for result in results {
            if !self.symtable.contains(&result.name) {
                self.compile_var_decl(result);
            }
            let slot = *self
                .symtable
                .get(&result.name)
                .unwrap_or_else(|| internal_error!("{result} not found in symbol table"));
            arguments.push(slot);
        }
        self.push(Instruction::Call {
            callee: Callee::Function(callee.name().to_string()),
            arguments,
            destination: None,
        });
    }

    fn emit_intrinsic_call(&mut self, results: &[Var], callee: &Func, actuals: &[Expr]) {
        let intrinsic = Intrinsic::of(callee)
            .unwrap_or_else(|| internal_error!("intrinsic '{}' not found", callee.name()));
        let width = self.options.float_width;

        match intrinsic {
            _ if intrinsic.is_math() => {
                let arguments: Vec<Operand> =
                    actuals.iter().map(|a| self.compile_expr(a)).collect();
                let destination = self.builder().create_register(lir::Type::Float);
                self.push(Instruction::Call {
                    callee: Callee::Runtime(intrinsics::runtime_symbol(intrinsic, width)),
                    arguments,
                    destination: Some(destination),
                });
                self.store_scalar_result(&results[0], Operand::Register(destination));
            }
            Intrinsic::Mod => {
                if actuals.len() != 2 {
                    internal_error!("mod takes two operands, got {}", actuals.len());
                }
                let a = self.compile_expr(&actuals[0]);
                let b = self.compile_expr(&actuals[1]);
                let destination = self.builder().create_register(lir::Type::Int);
                self.push(Instruction::Binary {
                    operator: BinaryOperator::Rem,
                    destination,
                    lhs: a,
                    rhs: b,
                });
                self.store_scalar_result(&results[0], Operand::Register(destination));
            }
            Intrinsic::Det => {
                let arguments: Vec<Operand> =
                    actuals.iter().map(|a| self.compile_expr(a)).collect();
                if arguments.len() != 1 {
                    internal_error!("det takes one operand, got {}", arguments.len());
                }
                self.require_3x3(&actuals[0]);
                let destination = self.builder().create_register(lir::Type::Float);
                self.push(Instruction::Call {
                    callee: Callee::Runtime(intrinsics::runtime_symbol(intrinsic, width)),
                    arguments,
                    destination: Some(destination),
                });
                self.store_scalar_result(&results[0], Operand::Register(destination));
            }
            Intrinsic::Inv => {
                let mut arguments: Vec<Operand> =
                    actuals.iter().map(|a| self.compile_expr(a)).collect();
                if arguments.len() != 1 {
                    internal_error!("inv takes one operand, got {}", arguments.len());
                }
                self.require_3x3(&actuals[0]);
                let result = &results[0];
                if !self.symtable.contains(&result.name) {
                    self.compile_var_decl(result);
                }
                let slot = *self
                    .symtable
                    .get(&result.name)
                    .unwrap_or_else(|| internal_error!("{result} not found in symbol table"));
                arguments.push(slot);
                self.push(Instruction::Call {
                    callee: Callee::Runtime(intrinsics::runtime_symbol(intrinsic, width)),
                    arguments,
                    destination: None,
                });
            }
            Intrinsic::Norm => self.emit_norm(results, actuals, width),
            Intrinsic::Dot => self.emit_dot(results, actuals, width),
            Intrinsic::Solve => self.emit_solve(results, actuals, width),
            Intrinsic::Loc => {
                let arguments: Vec<Operand> =
                    actuals.iter().map(|a| self.compile_expr(a)).collect();
                let destination = self.builder().create_register(lir::Type::Int);
                self.push(Instruction::Call {
                    callee: Callee::Runtime("loc".into()),
                    arguments,
                    destination: Some(destination),
                });
                self.store_scalar_result(&results[0], Operand::Register(destination));
            }
            _ => unreachable!(),
        }
    }

    fn require_3x3(&self, operand: &Expr) {
        let tensor = operand
            .ty()
            .as_tensor()
            .unwrap_or_else(|| internal_error!("matrix intrinsic over non-tensor operand"));
        let sizes: Vec<_> = tensor.dimensions.iter().map(IndexDomain::size).collect();
        if sizes != [Some(3), Some(3)] {
            unsupported!("det/inv of a matrix that is not 3x3");
        }
    }

    /// The vector length an intrinsic operand has, when statically known.
    fn static_vector_len(&self, operand: &Expr) -> Option<i64> {
        operand.ty().as_tensor().and_then(TensorType::static_size)
    }

    fn emit_norm(&mut self, results: &[Var], actuals: &[Expr], width: FloatWidth) {
        let v = self.compile_expr(&actuals[0]);
        let Some(component) = self.builder().pointer_component(&v) else {
            internal_error!("norm of a non-pointer operand")
        };

        // Length-3 vectors are unrolled inline; everything else goes
        // through the runtime with an explicit length.
        let result = if self.static_vector_len(&actuals[0]) == Some(3) {
            let squares = self.emit_square_sum_3(v, component);
            let destination = self.builder().create_register(lir::Type::Float);
            self.push(Instruction::Call {
                callee: Callee::Runtime(format!("sqrt{}", intrinsics::float_suffix(width))),
                arguments: vec![squares],
                destination: Some(destination),
            });
            Operand::Register(destination)
        } else {
            let tensor = actuals[0]
                .ty()
                .as_tensor()
                .unwrap_or_else(|| internal_error!("norm of a non-tensor operand"))
                .clone();
            let len = self.emit_compute_len(&tensor, &TensorStorage::DenseRowMajor);
            let destination = self.builder().create_register(lir::Type::Float);
            self.push(Instruction::Call {
                callee: Callee::Runtime(format!("norm{}", intrinsics::float_suffix(width))),
                arguments: vec![v, len],
                destination: Some(destination),
            });
            Operand::Register(destination)
        };
        self.store_scalar_result(&results[0], result);
    }

    fn emit_dot(&mut self, results: &[Var], actuals: &[Expr], width: FloatWidth) {
        let a = self.compile_expr(&actuals[0]);
        let b = self.compile_expr(&actuals[1]);

        let result = if self.static_vector_len(&actuals[0]) == Some(3)
            && self.static_vector_len(&actuals[1]) == Some(3)
        {
            let Some(component) = self.builder().pointer_component(&a) else {
                internal_error!("dot of a non-pointer operand")
            };
            let mut sum: Option<Operand> = None;
            for i in 0..3 {
                let x = self.emit_load(a, Operand::int(i), component);
                let y = self.emit_load(b, Operand::int(i), component);
                let product = self.emit_float_binary(BinaryOperator::Mul, x, y);
                sum = Some(match sum {
                    None => product,
                    Some(acc) => self.emit_float_binary(BinaryOperator::Add, acc, product),
                });
            }
            sum.unwrap()
        } else {
            let tensor = actuals[0]
                .ty()
                .as_tensor()
                .unwrap_or_else(|| internal_error!("dot of a non-tensor operand"))
                .clone();
            let len = self.emit_compute_len(&tensor, &TensorStorage::DenseRowMajor);
            let destination = self.builder().create_register(lir::Type::Float);
            self.push(Instruction::Call {
                callee: Callee::Runtime(format!("dot{}", intrinsics::float_suffix(width))),
                arguments: vec![a, b, len],
                destination: Some(destination),
            });
            Operand::Register(destination)
        };
        self.store_scalar_result(&results[0], result);
    }

    /// Marshals a sparse solve: dimension sizes and CSR index pointers come
    /// from the system operand's storage descriptor.
    fn emit_solve(&mut self, results: &[Var], actuals: &[Expr], width: FloatWidth) {
        let matrix = &actuals[0];
        let ExprKind::VarExpr(matrix_var) = matrix.kind() else {
            internal_error!("solve operand must be a variable reference")
        };
        let tensor = matrix
            .ty()
            .as_tensor()
            .unwrap_or_else(|| internal_error!("solve over a non-tensor operand"))
            .clone();
        let TensorStorage::SystemReduced { target_set, .. } = self.storage_of(matrix_var) else {
            unsupported!("solve over a matrix without sparse system storage")
        };

        let n = self.emit_compute_len_domain(&tensor.dimensions[0].clone());
        let m = self.emit_compute_len_domain(&tensor.dimensions[1].clone());

        let target = self.compile_expr(&target_set);
        let rowstart = self.emit_extract(target, SET_NEIGHBORS_START_SLOT, Component::Int);
        let colidx = self.emit_extract(target, SET_NEIGHBORS_SLOT, Component::Int);

        let block = tensor.block_type();
        let (nn, mm) = if block.is_scalar() {
            (Operand::int(1), Operand::int(1))
        } else {
            (
                self.emit_compute_len_domain(&block.dimensions[0].clone()),
                self.emit_compute_len_domain(&block.dimensions[1].clone()),
            )
        };

        let vals = self.compile_expr(matrix);
        let rhs = self.compile_expr(&actuals[1]);
        let result = &results[0];
        if !self.symtable.contains(&result.name) {
            self.compile_var_decl(result);
        }
        let solution = *self
            .symtable
            .get(&result.name)
            .unwrap_or_else(|| internal_error!("{result} not found in symbol table"));

        self.push(Instruction::Call {
            callee: Callee::Runtime(format!("solve{}", intrinsics::float_suffix(width))),
            arguments: vec![n, m, rowstart, colidx, nn, mm, vals, rhs, solution],
            destination: None,
        });
    }

    /// External functions take their tensor arguments with explicit
    /// lengths, followed by result pointers, and resolve to runtime symbols.
    fn emit_extern_call(&mut self, results: &[Var], callee: &Func, actuals: &[Expr]) {
        if actuals.len() != callee.arguments().len() {
            internal_error!(
                "external function '{}' called with {} arguments, but expects {}",
                callee.name(),
                actuals.len(),
                callee.arguments().len()
            );
        }
        let mut arguments = Vec::new();
        for actual in actuals {
            if let Some(tensor) = actual.ty().as_tensor() {
                if !tensor.is_scalar() {
                    let tensor = tensor.clone();
                    let len = self.emit_compute_len(&tensor, &TensorStorage::DenseRowMajor);
                    arguments.push(len);
                }
            }
            arguments.push(self.compile_expr(actual));
        }
        for result in results {
            if !self.symtable.contains(&result.name) {
                self.compile_var_decl(result);
            }
            let slot = *self
                .symtable
                .get(&result.name)
                .unwrap_or_else(|| internal_error!("{result} not found in symbol table"));
            arguments.push(slot);
        }
        self.push(Instruction::Call {
            callee: Callee::Runtime(callee.name().to_string()),
            arguments,
            destination: None,
        });
    }

    /// Stores an intrinsic's scalar return value into the result variable's
    /// slot, declaring it lazily if needed.
    fn store_scalar_result(&mut self, result: &Var, value: Operand) {
        if !self.symtable.contains(&result.name) {
            self.compile_var_decl(result);
        }
        let slot = *self
            .symtable
            .get(&result.name)
            .unwrap_or_else(|| internal_error!("{result} not found in symbol table"));
        let Some(component) = self.builder().pointer_component(&slot) else {
            internal_error!("intrinsic result {result} is not addressable")
        };
        self.push(Instruction::Store {
            component,
            ptr: slot,
            index: Operand::int(0),
            value,
        });
    }

    /* Control flow */

    fn compile_for(&mut self, var: &Var, domain: &ForDomain, body: &Stmt) {
        let index_set = match domain {
            ForDomain::IndexSet(is) => is.clone(),
            ForDomain::Endpoints { .. }
            | ForDomain::Edges { .. }
            | ForDomain::Neighbors { .. }
            | ForDomain::Diagonal => {
                internal_error!("loop domain must be rewritten into an index set before emission")
            }
        };
        let trip = self.emit_compute_len_index_set(&index_set);
        self.emit_counted_loop(var, Operand::int(0), trip, body);
    }

    fn compile_for_range(&mut self, var: &Var, start: &Expr, end: &Expr, body: &Stmt) {
        let start = self.compile_expr(start);
        let end = self.compile_expr(end);
        self.emit_counted_loop(var, start, end, body);
    }

    /// The shared loop pattern: bounds are computed once before entry, an
    /// entry test skips empty loops, the induction register steps by one,
    /// and the exit test is recomputed from the updated value.
    fn emit_counted_loop(&mut self, var: &Var, start: Operand, end: Operand, body: &Stmt) {
        let induction = self.builder().create_register(lir::Type::Int);
        self.push(Instruction::Move {
            destination: induction,
            source: start,
        });
        let entry_test = self.builder().create_register(lir::Type::Bool);
        self.push(Instruction::Binary {
            operator: BinaryOperator::Lt,
            destination: entry_test,
            lhs: start,
            rhs: end,
        });
        let body_block = self.builder().create_block();
        let end_block = self.builder().create_block();
        self.push(Instruction::Branch {
            condition: Operand::Register(entry_test),
            positive: body_block,
            negative: end_block,
        });

        self.builder().set_insert_point(body_block);
        // The loop variable is scoped around the body only.
        self.symtable.scope();
        self.symtable
            .insert(var.name.clone(), Operand::Register(induction));
        self.compile_stmt(body);
        self.symtable.unscope();

        self.push(Instruction::Binary {
            operator: BinaryOperator::Add,
            destination: induction,
            lhs: Operand::Register(induction),
            rhs: Operand::int(1),
        });
        let exit_test = self.builder().create_register(lir::Type::Bool);
        self.push(Instruction::Binary {
            operator: BinaryOperator::Lt,
            destination: exit_test,
            lhs: Operand::Register(induction),
            rhs: end,
        });
        self.push(Instruction::Branch {
            condition: Operand::Register(exit_test),
            positive: body_block,
            negative: end_block,
        });
        self.builder().set_insert_point(end_block);
    }

    fn emit_condition(&mut self, condition: &Expr) -> Operand {
        let value = self.compile_expr(condition);
        // The condition is compared for equality against true.
        let test = self.builder().create_register(lir::Type::Bool);
        self.push(Instruction::Binary {
            operator: BinaryOperator::Eq,
            destination: test,
            lhs: Operand::Immediate(Immediate::Bool(true)),
            rhs: value,
        });
        Operand::Register(test)
    }

    fn compile_if(&mut self, condition: &Expr, then_body: &Stmt, else_body: Option<&Stmt>) {
        let test = self.emit_condition(condition);
        let then_block = self.builder().create_block();
        let else_block = else_body.map(|_| self.builder().create_block());
        let exit_block = self.builder().create_block();

        self.push(Instruction::Branch {
            condition: test,
            positive: then_block,
            negative: else_block.unwrap_or(exit_block),
        });

        self.builder().set_insert_point(then_block);
        self.compile_stmt(then_body);
        self.push(Instruction::Jump {
            destination: exit_block,
        });

        if let (Some(else_block), Some(else_body)) = (else_block, else_body) {
            self.builder().set_insert_point(else_block);
            self.compile_stmt(else_body);
            self.push(Instruction::Jump {
                destination: exit_block,
            });
        }

        self.builder().set_insert_point(exit_block);
    }

    fn compile_while(&mut self, condition: &Expr, body: &Stmt) {
        let test = self.emit_condition(condition);
        let body_block = self.builder().create_block();
        let exit_block = self.builder().create_block();
        self.push(Instruction::Branch {
            condition: test,
            positive: body_block,
            negative: exit_block,
        });

        // The loop jumps back to the block the body STARTED in; compiling
        // the body may leave the insert point in a different block.
        self.builder().set_insert_point(body_block);
        self.compile_stmt(body);
        let retest = self.emit_condition(condition);
        self.push(Instruction::Branch {
            condition: retest,
            positive: body_block,
            negative: exit_block,
        });
        self.builder().set_insert_point(exit_block);
    }

    /* Print */

    fn compile_print(&mut self, expr: &Expr) {
        let tensor = expr
            .ty()
            .as_tensor()
            .unwrap_or_else(|| unsupported!("printing {} values", expr.ty()))
            .clone();

        if tensor.is_scalar() {
            let value = self.compile_expr(expr);
            let format = match tensor.component {
                ScalarKind::Float => "%g\n",
                ScalarKind::Int | ScalarKind::Boolean => "%d\n",
            };
            self.push(Instruction::Printf {
                format: format.to_string(),
                arguments: vec![value],
            });
            return;
        }

        // System tensors hold only their stored blocks; printing them as a
        // dense grid would misread the buffer.
        if let ExprKind::VarExpr(var) = expr.kind() {
            if self.storage.get(var).is_some_and(TensorStorage::is_system) {
                unsupported!("printing system tensor {var}");
            }
        }

        let ptr = self.compile_expr(expr);
        let component = self.component(tensor.component);
        let conversion = match tensor.component {
            ScalarKind::Float => "%g",
            ScalarKind::Int | ScalarKind::Boolean => "%d",
        };

        match tensor.static_size() {
            Some(total) => self.emit_print_static(&tensor, ptr, component, conversion, total),
            None => self.emit_print_dynamic(&tensor, ptr, component, conversion),
        }
    }

    /// Fully unrolled printing of a statically-shaped tensor: elements are
    /// separated by spaces, rows and higher-dimension boundaries by
    /// newlines computed from per-dimension stride breakpoints.
    fn emit_print_static(
        &mut self,
        tensor: &TensorType,
        ptr: Operand,
        component: Component,
        conversion: &str,
        total: i64,
    ) {
        let newline_separated = tensor.order() == 1 && tensor.column_vector;
        let innermost = if tensor.order() >= 2 {
            let columns = tensor
                .dimensions
                .last()
                .and_then(IndexDomain::size)
                .unwrap_or_else(|| internal_error!("static tensor with non-static dimension"));
            rectangular_row_width(total, columns)
        } else {
            total
        };

        // Stride breakpoints, innermost dimension first: crossing stride k
        // inserts one extra newline.
        let mut strides = Vec::new();
        let mut stride = innermost;
        for dim in tensor.dimensions.iter().rev().skip(1) {
            strides.push(stride);
            stride *= dim
                .size()
                .unwrap_or_else(|| internal_error!("static tensor with non-static dimension"));
        }

        for index in 0..total {
            let value = self.emit_load(ptr, Operand::int(index), component);
            let separator = if index == total - 1 {
                "\n".to_string()
            } else if tensor.order() >= 2 && (index + 1) % innermost == 0 {
                let crossings = strides.iter().filter(|&&s| (index + 1) % s == 0).count();
                "\n".repeat(crossings)
            } else if newline_separated {
                "\n".to_string()
            } else {
                " ".to_string()
            };
            self.push(Instruction::Printf {
                format: format!("{conversion}{separator}"),
                arguments: vec![value],
            });
        }
    }

    /// Printing a tensor with a runtime-sized dimension: a dynamic counted
    /// loop with two formatted writes, one for interior elements and one
    /// for the final terminator.
    fn emit_print_dynamic(
        &mut self,
        tensor: &TensorType,
        ptr: Operand,
        component: Component,
        conversion: &str,
    ) {
        if tensor.order() != 1 {
            unsupported!("printing a runtime-sized tensor of order {}", tensor.order());
        }
        let separator = if tensor.column_vector { "\n" } else { " " };
        let len = self.emit_compute_len_domain(&tensor.dimensions[0].clone());

        let induction = self.builder().create_register(lir::Type::Int);
        self.push(Instruction::Move {
            destination: induction,
            source: Operand::int(0),
        });
        let entry_test = self.builder().create_register(lir::Type::Bool);
        self.push(Instruction::Binary {
            operator: BinaryOperator::Lt,
            destination: entry_test,
            lhs: Operand::int(0),
            rhs: len,
        });
        let body_block = self.builder().create_block();
        let interior_block = self.builder().create_block();
        let last_block = self.builder().create_block();
        let footer_block = self.builder().create_block();
        let end_block = self.builder().create_block();
        self.push(Instruction::Branch {
            condition: Operand::Register(entry_test),
            positive: body_block,
            negative: end_block,
        });

        self.builder().set_insert_point(body_block);
        let value = self.emit_load(ptr, Operand::Register(induction), component);
        let next = self.builder().create_register(lir::Type::Int);
        self.push(Instruction::Binary {
            operator: BinaryOperator::Add,
            destination: next,
            lhs: Operand::Register(induction),
            rhs: Operand::int(1),
        });
        let is_interior = self.builder().create_register(lir::Type::Bool);
        self.push(Instruction::Binary {
            operator: BinaryOperator::Lt,
            destination: is_interior,
            lhs: Operand::Register(next),
            rhs: len,
        });
        self.push(Instruction::Branch {
            condition: Operand::Register(is_interior),
            positive: interior_block,
            negative: last_block,
        });

        self.builder().set_insert_point(interior_block);
        self.push(Instruction::Printf {
            format: format!("{conversion}{separator}"),
            arguments: vec![value],
        });
        self.push(Instruction::Jump {
            destination: footer_block,
        });

        self.builder().set_insert_point(last_block);
        self.push(Instruction::Printf {
            format: format!("{conversion}\n"),
            arguments: vec![value],
        });
        self.push(Instruction::Jump {
            destination: footer_block,
        });

        self.builder().set_insert_point(footer_block);
        self.push(Instruction::Move {
            destination: induction,
            source: Operand::Register(next),
        });
        let exit_test = self.builder().create_register(lir::Type::Bool);
        self.push(Instruction::Binary {
            operator: BinaryOperator::Lt,
            destination: exit_test,
            lhs: Operand::Register(induction),
            rhs: len,
        });
        self.push(Instruction::Branch {
            condition: Operand::Register(exit_test),
            positive: body_block,
            negative: end_block,
        });
        self.builder().set_insert_point(end_block);
    }

    /* Expressions */

    fn compile_expr(&mut self, expr: &Expr) -> Operand {
        match expr.kind() {
            ExprKind::Literal(data) => self.compile_literal(data, expr.ty()),
            ExprKind::VarExpr(var) => self.compile_var_expr(var),
            ExprKind::FieldRead { elem_or_set, field } => {
                self.emit_field_read(elem_or_set, field)
            }
            ExprKind::Length(index_set) => self.emit_compute_len_index_set(&index_set.clone()),
            ExprKind::IndexRead { edge_set, kind } => {
                let set_type = edge_set
                    .ty()
                    .as_set()
                    .unwrap_or_else(|| internal_error!("index read of non-set {edge_set}"));
                if !set_type.is_edge_set() {
                    internal_error!("index read of set {edge_set} without connectivity");
                }
                let record = self.compile_expr(&edge_set.clone());
                let slot = match kind {
                    IndexReadKind::Endpoints => SET_ENDPOINTS_SLOT,
                    IndexReadKind::NeighborsStart => SET_NEIGHBORS_START_SLOT,
                    IndexReadKind::Neighbors => SET_NEIGHBORS_SLOT,
                };
                self.emit_extract(record, slot, Component::Int)
            }
            ExprKind::Load { buffer, index } => {
                let buffer_operand = self.compile_expr(buffer);
                let index_operand = self.compile_expr(index);
                let Some(component) = self.builder().pointer_component(&buffer_operand) else {
                    internal_error!("load from non-pointer value {buffer}")
                };
                self.emit_load(buffer_operand, index_operand, component)
            }
            ExprKind::Unary { op, operand } => {
                if !operand.ty().is_scalar() {
                    internal_error!("unary {op} over non-scalar operand must be lowered first");
                }
                let value = self.compile_expr(operand);
                let ty = match expr.ty().as_tensor().map(|t| t.component) {
                    Some(kind) => self.scalar_type(kind),
                    None => internal_error!("unary over non-tensor"),
                };
                let destination = self.builder().create_register(ty);
                self.push(Instruction::Unary {
                    operator: *op,
                    destination,
                    operand: value,
                });
                Operand::Register(destination)
            }
            ExprKind::Binary { op, a, b } => {
                if !a.ty().is_scalar() || !b.ty().is_scalar() {
                    internal_error!("binary {op} over non-scalar operands must be lowered first");
                }
                let component = a
                    .ty()
                    .as_tensor()
                    .map(|t| t.component)
                    .unwrap_or_else(|| internal_error!("binary over non-tensor"));
                if *op == BinaryOperator::Div && component == ScalarKind::Int {
                    unsupported!("integer division");
                }
                let lhs = self.compile_expr(a);
                let rhs = self.compile_expr(b);
                let ty = if op.is_comparison() {
                    lir::Type::Bool
                } else {
                    self.scalar_type(component)
                };
                let destination = self.builder().create_register(ty);
                self.push(Instruction::Binary {
                    operator: *op,
                    destination,
                    lhs,
                    rhs,
                });
                Operand::Register(destination)
            }
            ExprKind::IndexedTensor { .. } => {
                internal_error!("unlowered indexed tensor reached code generation")
            }
            ExprKind::IndexExpr { .. } => {
                internal_error!("unlowered index expression reached code generation")
            }
            ExprKind::TensorRead { .. } => {
                internal_error!("unlowered tensor read reached code generation")
            }
            ExprKind::TupleRead { .. } => unsupported!("tuple reads in the backend"),
        }
    }

    fn compile_literal(&mut self, data: &LiteralData, ty: &Type) -> Operand {
        let tensor = ty
            .as_tensor()
            .unwrap_or_else(|| internal_error!("only tensor literals are supported"));
        if tensor.is_scalar() {
            return Operand::Immediate(match data {
                LiteralData::Int(v) => Immediate::Int(v[0]),
                LiteralData::Float(v) => Immediate::Float(v[0]),
                LiteralData::Boolean(v) => Immediate::Bool(v[0]),
            });
        }

        // Dense tensor literals are materialized into a frame buffer.
        let component = self.component(tensor.component);
        let ptr = self.builder().create_register(lir::Type::Ptr(component));
        self.push(Instruction::Alloca {
            destination: ptr,
            component,
            len: Operand::int(data.len() as i64),
        });
        for index in 0..data.len() {
            let value = match data {
                LiteralData::Int(v) => Immediate::Int(v[index]),
                LiteralData::Float(v) => Immediate::Float(v[index]),
                LiteralData::Boolean(v) => Immediate::Bool(v[index]),
            };
            self.push(Instruction::Store {
                component,
                ptr: Operand::Register(ptr),
                index: Operand::int(index as i64),
                value: Operand::Immediate(value),
            });
        }
        Operand::Register(ptr)
    }

    fn compile_var_expr(&mut self, var: &Var) -> Operand {
        let operand = *self.symtable.get(&var.name).unwrap_or_else(|| {
            internal_error!("{var} not found in symbol table:\n{}", self.symtable)
        });

        // Scalars kept behind a pointer (stack slots) are loaded here; loop
        // induction variables live in plain registers, which is why a
        // scalar symbol is not always a pointer.
        if var.ty.is_scalar() {
            if let Some(component) = self.builder().pointer_component(&operand) {
                return self.emit_load(operand, Operand::int(0), component);
            }
        }
        operand
    }

    fn emit_load(&mut self, ptr: Operand, index: Operand, component: Component) -> Operand {
        let ty = self.register_type_of(component);
        let destination = self.builder().create_register(ty);
        self.push(Instruction::Load {
            destination,
            component,
            ptr,
            index,
        });
        Operand::Register(destination)
    }

    fn emit_extract(&mut self, record: Operand, slot: usize, component: Component) -> Operand {
        let ty = if slot == SET_CARDINALITY_SLOT {
            lir::Type::Int
        } else {
            lir::Type::Ptr(component)
        };
        let destination = self.builder().create_register(ty);
        self.push(Instruction::ExtractField {
            destination,
            record,
            slot,
        });
        Operand::Register(destination)
    }

    fn emit_field_read(&mut self, elem_or_set: &Expr, field: &str) -> Operand {
        let record = self.compile_expr(&elem_or_set.clone());
        let (element, offset) = match &**elem_or_set.ty() {
            TypeKind::Element(e) => (e.clone(), 0),
            TypeKind::Set(s) => (s.element_type().clone(), set_fields_offset(s)),
            other => internal_error!("field read of non-element, non-set value of type {other}"),
        };
        let index = element
            .field_index(field)
            .unwrap_or_else(|| internal_error!("element {} has no field {field}", element.name));
        let field_component = self.component(element.fields[index].1.component);
        self.emit_extract(record, offset + index, field_component)
    }

    fn emit_float_binary(&mut self, op: BinaryOperator, lhs: Operand, rhs: Operand) -> Operand {
        let destination = self.builder().create_register(lir::Type::Float);
        self.push(Instruction::Binary {
            operator: op,
            destination,
            lhs,
            rhs,
        });
        Operand::Register(destination)
    }

    fn emit_square_sum_3(&mut self, v: Operand, component: Component) -> Operand {
        let mut sum: Option<Operand> = None;
        for i in 0..3 {
            let x = self.emit_load(v, Operand::int(i), component);
            let square = self.emit_float_binary(BinaryOperator::Mul, x, x);
            sum = Some(match sum {
                None => square,
                Some(acc) => self.emit_float_binary(BinaryOperator::Add, acc, square),
            });
        }
        sum.unwrap()
    }

    /// Integer multiply with immediate folding, used for length and byte
    /// size computations.
    fn emit_mul_int(&mut self, a: Operand, b: Operand) -> Operand {
        if let (Operand::Immediate(Immediate::Int(x)), Operand::Immediate(Immediate::Int(y))) =
            (&a, &b)
        {
            return Operand::Immediate(Immediate::Int(x * y));
        }
        let destination = self.builder().create_register(lir::Type::Int);
        self.push(Instruction::Binary {
            operator: BinaryOperator::Mul,
            destination,
            lhs: a,
            rhs: b,
        });
        Operand::Register(destination)
    }

    /* The tensor-length algorithm */

    /// Emits the element count of a tensor under its storage arrangement.
    pub fn emit_compute_len(
        &mut self,
        tensor: &TensorType,
        storage: &TensorStorage,
    ) -> Operand {
        if tensor.order() == 0 {
            return Operand::int(1);
        }
        match storage {
            TensorStorage::DenseRowMajor => {
                let dims = tensor.dimensions.clone();
                let mut len = self.emit_compute_len_domain(&dims[0]);
                for dim in &dims[1..] {
                    let dim_len = self.emit_compute_len_domain(dim);
                    len = self.emit_mul_int(len, dim_len);
                }
                len
            }
            TensorStorage::SystemDiagonal => {
                // One outer dimension suffices: diagonal implies square.
                let outer = tensor.outer_dimensions()[0].clone();
                let mut len = self.emit_compute_len_index_set(&outer);
                let block = tensor.block_type();
                let block_len = self.emit_compute_len(&block, &TensorStorage::DenseRowMajor);
                len = self.emit_mul_int(len, block_len);
                len
            }
            TensorStorage::SystemReduced {
                target_set,
                storage_set,
            } => {
                // The number of stored blocks sits one past the last real
                // entry of the target set's neighbor-start array, at the
                // position given by the storage set's cardinality.
                let storage_record = self.compile_expr(&storage_set.clone());
                let cardinality = self.emit_extract(storage_record, SET_CARDINALITY_SLOT, Component::Int);
                let target_record = self.compile_expr(&target_set.clone());
                let neighbors_start =
                    self.emit_extract(target_record, SET_NEIGHBORS_START_SLOT, Component::Int);
                let mut len = self.emit_load(neighbors_start, cardinality, Component::Int);

                let block = tensor.block_type();
                if !block.is_scalar() {
                    let block_len =
                        self.emit_compute_len(&block, &TensorStorage::DenseRowMajor);
                    len = self.emit_mul_int(len, block_len);
                }
                len
            }
            TensorStorage::Undefined | TensorStorage::SystemNone => {
                internal_error!("cannot compute the length of a tensor with {storage} storage")
            }
        }
    }

    fn emit_compute_len_domain(&mut self, domain: &IndexDomain) -> Operand {
        let sets = domain.index_sets().to_vec();
        let mut len = self.emit_compute_len_index_set(&sets[0]);
        for index_set in &sets[1..] {
            let set_len = self.emit_compute_len_index_set(index_set);
            len = self.emit_mul_int(len, set_len);
        }
        len
    }

    fn emit_compute_len_index_set(&mut self, index_set: &IndexSet) -> Operand {
        match index_set {
            IndexSet::Range(n) => Operand::int(*n),
            IndexSet::Set(set_expr) => {
                // The cardinality sits in slot 0 of the set's value.
                let record = self.compile_expr(&set_expr.clone());
                self.emit_extract(record, SET_CARDINALITY_SLOT, Component::Int)
            }
            IndexSet::Single => internal_error!("cannot compute the length of a single index"),
            IndexSet::Dynamic => unsupported!("length of a dynamic index set"),
        }
    }
}

/// Rejects non-rectangular shapes: a tensor printed as rows must hold an
/// exact number of them.
fn rectangular_row_width(total: i64, columns: i64) -> i64 {
    if columns <= 0 || total % columns != 0 {
        unsupported!(
            "cannot print a non-rectangular tensor ({total} elements in rows of {columns})"
        );
    }
    columns
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::backend::vm::{self, ExecutionContext, Value};
    use crate::ir::types::Type;

    #[test]
    fn rectangular_check_accepts_exact_rows() {
        assert_eq!(rectangular_row_width(12, 4), 4);
    }

    #[test]
    #[should_panic(expected = "non-rectangular")]
    fn rectangular_check_rejects_ragged_shapes() {
        let _ = rectangular_row_width(13, 4);
    }

    fn fresh_codegen(options: &CodegenOptions) -> Codegen<'_> {
        let mut codegen = Codegen::new(options, lir::Module::new("test"));
        codegen.func = Some(FunctionBuilder::new("test", true));
        codegen
    }

    fn tensor_of(ty: &Type) -> TensorType {
        ty.as_tensor().unwrap().clone()
    }

    #[test]
    fn scalar_length_is_one() {
        let options = CodegenOptions::default();
        let mut codegen = fresh_codegen(&options);
        let len = codegen.emit_compute_len(
            &tensor_of(&Type::scalar(ScalarKind::Float)),
            &TensorStorage::DenseRowMajor,
        );
        assert_eq!(len, Operand::int(1));
    }

    #[test]
    fn dense_length_is_the_dimension_product() {
        let options = CodegenOptions::default();
        let mut codegen = fresh_codegen(&options);
        let ty = Type::tensor(
            ScalarKind::Float,
            vec![IndexSet::Range(3).into(), IndexSet::Range(4).into()],
        );
        let len = codegen.emit_compute_len(&tensor_of(&ty), &TensorStorage::DenseRowMajor);
        assert_eq!(len, Operand::int(12));
    }

    #[test]
    fn diagonal_length_is_outer_dimension_times_block() {
        let options = CodegenOptions::default();
        let mut codegen = fresh_codegen(&options);

        // 3x3 with scalar blocks: length is just the outer dimension.
        let scalar_blocks = Type::tensor(
            ScalarKind::Float,
            vec![IndexSet::Range(3).into(), IndexSet::Range(3).into()],
        );
        let len = codegen
            .emit_compute_len(&tensor_of(&scalar_blocks), &TensorStorage::SystemDiagonal);
        assert_eq!(len, Operand::int(3));

        // 3x3 of 2x2 blocks: one block per diagonal entry.
        let blocked = Type::tensor(
            ScalarKind::Float,
            vec![
                IndexDomain::new(vec![IndexSet::Range(3), IndexSet::Range(2)]),
                IndexDomain::new(vec![IndexSet::Range(3), IndexSet::Range(2)]),
            ],
        );
        let len = codegen.emit_compute_len(&tensor_of(&blocked), &TensorStorage::SystemDiagonal);
        assert_eq!(len, Operand::int(12));
    }

    #[test]
    #[should_panic(expected = "internal compiler error")]
    fn undefined_storage_has_no_length() {
        let options = CodegenOptions::default();
        let mut codegen = fresh_codegen(&options);
        let ty = Type::tensor(ScalarKind::Float, vec![IndexSet::Range(3).into()]);
        let _ = codegen.emit_compute_len(&tensor_of(&ty), &TensorStorage::Undefined);
    }

    /// Emits a function `(points, edges) -> (n: int)` that stores the
    /// computed length of a tensor with the given storage, then runs it
    /// against hand-built set records.
    fn run_length_program(tensor: &TensorType, storage: &TensorStorage) -> i32 {
        let points = Var::new("points", Type::set(Type::element("Point", vec![]), vec![]));
        let edges_element = Type::element("Spring", vec![]);
        let edges = Var::new(
            "edges",
            Type::set(
                edges_element,
                vec![Expr::var(points.clone()), Expr::var(points.clone())],
            ),
        );
        let n = Var::new("n", Type::scalar(ScalarKind::Int));

        let options = CodegenOptions::default();
        let mut codegen = Codegen::new(&options, lir::Module::new("test"));
        codegen.symtable.scope();
        codegen.emit_shell("length", &[points, edges], &[n.clone()], true);
        let len = codegen.emit_compute_len(tensor, storage);
        codegen.store_scalar_result(&n, len);
        codegen.finish_function();
        let module = codegen.module;

        let mut ctx = ExecutionContext::new(0);
        // Three points, four edges; the CSR index over the points holds
        // seven neighbor pairs.
        let neighbors_start = ctx.memory.alloc(4 * 4);
        for (i, v) in [0, 2, 5, 7].iter().enumerate() {
            ctx.memory
                .write(Component::Int, neighbors_start, i as i64, &Value::Int(*v));
        }
        let neighbors = ctx.memory.alloc(7 * 4);
        let endpoints = ctx.memory.alloc(8 * 4);
        let points_record = Value::Fields(Rc::new(vec![Value::Int(3)]));
        let edges_record = Value::Fields(Rc::new(vec![
            Value::Int(4),
            Value::Ptr(endpoints),
            Value::Ptr(neighbors_start),
            Value::Ptr(neighbors),
        ]));
        let out = ctx.memory.alloc(4);
        vm::execute(
            &module,
            "length",
            &[points_record, edges_record, Value::Ptr(out)],
            &mut ctx,
        );
        ctx.memory.read(Component::Int, out, 0).as_int()
    }

    fn points_expr() -> Expr {
        Expr::var(Var::new(
            "points",
            Type::set(Type::element("Point", vec![]), vec![]),
        ))
    }

    fn edges_expr() -> Expr {
        let points = Var::new("points", Type::set(Type::element("Point", vec![]), vec![]));
        Expr::var(Var::new(
            "edges",
            Type::set(
                Type::element("Spring", vec![]),
                vec![Expr::var(points.clone()), Expr::var(points)],
            ),
        ))
    }

    #[test]
    fn sparse_length_reads_the_neighbor_index() {
        // A points x points system matrix with scalar blocks: the length is
        // the neighbor count stored one past the last row, here 7.
        let dim = IndexDomain::from(IndexSet::Set(points_expr()));
        let tensor = tensor_of(&Type::tensor(
            ScalarKind::Float,
            vec![dim.clone(), dim],
        ));
        let storage = TensorStorage::SystemReduced {
            target_set: edges_expr(),
            storage_set: points_expr(),
        };
        assert_eq!(run_length_program(&tensor, &storage), 7);
    }

    #[test]
    fn sparse_length_scales_by_block_size() {
        let dim = IndexDomain::new(vec![IndexSet::Set(points_expr()), IndexSet::Range(2)]);
        let tensor = tensor_of(&Type::tensor(
            ScalarKind::Float,
            vec![dim.clone(), dim],
        ));
        let storage = TensorStorage::SystemReduced {
            target_set: edges_expr(),
            storage_set: points_expr(),
        };
        assert_eq!(run_length_program(&tensor, &storage), 28);
    }

    #[test]
    fn dense_length_over_a_runtime_set_reads_its_cardinality() {
        let dim = IndexDomain::from(IndexSet::Set(points_expr()));
        let tensor = tensor_of(&Type::tensor(ScalarKind::Float, vec![dim]));
        assert_eq!(
            run_length_program(&tensor, &TensorStorage::DenseRowMajor),
            3
        );
    }
}
