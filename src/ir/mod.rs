//! The typed intermediate representation the backend consumes.
//!
//! Expressions and statements are immutable, reference-counted trees: the
//! same subexpression may be referenced from several places (compound
//! assignment desugaring, for instance, rebuilds an add over a fresh read of
//! the same location), so nodes are shared rather than deep-copied. Every
//! expression carries its resolved type.
//!
//! By the time a function tree reaches code generation it must be fully
//! lowered: no `IndexExpr`, `IndexedTensor`, `TensorRead`, `TensorWrite` or
//! `Map` nodes survive. Those kinds still exist here because the analyses in
//! [`queries`] run before lowering finishes; the backend treats encountering
//! one as a fatal internal-consistency violation.

use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::diagnostics::internal_error;

pub mod queries;
pub mod storage;
pub mod types;
pub mod visit;

use storage::Storage;
use types::{IndexDomain, IndexSet, ScalarKind, Type, TypeKind};

/// A named, typed variable. Identity is by name and type value, never by
/// reference: two `Var`s with the same name and type are the same variable
/// wherever they appear.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Var {
    pub name: String,
    pub ty: Type,
}

impl Var {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

impl core::fmt::Display for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Dense component data of a tensor literal, in row-major order.
#[derive(Debug, Clone, PartialEq)]
pub enum LiteralData {
    Int(Vec<i32>),
    Float(Vec<f64>),
    Boolean(Vec<bool>),
}

impl LiteralData {
    pub fn len(&self) -> usize {
        match self {
            LiteralData::Int(v) => v.len(),
            LiteralData::Float(v) => v.len(),
            LiteralData::Boolean(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when every component is zero (`false` counts as zero).
    pub fn is_all_zero(&self) -> bool {
        match self {
            LiteralData::Int(v) => v.iter().all(|&x| x == 0),
            LiteralData::Float(v) => v.iter().all(|&x| x == 0.0),
            LiteralData::Boolean(v) => v.iter().all(|&x| !x),
        }
    }

    pub fn scalar_kind(&self) -> ScalarKind {
        match self {
            LiteralData::Int(_) => ScalarKind::Int,
            LiteralData::Float(_) => ScalarKind::Float,
            LiteralData::Boolean(_) => ScalarKind::Boolean,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum UnaryOperator {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BinaryOperator {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
    Xor,
}

impl BinaryOperator {
    pub fn is_comparison(self) -> bool {
        use BinaryOperator::*;
        matches!(self, Eq | Ne | Gt | Lt | Ge | Le)
    }

    pub fn is_logical(self) -> bool {
        use BinaryOperator::*;
        matches!(self, And | Or | Xor)
    }
}

/// The compound part of `x op= v`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOperator {
    None,
    Add,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReductionOperator {
    Sum,
}

/// An index variable of an index expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexVar {
    pub name: String,
    pub domain: IndexDomain,
    pub kind: IndexVarKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexVarKind {
    Free,
    Reduction(ReductionOperator),
}

impl IndexVar {
    pub fn free(name: impl Into<String>, domain: IndexDomain) -> Self {
        Self {
            name: name.into(),
            domain,
            kind: IndexVarKind::Free,
        }
    }

    pub fn reduction(name: impl Into<String>, domain: IndexDomain) -> Self {
        Self {
            name: name.into(),
            domain,
            kind: IndexVarKind::Reduction(ReductionOperator::Sum),
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self.kind, IndexVarKind::Free)
    }

    pub fn is_reduction(&self) -> bool {
        matches!(self.kind, IndexVarKind::Reduction(_))
    }
}

/// Which connectivity array of an edge set to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexReadKind {
    Endpoints,
    NeighborsStart,
    Neighbors,
}

#[derive(Debug)]
pub struct ExprNode {
    pub kind: ExprKind,
    pub ty: Type,
}

/// A shared handle to an expression node.
#[derive(Debug, Clone)]
pub struct Expr(Rc<ExprNode>);

#[derive(Debug)]
pub enum ExprKind {
    Literal(LiteralData),
    VarExpr(Var),
    FieldRead {
        elem_or_set: Expr,
        field: String,
    },
    /// The cardinality of an index set.
    Length(IndexSet),
    /// A connectivity array of an edge set.
    IndexRead {
        edge_set: Expr,
        kind: IndexReadKind,
    },
    /// A flat read out of a tensor buffer.
    Load {
        buffer: Expr,
        index: Expr,
    },
    Unary {
        op: UnaryOperator,
        operand: Expr,
    },
    Binary {
        op: BinaryOperator,
        a: Expr,
        b: Expr,
    },
    /// Pre-lowering form: a tensor indexed by index variables.
    IndexedTensor {
        tensor: Expr,
        index_vars: Vec<IndexVar>,
    },
    /// Pre-lowering form: an index expression over free/reduction variables.
    IndexExpr {
        result_vars: Vec<IndexVar>,
        body: Expr,
    },
    /// Pre-lowering form: a tensor read with per-dimension index expressions.
    TensorRead {
        tensor: Expr,
        indices: Vec<Expr>,
    },
    /// A read out of a tuple.
    TupleRead {
        tuple: Expr,
        index: Expr,
    },
}

impl Expr {
    pub fn new(kind: ExprKind, ty: Type) -> Self {
        Self(Rc::new(ExprNode { kind, ty }))
    }

    pub fn kind(&self) -> &ExprKind {
        &self.0.kind
    }

    pub fn ty(&self) -> &Type {
        &self.0.ty
    }

    /* Literals */

    pub fn int(value: i32) -> Self {
        Self::new(
            ExprKind::Literal(LiteralData::Int(vec![value])),
            Type::scalar(ScalarKind::Int),
        )
    }

    pub fn float(value: f64) -> Self {
        Self::new(
            ExprKind::Literal(LiteralData::Float(vec![value])),
            Type::scalar(ScalarKind::Float),
        )
    }

    pub fn boolean(value: bool) -> Self {
        Self::new(
            ExprKind::Literal(LiteralData::Boolean(vec![value])),
            Type::scalar(ScalarKind::Boolean),
        )
    }

    pub fn literal(data: LiteralData, ty: Type) -> Self {
        let tensor = ty
            .as_tensor()
            .unwrap_or_else(|| internal_error!("literals must have tensor type, got {ty}"));
        if let Some(size) = tensor.static_size() {
            if size as usize != data.len() {
                internal_error!(
                    "literal component count {} does not match type {ty} (size {size})",
                    data.len()
                );
            }
        }
        Self::new(ExprKind::Literal(data), ty)
    }

    pub fn var(var: Var) -> Self {
        let ty = var.ty.clone();
        Self::new(ExprKind::VarExpr(var), ty)
    }

    /* Reads */

    pub fn field_read(elem_or_set: Expr, field: impl Into<String>) -> Self {
        let field = field.into();
        let element = match &**elem_or_set.ty() {
            TypeKind::Element(e) => e.clone(),
            TypeKind::Set(s) => s.element_type().clone(),
            other => internal_error!("field read of non-element, non-set value of type {other}"),
        };
        let field_ty = element.field_type(&field).unwrap_or_else(|| {
            internal_error!("element {} has no field {field}", element.name)
        });
        let mut ty = field_ty.clone();
        // Reading a field off a whole set yields the field over every element.
        if elem_or_set.ty().is_set() {
            let mut dims = vec![IndexDomain::from(IndexSet::Set(elem_or_set.clone()))];
            dims.extend(ty.dimensions);
            ty.dimensions = dims;
        }
        Self::new(
            ExprKind::FieldRead { elem_or_set, field },
            Type::new(TypeKind::Tensor(ty)),
        )
    }

    pub fn length(index_set: IndexSet) -> Self {
        Self::new(ExprKind::Length(index_set), Type::scalar(ScalarKind::Int))
    }

    pub fn index_read(edge_set: Expr, kind: IndexReadKind) -> Self {
        if !edge_set.ty().is_set() {
            internal_error!("index read of non-set value of type {}", edge_set.ty());
        }
        let ty = Type::tensor(
            ScalarKind::Int,
            vec![IndexDomain::from(IndexSet::Set(edge_set.clone()))],
        );
        Self::new(ExprKind::IndexRead { edge_set, kind }, ty)
    }

    pub fn load(buffer: Expr, index: Expr) -> Self {
        let component = buffer
            .ty()
            .as_tensor()
            .unwrap_or_else(|| internal_error!("load from non-tensor of type {}", buffer.ty()))
            .component;
        Self::new(
            ExprKind::Load { buffer, index },
            Type::scalar(component),
        )
    }

    /* Operators */

    pub fn unary(op: UnaryOperator, operand: Expr) -> Self {
        let ty = operand.ty().clone();
        Self::new(ExprKind::Unary { op, operand }, ty)
    }

    pub fn neg(operand: Expr) -> Self {
        Self::unary(UnaryOperator::Neg, operand)
    }

    pub fn not(operand: Expr) -> Self {
        Self::unary(UnaryOperator::Not, operand)
    }

    pub fn binary(op: BinaryOperator, a: Expr, b: Expr) -> Self {
        if a.ty() != b.ty() {
            internal_error!(
                "operand types of `{op}` don't match: {} vs {}",
                a.ty(),
                b.ty()
            );
        }
        let ty = if op.is_comparison() {
            Type::scalar(ScalarKind::Boolean)
        } else {
            a.ty().clone()
        };
        Self::new(ExprKind::Binary { op, a, b }, ty)
    }

    pub fn add(a: Expr, b: Expr) -> Self {
        Self::binary(BinaryOperator::Add, a, b)
    }

    pub fn sub(a: Expr, b: Expr) -> Self {
        Self::binary(BinaryOperator::Sub, a, b)
    }

    pub fn mul(a: Expr, b: Expr) -> Self {
        Self::binary(BinaryOperator::Mul, a, b)
    }

    pub fn div(a: Expr, b: Expr) -> Self {
        Self::binary(BinaryOperator::Div, a, b)
    }

    pub fn lt(a: Expr, b: Expr) -> Self {
        Self::binary(BinaryOperator::Lt, a, b)
    }

    pub fn eq(a: Expr, b: Expr) -> Self {
        Self::binary(BinaryOperator::Eq, a, b)
    }

    /* Pre-lowering forms */

    pub fn indexed_tensor(tensor: Expr, index_vars: Vec<IndexVar>) -> Self {
        let component = tensor
            .ty()
            .as_tensor()
            .unwrap_or_else(|| internal_error!("indexed non-tensor of type {}", tensor.ty()))
            .component;
        Self::new(
            ExprKind::IndexedTensor { tensor, index_vars },
            Type::scalar(component),
        )
    }

    pub fn index_expr(result_vars: Vec<IndexVar>, body: Expr) -> Self {
        let component = body
            .ty()
            .as_tensor()
            .unwrap_or_else(|| internal_error!("index expression over non-tensor body"))
            .component;
        let dims = result_vars.iter().map(|iv| iv.domain.clone()).collect();
        let ty = Type::tensor(component, dims);
        Self::new(ExprKind::IndexExpr { result_vars, body }, ty)
    }
}

/// Shallow structural equality: two expressions are equal when they are the
/// same node, or both reference a variable of the same name. This is what
/// makes index-set and storage descriptors comparable across functions
/// without deep tree comparison.
impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        match (self.kind(), other.kind()) {
            (ExprKind::VarExpr(a), ExprKind::VarExpr(b)) => a.name == b.name,
            _ => false,
        }
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.kind() {
            ExprKind::VarExpr(v) => v.name.hash(state),
            _ => (Rc::as_ptr(&self.0) as usize).hash(state),
        }
    }
}

/// The iteration domain of a counted `For` loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForDomain {
    /// All indices of an index set.
    IndexSet(IndexSet),
    /// The endpoints of an edge. Rewritten away before code generation.
    Endpoints { edge_set: Expr, edge: Var },
    /// The edges incident to an element. Rewritten away before codegen.
    Edges { set: Expr, element: Var },
    /// The neighbors of an element. Rewritten away before codegen.
    Neighbors { set: Expr, element: Var },
    /// The diagonal of a system matrix. Rewritten away before codegen.
    Diagonal,
}

#[derive(Debug)]
pub struct StmtNode {
    pub kind: StmtKind,
}

/// A shared handle to a statement node.
#[derive(Debug, Clone)]
pub struct Stmt(Rc<StmtNode>);

#[derive(Debug)]
pub enum StmtKind {
    VarDecl {
        var: Var,
    },
    Assign {
        var: Var,
        value: Expr,
        cop: CompoundOperator,
    },
    /// A flat write into a tensor buffer.
    Store {
        buffer: Expr,
        index: Expr,
        value: Expr,
        cop: CompoundOperator,
    },
    FieldWrite {
        elem_or_set: Expr,
        field: String,
        value: Expr,
        cop: CompoundOperator,
    },
    Call {
        results: Vec<Var>,
        callee: Func,
        actuals: Vec<Expr>,
    },
    For {
        var: Var,
        domain: ForDomain,
        body: Stmt,
    },
    ForRange {
        var: Var,
        start: Expr,
        end: Expr,
        body: Stmt,
    },
    While {
        condition: Expr,
        body: Stmt,
    },
    IfThenElse {
        condition: Expr,
        then_body: Stmt,
        else_body: Option<Stmt>,
    },
    Block(Vec<Stmt>),
    /// Opens a fresh symbol-table scope around the inner statement.
    Scope(Stmt),
    Pass,
    Print {
        expr: Expr,
    },
    /// Pre-lowering form: a tensor write with per-dimension indices.
    TensorWrite {
        tensor: Expr,
        indices: Vec<Expr>,
        value: Expr,
        cop: CompoundOperator,
    },
    /// Pre-lowering form: a map of a function over a set.
    Map {
        vars: Vec<Var>,
        function: Func,
        target: Expr,
        reduction: Option<ReductionOperator>,
    },
}

impl Stmt {
    pub fn new(kind: StmtKind) -> Self {
        Self(Rc::new(StmtNode { kind }))
    }

    pub fn kind(&self) -> &StmtKind {
        &self.0.kind
    }

    pub fn var_decl(var: Var) -> Self {
        Self::new(StmtKind::VarDecl { var })
    }

    pub fn assign(var: Var, value: Expr) -> Self {
        Self::assign_cop(var, value, CompoundOperator::None)
    }

    pub fn assign_cop(var: Var, value: Expr, cop: CompoundOperator) -> Self {
        Self::new(StmtKind::Assign { var, value, cop })
    }

    pub fn store(buffer: Expr, index: Expr, value: Expr) -> Self {
        Self::new(StmtKind::Store {
            buffer,
            index,
            value,
            cop: CompoundOperator::None,
        })
    }

    pub fn store_cop(buffer: Expr, index: Expr, value: Expr, cop: CompoundOperator) -> Self {
        Self::new(StmtKind::Store {
            buffer,
            index,
            value,
            cop,
        })
    }

    pub fn field_write(elem_or_set: Expr, field: impl Into<String>, value: Expr) -> Self {
        Self::new(StmtKind::FieldWrite {
            elem_or_set,
            field: field.into(),
            value,
            cop: CompoundOperator::None,
        })
    }

    pub fn call(results: Vec<Var>, callee: Func, actuals: Vec<Expr>) -> Self {
        Self::new(StmtKind::Call {
            results,
            callee,
            actuals,
        })
    }

    pub fn for_loop(var: Var, domain: ForDomain, body: Stmt) -> Self {
        Self::new(StmtKind::For { var, domain, body })
    }

    pub fn for_range(var: Var, start: Expr, end: Expr, body: Stmt) -> Self {
        Self::new(StmtKind::ForRange {
            var,
            start,
            end,
            body,
        })
    }

    pub fn while_loop(condition: Expr, body: Stmt) -> Self {
        Self::new(StmtKind::While { condition, body })
    }

    pub fn if_then(condition: Expr, then_body: Stmt) -> Self {
        Self::new(StmtKind::IfThenElse {
            condition,
            then_body,
            else_body: None,
        })
    }

    pub fn if_then_else(condition: Expr, then_body: Stmt, else_body: Stmt) -> Self {
        Self::new(StmtKind::IfThenElse {
            condition,
            then_body,
            else_body: Some(else_body),
        })
    }

    pub fn block(stmts: Vec<Stmt>) -> Self {
        Self::new(StmtKind::Block(stmts))
    }

    pub fn scope(inner: Stmt) -> Self {
        Self::new(StmtKind::Scope(inner))
    }

    pub fn pass() -> Self {
        Self::new(StmtKind::Pass)
    }

    pub fn print(expr: Expr) -> Self {
        Self::new(StmtKind::Print { expr })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FuncKind {
    /// Has a body and is emitted by the backend.
    Internal,
    /// A builtin dispatched specially at call sites.
    Intrinsic,
    /// Declared but defined outside the module.
    External,
}

/// Global constant bindings available to a function body.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub constants: Vec<(Var, Expr)>,
}

#[derive(Debug)]
struct FuncContent {
    name: String,
    arguments: Vec<Var>,
    results: Vec<Var>,
    body: Option<Stmt>,
    kind: FuncKind,
    environment: Environment,
    storage: Storage,
}

/// A named, typed, callable unit. Funcs are shared handles; two handles
/// denote the same function when their names and kinds agree (function
/// names are globally unique within a program).
#[derive(Debug, Clone)]
pub struct Func(Rc<FuncContent>);

impl Func {
    pub fn new(
        name: impl Into<String>,
        arguments: Vec<Var>,
        results: Vec<Var>,
        body: Stmt,
    ) -> Self {
        Self(Rc::new(FuncContent {
            name: name.into(),
            arguments,
            results,
            body: Some(body),
            kind: FuncKind::Internal,
            environment: Environment::default(),
            storage: Storage::new(),
        }))
    }

    pub fn intrinsic(name: impl Into<String>, arguments: Vec<Var>, results: Vec<Var>) -> Self {
        Self(Rc::new(FuncContent {
            name: name.into(),
            arguments,
            results,
            body: None,
            kind: FuncKind::Intrinsic,
            environment: Environment::default(),
            storage: Storage::new(),
        }))
    }

    pub fn external(name: impl Into<String>, arguments: Vec<Var>, results: Vec<Var>) -> Self {
        Self(Rc::new(FuncContent {
            name: name.into(),
            arguments,
            results,
            body: None,
            kind: FuncKind::External,
            environment: Environment::default(),
            storage: Storage::new(),
        }))
    }

    /// Rebuilds this function with the given storage table.
    pub fn with_storage(&self, storage: Storage) -> Self {
        Self(Rc::new(FuncContent {
            name: self.0.name.clone(),
            arguments: self.0.arguments.clone(),
            results: self.0.results.clone(),
            body: self.0.body.clone(),
            kind: self.0.kind,
            environment: self.0.environment.clone(),
            storage,
        }))
    }

    /// Rebuilds this function with the given constant environment.
    pub fn with_environment(&self, environment: Environment) -> Self {
        Self(Rc::new(FuncContent {
            name: self.0.name.clone(),
            arguments: self.0.arguments.clone(),
            results: self.0.results.clone(),
            body: self.0.body.clone(),
            kind: self.0.kind,
            environment,
            storage: self.0.storage.clone(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn arguments(&self) -> &[Var] {
        &self.0.arguments
    }

    pub fn results(&self) -> &[Var] {
        &self.0.results
    }

    pub fn body(&self) -> Option<&Stmt> {
        self.0.body.as_ref()
    }

    pub fn kind(&self) -> FuncKind {
        self.0.kind
    }

    pub fn environment(&self) -> &Environment {
        &self.0.environment
    }

    pub fn storage(&self) -> &Storage {
        &self.0.storage
    }
}

impl PartialEq for Func {
    fn eq(&self, other: &Self) -> bool {
        self.0.name == other.0.name && self.0.kind == other.0.kind
    }
}

impl Eq for Func {}

impl Hash for Func {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.name.hash(state);
        self.0.kind.hash(state);
    }
}

impl core::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            ExprKind::Literal(data) => match data {
                LiteralData::Int(v) if v.len() == 1 => write!(f, "{}", v[0]),
                LiteralData::Float(v) if v.len() == 1 => write!(f, "{}", v[0]),
                LiteralData::Boolean(v) if v.len() == 1 => write!(f, "{}", v[0]),
                _ => write!(f, "<{} components>", data.len()),
            },
            ExprKind::VarExpr(v) => write!(f, "{v}"),
            ExprKind::FieldRead { elem_or_set, field } => write!(f, "{elem_or_set}.{field}"),
            ExprKind::Length(is) => write!(f, "length({is})"),
            ExprKind::IndexRead { edge_set, kind } => {
                let name = match kind {
                    IndexReadKind::Endpoints => "endpoints",
                    IndexReadKind::NeighborsStart => "neighbors.start",
                    IndexReadKind::Neighbors => "neighbors",
                };
                write!(f, "{edge_set}.{name}")
            }
            ExprKind::Load { buffer, index } => write!(f, "{buffer}[{index}]"),
            ExprKind::Unary { op, operand } => match op {
                UnaryOperator::Neg => write!(f, "-{operand}"),
                UnaryOperator::Not => write!(f, "not {operand}"),
            },
            ExprKind::Binary { op, a, b } => {
                let symbol = match op {
                    BinaryOperator::Add => "+",
                    BinaryOperator::Sub => "-",
                    BinaryOperator::Mul => "*",
                    BinaryOperator::Div => "/",
                    BinaryOperator::Rem => "%",
                    BinaryOperator::Eq => "==",
                    BinaryOperator::Ne => "!=",
                    BinaryOperator::Gt => ">",
                    BinaryOperator::Lt => "<",
                    BinaryOperator::Ge => ">=",
                    BinaryOperator::Le => "<=",
                    BinaryOperator::And => "and",
                    BinaryOperator::Or => "or",
                    BinaryOperator::Xor => "xor",
                };
                write!(f, "({a} {symbol} {b})")
            }
            ExprKind::IndexedTensor { tensor, index_vars } => {
                write!(f, "{tensor}(")?;
                for (i, iv) in index_vars.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", iv.name)?;
                }
                write!(f, ")")
            }
            ExprKind::IndexExpr { result_vars, body } => {
                write!(f, "[")?;
                for (i, iv) in result_vars.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", iv.name)?;
                }
                write!(f, "] {body}")
            }
            ExprKind::TensorRead { tensor, indices } => {
                write!(f, "{tensor}(")?;
                for (i, idx) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{idx}")?;
                }
                write!(f, ")")
            }
            ExprKind::TupleRead { tuple, index } => write!(f, "{tuple}({index})"),
        }
    }
}

impl core::fmt::Display for Stmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.fmt_indented(f, 0)
    }
}

impl Stmt {
    fn fmt_indented(&self, f: &mut std::fmt::Formatter<'_>, level: usize) -> std::fmt::Result {
        let pad = "  ".repeat(level);
        match self.kind() {
            StmtKind::VarDecl { var } => writeln!(f, "{pad}var {var} : {};", var.ty),
            StmtKind::Assign { var, value, cop } => match cop {
                CompoundOperator::None => writeln!(f, "{pad}{var} = {value};"),
                CompoundOperator::Add => writeln!(f, "{pad}{var} += {value};"),
            },
            StmtKind::Store {
                buffer,
                index,
                value,
                cop,
            } => match cop {
                CompoundOperator::None => writeln!(f, "{pad}{buffer}[{index}] = {value};"),
                CompoundOperator::Add => writeln!(f, "{pad}{buffer}[{index}] += {value};"),
            },
            StmtKind::FieldWrite {
                elem_or_set,
                field,
                value,
                cop,
            } => match cop {
                CompoundOperator::None => writeln!(f, "{pad}{elem_or_set}.{field} = {value};"),
                CompoundOperator::Add => writeln!(f, "{pad}{elem_or_set}.{field} += {value};"),
            },
            StmtKind::Call {
                results,
                callee,
                actuals,
            } => {
                write!(f, "{pad}")?;
                for (i, r) in results.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{r}")?;
                }
                if !results.is_empty() {
                    write!(f, " = ")?;
                }
                write!(f, "{}(", callee.name())?;
                for (i, a) in actuals.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                writeln!(f, ");")
            }
            StmtKind::For { var, domain, body } => {
                match domain {
                    ForDomain::IndexSet(is) => writeln!(f, "{pad}for {var} in {is}:")?,
                    ForDomain::Endpoints { edge_set, edge } => {
                        writeln!(f, "{pad}for {var} in endpoints({edge_set}, {edge}):")?
                    }
                    ForDomain::Edges { set, element } => {
                        writeln!(f, "{pad}for {var} in edges({set}, {element}):")?
                    }
                    ForDomain::Neighbors { set, element } => {
                        writeln!(f, "{pad}for {var} in neighbors({set}, {element}):")?
                    }
                    ForDomain::Diagonal => writeln!(f, "{pad}for {var} in diagonal:")?,
                }
                body.fmt_indented(f, level + 1)
            }
            StmtKind::ForRange {
                var,
                start,
                end,
                body,
            } => {
                writeln!(f, "{pad}for {var} in {start}:{end}:")?;
                body.fmt_indented(f, level + 1)
            }
            StmtKind::While { condition, body } => {
                writeln!(f, "{pad}while {condition}:")?;
                body.fmt_indented(f, level + 1)
            }
            StmtKind::IfThenElse {
                condition,
                then_body,
                else_body,
            } => {
                writeln!(f, "{pad}if {condition}:")?;
                then_body.fmt_indented(f, level + 1)?;
                if let Some(else_body) = else_body {
                    writeln!(f, "{pad}else:")?;
                    else_body.fmt_indented(f, level + 1)?;
                }
                Ok(())
            }
            StmtKind::Block(stmts) => {
                for stmt in stmts {
                    stmt.fmt_indented(f, level)?;
                }
                Ok(())
            }
            StmtKind::Scope(inner) => inner.fmt_indented(f, level),
            StmtKind::Pass => writeln!(f, "{pad}pass;"),
            StmtKind::Print { expr } => writeln!(f, "{pad}print {expr};"),
            StmtKind::TensorWrite {
                tensor,
                indices,
                value,
                ..
            } => {
                write!(f, "{pad}{tensor}(")?;
                for (i, idx) in indices.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{idx}")?;
                }
                writeln!(f, ") = {value};")
            }
            StmtKind::Map {
                vars,
                function,
                target,
                reduction,
            } => {
                write!(f, "{pad}")?;
                for (i, v) in vars.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                if !vars.is_empty() {
                    write!(f, " = ")?;
                }
                write!(f, "map {} to {target}", function.name())?;
                if reduction.is_some() {
                    write!(f, " reduce +")?;
                }
                writeln!(f, ";")
            }
        }
    }
}

impl core::fmt::Display for Func {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "func {}(", self.name())?;
        for (i, arg) in self.arguments().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} : {}", arg, arg.ty)?;
        }
        write!(f, ") -> (")?;
        for (i, res) in self.results().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} : {}", res, res.ty)?;
        }
        writeln!(f, ")")?;
        if let Some(body) = self.body() {
            body.fmt_indented(f, 1)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::types::*;
    use super::*;

    fn float_var(name: &str) -> Var {
        Var::new(name, Type::scalar(ScalarKind::Float))
    }

    #[test]
    fn vars_compare_by_name_and_type() {
        let a = float_var("x");
        let b = float_var("x");
        let c = Var::new("x", Type::scalar(ScalarKind::Int));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn binary_expr_checks_operand_types() {
        let e = Expr::add(Expr::float(1.0), Expr::float(2.0));
        assert!(e.ty().is_scalar());
        assert_eq!(e.ty().as_tensor().unwrap().component, ScalarKind::Float);
    }

    #[test]
    #[should_panic(expected = "internal compiler error")]
    fn binary_expr_rejects_mismatched_operands() {
        let _ = Expr::add(Expr::float(1.0), Expr::int(2));
    }

    #[test]
    fn comparison_yields_boolean() {
        let e = Expr::lt(Expr::float(1.0), Expr::float(2.0));
        assert_eq!(e.ty().as_tensor().unwrap().component, ScalarKind::Boolean);
    }

    #[test]
    fn var_exprs_compare_by_name() {
        let a = Expr::var(float_var("s"));
        let b = Expr::var(float_var("s"));
        assert_eq!(a, b);
        let c = Expr::float(1.0);
        let d = c.clone();
        assert_eq!(c, d);
        assert_ne!(a, c);
    }

    #[test]
    fn funcs_compare_by_name() {
        let body = Stmt::pass();
        let a = Func::new("f", vec![], vec![], body.clone());
        let b = Func::new("f", vec![], vec![], Stmt::pass());
        let c = Func::new("g", vec![], vec![], body);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn field_read_off_set_gains_set_dimension() {
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
        let set_ty = Type::set(element, vec![]);
        let points = Expr::var(Var::new("points", set_ty));
        let read = Expr::field_read(points, "mass");
        let tensor = read.ty().as_tensor().unwrap();
        assert_eq!(tensor.order(), 1);
    }

    #[test]
    fn literal_component_count_is_checked() {
        let ty = Type::tensor(ScalarKind::Float, vec![IndexSet::Range(3).into()]);
        let lit = Expr::literal(LiteralData::Float(vec![1.0, 2.0, 3.0]), ty);
        assert_eq!(lit.ty().as_tensor().unwrap().static_size(), Some(3));
    }

    #[test]
    fn stmt_display_renders_assignment() {
        let stmt = Stmt::assign(float_var("c"), Expr::add(
            Expr::var(float_var("a")),
            Expr::var(float_var("b")),
        ));
        assert_eq!(stmt.to_string(), "c = (a + b);\n");
    }
}
