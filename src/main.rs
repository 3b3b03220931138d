use clap::{error::ErrorKind, CommandFactory, Parser as ClapParser};

use tessc::backend::function::HostValue;
use tessc::backend::intrinsics::{self, Intrinsic};
use tessc::backend::{Backend, CodegenOptions};
use tessc::host::{DenseTensor, GraphSet};
use tessc::ir::storage::{Storage, TensorStorage};
use tessc::ir::types::{FloatWidth, IndexSet, ScalarKind, Type};
use tessc::ir::{Expr, Func, LiteralData, Stmt, Var};

#[derive(Debug, ClapParser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Demo program to compile and run (see --list)
    demo: Option<String>,

    /// Print the emitted low-level module before running
    #[arg(long)]
    emit_lir: bool,

    /// Compile floats at single precision
    #[arg(long)]
    float32: bool,

    /// List the available demo programs
    #[arg(long)]
    list: bool,
}

const DEMOS: &[&str] = &["add", "norm", "matrix", "card"];

fn main() {
    let args = Args::parse();

    if args.list {
        for demo in DEMOS {
            println!("{demo}");
        }
        return;
    }

    let Some(demo) = args.demo.as_deref() else {
        Args::command()
            .error(ErrorKind::MissingRequiredArgument, "Missing demo name!")
            .exit();
    };

    tessc::backend::ensure_initialized();

    let options = CodegenOptions {
        float_width: if args.float32 {
            FloatWidth::Single
        } else {
            FloatWidth::Double
        },
        optimize: false,
    };
    let backend = Backend::new(options);

    match demo {
        "add" => demo_add(&backend, args.emit_lir),
        "norm" => demo_norm(&backend, args.emit_lir),
        "matrix" => demo_matrix(&backend, args.emit_lir),
        "card" => demo_card(&backend, args.emit_lir),
        other => {
            Args::command()
                .error(
                    ErrorKind::InvalidValue,
                    format!("Unknown demo '{other}' (try --list)"),
                )
                .exit();
        }
    }
}

fn float_scalar(name: &str) -> Var {
    Var::new(name, Type::scalar(ScalarKind::Float))
}

/// c = a + b over float scalars.
fn demo_add(backend: &Backend, emit_lir: bool) {
    let a = float_scalar("a");
    let b = float_scalar("b");
    let c = float_scalar("c");
    let body = Stmt::assign(
        c.clone(),
        Expr::add(Expr::var(a.clone()), Expr::var(b.clone())),
    );
    let func = Func::new("add", vec![a, b], vec![c], body);

    let mut compiled = backend.compile(&func);
    if emit_lir {
        println!("{}", compiled.module());
    }

    let (a_val, _) = HostValue::tensor(DenseTensor::scalar_float(2.0));
    let (b_val, _) = HostValue::tensor(DenseTensor::scalar_float(4.1));
    let (c_val, c_handle) = HostValue::tensor(DenseTensor::scalar_float(0.0));
    compiled.bind("a", a_val).unwrap();
    compiled.bind("b", b_val).unwrap();
    compiled.bind("c", c_val).unwrap();
    compiled.run().unwrap();

    println!("add(2, 4.1) = {:?}", c_handle.borrow().data);
}

/// n = norm(v) over a 3-vector, exercising the inline intrinsic path.
fn demo_norm(backend: &Backend, emit_lir: bool) {
    let v = Var::new(
        "v",
        Type::tensor(ScalarKind::Float, vec![IndexSet::Range(3).into()]),
    );
    let n = float_scalar("n");
    let body = Stmt::call(
        vec![n.clone()],
        intrinsics::func(Intrinsic::Norm),
        vec![Expr::var(v.clone())],
    );
    let func = Func::new("vecnorm", vec![v], vec![n], body);

    let mut compiled = backend.compile(&func);
    if emit_lir {
        println!("{}", compiled.module());
    }

    let (v_val, _) = HostValue::tensor(DenseTensor::vector_float(vec![1.0, 2.0, 2.0]));
    let (n_val, n_handle) = HostValue::tensor(DenseTensor::scalar_float(0.0));
    compiled.bind("v", v_val).unwrap();
    compiled.bind("n", n_val).unwrap();
    compiled.run().unwrap();

    println!("norm([1 2 2]) = {:?}", n_handle.borrow().data);
}

/// Declares and prints a dense 2x3 matrix.
fn demo_matrix(backend: &Backend, emit_lir: bool) {
    let matrix_ty = Type::tensor(
        ScalarKind::Float,
        vec![IndexSet::Range(2).into(), IndexSet::Range(3).into()],
    );
    let a = Var::new("A", matrix_ty.clone());
    let literal = Expr::literal(
        LiteralData::Float(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
        matrix_ty,
    );
    let body = Stmt::block(vec![
        Stmt::var_decl(a.clone()),
        Stmt::assign(a.clone(), literal),
        Stmt::print(Expr::var(a.clone())),
    ]);
    let mut storage = Storage::new();
    storage.add(a, TensorStorage::DenseRowMajor);
    let func = Func::new("matrix", vec![], vec![], body).with_storage(storage);

    let mut compiled = backend.compile(&func);
    if emit_lir {
        println!("{}", compiled.module());
    }
    compiled.run().unwrap();
}

/// n = |points| for a runtime set.
fn demo_card(backend: &Backend, emit_lir: bool) {
    let element = Type::element("Point", vec![]);
    let points = Var::new("points", Type::set(element, vec![]));
    let n = Var::new("n", Type::scalar(ScalarKind::Int));
    let body = Stmt::assign(
        n.clone(),
        Expr::length(IndexSet::Set(Expr::var(points.clone()))),
    );
    let func = Func::new("cardinality", vec![points], vec![n], body);

    let mut compiled = backend.compile(&func);
    if emit_lir {
        println!("{}", compiled.module());
    }

    let (points_val, _) = HostValue::set(GraphSet::new(5));
    let (n_val, n_handle) = HostValue::tensor(DenseTensor::scalar_int(0));
    compiled.bind("points", points_val).unwrap();
    compiled.bind("n", n_val).unwrap();
    compiled.run().unwrap();

    println!("|points| = {:?}", n_handle.borrow().data);
}
