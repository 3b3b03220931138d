//! The fixed table of intrinsic functions and their runtime symbol names.
//!
//! Intrinsic callees are dispatched specially by the backend: most become
//! calls to runtime-library routines whose names carry a float-width suffix
//! chosen by the session's [`FloatWidth`] policy; a few (`mod`) lower to
//! native instructions; `det`/`inv` bind to fixed-size 3x3 routines.

use std::str::FromStr;

use crate::ir::types::{FloatWidth, IndexDomain, IndexSet, ScalarKind, Type};
use crate::ir::{Func, Var};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Intrinsic {
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan2,
    Sqrt,
    Log,
    Exp,
    Pow,
    Det,
    Inv,
    Norm,
    Dot,
    Solve,
    Mod,
    Loc,
}

impl Intrinsic {
    /// Resolves an intrinsic callee back to its table entry. Only functions
    /// of kind `Intrinsic` participate.
    pub fn of(func: &Func) -> Option<Intrinsic> {
        match func.kind() {
            crate::ir::FuncKind::Intrinsic => Intrinsic::from_str(func.name()).ok(),
            _ => None,
        }
    }

    /// True for the unary/binary math operations that resolve directly to a
    /// float routine of the runtime library.
    pub fn is_math(self) -> bool {
        use Intrinsic::*;
        matches!(
            self,
            Sin | Cos | Tan | Asin | Acos | Atan2 | Sqrt | Log | Exp | Pow
        )
    }
}

pub fn float_suffix(width: FloatWidth) -> &'static str {
    match width {
        FloatWidth::Single => "_f32",
        FloatWidth::Double => "_f64",
    }
}

/// The runtime-library symbol an intrinsic resolves to under the given
/// float-width policy. `mod` lowers to a native instruction and has no
/// symbol.
pub fn runtime_symbol(intrinsic: Intrinsic, width: FloatWidth) -> String {
    let suffix = float_suffix(width);
    match intrinsic {
        Intrinsic::Det => format!("det3{suffix}"),
        Intrinsic::Inv => format!("inv3{suffix}"),
        Intrinsic::Loc => "loc".to_string(),
        Intrinsic::Mod => unreachable!("mod lowers to a native remainder"),
        other => format!("{other}{suffix}"),
    }
}

fn float_scalar(name: &str) -> Var {
    Var::new(name, Type::scalar(ScalarKind::Float))
}

fn int_scalar(name: &str) -> Var {
    Var::new(name, Type::scalar(ScalarKind::Int))
}

fn float_vector(name: &str) -> Var {
    Var::new(
        name,
        Type::tensor(ScalarKind::Float, vec![IndexDomain::from(IndexSet::Dynamic)]),
    )
}

fn float_matrix_3x3(name: &str) -> Var {
    Var::new(
        name,
        Type::tensor(
            ScalarKind::Float,
            vec![IndexSet::Range(3).into(), IndexSet::Range(3).into()],
        ),
    )
}

/// The IR function value of an intrinsic, usable as a call-statement callee.
pub fn func(intrinsic: Intrinsic) -> Func {
    let name = intrinsic.to_string();
    match intrinsic {
        Intrinsic::Sin
        | Intrinsic::Cos
        | Intrinsic::Tan
        | Intrinsic::Asin
        | Intrinsic::Acos
        | Intrinsic::Sqrt
        | Intrinsic::Log
        | Intrinsic::Exp => Func::intrinsic(name, vec![float_scalar("x")], vec![float_scalar("r")]),
        Intrinsic::Atan2 | Intrinsic::Pow => Func::intrinsic(
            name,
            vec![float_scalar("x"), float_scalar("y")],
            vec![float_scalar("r")],
        ),
        Intrinsic::Det => {
            Func::intrinsic(name, vec![float_matrix_3x3("A")], vec![float_scalar("r")])
        }
        Intrinsic::Inv => {
            Func::intrinsic(name, vec![float_matrix_3x3("A")], vec![float_matrix_3x3("R")])
        }
        Intrinsic::Norm => Func::intrinsic(name, vec![float_vector("v")], vec![float_scalar("r")]),
        Intrinsic::Dot => Func::intrinsic(
            name,
            vec![float_vector("a"), float_vector("b")],
            vec![float_scalar("r")],
        ),
        Intrinsic::Solve => Func::intrinsic(
            name,
            vec![
                Var::new(
                    "A",
                    Type::tensor(
                        ScalarKind::Float,
                        vec![
                            IndexDomain::from(IndexSet::Dynamic),
                            IndexDomain::from(IndexSet::Dynamic),
                        ],
                    ),
                ),
                float_vector("b"),
            ],
            vec![float_vector("x")],
        ),
        Intrinsic::Mod => Func::intrinsic(
            name,
            vec![int_scalar("a"), int_scalar("b")],
            vec![int_scalar("r")],
        ),
        Intrinsic::Loc => Func::intrinsic(
            name,
            vec![int_scalar("i"), int_scalar("j")],
            vec![int_scalar("r")],
        ),
    }
}
