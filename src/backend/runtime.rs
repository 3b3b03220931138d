//! The runtime library compiled code calls into: float math routines in
//! both widths, the fixed-size 3x3 linear-algebra kernels, vector norm/dot
//! with an explicit length argument, a conjugate-gradient CSR solve, the
//! `loc` coordinate lookup, the allocator hooks, and printf-style
//! formatting with C `%g` semantics.
//!
//! Routines are looked up by name in a lazily built dispatch table; the
//! process-wide [`crate::backend::ensure_initialized`] guard forces the
//! table exactly once before compilation begins.

use hashbrown::HashMap;
use once_cell::sync::Lazy;

use crate::backend::lir::Component;
use crate::backend::vm::{ExecutionContext, Ptr, Value};
use crate::diagnostics::{internal_error, unsupported};

pub type RuntimeFn = fn(&[Value], &mut ExecutionContext) -> Option<Value>;

macro_rules! unary_math {
    ($table:ident, $($name:ident => $method:ident),* $(,)?) => {
        $(
            $table.insert(
                concat!(stringify!($name), "_f32"),
                (|args: &[Value], _: &mut ExecutionContext| {
                    Some(Value::Float((args[0].as_float() as f32).$method() as f64))
                }) as RuntimeFn,
            );
            $table.insert(
                concat!(stringify!($name), "_f64"),
                (|args: &[Value], _: &mut ExecutionContext| {
                    Some(Value::Float(args[0].as_float().$method()))
                }) as RuntimeFn,
            );
        )*
    };
}

macro_rules! binary_math {
    ($table:ident, $($name:ident => $method:ident),* $(,)?) => {
        $(
            $table.insert(
                concat!(stringify!($name), "_f32"),
                (|args: &[Value], _: &mut ExecutionContext| {
                    let a = args[0].as_float() as f32;
                    let b = args[1].as_float() as f32;
                    Some(Value::Float(a.$method(b) as f64))
                }) as RuntimeFn,
            );
            $table.insert(
                concat!(stringify!($name), "_f64"),
                (|args: &[Value], _: &mut ExecutionContext| {
                    Some(Value::Float(args[0].as_float().$method(args[1].as_float())))
                }) as RuntimeFn,
            );
        )*
    };
}

static ROUTINES: Lazy<HashMap<&'static str, RuntimeFn>> = Lazy::new(|| {
    let mut table: HashMap<&'static str, RuntimeFn> = HashMap::new();

    unary_math!(table,
        sin => sin,
        cos => cos,
        tan => tan,
        asin => asin,
        acos => acos,
        sqrt => sqrt,
        log => ln,
        exp => exp,
    );
    binary_math!(table,
        atan2 => atan2,
        pow => powf,
    );

    table.insert("malloc", |args, ctx| {
        let size = args[0].as_int();
        Some(Value::Ptr(ctx.memory.alloc(size as usize)))
    });
    table.insert("free", |args, ctx| {
        ctx.memory.free(args[0].as_ptr());
        None
    });

    table.insert("det3_f32", |args, ctx| Some(det3(args, ctx, Component::F32)));
    table.insert("det3_f64", |args, ctx| Some(det3(args, ctx, Component::F64)));
    table.insert("inv3_f32", |args, ctx| inv3(args, ctx, Component::F32));
    table.insert("inv3_f64", |args, ctx| inv3(args, ctx, Component::F64));
    table.insert("norm_f32", |args, ctx| Some(norm(args, ctx, Component::F32)));
    table.insert("norm_f64", |args, ctx| Some(norm(args, ctx, Component::F64)));
    table.insert("dot_f32", |args, ctx| Some(dot(args, ctx, Component::F32)));
    table.insert("dot_f64", |args, ctx| Some(dot(args, ctx, Component::F64)));
    table.insert("solve_f32", |args, ctx| solve(args, ctx, Component::F32));
    table.insert("solve_f64", |args, ctx| solve(args, ctx, Component::F64));
    table.insert("loc", loc);

    table
});

/// Forces construction of the dispatch table. Idempotent.
pub fn initialize() {
    Lazy::force(&ROUTINES);
}

pub fn call(name: &str, args: &[Value], ctx: &mut ExecutionContext) -> Option<Value> {
    let routine = ROUTINES
        .get(name)
        .unwrap_or_else(|| internal_error!("runtime routine '{name}' not found"));
    routine(args, ctx)
}

fn read_vec(ctx: &ExecutionContext, ptr: Ptr, len: usize, component: Component) -> Vec<f64> {
    (0..len)
        .map(|i| ctx.memory.read(component, ptr, i as i64).as_float())
        .collect()
}

fn read_ints(ctx: &ExecutionContext, ptr: Ptr, len: usize) -> Vec<i32> {
    (0..len)
        .map(|i| ctx.memory.read(Component::Int, ptr, i as i64).as_int())
        .collect()
}

fn write_vec(ctx: &mut ExecutionContext, ptr: Ptr, values: &[f64], component: Component) {
    for (i, v) in values.iter().enumerate() {
        ctx.memory.write(component, ptr, i as i64, &Value::Float(*v));
    }
}

fn det3(args: &[Value], ctx: &ExecutionContext, component: Component) -> Value {
    let a = read_vec(ctx, args[0].as_ptr(), 9, component);
    Value::Float(det3x3(&a))
}

fn det3x3(a: &[f64]) -> f64 {
    a[0] * (a[4] * a[8] - a[5] * a[7]) - a[1] * (a[3] * a[8] - a[5] * a[6])
        + a[2] * (a[3] * a[7] - a[4] * a[6])
}

fn inv3(args: &[Value], ctx: &mut ExecutionContext, component: Component) -> Option<Value> {
    let a = read_vec(ctx, args[0].as_ptr(), 9, component);
    let det = det3x3(&a);
    let cofactors = [
        a[4] * a[8] - a[5] * a[7],
        a[2] * a[7] - a[1] * a[8],
        a[1] * a[5] - a[2] * a[4],
        a[5] * a[6] - a[3] * a[8],
        a[0] * a[8] - a[2] * a[6],
        a[2] * a[3] - a[0] * a[5],
        a[3] * a[7] - a[4] * a[6],
        a[1] * a[6] - a[0] * a[7],
        a[0] * a[4] - a[1] * a[3],
    ];
    let inv: Vec<f64> = cofactors.iter().map(|c| c / det).collect();
    write_vec(ctx, args[1].as_ptr(), &inv, component);
    None
}

fn norm(args: &[Value], ctx: &ExecutionContext, component: Component) -> Value {
    let len = args[1].as_int() as usize;
    let v = read_vec(ctx, args[0].as_ptr(), len, component);
    Value::Float(v.iter().map(|x| x * x).sum::<f64>().sqrt())
}

fn dot(args: &[Value], ctx: &ExecutionContext, component: Component) -> Value {
    let len = args[2].as_int() as usize;
    let a = read_vec(ctx, args[0].as_ptr(), len, component);
    let b = read_vec(ctx, args[1].as_ptr(), len, component);
    Value::Float(a.iter().zip(&b).map(|(x, y)| x * y).sum())
}

/// Conjugate-gradient solve of `A x = b` over a CSR matrix.
///
/// Calling convention (matching the emitted marshalling): `n`, `m`,
/// row-start pointer, column-index pointer, block sizes `nn` and `mm`,
/// then the value, right-hand-side and solution pointers.
fn solve(args: &[Value], ctx: &mut ExecutionContext, component: Component) -> Option<Value> {
    let n = args[0].as_int() as usize;
    let _m = args[1].as_int() as usize;
    let rowstart_ptr = args[2].as_ptr();
    let colidx_ptr = args[3].as_ptr();
    let nn = args[4].as_int();
    let mm = args[5].as_int();
    if nn != 1 || mm != 1 {
        unsupported!("sparse solve over non-scalar blocks");
    }

    let rowstart = read_ints(ctx, rowstart_ptr, n + 1);
    let nnz = rowstart[n] as usize;
    let colidx = read_ints(ctx, colidx_ptr, nnz);
    let vals = read_vec(ctx, args[6].as_ptr(), nnz, component);
    let b = read_vec(ctx, args[7].as_ptr(), n, component);

    let spmv = |x: &[f64]| -> Vec<f64> {
        let mut y = vec![0.0; n];
        for row in 0..n {
            for k in rowstart[row] as usize..rowstart[row + 1] as usize {
                y[row] += vals[k] * x[colidx[k] as usize];
            }
        }
        y
    };

    let mut x = vec![0.0; n];
    let mut r = b.clone();
    let mut p = r.clone();
    let mut rr: f64 = r.iter().map(|v| v * v).sum();
    for _ in 0..10 * n.max(1) {
        if rr < 1e-24 {
            break;
        }
        let ap = spmv(&p);
        let pap: f64 = p.iter().zip(&ap).map(|(a, b)| a * b).sum();
        let alpha = rr / pap;
        for i in 0..n {
            x[i] += alpha * p[i];
            r[i] -= alpha * ap[i];
        }
        let rr_next: f64 = r.iter().map(|v| v * v).sum();
        let beta = rr_next / rr;
        for i in 0..n {
            p[i] = r[i] + beta * p[i];
        }
        rr = rr_next;
    }

    write_vec(ctx, args[8].as_ptr(), &x, component);
    None
}

/// Position of coordinate `(i, j)` within a CSR index.
fn loc(args: &[Value], ctx: &mut ExecutionContext) -> Option<Value> {
    let i = args[0].as_int();
    let j = args[1].as_int();
    let rowstart_ptr = args[2].as_ptr();
    let colidx_ptr = args[3].as_ptr();
    let begin = ctx.memory.read(Component::Int, rowstart_ptr, i as i64).as_int();
    let end = ctx
        .memory
        .read(Component::Int, rowstart_ptr, i as i64 + 1)
        .as_int();
    for k in begin..end {
        if ctx.memory.read(Component::Int, colidx_ptr, k as i64).as_int() == j {
            return Some(Value::Int(k));
        }
    }
    internal_error!("coordinate ({i}, {j}) is not in the sparse index");
}

/// Formats one value the way C's `%g` conversion does: six significant
/// digits, trailing zeros stripped, scientific notation outside
/// `[1e-4, 1e6)`.
pub fn fmt_g(v: f64) -> String {
    if v == 0.0 {
        return "0".to_string();
    }
    if !v.is_finite() {
        return if v.is_nan() {
            "nan".to_string()
        } else if v > 0.0 {
            "inf".to_string()
        } else {
            "-inf".to_string()
        };
    }

    let scientific = format!("{:.5e}", v);
    let (_, exp) = scientific
        .split_once('e')
        .expect("float e-notation always carries an exponent");
    let exp: i32 = exp.parse().expect("exponent is an integer");

    if exp < -4 || exp >= 6 {
        let (mantissa, _) = scientific.split_once('e').unwrap();
        let mantissa = trim_trailing_zeros(mantissa);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exp.abs())
    } else {
        let decimals = (5 - exp).max(0) as usize;
        trim_trailing_zeros(&format!("{:.*}", decimals, v))
    }
}

fn trim_trailing_zeros(s: &str) -> String {
    if !s.contains('.') {
        return s.to_string();
    }
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}

/// Expands a printf-style format string against the given values. Supports
/// the `%d`, `%g` and `%%` conversions, which is all the emitted code uses.
pub fn format_printf(format: &str, args: &[Value]) -> String {
    let mut out = String::new();
    let mut next = 0usize;
    let mut chars = format.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('d') => {
                match &args[next] {
                    Value::Int(v) => out.push_str(&v.to_string()),
                    Value::Bool(v) => out.push_str(if *v { "1" } else { "0" }),
                    other => internal_error!("%d conversion over {other:?}"),
                }
                next += 1;
            }
            Some('g') => {
                out.push_str(&fmt_g(args[next].as_float()));
                next += 1;
            }
            other => internal_error!("unknown printf conversion %{other:?}"),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use paste::paste;

    macro_rules! fmt_g_cases {
        ($($name:ident: $value:expr => $expected:expr;)*) => {
            $(paste! {
                #[test]
                fn [<fmt_g_ $name>]() {
                    assert_eq!(fmt_g($value), $expected);
                }
            })*
        };
    }

    fmt_g_cases! {
        zero: 0.0 => "0";
        integral: 2.0 => "2";
        simple: 6.1 => "6.1";
        six_significant_digits: 3.14159265 => "3.14159";
        large_fixed: 123456.7 => "123457";
        scientific_positive: 12345678.0 => "1.23457e+07";
        scientific_negative_exp: 0.00001 => "1e-05";
        small_fixed: 0.0001 => "0.0001";
        negative: -2.5 => "-2.5";
    }

    #[test]
    fn printf_expands_conversions_in_order() {
        let text = format_printf("%d: %g%%\n", &[Value::Int(3), Value::Float(0.5)]);
        assert_eq!(text, "3: 0.5%\n");
    }

    #[test]
    fn math_routines_respect_width() {
        let mut ctx = ExecutionContext::new(0);
        let wide = call("sin_f64", &[Value::Float(2.0)], &mut ctx).unwrap();
        assert_eq!(wide.as_float(), 2.0f64.sin());
        let narrow = call("sin_f32", &[Value::Float(2.0)], &mut ctx).unwrap();
        assert_eq!(narrow.as_float(), 2.0f32.sin() as f64);
    }

    #[test]
    fn log_is_natural() {
        let mut ctx = ExecutionContext::new(0);
        let v = call("log_f64", &[Value::Float(std::f64::consts::E)], &mut ctx).unwrap();
        assert!((v.as_float() - 1.0).abs() < 1e-15);
    }

    #[test]
    fn det_and_inv_agree_on_a_3x3() {
        let mut ctx = ExecutionContext::new(0);
        let a = ctx.memory.alloc(9 * 8);
        let m = [2.0, 0.0, 0.0, 0.0, 4.0, 0.0, 0.0, 0.0, 8.0];
        write_vec(&mut ctx, a, &m, Component::F64);

        let det = call("det3_f64", &[Value::Ptr(a)], &mut ctx).unwrap();
        assert_eq!(det.as_float(), 64.0);

        let r = ctx.memory.alloc(9 * 8);
        call("inv3_f64", &[Value::Ptr(a), Value::Ptr(r)], &mut ctx);
        let inv = read_vec(&ctx, r, 9, Component::F64);
        assert_eq!(inv[0], 0.5);
        assert_eq!(inv[4], 0.25);
        assert_eq!(inv[8], 0.125);
        assert_eq!(inv[1], 0.0);
    }

    #[test]
    fn norm_and_dot_take_explicit_lengths() {
        let mut ctx = ExecutionContext::new(0);
        let a = ctx.memory.alloc(4 * 8);
        write_vec(&mut ctx, a, &[1.0, 2.0, 2.0, 4.0], Component::F64);
        let b = ctx.memory.alloc(4 * 8);
        write_vec(&mut ctx, b, &[1.0, 1.0, 1.0, 0.5], Component::F64);

        let n = call("norm_f64", &[Value::Ptr(a), Value::Int(3)], &mut ctx).unwrap();
        assert_eq!(n.as_float(), 3.0);

        let d = call(
            "dot_f64",
            &[Value::Ptr(a), Value::Ptr(b), Value::Int(4)],
            &mut ctx,
        )
        .unwrap();
        assert_eq!(d.as_float(), 7.0);
    }

    #[test]
    fn cg_solve_recovers_solution_of_spd_system() {
        // A = [[4, 1], [1, 3]], b = [1, 2]; the CSR arrays cover both rows.
        let mut ctx = ExecutionContext::new(0);
        let rowstart = ctx.memory.alloc(3 * 4);
        for (i, v) in [0, 2, 4].iter().enumerate() {
            ctx.memory
                .write(Component::Int, rowstart, i as i64, &Value::Int(*v));
        }
        let colidx = ctx.memory.alloc(4 * 4);
        for (i, v) in [0, 1, 0, 1].iter().enumerate() {
            ctx.memory
                .write(Component::Int, colidx, i as i64, &Value::Int(*v));
        }
        let vals = ctx.memory.alloc(4 * 8);
        write_vec(&mut ctx, vals, &[4.0, 1.0, 1.0, 3.0], Component::F64);
        let b = ctx.memory.alloc(2 * 8);
        write_vec(&mut ctx, b, &[1.0, 2.0], Component::F64);
        let x = ctx.memory.alloc(2 * 8);

        call(
            "solve_f64",
            &[
                Value::Int(2),
                Value::Int(2),
                Value::Ptr(rowstart),
                Value::Ptr(colidx),
                Value::Int(1),
                Value::Int(1),
                Value::Ptr(vals),
                Value::Ptr(b),
                Value::Ptr(x),
            ],
            &mut ctx,
        );

        let solution = read_vec(&ctx, x, 2, Component::F64);
        assert!((solution[0] - 1.0 / 11.0).abs() < 1e-9);
        assert!((solution[1] - 7.0 / 11.0).abs() < 1e-9);
    }

    #[test]
    fn loc_finds_csr_positions() {
        let mut ctx = ExecutionContext::new(0);
        let rowstart = ctx.memory.alloc(4 * 4);
        for (i, v) in [0, 2, 5, 7].iter().enumerate() {
            ctx.memory
                .write(Component::Int, rowstart, i as i64, &Value::Int(*v));
        }
        let colidx = ctx.memory.alloc(7 * 4);
        for (i, v) in [0, 1, 0, 1, 2, 1, 2].iter().enumerate() {
            ctx.memory
                .write(Component::Int, colidx, i as i64, &Value::Int(*v));
        }
        let found = call(
            "loc",
            &[
                Value::Int(1),
                Value::Int(2),
                Value::Ptr(rowstart),
                Value::Ptr(colidx),
            ],
            &mut ctx,
        )
        .unwrap();
        assert_eq!(found.as_int(), 4);
    }
}
