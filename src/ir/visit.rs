//! Generic traversal over the closed IR node set.
//!
//! A [`Visitor`] overrides the `visit_*` hooks it cares about and delegates
//! to the matching `walk_*` function for the default traversal of children.
//! Traversal direction is a value: `Backward` walks every child list in
//! reverse, which is all a backward pass means over a tree.
//!
//! Every hook returns [`ControlFlow`], so any visitor can abort the whole
//! traversal early; the query helpers at the bottom build on that.

use std::ops::ControlFlow;

use crate::ir::{Expr, ExprKind, ForDomain, Func, Stmt, StmtKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

pub trait Visitor: Sized {
    fn direction(&self) -> Direction {
        Direction::Forward
    }

    fn visit_func(&mut self, func: &Func) -> ControlFlow<()> {
        walk_func(self, func)
    }

    fn visit_stmt(&mut self, stmt: &Stmt) -> ControlFlow<()> {
        walk_stmt(self, stmt)
    }

    fn visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
        walk_expr(self, expr)
    }
}

fn each<T>(
    direction: Direction,
    items: &[T],
    mut f: impl FnMut(&T) -> ControlFlow<()>,
) -> ControlFlow<()> {
    match direction {
        Direction::Forward => {
            for item in items {
                f(item)?;
            }
        }
        Direction::Backward => {
            for item in items.iter().rev() {
                f(item)?;
            }
        }
    }
    ControlFlow::Continue(())
}

pub fn walk_func<V: Visitor>(visitor: &mut V, func: &Func) -> ControlFlow<()> {
    for (_, init) in &func.environment().constants {
        visitor.visit_expr(init)?;
    }
    if let Some(body) = func.body() {
        visitor.visit_stmt(body)?;
    }
    ControlFlow::Continue(())
}

pub fn walk_stmt<V: Visitor>(visitor: &mut V, stmt: &Stmt) -> ControlFlow<()> {
    match stmt.kind() {
        StmtKind::VarDecl { .. } | StmtKind::Pass => ControlFlow::Continue(()),
        StmtKind::Assign { value, .. } => visitor.visit_expr(value),
        StmtKind::Store {
            buffer,
            index,
            value,
            ..
        } => {
            visitor.visit_expr(buffer)?;
            visitor.visit_expr(index)?;
            visitor.visit_expr(value)
        }
        StmtKind::FieldWrite {
            elem_or_set, value, ..
        } => {
            visitor.visit_expr(elem_or_set)?;
            visitor.visit_expr(value)
        }
        StmtKind::Call { actuals, .. } => {
            // The callee is deliberately not descended into here; analyses
            // that follow call edges (the call-tree builder) do so
            // explicitly.
            each(visitor.direction(), actuals, |a| visitor.visit_expr(a))
        }
        StmtKind::For { domain, body, .. } => {
            match domain {
                ForDomain::IndexSet(_) | ForDomain::Diagonal => {}
                ForDomain::Endpoints { edge_set, .. } => visitor.visit_expr(edge_set)?,
                ForDomain::Edges { set, .. } | ForDomain::Neighbors { set, .. } => {
                    visitor.visit_expr(set)?
                }
            }
            visitor.visit_stmt(body)
        }
        StmtKind::ForRange {
            start, end, body, ..
        } => {
            visitor.visit_expr(start)?;
            visitor.visit_expr(end)?;
            visitor.visit_stmt(body)
        }
        StmtKind::While { condition, body } => {
            visitor.visit_expr(condition)?;
            visitor.visit_stmt(body)
        }
        StmtKind::IfThenElse {
            condition,
            then_body,
            else_body,
        } => {
            visitor.visit_expr(condition)?;
            visitor.visit_stmt(then_body)?;
            if let Some(else_body) = else_body {
                visitor.visit_stmt(else_body)?;
            }
            ControlFlow::Continue(())
        }
        StmtKind::Block(stmts) => each(visitor.direction(), stmts, |s| visitor.visit_stmt(s)),
        StmtKind::Scope(inner) => visitor.visit_stmt(inner),
        StmtKind::Print { expr } => visitor.visit_expr(expr),
        StmtKind::TensorWrite {
            tensor,
            indices,
            value,
            ..
        } => {
            visitor.visit_expr(tensor)?;
            each(visitor.direction(), indices, |i| visitor.visit_expr(i))?;
            visitor.visit_expr(value)
        }
        StmtKind::Map { target, .. } => visitor.visit_expr(target),
    }
}

pub fn walk_expr<V: Visitor>(visitor: &mut V, expr: &Expr) -> ControlFlow<()> {
    match expr.kind() {
        ExprKind::Literal(_) | ExprKind::VarExpr(_) | ExprKind::Length(_) => {
            ControlFlow::Continue(())
        }
        ExprKind::FieldRead { elem_or_set, .. } => visitor.visit_expr(elem_or_set),
        ExprKind::IndexRead { edge_set, .. } => visitor.visit_expr(edge_set),
        ExprKind::Load { buffer, index } => {
            visitor.visit_expr(buffer)?;
            visitor.visit_expr(index)
        }
        ExprKind::Unary { operand, .. } => visitor.visit_expr(operand),
        ExprKind::Binary { a, b, .. } => match visitor.direction() {
            Direction::Forward => {
                visitor.visit_expr(a)?;
                visitor.visit_expr(b)
            }
            Direction::Backward => {
                visitor.visit_expr(b)?;
                visitor.visit_expr(a)
            }
        },
        ExprKind::IndexedTensor { tensor, .. } => visitor.visit_expr(tensor),
        ExprKind::IndexExpr { body, .. } => visitor.visit_expr(body),
        ExprKind::TensorRead { tensor, indices } => {
            visitor.visit_expr(tensor)?;
            each(visitor.direction(), indices, |i| visitor.visit_expr(i))
        }
        ExprKind::TupleRead { tuple, index } => {
            visitor.visit_expr(tuple)?;
            visitor.visit_expr(index)
        }
    }
}

/// True when any expression beneath `stmt` (inclusive of subexpressions)
/// satisfies the predicate. Short-circuits on the first hit.
pub fn any_expr<F: Fn(&Expr) -> bool>(stmt: &Stmt, pred: F) -> bool {
    struct Query<F> {
        pred: F,
    }

    impl<F: Fn(&Expr) -> bool> Visitor for Query<F> {
        fn visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
            if (self.pred)(expr) {
                return ControlFlow::Break(());
            }
            walk_expr(self, expr)
        }
    }

    let mut query = Query { pred };
    query.visit_stmt(stmt).is_break()
}

/// Expression-rooted variant of [`any_expr`].
pub fn any_expr_in<F: Fn(&Expr) -> bool>(expr: &Expr, pred: F) -> bool {
    struct Query<F> {
        pred: F,
    }

    impl<F: Fn(&Expr) -> bool> Visitor for Query<F> {
        fn visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
            if (self.pred)(expr) {
                return ControlFlow::Break(());
            }
            walk_expr(self, expr)
        }
    }

    let mut query = Query { pred };
    query.visit_expr(expr).is_break()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{ScalarKind, Type};
    use crate::ir::Var;

    fn var(name: &str) -> Expr {
        Expr::var(Var::new(name, Type::scalar(ScalarKind::Float)))
    }

    struct CollectVars {
        direction: Direction,
        names: Vec<String>,
    }

    impl Visitor for CollectVars {
        fn direction(&self) -> Direction {
            self.direction
        }

        fn visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
            if let ExprKind::VarExpr(v) = expr.kind() {
                self.names.push(v.name.clone());
            }
            walk_expr(self, expr)
        }
    }

    fn sum_stmt() -> Stmt {
        let value = Expr::add(Expr::add(var("a"), var("b")), var("c"));
        Stmt::assign(Var::new("d", Type::scalar(ScalarKind::Float)), value)
    }

    #[test]
    fn forward_traversal_visits_left_to_right() {
        let mut v = CollectVars {
            direction: Direction::Forward,
            names: vec![],
        };
        let _ = v.visit_stmt(&sum_stmt());
        assert_eq!(v.names, ["a", "b", "c"]);
    }

    #[test]
    fn backward_traversal_visits_right_to_left() {
        let mut v = CollectVars {
            direction: Direction::Backward,
            names: vec![],
        };
        let _ = v.visit_stmt(&sum_stmt());
        assert_eq!(v.names, ["c", "b", "a"]);
    }

    #[test]
    fn any_expr_short_circuits() {
        let stmt = sum_stmt();
        assert!(any_expr(&stmt, |e| {
            matches!(e.kind(), ExprKind::VarExpr(v) if v.name == "b")
        }));
        assert!(!any_expr(&stmt, |e| {
            matches!(e.kind(), ExprKind::VarExpr(v) if v.name == "z")
        }));
    }
}
