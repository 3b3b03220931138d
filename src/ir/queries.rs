//! Analyses over the IR: index-variable extraction, lowering-state checks,
//! and the call-tree builder that sequences nested function compilation.

use std::ops::ControlFlow;

use hashbrown::{HashMap, HashSet};
use itertools::Itertools;

use crate::diagnostics::internal_error;
use crate::ir::visit::{self, Visitor};
use crate::ir::{Expr, ExprKind, Func, FuncKind, IndexVar, Stmt, StmtKind};

/// The free index variables of an expression, in first-use order, each
/// appearing once.
pub fn free_index_vars(expr: &Expr) -> Vec<IndexVar> {
    index_vars(expr, IndexVar::is_free)
}

/// The reduction index variables of an expression, in first-use order, each
/// appearing once.
pub fn reduction_index_vars(expr: &Expr) -> Vec<IndexVar> {
    index_vars(expr, IndexVar::is_reduction)
}

fn index_vars(expr: &Expr, pred: fn(&IndexVar) -> bool) -> Vec<IndexVar> {
    struct Collect {
        pred: fn(&IndexVar) -> bool,
        vars: Vec<IndexVar>,
    }

    impl Visitor for Collect {
        fn visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
            if let ExprKind::IndexedTensor { index_vars, .. } = expr.kind() {
                self.vars
                    .extend(index_vars.iter().filter(|iv| (self.pred)(iv)).cloned());
            }
            visit::walk_expr(self, expr)
        }
    }

    let mut collect = Collect { pred, vars: vec![] };
    let _ = collect.visit_expr(expr);
    collect.vars.into_iter().unique().collect()
}

pub fn contains_free_var(expr: &Expr) -> bool {
    visit::any_expr_in(expr, |e| {
        matches!(e.kind(), ExprKind::IndexedTensor { index_vars, .. }
            if index_vars.iter().any(IndexVar::is_free))
    })
}

pub fn contains_reduction_var(expr: &Expr) -> bool {
    visit::any_expr_in(expr, |e| {
        matches!(e.kind(), ExprKind::IndexedTensor { index_vars, .. }
            if index_vars.iter().any(IndexVar::is_reduction))
    })
}

/// A statement is flattened when it holds at most one index expression.
pub fn is_flattened(stmt: &Stmt) -> bool {
    struct CountIndexExprs {
        count: usize,
    }

    impl Visitor for CountIndexExprs {
        fn visit_expr(&mut self, expr: &Expr) -> ControlFlow<()> {
            if matches!(expr.kind(), ExprKind::IndexExpr { .. }) {
                self.count += 1;
                if self.count > 1 {
                    return ControlFlow::Break(());
                }
            }
            visit::walk_expr(self, expr)
        }
    }

    let mut counter = CountIndexExprs { count: 0 };
    counter.visit_stmt(stmt).is_continue()
}

/// True when any indexed tensor in the statement has a non-scalar block
/// type.
pub fn is_blocked(stmt: &Stmt) -> bool {
    visit::any_expr(stmt, |e| {
        if let ExprKind::IndexedTensor { tensor, .. } = e.kind() {
            if let Some(tensor_type) = tensor.ty().as_tensor() {
                return !tensor_type.block_type().is_scalar();
            }
        }
        false
    })
}

/// Returns every `Internal` function reachable from `root` through call
/// statements (the root included), ordered so that every callee appears
/// strictly before every function that calls it.
///
/// The call graph of a well-formed program is a DAG; any cycle — a function
/// calling itself included — is a fatal internal error, since the language
/// does not support recursion.
pub fn call_tree(root: &Func) -> Vec<Func> {
    // Build the reverse call graph (edges callee -> caller) over the
    // Internal functions reachable from the root. Intrinsic and external
    // callees are call targets, never nodes.
    let mut nodes: Vec<Func> = vec![root.clone()];
    let mut seen: HashSet<Func> = HashSet::new();
    seen.insert(root.clone());
    let mut callers: HashMap<Func, Vec<Func>> = HashMap::new();

    let mut worklist = vec![root.clone()];
    while let Some(caller) = worklist.pop() {
        for callee in callees_of(&caller) {
            if callee.kind() != FuncKind::Internal {
                continue;
            }
            let entry = callers.entry(callee.clone()).or_default();
            if !entry.contains(&caller) {
                entry.push(caller.clone());
            }
            if seen.insert(callee.clone()) {
                nodes.push(callee.clone());
                worklist.push(callee);
            }
        }
    }

    // Depth-first topological sort over the reverse graph: a node is
    // appended only after all of its callers have been. Reversing the
    // output then puts callees before callers.
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unmarked,
        Temporary,
        Permanent,
    }

    fn visit(
        node: &Func,
        callers: &HashMap<Func, Vec<Func>>,
        marks: &mut HashMap<Func, Mark>,
        order: &mut Vec<Func>,
    ) {
        match marks.get(node).copied().unwrap_or(Mark::Unmarked) {
            Mark::Permanent => return,
            Mark::Temporary => {
                internal_error!("call graph cycle through function '{}'", node.name())
            }
            Mark::Unmarked => {}
        }
        marks.insert(node.clone(), Mark::Temporary);
        if let Some(node_callers) = callers.get(node) {
            for caller in node_callers {
                visit(caller, callers, marks, order);
            }
        }
        marks.insert(node.clone(), Mark::Permanent);
        order.push(node.clone());
    }

    let mut marks = HashMap::new();
    let mut order = Vec::with_capacity(nodes.len());
    for node in &nodes {
        visit(node, &callers, &mut marks, &mut order);
    }
    order.reverse();
    order
}

/// The callees of every call statement in a function body, in body order.
fn callees_of(func: &Func) -> Vec<Func> {
    struct CollectCallees {
        callees: Vec<Func>,
    }

    impl Visitor for CollectCallees {
        fn visit_stmt(&mut self, stmt: &Stmt) -> ControlFlow<()> {
            if let StmtKind::Call { callee, .. } = stmt.kind() {
                self.callees.push(callee.clone());
            }
            visit::walk_stmt(self, stmt)
        }
    }

    let mut collect = CollectCallees { callees: vec![] };
    let _ = collect.visit_func(func);
    collect.callees
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::types::{IndexDomain, IndexSet, ScalarKind, Type};
    use crate::ir::Var;

    fn scalar_var(name: &str) -> Var {
        Var::new(name, Type::scalar(ScalarKind::Float))
    }

    /// A function whose body calls each of `callees` once.
    fn calling_func(name: &str, callees: &[Func]) -> Func {
        let calls = callees
            .iter()
            .map(|callee| Stmt::call(vec![], callee.clone(), vec![]))
            .collect();
        Func::new(name, vec![], vec![], Stmt::block(calls))
    }

    fn leaf(name: &str) -> Func {
        Func::new(name, vec![], vec![], Stmt::pass())
    }

    fn position(order: &[Func], name: &str) -> usize {
        order
            .iter()
            .position(|f| f.name() == name)
            .unwrap_or_else(|| panic!("{name} missing from call tree"))
    }

    #[test]
    fn single_function_tree_is_just_the_root() {
        let root = leaf("main");
        let order = call_tree(&root);
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].name(), "main");
    }

    #[test]
    fn callees_precede_callers() {
        let c = leaf("c");
        let b = calling_func("b", &[c.clone()]);
        let a = calling_func("a", &[b.clone()]);
        let order = call_tree(&a);
        assert_eq!(order.len(), 3);
        assert!(position(&order, "c") < position(&order, "b"));
        assert!(position(&order, "b") < position(&order, "a"));
    }

    #[test]
    fn diamond_graph_lists_each_function_once() {
        let d = leaf("d");
        let b = calling_func("b", &[d.clone()]);
        let c = calling_func("c", &[d.clone()]);
        let a = calling_func("a", &[b.clone(), c.clone()]);
        let order = call_tree(&a);
        assert_eq!(order.len(), 4);
        assert!(position(&order, "d") < position(&order, "b"));
        assert!(position(&order, "d") < position(&order, "c"));
        assert!(position(&order, "b") < position(&order, "a"));
        assert!(position(&order, "c") < position(&order, "a"));
    }

    #[test]
    fn intrinsic_callees_are_not_nodes() {
        let sine = Func::intrinsic("sin", vec![scalar_var("x")], vec![scalar_var("r")]);
        let root = calling_func("main", &[sine]);
        let order = call_tree(&root);
        assert_eq!(order.len(), 1);
        assert_eq!(order[0].name(), "main");
    }

    #[test]
    #[should_panic(expected = "call graph cycle")]
    fn self_call_is_fatal() {
        // Func identity is by name, so a body calling a same-named function
        // forms a self-loop.
        let proto = leaf("loop");
        let root = calling_func("loop", &[proto]);
        let _ = call_tree(&root);
    }

    #[test]
    #[should_panic(expected = "call graph cycle")]
    fn mutual_recursion_is_fatal() {
        let a_proto = leaf("a");
        let b = calling_func("b", &[a_proto]);
        let a = calling_func("a", &[b]);
        let _ = call_tree(&a);
    }

    #[test]
    fn free_and_reduction_vars_are_split_and_deduplicated() {
        let dom = IndexDomain::from(IndexSet::Range(3));
        let i = IndexVar::free("i", dom.clone());
        let j = IndexVar::reduction("j", dom.clone());
        let a = Expr::var(Var::new(
            "A",
            Type::tensor(ScalarKind::Float, vec![dom.clone(), dom.clone()]),
        ));
        let read1 = Expr::indexed_tensor(a.clone(), vec![i.clone(), j.clone()]);
        let read2 = Expr::indexed_tensor(a, vec![i.clone(), j.clone()]);
        let sum = Expr::add(read1, read2);

        let free = free_index_vars(&sum);
        assert_eq!(free, vec![i]);
        let reduction = reduction_index_vars(&sum);
        assert_eq!(reduction, vec![j]);
        assert!(contains_free_var(&sum));
        assert!(contains_reduction_var(&sum));
    }

    #[test]
    fn flattened_check_counts_index_expressions() {
        let dom = IndexDomain::from(IndexSet::Range(3));
        let i = IndexVar::free("i", dom.clone());
        let v = Expr::var(Var::new(
            "v",
            Type::tensor(ScalarKind::Float, vec![dom.clone()]),
        ));
        let inner = Expr::index_expr(
            vec![i.clone()],
            Expr::indexed_tensor(v.clone(), vec![i.clone()]),
        );

        let target = Var::new("w", inner.ty().clone());
        let one = Stmt::assign(target.clone(), inner.clone());
        assert!(is_flattened(&one));

        // An index expression whose body holds another is not flattened.
        let nested = Expr::index_expr(
            vec![i.clone()],
            Expr::indexed_tensor(inner, vec![i.clone()]),
        );
        let two = Stmt::assign(target, nested);
        assert!(!is_flattened(&two));
    }

    #[test]
    fn blocked_check_inspects_block_types() {
        let blocked_dom = IndexDomain::new(vec![IndexSet::Range(3), IndexSet::Range(2)]);
        let i = IndexVar::free("i", blocked_dom.clone());
        let m = Expr::var(Var::new(
            "M",
            Type::tensor(ScalarKind::Float, vec![blocked_dom]),
        ));
        let stmt = Stmt::assign(
            Var::new("x", Type::scalar(ScalarKind::Float)),
            Expr::indexed_tensor(m, vec![i]),
        );
        assert!(is_blocked(&stmt));
    }
}
