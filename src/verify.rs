//! The verification harness: runs declared tests against compiled
//! functions and compares results by literal equality.
//!
//! Unknown function references and value mismatches are user-facing
//! failures, reported through the diagnostics sink with distinct status
//! codes; they never abort the process.

use hashbrown::HashMap;

use crate::backend::function::HostValue;
use crate::backend::Backend;
use crate::diagnostics::DiagnosticsSink;
use crate::host::DenseTensor;
use crate::ir::types::TypeKind;
use crate::ir::Func;

/// Status code when a test references a function the program doesn't
/// define.
pub const STATUS_UNKNOWN_FUNCTION: i32 = 1;
/// Status code when an actual result differs from its expected literal.
pub const STATUS_VALUE_MISMATCH: i32 = 2;

/// One declared test: a function name, literal arguments bound
/// positionally, and the expected value of each result.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub function: String,
    pub arguments: Vec<DenseTensor>,
    pub expected: Vec<DenseTensor>,
}

impl TestCase {
    pub fn new(
        function: impl Into<String>,
        arguments: Vec<DenseTensor>,
        expected: Vec<DenseTensor>,
    ) -> Self {
        Self {
            function: function.into(),
            arguments,
            expected,
        }
    }
}

/// Verifies every test against the program's functions. Each referenced
/// function is compiled once (cached by function identity), its arguments
/// bound positionally, its results bound to freshly zero-filled literals,
/// then run and compared. Returns 0 on success, otherwise the failure code
/// of the first failing tier (unknown function before value mismatch).
pub fn verify(
    backend: &Backend,
    program: &[Func],
    tests: &[TestCase],
    diagnostics: &mut DiagnosticsSink,
) -> i32 {
    let mut status = 0;
    let mut compiled = HashMap::new();

    for test in tests {
        let Some(func) = program.iter().find(|f| f.name() == test.function) else {
            diagnostics.error(format!("test references unknown function '{}'", test.function));
            if status == 0 || status == STATUS_VALUE_MISMATCH {
                status = STATUS_UNKNOWN_FUNCTION;
            }
            continue;
        };

        let artifact = compiled
            .entry(func.clone())
            .or_insert_with(|| backend.compile(func));

        let mut failed = false;
        for (formal, argument) in func.arguments().iter().zip(&test.arguments) {
            let (value, _) = HostValue::tensor(argument.clone());
            if let Err(message) = artifact.bind(&formal.name, value) {
                diagnostics.error(format!("test of '{}': {message}", test.function));
                failed = true;
            }
        }

        // Results are bound to fresh zero literals the run overwrites.
        let mut results = Vec::new();
        for formal in func.results() {
            let TypeKind::Tensor(tensor) = &*formal.ty else {
                diagnostics.error(format!(
                    "test of '{}': result '{}' is not tensor-typed",
                    test.function, formal.name
                ));
                failed = true;
                continue;
            };
            let dims: Vec<usize> = tensor
                .dimensions
                .iter()
                .map(|d| d.size().unwrap_or(0) as usize)
                .collect();
            let zeros = DenseTensor::zeros(tensor.component, dims);
            let (value, handle) = HostValue::tensor(zeros);
            if let Err(message) = artifact.bind(&formal.name, value) {
                diagnostics.error(format!("test of '{}': {message}", test.function));
                failed = true;
            }
            results.push((formal.name.clone(), handle));
        }

        if failed {
            status = STATUS_VALUE_MISMATCH;
            continue;
        }
        if let Err(message) = artifact.run() {
            diagnostics.error(format!("test of '{}': {message}", test.function));
            status = STATUS_VALUE_MISMATCH;
            continue;
        }

        for ((name, actual), expected) in results.iter().zip(&test.expected) {
            let actual = actual.borrow();
            if !actual.equals(expected) {
                diagnostics.error(format!(
                    "test of '{}': result '{}' is {:?}, expected {:?}",
                    test.function, name, actual.data, expected.data
                ));
                status = STATUS_VALUE_MISMATCH;
            }
        }
    }

    status
}
