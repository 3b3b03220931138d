//! The backend lowers fully-resolved IR functions to LIR (see [`lir`]) and
//! packages the result, together with an execution context, into a
//! [`function::CompiledFunction`] that host code can bind values to and run.

use once_cell::sync::OnceCell;

use crate::ir::types::FloatWidth;
use crate::ir::Func;

pub mod function;
pub mod intrinsics;
pub mod lir;
pub mod lowering;
pub mod runtime;
pub mod symtable;
pub mod vm;

/// Session-wide code generation policy, threaded through the backend
/// explicitly rather than read from process state.
#[derive(Debug, Clone, Default)]
pub struct CodegenOptions {
    /// Width of the `float` component type. Decides buffer layouts and the
    /// `_f32`/`_f64` suffix of runtime symbols.
    pub float_width: FloatWidth,
    /// Hook for a post-emission optimization pipeline. The VM target
    /// carries no passes, so this is a policy knob with no effect today.
    pub optimize: bool,
}

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// One-time process-wide initialization (builds the runtime dispatch
/// table). Idempotent; the driver calls it once before compiling anything,
/// and [`Backend::compile`] calls it defensively. Not re-entrant-safe
/// without external synchronization beyond the cell's own once guarantee.
pub fn ensure_initialized() {
    INITIALIZED.get_or_init(|| {
        runtime::initialize();
    });
}

/// Compiles IR functions into runnable artifacts.
#[derive(Debug, Default)]
pub struct Backend {
    options: CodegenOptions,
}

impl Backend {
    pub fn new(options: CodegenOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CodegenOptions {
        &self.options
    }

    /// Compiles `func` and every internal function it reaches. Fails only
    /// through fatal internal assertions: input reaching this stage has
    /// passed front-end validation, so malformed IR is a compiler bug, not
    /// a user error.
    pub fn compile(&self, func: &Func) -> function::CompiledFunction {
        ensure_initialized();
        let (module, requires_init) = lowering::compile(&self.options, func);
        function::CompiledFunction::new(func.clone(), module, requires_init, self.options.clone())
    }
}
