//! User-facing diagnostics and the two tiers of fatal compiler failures.
//!
//! Recoverable problems (bad test expectations, unknown function names) are
//! accumulated in a [`DiagnosticsSink`] and surfaced with a status code.
//! Everything else is a bug: either malformed IR reached a stage that trusted
//! its input (`internal_error!`) or a recognized construct has no
//! implementation yet (`unsupported!`). The two have different resolutions —
//! one needs a front-end fix, the other needs a feature — so they carry
//! distinct panic prefixes.

use colored::Colorize;

/// Collects user-facing error messages for later reporting.
#[derive(Debug, Default)]
pub struct DiagnosticsSink {
    messages: Vec<String>,
}

impl DiagnosticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn has_errors(&self) -> bool {
        !self.messages.is_empty()
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    /// Writes every collected message to stderr, one per line.
    pub fn report(&self) {
        for message in &self.messages {
            eprintln!("{} {}", "error:".red().bold(), message);
        }
    }
}

/// An invariant the compiler relies on was violated. This is never a user
/// error: something upstream produced IR that should not exist.
macro_rules! internal_error {
    ($($arg:tt)*) => {
        panic!("internal compiler error: {}", format_args!($($arg)*))
    };
}

/// A recognized construct that the backend does not implement yet.
macro_rules! unsupported {
    ($($arg:tt)*) => {
        panic!("unsupported: {}", format_args!($($arg)*))
    };
}

pub(crate) use internal_error;
pub(crate) use unsupported;
