//! Error handling infrastructure for shadegraph.
//!
//! Every fallible operation in the crate returns [`ShadeResult`]. The error
//! kinds mirror the runtime's failure surfaces:
//!
//! - **Validation**: structural IR violations, reported as a diagnostic list.
//!   Any `error`-severity diagnostic aborts the run.
//! - **TypeInference**: a port whose type cannot be resolved.
//! - **ShaderCompile**: WGSL compilation failures, annotated with
//!   `line:column` positions from the shader front-end.
//! - **Resource**: CPU-side out-of-bounds accesses and other resource
//!   misuse. The GPU silently clamps out-of-bounds accesses, so the CPU
//!   path is deliberately strict to keep test coverage honest.
//! - **BuiltinMisuse**: reading a GPU-only built-in on the CPU backend.
//! - **DeviceLost**: the shared device disappeared; the cached device is
//!   dropped and the next acquisition re-requests one.

use thiserror::Error;

/// Severity of a validation diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Fatal; aborts the enclosing run.
    Error,
    /// Reported but not fatal.
    Warning,
}

/// A single validation or inference finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// How serious the finding is.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
    /// Where in the document the finding points (function id, node id, ...).
    pub location: String,
}

impl Diagnostic {
    /// Creates an `Error`-severity diagnostic.
    pub fn error(message: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            location: location.into(),
        }
    }

    /// Creates a `Warning`-severity diagnostic.
    pub fn warning(message: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            location: location.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sev = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{sev}: {} ({})", self.message, self.location)
    }
}

/// The main error type for shadegraph operations.
#[derive(Error, Debug)]
pub enum ShadeError {
    /// The IR failed structural validation.
    #[error("IR validation failed: {}", format_diagnostics(.0))]
    Validation(Vec<Diagnostic>),

    /// A port's type could not be resolved.
    #[error("type inference failed at node '{node}', port '{port}': {message}")]
    TypeInference {
        /// Offending node id.
        node: String,
        /// Offending port name.
        port: String,
        /// What went wrong.
        message: String,
    },

    /// The generated shader failed to compile.
    #[error("shader compilation failed: {0}")]
    ShaderCompile(String),

    /// A resource operation failed (out-of-bounds access, unknown id, ...).
    #[error("{0}")]
    Resource(String),

    /// A GPU-only built-in was read on the CPU backend.
    #[error("GPU Built-in '{0}' is not available in CPU context")]
    BuiltinMisuse(String),

    /// The shared GPU device was lost mid-flight.
    #[error("GPU device lost: {0}")]
    DeviceLost(String),

    /// A GPU-side failure that is not a compile error or device loss.
    #[error("GPU error: {0}")]
    Gpu(String),

    /// The operation is valid IR but unsupported on the chosen backend.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// An unknown op, function, resource or variable id was referenced.
    #[error("unknown {kind} '{id}'")]
    UnknownId {
        /// What category of id was looked up.
        kind: &'static str,
        /// The id that failed to resolve.
        id: String,
    },
}

impl ShadeError {
    pub(crate) fn unknown(kind: &'static str, id: impl Into<String>) -> Self {
        ShadeError::UnknownId {
            kind,
            id: id.into(),
        }
    }
}

fn format_diagnostics(diags: &[Diagnostic]) -> String {
    diags
        .iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// A specialized `Result` type for shadegraph operations.
pub type ShadeResult<T> = Result<T, ShadeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_misuse_message_format() {
        let err = ShadeError::BuiltinMisuse("global_invocation_id".to_string());
        assert_eq!(
            err.to_string(),
            "GPU Built-in 'global_invocation_id' is not available in CPU context"
        );
    }

    #[test]
    fn test_validation_message_joins_diagnostics() {
        let err = ShadeError::Validation(vec![
            Diagnostic::error("duplicate node id 'n1'", "fn main"),
            Diagnostic::warning("unused local 'x'", "fn main"),
        ]);
        let text = err.to_string();
        assert!(text.contains("duplicate node id 'n1'"));
        assert!(text.contains("unused local 'x'"));
    }

    #[test]
    fn test_unknown_id_message() {
        let err = ShadeError::unknown("resource", "b_missing");
        assert_eq!(err.to_string(), "unknown resource 'b_missing'");
    }
}
