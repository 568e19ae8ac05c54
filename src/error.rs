//! Error types for the script sandbox.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single compile-time problem, reported as a line number and a message.
///
/// Line numbers are 1-based; `0` means the failing stage did not report a
/// usable location. Serializable, since embedders typically forward
/// diagnostics to a frontend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Source line the problem was reported on.
    pub line: u32,
    /// Human-readable description.
    pub message: String,
}

impl Diagnostic {
    /// Create a new diagnostic.
    pub fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Line {}: {}", self.line, self.message)
    }
}

/// Compilation failure: the ordered sequence of diagnostics produced by the
/// pipeline. Entries are ordered by pipeline stage, not by source position,
/// and callers must display all of them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", render_diagnostics(.errors))]
pub struct CompileError {
    /// The diagnostics, in stage order.
    pub errors: Vec<Diagnostic>,
}

impl CompileError {
    /// A compile error carrying exactly one diagnostic.
    pub fn single(diagnostic: Diagnostic) -> Self {
        Self {
            errors: vec![diagnostic],
        }
    }

    /// Render the diagnostics as `"Line <n>: <message>"` lines joined by
    /// newline. This is the shape `eval` surfaces as an exception message.
    pub fn render(&self) -> String {
        render_diagnostics(&self.errors)
    }
}

fn render_diagnostics(errors: &[Diagnostic]) -> String {
    errors
        .iter()
        .map(Diagnostic::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Errors raised by the sandbox runtime support layer or by the running
/// program. These surface only at run/eval completion, as a single
/// exception-kind [`Outcome`](crate::sandbox::engine::Outcome).
#[derive(Error, Debug)]
pub enum SandboxError {
    /// A name was read that is neither a fixed global nor a prior write.
    #[error("{0} is not defined")]
    NotDefined(String),

    /// The program tried to overwrite a protected global binding.
    #[error("{0} is part of the global library, and cannot be overwritten")]
    ProtectedGlobal(String),

    /// `require` was called with a name absent from the whitelist.
    #[error("'{0}' not found")]
    ModuleNotFound(String),

    /// Any other runtime failure raised by the support library: assertion
    /// failures, frozen-object writes, type errors, malformed codec input.
    #[error("{0}")]
    Runtime(String),

    /// The execution engine rejected the compiled unit.
    #[error("engine rejected the compiled unit: {0}")]
    EngineInit(#[source] anyhow::Error),
}

impl SandboxError {
    /// Check if this error is an undefined-variable read.
    pub fn is_not_defined(&self) -> bool {
        matches!(self, SandboxError::NotDefined(_))
    }

    /// Check if this error is a protected-global write.
    pub fn is_protected_global(&self) -> bool {
        matches!(self, SandboxError::ProtectedGlobal(_))
    }

    /// Check if this error is a missing whitelist module.
    pub fn is_module_not_found(&self) -> bool {
        matches!(self, SandboxError::ModuleNotFound(_))
    }
}

/// Result type alias for sandbox runtime operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

/// An unexpected failure escaping from a pipeline stage (parse, lowering,
/// instrumentation). Restriction violations do not use this shape: they are
/// already ordered diagnostics and bypass normalization entirely.
#[derive(Debug, Clone)]
pub struct StageFailure {
    /// Raw failure text. Parser failures conventionally embed a trailing
    /// `(line:col)` location in this text.
    pub message: String,
    /// Explicit location, when the stage tracked one.
    pub line: Option<u32>,
}

impl StageFailure {
    /// A failure with no explicit location.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    /// A failure carrying an explicit line.
    pub fn at_line(message: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            line: Some(line),
        }
    }
}

impl From<anyhow::Error> for StageFailure {
    fn from(err: anyhow::Error) -> Self {
        StageFailure::new(err.to_string())
    }
}

impl std::fmt::Display for StageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Fold a stage failure into the one `{line, message}` shape.
///
/// Order of preference: a `(line:col)` suffix embedded in the message, then
/// an explicit location carried by the failure, then line 0 with the raw
/// text.
pub fn normalize(failure: StageFailure) -> Diagnostic {
    if let Some((line, message)) = split_location_suffix(&failure.message) {
        return Diagnostic::new(line, message);
    }
    if let Some(line) = failure.line {
        return Diagnostic::new(line, failure.message);
    }
    Diagnostic::new(0, failure.message)
}

/// Split a trailing `(line:col)` location off a failure message.
///
/// Returns the line and the description with the location removed, or
/// `None` if the message does not end in that shape.
fn split_location_suffix(message: &str) -> Option<(u32, String)> {
    let rest = message.strip_suffix(')')?;
    let open = rest.rfind('(')?;
    let inside = &rest[open + 1..];

    let (line_str, col_str) = inside.split_once(':')?;
    if line_str.is_empty() || col_str.is_empty() {
        return None;
    }
    if !line_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !col_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    let line: u32 = line_str.parse().ok()?;
    let description = rest[..open].trim_end().to_string();
    Some((line, description))
}
