//! Prelude module for convenient imports.

pub use crate::error::{CompileError, Diagnostic, Result, SandboxError};
pub use crate::sandbox::{
    config::CompileOptions,
    engine::Outcome,
    program::{Program, Sandbox},
    value::Value,
};
