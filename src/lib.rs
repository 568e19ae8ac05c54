//! # Script Sandbox
//!
//! A construction and execution-control layer for restricted-script
//! sandboxes.
//!
//! Source text runs through a four-stage compilation pipeline (parse,
//! restriction enforcement, lowering, instrumentation) into a program
//! whose global namespace is built up-front and protected. Execution is
//! delegated to an injected interruptible engine and controlled through a
//! run/eval/stop lifecycle. The layer guarantees:
//!
//! - **One error shape**: every compile-time failure, whatever its stage,
//!   reaches the caller as an ordered list of `{line, message}` diagnostics
//! - **Protected globals**: the fixed bindings installed at construction
//!   can never be overwritten, by sandboxed code or by the host
//! - **Module whitelist**: sandboxed code reaches host capabilities only
//!   through statically registered module factories, via `require`
//! - **Cooperative interruption**: a `stop` request is honored at the
//!   engine's next safe point, and managed-container traffic keeps safe
//!   points frequent even in iteration-heavy code
//!
//! ## Example
//!
//! ```rust,ignore
//! use coop_script_sandbox_rs::prelude::*;
//!
//! let sandbox = Sandbox::new(my_toolchain(), my_engine_factory());
//! let opts = CompileOptions::builder()
//!     .version(Value::str("3.1.0"))
//!     .build();
//!
//! let program = sandbox.compile("let x = 1; x;", opts)?;
//! program.run(|outcome| println!("{outcome:?}"));
//! ```
//!
//! ## Execution Model
//!
//! The handle to the most recently compiled program's engine is
//! process-wide: at most one program runs through it at any instant, and
//! embedders hosting several programs serialize their run/eval calls.
//! Completion is always delivered through callbacks, never return values.

pub mod error;
pub mod prelude;
pub mod sandbox;
pub mod testing;

// Re-export main types at crate root for convenience
pub use error::{CompileError, Diagnostic, Result, SandboxError, StageFailure};
pub use sandbox::config::{CompileOptions, CompileOptionsBuilder, LogSink, ModuleFactory};
pub use sandbox::engine::{
    DoneFn, EngineFactory, EngineHandle, Interrupt, InterruptibleEngine, Outcome, StoppedFn,
};
pub use sandbox::globals::GlobalScope;
pub use sandbox::pipeline::{
    Ast, AstPass, CodeInput, Parser, Pipeline, RestrictionPass, Toolchain, Violations,
};
pub use sandbox::program::{Program, Sandbox};
pub use sandbox::value::{ManagedArray, ManagedObject, ModuleCtx, NativeFn, Value};
