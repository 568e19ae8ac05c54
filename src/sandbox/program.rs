//! The run/eval/stop lifecycle over the interruptible-execution engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{CompileError, Diagnostic, SandboxError};
use crate::sandbox::config::CompileOptions;
use crate::sandbox::engine::{self, EngineHandle, InterruptibleEngine, Outcome, StoppedFn};
use crate::sandbox::globals::{build_globals, GlobalScope};
use crate::sandbox::pipeline::{CodeInput, Pipeline, Toolchain};

/// Per-program mutable state: the running flag and the pending stop
/// callback. Shared with engine-delivered completion callbacks, which may
/// arrive on an engine-owned thread.
pub(crate) struct RunState {
    is_running: AtomicBool,
    on_stopped: Mutex<Option<StoppedFn>>,
}

impl RunState {
    fn new() -> Self {
        Self {
            is_running: AtomicBool::new(false),
            on_stopped: Mutex::new(None),
        }
    }
}

/// The host-side entry point: a compilation toolchain plus the factory for
/// the interruptible-execution engine, both injected by the embedder.
pub struct Sandbox {
    pipeline: Arc<Pipeline>,
    factory: Arc<dyn engine::EngineFactory>,
}

impl Sandbox {
    /// Create a sandbox over the given collaborators.
    pub fn new(toolchain: Toolchain, factory: Arc<dyn engine::EngineFactory>) -> Self {
        Self {
            pipeline: Arc::new(Pipeline::new(toolchain)),
            factory,
        }
    }

    /// Compile source text or a pre-parsed tree into a runnable program.
    ///
    /// Runs the full pipeline, evaluates the whitelist-module factories,
    /// builds the protected namespace, and instantiates an engine over it.
    /// The new engine's handle becomes the process-wide active handle.
    /// Never panics past this boundary: every failure comes back as the
    /// ordered diagnostic sequence.
    pub fn compile(
        &self,
        code: impl Into<CodeInput>,
        opts: CompileOptions,
    ) -> Result<Program, CompileError> {
        let ast = self.pipeline.apply(code.into(), opts.restrictions_disabled)?;

        let globals = Arc::new(
            build_globals(&opts)
                .map_err(|e| CompileError::single(Diagnostic::new(0, e.to_string())))?,
        );

        let engine = self.factory.instantiate(ast, Arc::clone(&globals)).map_err(|e| {
            CompileError::single(Diagnostic::new(0, SandboxError::EngineInit(e).to_string()))
        })?;

        engine::install(EngineHandle::new(Arc::clone(&engine)));
        #[cfg(feature = "tracing")]
        tracing::debug!(fixed = globals.fixed_names().len(), "program compiled");

        Ok(Program {
            engine,
            globals,
            state: Arc::new(RunState::new()),
            pipeline: Arc::clone(&self.pipeline),
            restrictions_disabled: opts.restrictions_disabled,
        })
    }
}

/// A compiled sandbox program: the protected namespace plus run/eval/stop
/// over the engine. One per successful `compile`.
pub struct Program {
    engine: Arc<dyn InterruptibleEngine>,
    globals: Arc<GlobalScope>,
    state: Arc<RunState>,
    pipeline: Arc<Pipeline>,
    restrictions_disabled: bool,
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("restrictions_disabled", &self.restrictions_disabled)
            .finish_non_exhaustive()
    }
}

impl Program {
    /// The program's namespace, for host-side inspection or
    /// post-construction injection of helper bindings. Host writes follow
    /// the same access-control contract as program writes: fixed keys stay
    /// protected.
    pub fn globals(&self) -> &GlobalScope {
        &self.globals
    }

    /// Whether a run/eval is currently in flight. Flips false ahead of the
    /// engine honoring a `stop`.
    pub fn is_running(&self) -> bool {
        self.state.is_running.load(Ordering::SeqCst)
    }

    /// Execute the compiled program.
    ///
    /// Completion is always delivered through `on_done`, never a return
    /// value. Concurrent run/eval calls on the same program are undefined;
    /// callers serialize. Re-running after a `stop` is permitted: the
    /// engine decides whether it resumes or restarts.
    ///
    /// # Panics
    ///
    /// Panics if no process-wide execution handle is installed. That is a
    /// bug in the embedding code, not a sandboxed-program error.
    pub fn run(&self, on_done: impl FnOnce(Outcome) + Send + 'static) {
        let _handle = require_handle("run");
        #[cfg(feature = "tracing")]
        tracing::debug!("run requested");
        self.state.is_running.store(true, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        self.engine.run(Box::new(move |outcome| {
            state.is_running.store(false, Ordering::SeqCst);
            on_done(outcome);
        }));
    }

    /// Compile and execute a new unit inside this program's existing
    /// namespace, so state accumulated by prior run/eval calls stays
    /// visible.
    ///
    /// On a transform failure `on_done` is invoked synchronously with an
    /// exception whose message is the diagnostics rendered as
    /// `"Line <n>: <message>"` lines; the running flag is untouched.
    ///
    /// # Panics
    ///
    /// Panics if no process-wide execution handle is installed (embedding
    /// bug).
    pub fn eval(
        &self,
        code: impl Into<CodeInput>,
        on_done: impl FnOnce(Outcome) + Send + 'static,
    ) {
        let ast = match self.pipeline.apply(code.into(), self.restrictions_disabled) {
            Ok(ast) => ast,
            Err(err) => {
                on_done(Outcome::exception(err.render()));
                return;
            }
        };
        let _handle = require_handle("eval");
        #[cfg(feature = "tracing")]
        tracing::debug!("eval requested");
        self.state.is_running.store(true, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        self.engine.eval_ast(
            ast,
            Box::new(move |outcome| {
                state.is_running.store(false, Ordering::SeqCst);
                on_done(outcome);
            }),
        );
    }

    /// Request that the running program stop at the engine's next safe
    /// point. Best-effort and eventual, never instantaneous: the running
    /// flag flips false immediately (optimistic), and `on_stopped` fires
    /// exactly once when the engine honors the pause. Stopping a
    /// non-running program still fires the callback.
    ///
    /// # Panics
    ///
    /// Panics if no process-wide execution handle is installed (embedding
    /// bug).
    pub fn stop(&self, on_stopped: impl FnOnce() + Send + 'static) {
        let handle = require_handle("stop");
        #[cfg(feature = "tracing")]
        tracing::debug!("stop requested");
        self.state.is_running.store(false, Ordering::SeqCst);
        *self.state.on_stopped.lock().unwrap() = Some(Box::new(on_stopped));
        handle.interrupt().request_pause();

        let state = Arc::clone(&self.state);
        let interrupt = Arc::clone(handle.interrupt());
        self.engine.pause(Box::new(move || {
            // The pause is honored; a later run/eval starts with a clean
            // flag.
            interrupt.clear_pause();
            if let Some(callback) = state.on_stopped.lock().unwrap().take() {
                callback();
            }
        }));
    }
}

/// Fetch the process-wide handle or abort: operating without one is a
/// usage-protocol violation by the embedder.
fn require_handle(operation: &str) -> EngineHandle {
    match engine::current() {
        Some(handle) => handle,
        None => panic!("invalid execution handle in {operation}"),
    }
}
