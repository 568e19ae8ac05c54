//! The interruptible-execution engine contract and the process-wide handle.
//!
//! How the engine achieves cooperative suspension is not this layer's
//! concern; only its run / eval-from-ast / pause contract is. The handle to
//! the most recently instantiated engine is process-wide: at most one
//! program may be actively running through it at any instant, and multiple
//! programs in one process must serialize their run/eval calls.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::sandbox::globals::GlobalScope;
use crate::sandbox::pipeline::Ast;
use crate::sandbox::value::Value;

/// The result of one run/eval execution.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The program completed; carries the value of its final expression.
    Normal(Value),
    /// The program raised an uncaught failure.
    Exception {
        /// Engine-provided stack description, possibly empty.
        stack: Vec<String>,
        /// The failure rendered as text.
        message: String,
    },
}

impl Outcome {
    /// An exception outcome with no stack.
    pub fn exception(message: impl Into<String>) -> Self {
        Outcome::Exception {
            stack: Vec::new(),
            message: message.into(),
        }
    }

    /// Check if this is a normal completion.
    pub fn is_normal(&self) -> bool {
        matches!(self, Outcome::Normal(_))
    }

    /// Check if this is an exception.
    pub fn is_exception(&self) -> bool {
        matches!(self, Outcome::Exception { .. })
    }

    /// The exception message, if this is an exception.
    pub fn exception_message(&self) -> Option<&str> {
        match self {
            Outcome::Exception { message, .. } => Some(message),
            Outcome::Normal(_) => None,
        }
    }
}

impl From<crate::error::SandboxError> for Outcome {
    fn from(err: crate::error::SandboxError) -> Self {
        Outcome::exception(err.to_string())
    }
}

/// Completion callback for run/eval. Completion is always delivered through
/// this, never through a return value, even for programs that never
/// suspend.
pub type DoneFn = Box<dyn FnOnce(Outcome) + Send>;

/// Callback fired once a requested pause has been honored.
pub type StoppedFn = Box<dyn FnOnce() + Send>;

/// The externally supplied engine running compiled code while retaining the
/// ability to pause at safe points of its own choosing.
pub trait InterruptibleEngine: Send + Sync {
    /// Execute the unit the engine was instantiated over.
    fn run(&self, done: DoneFn);

    /// Execute a freshly compiled unit inside the engine's existing global
    /// scope, so state accumulated by prior executions stays visible.
    fn eval_ast(&self, ast: Ast, done: DoneFn);

    /// Request a pause at the next safe point. Best-effort and eventual,
    /// never instantaneous; the callback fires once the pause is honored.
    fn pause(&self, on_paused: StoppedFn);
}

/// Instantiates an engine over a compiled unit and a global scope.
pub trait EngineFactory: Send + Sync {
    /// Build an engine for the given unit, with the scope installed as its
    /// global namespace.
    fn instantiate(
        &self,
        ast: Ast,
        globals: Arc<GlobalScope>,
    ) -> anyhow::Result<Arc<dyn InterruptibleEngine>>;
}

/// Interruption bookkeeping shared between managed containers and the
/// engine. Container traffic ticks the access counter; engines may treat
/// any tick as a safe point.
#[derive(Debug, Default)]
pub struct Interrupt {
    pause_requested: AtomicBool,
    accesses: AtomicU64,
}

impl Interrupt {
    /// Record one managed-container access.
    pub fn tick(&self) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
    }

    /// Total managed-container accesses recorded so far.
    pub fn accesses(&self) -> u64 {
        self.accesses.load(Ordering::Relaxed)
    }

    /// Flag that a pause has been requested.
    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Clear the pause flag, e.g. after the pause was honored.
    pub fn clear_pause(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    /// Check whether a pause is pending.
    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }
}

/// A shareable handle over an instantiated engine plus its interruption
/// bookkeeping.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<dyn InterruptibleEngine>,
    interrupt: Arc<Interrupt>,
}

impl EngineHandle {
    /// Wrap an engine in a handle with fresh bookkeeping.
    pub fn new(engine: Arc<dyn InterruptibleEngine>) -> Self {
        Self {
            engine,
            interrupt: Arc::new(Interrupt::default()),
        }
    }

    /// The engine itself.
    pub fn engine(&self) -> &Arc<dyn InterruptibleEngine> {
        &self.engine
    }

    /// The interruption bookkeeping.
    pub fn interrupt(&self) -> &Arc<Interrupt> {
        &self.interrupt
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("engine", &"<dyn InterruptibleEngine>")
            .field("interrupt", &self.interrupt)
            .finish()
    }
}

/// The process-wide handle slot. `compile()` installs the handle of the
/// engine it instantiates; run/eval/stop require a handle to be present.
static ACTIVE_HANDLE: RwLock<Option<EngineHandle>> = RwLock::new(None);

/// Install a handle as the process-wide active one, replacing any previous
/// handle.
pub fn install(handle: EngineHandle) {
    *ACTIVE_HANDLE.write().unwrap() = Some(handle);
}

/// The currently installed handle, if any.
pub fn current() -> Option<EngineHandle> {
    ACTIVE_HANDLE.read().unwrap().clone()
}

/// Remove the installed handle. Subsequent run/eval/stop calls on any
/// program become usage-protocol violations until a new compile installs
/// one.
pub fn clear() {
    *ACTIVE_HANDLE.write().unwrap() = None;
}

/// Tick the installed handle's bookkeeping, if one is installed. Managed
/// containers call this on every access.
pub(crate) fn checkpoint() {
    if let Some(handle) = current() {
        handle.interrupt.tick();
    }
}

#[cfg(test)]
pub(crate) static SLOT_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
