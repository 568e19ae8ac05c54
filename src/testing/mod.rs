//! Reference collaborators: a miniature script language with a full
//! four-stage toolchain, and a thread-backed interruptible engine over it.
//!
//! Real embedders bring their own parser, passes, and engine; this module
//! exists so the sandbox layer can be exercised end to end without them,
//! by this crate's tests, benches, and demos.

pub mod engine;
pub mod lang;

use std::sync::Arc;

use crate::sandbox::engine::EngineFactory;
use crate::sandbox::pipeline::Toolchain;

/// The miniature language's toolchain: parser, loop-denying restriction
/// pass, constant-folding lowering, and checkpoint instrumentation.
pub fn toolchain() -> Toolchain {
    Toolchain {
        parser: Arc::new(lang::ScriptParser),
        restrictions: Arc::new(lang::DenyLoops),
        lowerings: vec![Arc::new(lang::FoldConstants)],
        instrumentation: Arc::new(lang::InsertCheckpoints),
    }
}

/// A factory producing [`engine::MiniEngine`] instances.
pub fn engine_factory() -> Arc<dyn EngineFactory> {
    Arc::new(engine::MiniEngineFactory)
}
