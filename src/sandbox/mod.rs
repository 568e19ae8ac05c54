//! The sandbox layer: compilation pipeline, protected namespace, value
//! model, and the run/eval/stop lifecycle over an interruptible engine.

pub mod config;
pub mod engine;
pub mod globals;
pub mod pipeline;
pub mod program;
pub mod value;
