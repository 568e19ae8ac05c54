//! Caller-supplied compilation options, with builder pattern.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::sandbox::value::{ModuleCtx, Value};

/// Destination for the sandboxed program's console output.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// A statically registered whitelist-module factory. Invoked exactly once
/// per compile with a [`ModuleCtx`] exposing the three sanctioned
/// capabilities; its return value is the module's capability bundle.
pub type ModuleFactory = Arc<dyn Fn(&ModuleCtx) -> Result<Value> + Send + Sync>;

/// Configuration for sandbox compilation. Immutable once passed to
/// `compile`.
#[derive(Clone)]
pub struct CompileOptions {
    /// Skip the restriction-enforcement stage entirely.
    pub restrictions_disabled: bool,
    /// Whitelist modules, keyed by the name sandboxed code requires them
    /// under.
    pub modules: HashMap<String, ModuleFactory>,
    /// Where `console.log` output goes.
    pub log_sink: LogSink,
    /// Opaque value exposed to sandboxed code as the `version` global.
    pub version: Value,
}

impl std::fmt::Debug for CompileOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.modules.keys().collect();
        names.sort();
        f.debug_struct("CompileOptions")
            .field("restrictions_disabled", &self.restrictions_disabled)
            .field("modules", &names)
            .field("version", &self.version)
            .finish()
    }
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            restrictions_disabled: false,
            modules: HashMap::new(),
            log_sink: Arc::new(|_| {}),
            version: Value::Undefined,
        }
    }
}

impl CompileOptions {
    /// Create a new builder for CompileOptions.
    pub fn builder() -> CompileOptionsBuilder {
        CompileOptionsBuilder::default()
    }
}

/// Builder for creating CompileOptions instances.
#[derive(Default)]
pub struct CompileOptionsBuilder {
    restrictions_disabled: bool,
    modules: HashMap<String, ModuleFactory>,
    log_sink: Option<LogSink>,
    version: Option<Value>,
}

impl CompileOptionsBuilder {
    /// Disable the restriction-enforcement stage.
    pub fn restrictions_disabled(mut self, disabled: bool) -> Self {
        self.restrictions_disabled = disabled;
        self
    }

    /// Register a whitelist module under the given name.
    pub fn module(
        mut self,
        name: impl Into<String>,
        factory: impl Fn(&ModuleCtx) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.modules.insert(name.into(), Arc::new(factory));
        self
    }

    /// Set the console output sink.
    pub fn log_sink(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log_sink = Some(Arc::new(sink));
        self
    }

    /// Set the opaque `version` value.
    pub fn version(mut self, version: Value) -> Self {
        self.version = Some(version);
        self
    }

    /// Build the CompileOptions.
    pub fn build(self) -> CompileOptions {
        let default = CompileOptions::default();
        CompileOptions {
            restrictions_disabled: self.restrictions_disabled,
            modules: self.modules,
            log_sink: self.log_sink.unwrap_or(default.log_sink),
            version: self.version.unwrap_or(default.version),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = CompileOptions::default();
        assert!(!opts.restrictions_disabled);
        assert!(opts.modules.is_empty());
        assert_eq!(opts.version, Value::Undefined);
    }

    #[test]
    fn test_builder() {
        let opts = CompileOptions::builder()
            .restrictions_disabled(true)
            .version(Value::str("3.1.0"))
            .module("stdlib", |_ctx| Ok(Value::Undefined))
            .build();

        assert!(opts.restrictions_disabled);
        assert_eq!(opts.version, Value::str("3.1.0"));
        assert!(opts.modules.contains_key("stdlib"));
    }
}
