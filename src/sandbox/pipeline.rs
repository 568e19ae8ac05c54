//! The multi-stage compilation pipeline.
//!
//! The parser, the restriction-enforcement pass, the lowering passes, and
//! the higher-order-function instrumentation pass are external collaborators
//! consumed through the narrow traits below. The pipeline only sequences
//! them and funnels their failures into the one diagnostic shape.

use std::any::Any;
use std::sync::Arc;

use crate::error::{normalize, CompileError, Diagnostic, StageFailure};

/// An opaque syntax tree threaded between pipeline stages and handed to the
/// execution engine. Collaborators own the concrete node types; this layer
/// never inspects them.
pub struct Ast(Box<dyn Any + Send>);

impl Ast {
    /// Box a collaborator-owned syntax tree.
    pub fn new<T: Any + Send>(tree: T) -> Self {
        Self(Box::new(tree))
    }

    /// Recover the concrete tree, or hand the box back unchanged if it
    /// belongs to a different collaborator.
    pub fn downcast<T: Any>(self) -> std::result::Result<Box<T>, Ast> {
        self.0.downcast::<T>().map_err(Ast)
    }

    /// Borrow the concrete tree if it is of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for Ast {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Ast(<opaque>)")
    }
}

/// Input to compilation: source text, or a tree that already passed a
/// parser somewhere else.
#[derive(Debug)]
pub enum CodeInput {
    /// Raw source text; runs through every pipeline stage.
    Source(String),
    /// A pre-parsed tree; skips the parse stage.
    Ast(Ast),
}

impl From<&str> for CodeInput {
    fn from(source: &str) -> Self {
        CodeInput::Source(source.to_string())
    }
}

impl From<String> for CodeInput {
    fn from(source: String) -> Self {
        CodeInput::Source(source)
    }
}

impl From<Ast> for CodeInput {
    fn from(ast: Ast) -> Self {
        CodeInput::Ast(ast)
    }
}

/// Ordered restriction violations, already in the target `{line, message}`
/// shape. These pass through to the caller unmodified, never through the
/// normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violations(pub Vec<Diagnostic>);

/// Turns source text into a syntax tree. Parse failures conventionally
/// embed a `(line:col)` location in their message text.
pub trait Parser: Send + Sync {
    /// Parse source text into a tree.
    fn parse(&self, source: &str) -> std::result::Result<Ast, StageFailure>;
}

/// Rejects or rewrites constructs outside the approved language subset.
pub trait RestrictionPass: Send + Sync {
    /// Enforce the restriction rules, reporting every violating construct.
    fn enforce(&self, ast: Ast) -> std::result::Result<Ast, Violations>;
}

/// A tree-to-tree rewrite: lowering of legacy constructs, or the
/// instrumentation that keeps iteration-heavy code interruptible. Expected
/// to succeed on any tree that passed restriction enforcement.
pub trait AstPass: Send + Sync {
    /// Apply the rewrite.
    fn apply(&self, ast: Ast) -> std::result::Result<Ast, StageFailure>;
}

/// The full set of collaborators the pipeline sequences.
#[derive(Clone)]
pub struct Toolchain {
    /// Stage 1: text to tree.
    pub parser: Arc<dyn Parser>,
    /// Stage 2: restriction enforcement (skipped when disabled).
    pub restrictions: Arc<dyn RestrictionPass>,
    /// Stage 3: lowering passes, applied in order.
    pub lowerings: Vec<Arc<dyn AstPass>>,
    /// Stage 4: higher-order-function instrumentation.
    pub instrumentation: Arc<dyn AstPass>,
}

/// Runs the ordered compilation stages, short-circuiting on the first
/// failure.
pub struct Pipeline {
    toolchain: Toolchain,
}

impl Pipeline {
    /// Create a pipeline over the given collaborators.
    pub fn new(toolchain: Toolchain) -> Self {
        Self { toolchain }
    }

    /// Run the pipeline.
    ///
    /// Stage order is parse (source input only), restriction enforcement
    /// (unless disabled), lowering, instrumentation. Restriction violations
    /// pass through as-is; any other stage failure is normalized into a
    /// single diagnostic. This never panics past the API boundary.
    pub fn apply(
        &self,
        input: CodeInput,
        restrictions_disabled: bool,
    ) -> std::result::Result<Ast, CompileError> {
        let ast = match input {
            CodeInput::Source(text) => self
                .toolchain
                .parser
                .parse(&text)
                .map_err(|f| CompileError::single(normalize(f)))?,
            CodeInput::Ast(ast) => ast,
        };

        let ast = if restrictions_disabled {
            ast
        } else {
            self.toolchain
                .restrictions
                .enforce(ast)
                .map_err(|Violations(errors)| CompileError { errors })?
        };

        let mut ast = ast;
        for pass in &self.toolchain.lowerings {
            ast = pass
                .apply(ast)
                .map_err(|f| CompileError::single(normalize(f)))?;
        }

        self.toolchain
            .instrumentation
            .apply(ast)
            .map_err(|f| CompileError::single(normalize(f)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Marker(Vec<&'static str>);

    struct FakeParser {
        fail: bool,
    }

    impl Parser for FakeParser {
        fn parse(&self, _source: &str) -> std::result::Result<Ast, StageFailure> {
            if self.fail {
                Err(StageFailure::new("Unexpected token (3:7)"))
            } else {
                Ok(Ast::new(Marker(vec!["parsed"])))
            }
        }
    }

    struct Tag(&'static str);

    impl AstPass for Tag {
        fn apply(&self, ast: Ast) -> std::result::Result<Ast, StageFailure> {
            let mut marker = ast
                .downcast::<Marker>()
                .map_err(|_| StageFailure::new("foreign tree"))?;
            marker.0.push(self.0);
            Ok(Ast::new(*marker))
        }
    }

    struct RejectAll;

    impl RestrictionPass for RejectAll {
        fn enforce(&self, _ast: Ast) -> std::result::Result<Ast, Violations> {
            Err(Violations(vec![
                Diagnostic::new(1, "first violation"),
                Diagnostic::new(2, "second violation"),
            ]))
        }
    }

    struct AllowAll;

    impl RestrictionPass for AllowAll {
        fn enforce(&self, ast: Ast) -> std::result::Result<Ast, Violations> {
            Ok(ast)
        }
    }

    fn toolchain(parser_fails: bool, reject: bool) -> Toolchain {
        Toolchain {
            parser: Arc::new(FakeParser { fail: parser_fails }),
            restrictions: if reject {
                Arc::new(RejectAll)
            } else {
                Arc::new(AllowAll)
            },
            lowerings: vec![Arc::new(Tag("lowered"))],
            instrumentation: Arc::new(Tag("instrumented")),
        }
    }

    #[test]
    fn test_stages_run_in_order() {
        let pipeline = Pipeline::new(toolchain(false, false));
        let ast = pipeline.apply("anything".into(), false).unwrap();
        let marker = ast.downcast::<Marker>().unwrap();
        assert_eq!(marker.0, vec!["parsed", "lowered", "instrumented"]);
    }

    #[test]
    fn test_parse_failure_extracts_location() {
        let pipeline = Pipeline::new(toolchain(true, false));
        let err = pipeline.apply("x +".into(), false).unwrap_err();
        assert_eq!(err.errors.len(), 1);
        assert_eq!(err.errors[0].line, 3);
        assert_eq!(err.errors[0].message, "Unexpected token");
    }

    #[test]
    fn test_violations_pass_through_unmodified() {
        let pipeline = Pipeline::new(toolchain(false, true));
        let err = pipeline.apply("anything".into(), false).unwrap_err();
        assert_eq!(err.errors.len(), 2);
        assert_eq!(err.errors[0], Diagnostic::new(1, "first violation"));
        assert_eq!(err.errors[1], Diagnostic::new(2, "second violation"));
    }

    #[test]
    fn test_disabled_restrictions_skip_stage_two() {
        let pipeline = Pipeline::new(toolchain(false, true));
        let ast = pipeline.apply("anything".into(), true).unwrap();
        let marker = ast.downcast::<Marker>().unwrap();
        assert_eq!(marker.0, vec!["parsed", "lowered", "instrumented"]);
    }

    #[test]
    fn test_pre_parsed_input_skips_the_parser() {
        // A failing parser is never consulted for AST input.
        let pipeline = Pipeline::new(toolchain(true, false));
        let input = CodeInput::Ast(Ast::new(Marker(vec!["external"])));
        let ast = pipeline.apply(input, false).unwrap();
        let marker = ast.downcast::<Marker>().unwrap();
        assert_eq!(marker.0, vec!["external", "lowered", "instrumented"]);
    }
}
