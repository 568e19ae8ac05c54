//! End-to-end tests for the sandbox layer.
//!
//! These drive the public surface the way an embedder would: compile with
//! the reference toolchain, execute through the reference engine, and
//! verify the error shape, the namespace protection, and the stop
//! lifecycle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use coop_script_sandbox_rs::prelude::*;
use coop_script_sandbox_rs::{testing, ManagedObject};
use tokio::sync::oneshot;
use tokio::time::timeout;

/// Helper to create a sandbox over the reference collaborators.
fn test_sandbox() -> Sandbox {
    Sandbox::new(testing::toolchain(), testing::engine_factory())
}

/// Run the program and await its completion callback.
async fn run_outcome(program: &Program) -> Outcome {
    let (tx, rx) = oneshot::channel();
    program.run(move |outcome| {
        let _ = tx.send(outcome);
    });
    timeout(Duration::from_secs(5), rx)
        .await
        .expect("run timed out")
        .expect("completion callback dropped")
}

/// Eval a unit in the program's scope and await its completion callback.
async fn eval_outcome(program: &Program, code: &str) -> Outcome {
    let (tx, rx) = oneshot::channel();
    program.eval(code, move |outcome| {
        let _ = tx.send(outcome);
    });
    timeout(Duration::from_secs(5), rx)
        .await
        .expect("eval timed out")
        .expect("completion callback dropped")
}

/// A source program flows through all four stages and completes with the
/// value of its final expression.
#[tokio::test]
async fn test_compile_and_run_completes_normally() {
    let sandbox = test_sandbox();
    let program = sandbox
        .compile("let x = 1; x;", CompileOptions::default())
        .unwrap();

    let outcome = run_outcome(&program).await;
    assert_eq!(outcome, Outcome::Normal(Value::Num(1.0)));
    assert!(!program.is_running());
}

/// A parse failure comes back as exactly one diagnostic with the line
/// extracted from the parser's message suffix.
#[tokio::test]
async fn test_parse_failure_is_one_positioned_diagnostic() {
    let err = test_sandbox()
        .compile("x +", CompileOptions::default())
        .unwrap_err();

    assert_eq!(err.errors.len(), 1);
    assert_eq!(err.errors[0].line, 1);
    assert_eq!(err.errors[0].message, "Unexpected end of input");
    assert!(err.to_string().starts_with("Line 1:"), "got: {err}");
}

/// Restriction violations arrive in order, one per violating construct.
#[tokio::test]
async fn test_restriction_violations_are_ordered() {
    let err = test_sandbox()
        .compile("loop { }\nlet a = 1;\nloop { }", CompileOptions::default())
        .unwrap_err();

    assert_eq!(err.errors.len(), 2);
    assert_eq!(err.errors[0].line, 1);
    assert_eq!(err.errors[1].line, 3);
    assert_eq!(err.errors[0].message, "loop statements are not permitted");
}

/// Disabling restrictions skips stage two; the same program compiles.
#[tokio::test]
async fn test_restrictions_disabled_admits_loops() {
    let opts = CompileOptions::builder().restrictions_disabled(true).build();
    assert!(test_sandbox().compile("loop { }", opts).is_ok());
}

/// The `version` global carries the value supplied at construction, on
/// both the run and the eval path.
#[tokio::test]
async fn test_version_global_matches_construction() {
    let opts = CompileOptions::builder().version(Value::str("3.1.0")).build();
    let program = test_sandbox().compile("version;", opts).unwrap();

    let outcome = run_outcome(&program).await;
    assert_eq!(outcome, Outcome::Normal(Value::str("3.1.0")));

    let outcome = eval_outcome(&program, "version;").await;
    assert_eq!(outcome, Outcome::Normal(Value::str("3.1.0")));
}

/// Writing to a fixed binding raises the protection error, and the binding
/// survives unchanged.
#[tokio::test]
async fn test_fixed_binding_write_is_rejected() {
    let program = test_sandbox()
        .compile("let x = 1;", CompileOptions::default())
        .unwrap();
    run_outcome(&program).await;

    let outcome = eval_outcome(&program, "console = 5;").await;
    let message = outcome.exception_message().unwrap();
    assert!(
        message.contains("is part of the global library, and cannot be overwritten"),
        "got: {message}"
    );
    assert!(program.globals().get("console").is_ok());
}

/// Host-side writes follow the same access-control contract.
#[tokio::test]
async fn test_host_writes_respect_protection() {
    let program = test_sandbox()
        .compile("let x = 1;", CompileOptions::default())
        .unwrap();

    assert!(program.globals().set("console", Value::Num(5.0)).is_err());
    program.globals().set("helper", Value::Num(7.0)).unwrap();

    let outcome = run_outcome(&program).await;
    assert!(outcome.is_normal());
    let outcome = eval_outcome(&program, "helper;").await;
    assert_eq!(outcome, Outcome::Normal(Value::Num(7.0)));
}

/// Eval units share the program's scope: state from earlier executions
/// stays visible.
#[tokio::test]
async fn test_eval_accumulates_state() {
    let program = test_sandbox()
        .compile("let counter = 10;", CompileOptions::default())
        .unwrap();
    run_outcome(&program).await;

    let outcome = eval_outcome(&program, "counter + 5;").await;
    assert_eq!(outcome, Outcome::Normal(Value::Num(15.0)));

    eval_outcome(&program, "counter = 20;").await;
    let outcome = eval_outcome(&program, "counter;").await;
    assert_eq!(outcome, Outcome::Normal(Value::Num(20.0)));
}

/// A registered whitelist module is reachable through `require` and comes
/// back frozen; an unregistered name raises the not-found error.
#[tokio::test]
async fn test_require_whitelist_modules() {
    let opts = CompileOptions::builder()
        .module("tools", |_ctx| {
            Ok(Value::Object(ManagedObject::from_pairs(vec![(
                "answer",
                Value::Num(42.0),
            )])))
        })
        .build();
    let program = test_sandbox()
        .compile(r#"let tools = require("tools"); tools.answer;"#, opts)
        .unwrap();

    let outcome = run_outcome(&program).await;
    assert_eq!(outcome, Outcome::Normal(Value::Num(42.0)));

    let outcome = eval_outcome(&program, r#"require("nope");"#).await;
    assert_eq!(outcome.exception_message(), Some("'nope' not found"));
}

/// Console output reaches the configured sink in program order.
#[tokio::test]
async fn test_console_output_ordering() {
    let captured: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&captured);
    let opts = CompileOptions::builder()
        .log_sink(move |line| sink.lock().unwrap().push(line.to_string()))
        .build();

    let program = test_sandbox()
        .compile(r#"console.log("first"); console.log("second", 2);"#, opts)
        .unwrap();
    run_outcome(&program).await;

    assert_eq!(
        captured.lock().unwrap().as_slice(),
        ["first", "second 2"]
    );
}

/// Stopping a looping program is eventual: the running flag drops
/// immediately and the stopped callback fires once the engine reaches a
/// safe point. The loop's completion callback never fires.
#[tokio::test]
async fn test_stop_interrupts_a_running_loop() {
    let opts = CompileOptions::builder().restrictions_disabled(true).build();
    let program = test_sandbox().compile("loop { 1; }", opts).unwrap();

    let (done_tx, mut done_rx) = oneshot::channel();
    program.run(move |outcome| {
        let _ = done_tx.send(outcome);
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(program.is_running());

    let (stop_tx, stop_rx) = oneshot::channel();
    program.stop(move || {
        let _ = stop_tx.send(());
    });
    assert!(!program.is_running());

    timeout(Duration::from_secs(5), stop_rx)
        .await
        .expect("stop was not honored")
        .expect("stopped callback dropped");
    assert!(done_rx.try_recv().is_err());
}

/// Stopping an idle program still fires the callback.
#[tokio::test]
async fn test_stop_idle_program() {
    let program = test_sandbox()
        .compile("let x = 1;", CompileOptions::default())
        .unwrap();

    let (tx, rx) = oneshot::channel();
    program.stop(move || {
        let _ = tx.send(());
    });
    timeout(Duration::from_secs(5), rx)
        .await
        .expect("stop timed out")
        .expect("stopped callback dropped");
}

/// A run issued after a stop executes the unit again from the top.
#[tokio::test]
async fn test_run_after_stop_restarts() {
    let opts = CompileOptions::builder().restrictions_disabled(true).build();
    let program = test_sandbox()
        .compile("let x = 9; x;", opts)
        .unwrap();

    let outcome = run_outcome(&program).await;
    assert_eq!(outcome, Outcome::Normal(Value::Num(9.0)));

    let (tx, rx) = oneshot::channel();
    program.stop(move || {
        let _ = tx.send(());
    });
    timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();

    let outcome = run_outcome(&program).await;
    assert_eq!(outcome, Outcome::Normal(Value::Num(9.0)));
}

/// An eval transform failure is delivered synchronously as an exception
/// whose message is the rendered diagnostic lines.
#[tokio::test]
async fn test_eval_transform_failure_shape() {
    let program = test_sandbox()
        .compile("let x = 1;", CompileOptions::default())
        .unwrap();

    let (tx, mut rx) = oneshot::channel();
    program.eval("loop { }", move |outcome| {
        let _ = tx.send(outcome);
    });
    let outcome = rx.try_recv().expect("callback did not fire synchronously");
    let message = outcome.exception_message().unwrap();
    assert_eq!(message, "Line 1: loop statements are not permitted");
    assert!(!program.is_running());
}
