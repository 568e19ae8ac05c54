//! A thread-backed reference implementation of the interruptible-execution
//! engine, interpreting the miniature script language.
//!
//! Variables live directly in the program's [`GlobalScope`], so `eval`
//! units see state left behind by earlier executions and writes to fixed
//! keys fail with the protection error. Pause requests are honored at
//! [`Stmt::Checkpoint`] statements; a pause requested while the engine is
//! idle fires its callback immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::error::{Result, SandboxError};
use crate::sandbox::engine::{DoneFn, EngineFactory, InterruptibleEngine, Outcome, StoppedFn};
use crate::sandbox::globals::GlobalScope;
use crate::sandbox::pipeline::Ast;
use crate::sandbox::value::Value;
use crate::testing::lang::{Expr, Script, Stmt};

/// Builds a [`MiniEngine`] over a parsed [`Script`].
pub struct MiniEngineFactory;

impl EngineFactory for MiniEngineFactory {
    fn instantiate(
        &self,
        ast: Ast,
        globals: Arc<GlobalScope>,
    ) -> anyhow::Result<Arc<dyn InterruptibleEngine>> {
        let script = ast
            .downcast::<Script>()
            .map_err(|_| anyhow::anyhow!("mini engine requires a mini-language syntax tree"))?;
        Ok(Arc::new(MiniEngine {
            program: *script,
            globals,
            ctl: Arc::new(EngineCtl::default()),
        }))
    }
}

#[derive(Default)]
struct EngineCtl {
    busy: AtomicBool,
    pause_requested: AtomicBool,
    on_paused: Mutex<Option<StoppedFn>>,
}

impl EngineCtl {
    /// Take and fire the pending pause callback if a pause was requested.
    /// Returns true when execution should unwind.
    fn honor_pause(&self) -> bool {
        if self.pause_requested.swap(false, Ordering::SeqCst) {
            if let Some(callback) = self.on_paused.lock().unwrap().take() {
                callback();
            }
            true
        } else {
            false
        }
    }
}

/// The reference engine. Each run/eval executes on a fresh spawned thread;
/// a run issued after a stop starts again from the top of the unit.
pub struct MiniEngine {
    program: Script,
    globals: Arc<GlobalScope>,
    ctl: Arc<EngineCtl>,
}

impl InterruptibleEngine for MiniEngine {
    fn run(&self, done: DoneFn) {
        self.spawn(self.program.clone(), done);
    }

    fn eval_ast(&self, ast: Ast, done: DoneFn) {
        match ast.downcast::<Script>() {
            Ok(script) => self.spawn(*script, done),
            Err(_) => done(Outcome::exception(
                "mini engine received a foreign compiled unit",
            )),
        }
    }

    fn pause(&self, on_paused: StoppedFn) {
        *self.ctl.on_paused.lock().unwrap() = Some(on_paused);
        self.ctl.pause_requested.store(true, Ordering::SeqCst);
        if !self.ctl.busy.load(Ordering::SeqCst) {
            // Idle, or the worker finished while we were storing the
            // request: honor it right here.
            self.ctl.pause_requested.store(false, Ordering::SeqCst);
            if let Some(callback) = self.ctl.on_paused.lock().unwrap().take() {
                callback();
            }
        }
    }
}

impl MiniEngine {
    fn spawn(&self, script: Script, done: DoneFn) {
        let globals = Arc::clone(&self.globals);
        let ctl = Arc::clone(&self.ctl);
        // Flip busy before the worker exists, so a pause issued right
        // after run/eval returns is routed to the worker instead of
        // firing as an idle pause.
        ctl.busy.store(true, Ordering::SeqCst);
        thread::spawn(move || execute(script, globals, ctl, done));
    }
}

enum Flow {
    Done,
    Paused,
    Failed(SandboxError),
}

fn execute(script: Script, globals: Arc<GlobalScope>, ctl: Arc<EngineCtl>, done: DoneFn) {
    let mut last = Value::Undefined;
    let flow = exec_block(&script.body, &globals, &ctl, &mut last);
    ctl.busy.store(false, Ordering::SeqCst);

    match flow {
        // A paused execution has no completion to deliver.
        Flow::Paused => {}
        Flow::Failed(err) => done(Outcome::from(err)),
        Flow::Done => done(Outcome::Normal(last)),
    }

    // A stop that raced our completion left its request behind; honor it
    // so the stopped callback still fires exactly once.
    if ctl.pause_requested.swap(false, Ordering::SeqCst) {
        if let Some(callback) = ctl.on_paused.lock().unwrap().take() {
            callback();
        }
    }
}

fn exec_block(
    body: &[Stmt],
    globals: &GlobalScope,
    ctl: &EngineCtl,
    last: &mut Value,
) -> Flow {
    for stmt in body {
        match stmt {
            Stmt::Checkpoint => {
                if ctl.honor_pause() {
                    return Flow::Paused;
                }
            }
            Stmt::Let { name, value, .. } | Stmt::Assign { name, value, .. } => {
                let value = match eval_expr(value, globals) {
                    Ok(value) => value,
                    Err(err) => return Flow::Failed(err),
                };
                if let Err(err) = globals.set(name, value) {
                    return Flow::Failed(err);
                }
            }
            Stmt::Expr { value, .. } => match eval_expr(value, globals) {
                Ok(value) => *last = value,
                Err(err) => return Flow::Failed(err),
            },
            Stmt::Loop { body, .. } => loop {
                match exec_block(body, globals, ctl, last) {
                    Flow::Done => {}
                    unwound => return unwound,
                }
            },
        }
    }
    Flow::Done
}

fn eval_expr(expr: &Expr, globals: &GlobalScope) -> Result<Value> {
    match expr {
        Expr::Num(n) => Ok(Value::Num(*n)),
        Expr::Str(s) => Ok(Value::str(s.clone())),
        Expr::Ident(name) => globals.get(name),
        Expr::Add(lhs, rhs) => {
            let lhs = eval_expr(lhs, globals)?;
            let rhs = eval_expr(rhs, globals)?;
            add_values(lhs, rhs)
        }
        Expr::Member { object, name } => {
            let object = eval_expr(object, globals)?;
            member_value(object, name)
        }
        Expr::Call { callee, args } => {
            let callee = eval_expr(callee, globals)?;
            let mut evaluated = Vec::with_capacity(args.len());
            for arg in args {
                evaluated.push(eval_expr(arg, globals)?);
            }
            match callee {
                Value::Native(f) => f.call(&evaluated),
                other => Err(SandboxError::Runtime(format!(
                    "{} is not a function",
                    other.type_name()
                ))),
            }
        }
    }
}

fn add_values(lhs: Value, rhs: Value) -> Result<Value> {
    match (&lhs, &rhs) {
        (Value::Num(a), Value::Num(b)) => Ok(Value::Num(a + b)),
        (Value::Str(_), _) | (_, Value::Str(_)) => {
            Ok(Value::str(format!("{}{}", lhs.to_display(), rhs.to_display())))
        }
        _ => Err(SandboxError::Runtime(format!(
            "cannot add {} and {}",
            lhs.type_name(),
            rhs.type_name()
        ))),
    }
}

fn member_value(object: Value, name: &str) -> Result<Value> {
    match object {
        Value::Object(obj) => Ok(obj.get(name).unwrap_or(Value::Undefined)),
        Value::Array(arr) => match name {
            "length" => Ok(Value::Num(arr.len() as f64)),
            other => Err(SandboxError::Runtime(format!(
                "arrays have no member '{other}'"
            ))),
        },
        other => Err(SandboxError::Runtime(format!(
            "cannot read member '{name}' of {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::config::CompileOptions;
    use crate::sandbox::globals::build_globals;
    use crate::sandbox::pipeline::{AstPass, Parser};
    use crate::testing::lang::{InsertCheckpoints, ScriptParser};
    use std::sync::mpsc;
    use std::time::Duration;

    fn engine_over(source: &str, opts: &CompileOptions) -> Arc<dyn InterruptibleEngine> {
        let ast = ScriptParser.parse(source).unwrap();
        let ast = InsertCheckpoints.apply(ast).unwrap();
        let globals = Arc::new(build_globals(opts).unwrap());
        MiniEngineFactory.instantiate(ast, globals).unwrap()
    }

    fn run_to_outcome(engine: &Arc<dyn InterruptibleEngine>) -> Outcome {
        let (tx, rx) = mpsc::channel();
        engine.run(Box::new(move |outcome| tx.send(outcome).unwrap()));
        rx.recv_timeout(Duration::from_secs(5)).expect("no completion")
    }

    #[test]
    fn test_last_expression_is_the_result() {
        let opts = CompileOptions::default();
        let engine = engine_over("let a = 2; a + 3;", &opts);
        assert_eq!(run_to_outcome(&engine), Outcome::Normal(Value::Num(5.0)));
    }

    #[test]
    fn test_string_concatenation() {
        let opts = CompileOptions::default();
        let engine = engine_over(r#""n = " + 4;"#, &opts);
        assert_eq!(
            run_to_outcome(&engine),
            Outcome::Normal(Value::str("n = 4"))
        );
    }

    #[test]
    fn test_undefined_identifier_is_an_exception() {
        let opts = CompileOptions::default();
        let engine = engine_over("missing;", &opts);
        let outcome = run_to_outcome(&engine);
        assert_eq!(
            outcome.exception_message(),
            Some("missing is not defined")
        );
    }

    #[test]
    fn test_fixed_key_write_is_an_exception() {
        let opts = CompileOptions::default();
        let engine = engine_over("console = 5;", &opts);
        let outcome = run_to_outcome(&engine);
        assert_eq!(
            outcome.exception_message(),
            Some("console is part of the global library, and cannot be overwritten")
        );
    }

    #[test]
    fn test_console_log_reaches_the_sink() {
        let (tx, rx) = mpsc::channel();
        let opts = CompileOptions::builder()
            .log_sink(move |line| tx.send(line.to_string()).unwrap())
            .build();
        let engine = engine_over(r#"console.log("hello", 1 + 1);"#, &opts);
        run_to_outcome(&engine);
        assert_eq!(rx.try_recv().unwrap(), "hello 2");
    }

    #[test]
    fn test_pause_interrupts_a_loop() {
        let opts = CompileOptions::default();
        let engine = engine_over("loop { 1; }", &opts);

        let (done_tx, done_rx) = mpsc::channel();
        engine.run(Box::new(move |outcome| {
            let _ = done_tx.send(outcome);
        }));
        thread::sleep(Duration::from_millis(20));

        let (stop_tx, stop_rx) = mpsc::channel();
        engine.pause(Box::new(move || stop_tx.send(()).unwrap()));
        stop_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("pause was not honored");
        // A paused run never completes.
        assert!(done_rx.try_recv().is_err());
    }

    #[test]
    fn test_pause_issued_right_after_run_stops_the_loop() {
        let count = Arc::new(Mutex::new(0u64));
        let counter = Arc::clone(&count);
        let opts = CompileOptions::builder()
            .log_sink(move |_| *counter.lock().unwrap() += 1)
            .build();
        let engine = engine_over(r#"loop { console.log("tick"); }"#, &opts);

        let (done_tx, done_rx) = mpsc::channel();
        engine.run(Box::new(move |outcome| {
            let _ = done_tx.send(outcome);
        }));
        // No settling delay: the request must reach the worker even if it
        // has not started executing yet.
        let (stop_tx, stop_rx) = mpsc::channel();
        engine.pause(Box::new(move || stop_tx.send(()).unwrap()));
        stop_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("pause was not honored");

        let seen = *count.lock().unwrap();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(
            *count.lock().unwrap(),
            seen,
            "loop kept running after the pause was honored"
        );
        assert!(done_rx.try_recv().is_err());
    }

    #[test]
    fn test_pause_while_idle_fires_immediately() {
        let opts = CompileOptions::default();
        let engine = engine_over("1;", &opts);
        let (tx, rx) = mpsc::channel();
        engine.pause(Box::new(move || tx.send(()).unwrap()));
        rx.try_recv().expect("idle pause should fire synchronously");
    }

    #[test]
    fn test_rerun_executes_from_the_top() {
        let opts = CompileOptions::default();
        let engine = engine_over("let n = 0; n = n + 1; n;", &opts);
        assert_eq!(run_to_outcome(&engine), Outcome::Normal(Value::Num(1.0)));
        // The unit re-executes in the same scope: n resets to 0 first.
        assert_eq!(run_to_outcome(&engine), Outcome::Normal(Value::Num(1.0)));
    }
}
