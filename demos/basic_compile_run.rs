//! Compile and run a small program end to end with the reference
//! collaborators, printing its console output and final value.
//!
//! Run with: cargo run --example basic_compile_run

use std::sync::mpsc;

use coop_script_sandbox_rs::prelude::*;
use coop_script_sandbox_rs::testing;

fn main() {
    let sandbox = Sandbox::new(testing::toolchain(), testing::engine_factory());

    let opts = CompileOptions::builder()
        .version(Value::str("3.1.0"))
        .log_sink(|line| println!("[sandbox] {line}"))
        .build();

    let source = r#"
        let greeting = "hello, " + "sandbox";
        console.log(greeting);
        console.log("running version", version);
        1 + 2;
    "#;

    let program = match sandbox.compile(source, opts) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("compile failed:\n{err}");
            std::process::exit(1);
        }
    };

    let (tx, rx) = mpsc::channel();
    program.run(move |outcome| tx.send(outcome).unwrap());

    match rx.recv().expect("no completion") {
        Outcome::Normal(value) => println!("result: {}", value.to_display()),
        Outcome::Exception { message, .. } => eprintln!("exception: {message}"),
    }
}
