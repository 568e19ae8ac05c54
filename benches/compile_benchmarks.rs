//! Benchmarks for the compilation pipeline.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use coop_script_sandbox_rs::prelude::*;
use coop_script_sandbox_rs::testing;

/// A synthetic program of the given statement count.
fn synthetic_source(statements: usize) -> String {
    let mut source = String::new();
    for i in 0..statements {
        source.push_str(&format!("let v{i} = {i} + 1;\n"));
    }
    source.push_str("v0;\n");
    source
}

/// Benchmark the full compile path (pipeline plus namespace construction).
fn bench_compile(c: &mut Criterion) {
    let sandbox = Sandbox::new(testing::toolchain(), testing::engine_factory());

    let mut group = c.benchmark_group("compile");
    for statements in [10usize, 100, 1000] {
        let source = synthetic_source(statements);
        group.throughput(Throughput::Bytes(source.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(statements),
            &source,
            |b, source| {
                b.iter(|| {
                    let program = sandbox
                        .compile(black_box(source.as_str()), CompileOptions::default())
                        .unwrap();
                    black_box(program);
                });
            },
        );
    }
    group.finish();
}

/// Benchmark a compile that fails restriction enforcement, to measure the
/// diagnostic path.
fn bench_compile_rejection(c: &mut Criterion) {
    let sandbox = Sandbox::new(testing::toolchain(), testing::engine_factory());
    let source = "loop { let a = 1; }";

    c.bench_function("compile_rejection", |b| {
        b.iter(|| {
            let err = sandbox
                .compile(black_box(source), CompileOptions::default())
                .unwrap_err();
            black_box(err);
        });
    });
}

criterion_group!(benches, bench_compile, bench_compile_rejection);
criterion_main!(benches);
