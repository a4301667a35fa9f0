//! Runner and suite benchmarks.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use focalcheck_focal::checksum::adler32;
use focalcheck_harness::{Reporter, TestRegistry, TestRunner};

fn bench_run_trivial_cases(c: &mut Criterion) {
    let mut group = c.benchmark_group("run_trivial_cases");

    for &count in &[1usize, 16, 128] {
        group.bench_with_input(BenchmarkId::new("cases", count), &count, |b, &n| {
            let mut registry = TestRegistry::new();
            for i in 0..n {
                registry
                    .register(format!("case-{i}"), |ctx| {
                        ctx.recorder.record_true(true, "ok");
                        Ok(())
                    })
                    .expect("register");
            }
            let runner = TestRunner::new("bench");
            b.iter(|| {
                let results = runner.run(&mut registry);
                criterion::black_box(Reporter::exit_code(&results));
            });
        });
    }
    group.finish();
}

fn bench_focal_suite(c: &mut Criterion) {
    let mut group = c.benchmark_group("focal_suite");

    group.bench_function("register_and_run", |b| {
        b.iter(|| {
            let mut registry = TestRegistry::new();
            focalcheck_focal::register_all(&mut registry).expect("register suite");
            let results = TestRunner::new("bench").run(&mut registry);
            criterion::black_box(Reporter::new().render(&results));
        });
    });

    group.finish();
}

fn bench_adler32(c: &mut Criterion) {
    let mut group = c.benchmark_group("adler32");

    for &size in &[64usize, 4096, 65536] {
        let data = vec![0xa5u8; size];
        group.bench_with_input(BenchmarkId::new("one_shot", size), &data, |b, d| {
            b.iter(|| criterion::black_box(adler32(d)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_run_trivial_cases, bench_focal_suite, bench_adler32);
criterion_main!(benches);
