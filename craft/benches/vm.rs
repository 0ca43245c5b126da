//! Dispatch-loop benchmarks against a small fixed set of programs, matching
//! the `[[bench]] name = "vm"` entry declared in `Cargo.toml`.

use criterion::{criterion_group, criterion_main, Criterion};

use craft::Vm;

fn run(source: &str) {
    let mut vm = Vm::new(std::io::sink());
    vm.interpret(source);
}

fn recursive_fibonacci(c: &mut Criterion) {
    let source = "fun fib(n) { if (n < 2) return n; return fib(n - 1) + fib(n - 2); } fib(20);";
    c.bench_function("recursive_fibonacci", |b| b.iter(|| run(source)));
}

fn tight_loop(c: &mut Criterion) {
    let source = "var i = 0; var sum = 0; while (i < 100000) { sum = sum + i; i = i + 1; }";
    c.bench_function("tight_loop", |b| b.iter(|| run(source)));
}

fn deep_closure_chain(c: &mut Criterion) {
    let source = r#"
        fun make(n) {
            var x = n;
            fun get() { return x; }
            return get;
        }
        fun chain(n) {
            if (n == 0) return make(0);
            var prev = chain(n - 1);
            fun wrap() { return prev(); }
            return wrap;
        }
        var f = chain(200);
        f();
    "#;
    c.bench_function("deep_closure_chain", |b| b.iter(|| run(source)));
}

criterion_group!(benches, recursive_fibonacci, tight_loop, deep_closure_chain);
criterion_main!(benches);
