use std::sync::Barrier;

use rcblock::ordering::Relaxed;
use rcblock::RcBox;

fn clone_drop(n: usize) {
    let rc = RcBox::new(String::from("hello"));
    for _ in 0..n {
        let other = RcBox::clone(&rc);
        drop(other);
    }
}

fn clone_drop_relaxed(n: usize) {
    let rc = RcBox::new_in(String::from("hello"), Relaxed);
    for _ in 0..n {
        let other = RcBox::clone(&rc);
        drop(other);
    }
}

fn contended(n: usize) {
    let rc = RcBox::new(0usize);
    let barrier = Barrier::new(4);

    std::thread::scope(|s| {
        for _ in 0..4 {
            let rc = RcBox::clone(&rc);
            let barrier = &barrier;
            s.spawn(move || {
                barrier.wait();
                for _ in 0..n {
                    let _ = RcBox::clone(&rc);
                }
            });
        }
    });
}

fn allocate(n: usize) {
    for i in 0..n {
        let array: RcBox<[usize]> = RcBox::from_fn(16, |j| i + j);
        let _ = RcBox::clone(&array);
    }
}

// -------------------------------------

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

pub fn rc_box(c: &mut Criterion) {
    c.bench_function("clone-drop", |b| b.iter(|| clone_drop(black_box(1_000))));

    c.bench_function("clone-drop-relaxed", |b| {
        b.iter(|| clone_drop_relaxed(black_box(1_000)))
    });

    c.bench_function("contended", |b| b.iter(|| contended(black_box(1_000))));

    c.bench_function("allocate", |b| b.iter(|| allocate(black_box(1_000))));
}

criterion_group!(benches, rc_box);
criterion_main!(benches);
