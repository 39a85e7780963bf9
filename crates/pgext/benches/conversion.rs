// Datum conversion benchmarks
//
// These measure moving values between Rust and host representations:
// by-value integers, by-reference strings copied into a memory context,
// and reading strings back through a reset-tracked arena.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use pgext::{Arena, Datum, FromDatum, IntoDatum, OwnedArena, Text, Type};

fn bench_by_value(c: &mut Criterion) {
    let mut group = c.benchmark_group("by_value");
    let arena = OwnedArena::new("bench").unwrap().into_borrowed();

    group.bench_function("i64_roundtrip", |b| {
        b.iter(|| {
            let datum = black_box(42_i64).into_datum().unwrap();
            i64::from_datum(datum, Type::INT8, arena).unwrap()
        });
    });

    group.bench_function("i32_widened", |b| {
        let datum = Datum::from_i64(7);
        b.iter(|| i64::from_datum(black_box(datum), Type::INT4, arena).unwrap());
    });

    group.finish();
}

fn bench_strings(c: &mut Criterion) {
    let mut group = c.benchmark_group("strings");
    let arena = OwnedArena::new("bench strings").unwrap();

    for len in [8_usize, 256, 4096] {
        let s = "x".repeat(len);

        group.bench_with_input(BenchmarkId::new("into_datum", len), &s, |b, s| {
            b.iter(|| {
                let datum = arena.run(|| black_box(s.as_str()).into_datum().unwrap());
                black_box(datum);
            });
            arena.reset().unwrap();
        });

        let datum = arena.run(|| s.as_str().into_datum().unwrap());
        group.bench_with_input(BenchmarkId::new("to_string", len), &datum, |b, &datum| {
            b.iter(|| String::from_datum(black_box(datum), Type::TEXT, arena.borrowed()).unwrap());
        });

        let text = Text::new(&s, &arena).unwrap();
        group.bench_with_input(BenchmarkId::new("tracked_str", len), &text, |b, text| {
            b.iter(|| text.as_str().unwrap().len());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_by_value, bench_strings);
criterion_main!(benches);
