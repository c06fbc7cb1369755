//! Benchmarks for the prepared statement cache and statement rendering.
//!
//! Run with: cargo bench --bench statement_cache

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use pgbridge::cursor::{parse_rowcount, render_operation};
use pgbridge::{Attribute, PreparedStatementCache, SchemaInvalidation, Timestamp};

fn statement_sql(index: usize) -> String {
    format!("SELECT id, name, created_at FROM table_{index} WHERE id = $1")
}

fn attributes() -> Arc<[Attribute]> {
    vec![
        Attribute::new("id", 23),
        Attribute::new("name", 25),
        Attribute::new("created_at", 1184),
    ]
    .into()
}

fn filled_cache(capacity: usize) -> PreparedStatementCache<u64> {
    let mut cache = PreparedStatementCache::new(capacity).unwrap();
    let attrs = attributes();
    for index in 0..capacity {
        cache.insert(statement_sql(index), index as u64, Arc::clone(&attrs));
    }
    cache
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("statement_cache_lookup");

    for capacity in [16, 100, 1000] {
        let mut cache = filled_cache(capacity);
        let hit_sql = statement_sql(capacity / 2);
        let miss_sql = statement_sql(capacity + 1);

        group.bench_with_input(BenchmarkId::new("hit", capacity), &capacity, |b, _| {
            b.iter(|| black_box(cache.lookup(black_box(&hit_sql), Timestamp::ZERO)));
        });

        group.bench_with_input(BenchmarkId::new("miss", capacity), &capacity, |b, _| {
            b.iter(|| black_box(cache.lookup(black_box(&miss_sql), Timestamp::ZERO)));
        });
    }

    // Every entry predates the invalidation, so each lookup is a stale miss.
    let mut cache = filled_cache(100);
    let invalidation = SchemaInvalidation::new();
    let asof = invalidation.bump();
    let sql = statement_sql(50);
    group.bench_function("stale", |b| {
        b.iter(|| black_box(cache.lookup(black_box(&sql), asof)));
    });

    group.finish();
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("statement_cache_insert");
    group.throughput(Throughput::Elements(1));

    let attrs = attributes();
    let keys: Vec<String> = (0..10_000).map(statement_sql).collect();

    group.bench_function("insert_with_eviction", |b| {
        let mut cache = filled_cache(100);
        let mut next = 0usize;
        b.iter(|| {
            let sql = &keys[next % keys.len()];
            next += 1;
            black_box(cache.insert(sql.as_str(), next as u64, Arc::clone(&attrs)))
        });
    });

    group.bench_function("replace_same_key", |b| {
        let mut cache = filled_cache(100);
        let sql = statement_sql(7);
        b.iter(|| black_box(cache.insert(sql.as_str(), 7, Arc::clone(&attrs))));
    });

    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_operation");

    for params in [1, 10, 100] {
        let template = format!(
            "INSERT INTO t VALUES ({}) -- 100%%",
            vec!["%s"; params].join(", ")
        );
        let placeholders: Vec<String> = (1..=params).map(|i| format!("${i}")).collect();

        group.bench_with_input(BenchmarkId::new("params", params), &params, |b, _| {
            b.iter(|| black_box(render_operation(black_box(&template), &placeholders)));
        });
    }

    group.bench_function("parse_rowcount", |b| {
        b.iter(|| black_box(parse_rowcount(black_box(Some("INSERT 0 1234")))));
    });

    group.finish();
}

criterion_group!(benches, bench_lookup, bench_insert, bench_render);
criterion_main!(benches);
