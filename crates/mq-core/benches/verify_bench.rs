//! Criterion benchmarks for the handshake and query hot paths.
//!
//! Every connection pays for one `verify` call and every directory query
//! compiles a filter and evaluates it once per stored record.
//!
//! Run with:
//! ```bash
//! cargo bench --package mq-core --bench verify_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mq_core::{verify, Filter, VerifyParams};
use serde_json::{json, Map, Value};

fn params(secret: &str) -> VerifyParams {
    let mut extra = Map::new();
    extra.insert("code".to_string(), json!("324550"));
    extra.insert("type".to_string(), json!("worker"));
    VerifyParams {
        secret: Some(secret.to_string()),
        timestamp: Some(1_700_000_000),
        extra,
        ..VerifyParams::default()
    }
}

// ── Benchmarks: verification ──────────────────────────────────────────────────

fn bench_verify(c: &mut Criterion) {
    let mut group = c.benchmark_group("verify");

    for (name, secret) in [
        ("base32", "JBSWY3DPEHPK3PXP"),
        ("raw", "b8d4bc91c784"),
        (
            "otpauth",
            "otpauth://totp/x?secret=JBSWY3DPEHPK3PXP&period=30&digits=6&algorithm=sha1",
        ),
    ] {
        let p = params(secret);
        group.bench_with_input(BenchmarkId::new("secret", name), &p, |b, p| {
            b.iter(|| verify(black_box(p), 1_700_000_000))
        });
    }

    group.finish();
}

// ── Benchmarks: directory filters ─────────────────────────────────────────────

fn records(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            json!({
                "receive": ["10.0.0.1", 40_000 + i],
                "verified": true,
                "parameters": {"type": if i % 3 == 0 { "TikTok.worker" } else { "ai.server" }}
            })
        })
        .collect()
}

fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");
    let data = records(1_000);

    let documents = [
        ("equality", json!({"parameters.type": "ai.server"})),
        (
            "regex",
            json!({"parameters.type": {"$regex": "tiktok", "$options": "i"}}),
        ),
        (
            "or",
            json!({"$or": [{"receive.1": {"$lt": 40_100}}, {"verified": false}]}),
        ),
    ];

    for (name, document) in &documents {
        group.bench_with_input(BenchmarkId::new("parse", name), document, |b, d| {
            b.iter(|| Filter::parse(black_box(d)))
        });

        if let Ok(filter) = Filter::parse(document) {
            group.bench_with_input(BenchmarkId::new("scan_1000", name), &data, |b, data| {
                b.iter(|| data.iter().filter(|r| filter.matches(black_box(r))).count())
            });
        }
    }

    group.finish();
}

criterion_group!(benches, bench_verify, bench_filter);
criterion_main!(benches);
