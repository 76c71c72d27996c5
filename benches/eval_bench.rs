use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, SamplingMode};
use std::time::Duration;

use flagkit::eval::{bucket_user, evaluate};
use flagkit::schema::FeatureFlag;
use flagkit::store::{DataStore, MemoryStore};
use flagkit::{User, Value};

fn rollout_flag() -> FeatureFlag {
    serde_json::from_str(
        r#"{
            "key": "bench-flag",
            "version": 1,
            "on": true,
            "salt": "0123456789abcdef",
            "fallthrough": {"rollout": {"variations": [
                {"variation": 0, "weight": 60000},
                {"variation": 1, "weight": 30000},
                {"variation": 2, "weight": 10000}
            ]}},
            "variations": ["a", "b", "c"],
            "rules": [{
                "id": "r1",
                "variation": 2,
                "clauses": [{"attribute": "email", "op": "endsWith", "values": ["@example.com"]}]
            }]
        }"#,
    )
    .unwrap()
}

fn bench_bucketing(c: &mut Criterion) {
    // Build the user pool once, outside the measured loop.
    let users: Vec<User> = (0..1_000)
        .map(|i| User::with_key(format!("user-{i:04}")).unwrap())
        .collect();

    let mut g = c.benchmark_group("bucketing");
    g.sample_size(60)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1))
        .sampling_mode(SamplingMode::Auto);

    g.bench_function(BenchmarkId::new("bucket_user", users.len()), |b| {
        let mut i = 0usize;
        b.iter(|| {
            let user = &users[i % users.len()];
            i += 1;
            let bucket = bucket_user(black_box(user), "bench-flag", "key", "salt", None);
            black_box(bucket);
        });
    });

    g.finish();
}

fn bench_evaluate(c: &mut Criterion) {
    let store = MemoryStore::new();
    store.init(Default::default()).unwrap();
    let flag = rollout_flag();
    let plain = User::with_key("plain-user").unwrap();
    let rule_hit = User::builder("rule-user")
        .email("rule-user@example.com")
        .custom(Value::parse(r#"{"plan":"pro"}"#).unwrap())
        .build()
        .unwrap();

    let mut g = c.benchmark_group("evaluate");
    g.sample_size(60)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1));

    g.bench_function("fallthrough_rollout", |b| {
        b.iter(|| {
            let mut events = Vec::new();
            let detail = evaluate(black_box(&flag), black_box(&plain), &store, &mut events);
            black_box(detail.variation_index);
        });
    });

    g.bench_function("rule_match", |b| {
        b.iter(|| {
            let mut events = Vec::new();
            let detail = evaluate(black_box(&flag), black_box(&rule_hit), &store, &mut events);
            black_box(detail.variation_index);
        });
    });

    g.finish();
}

criterion_group!(benches, bench_bucketing, bench_evaluate);
criterion_main!(benches);
