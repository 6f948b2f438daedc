use std::time::Duration;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use fitswap_conversions::{ConversionRecord, ConversionTransition, NewConversion, QuotaAccount};
use fitswap_core::{ConversionId, ImageId, UserId};
use fitswap_infra::retry::{BackoffStrategy, RetryPolicy};
use fitswap_infra::store::{ConversionStore, InMemoryConversionStore, QuotaDefaults};

fn bench_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("backoff");

    for strategy in [
        BackoffStrategy::Exponential,
        BackoffStrategy::Linear,
        BackoffStrategy::Fixed,
    ] {
        let policy = RetryPolicy {
            strategy,
            ..RetryPolicy::exponential(10, Duration::from_millis(100), Duration::from_secs(30))
        };
        group.bench_with_input(
            BenchmarkId::new("delay_for_attempt", format!("{strategy:?}")),
            &policy,
            |b, policy| {
                b.iter(|| {
                    for attempt in 0..10 {
                        black_box(policy.delay_for_attempt(black_box(attempt)));
                    }
                })
            },
        );
    }

    let policy = RetryPolicy::default();
    group.bench_function("backoff_with_jitter", |b| {
        b.iter(|| black_box(policy.backoff(black_box(3))))
    });
    group.bench_function("classify_message", |b| {
        b.iter(|| {
            black_box(policy.classify_message(black_box("upstream connection reset by peer")))
        })
    });

    group.finish();
}

fn bench_transitions(c: &mut Criterion) {
    let mut group = c.benchmark_group("lifecycle");
    let new = NewConversion::new(UserId::new(), ImageId::new(), ImageId::new(), None);
    let pending = ConversionRecord::new(ConversionId::new(), new, Utc::now());

    group.bench_function("plan_and_apply_full_lifecycle", |b| {
        b.iter(|| {
            let mut record = pending.clone();
            let now = Utc::now();
            for transition in [
                ConversionTransition::StartProcessing,
                ConversionTransition::Complete {
                    result_image_id: ImageId::new(),
                    processing_time_ms: 900,
                },
            ] {
                if let Ok(update) = record.plan_transition(&transition, now) {
                    record.apply_update(&update);
                }
            }
            black_box(record.check_invariants().is_ok())
        })
    });

    group.bench_function("quota_try_consume", |b| {
        b.iter(|| {
            let mut account = QuotaAccount::new("free", 3, Utc::now()).with_paid_credits(5);
            while black_box(account.try_consume()).is_some() {}
        })
    });

    group.finish();
}

fn bench_admission_store(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let mut group = c.benchmark_group("store");
    group.sample_size(200);

    group.bench_function("create_conversion_until_exhausted", |b| {
        b.iter(|| {
            let store = InMemoryConversionStore::new(QuotaDefaults {
                plan: "bench".into(),
                monthly_limit: 50,
            });
            let user = UserId::new();
            runtime.block_on(async {
                while store
                    .create_conversion(NewConversion::new(
                        user,
                        ImageId::new(),
                        ImageId::new(),
                        None,
                    ))
                    .await
                    .is_ok()
                {}
            });
            black_box(store)
        })
    });

    group.finish();
}

criterion_group!(benches, bench_backoff, bench_transitions, bench_admission_store);
criterion_main!(benches);
