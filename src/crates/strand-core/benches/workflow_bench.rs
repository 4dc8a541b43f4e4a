//! Benchmarks for entrypoint invocation and streaming
//!
//! Run with: cargo bench -p strand-core

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use strand_core::{task, Entrypoint, Final, InMemoryCheckpointSaver, RunConfig, StreamMode};

fn sequential_workflow(steps: usize) -> Entrypoint {
    let increment = task("increment", |input| {
        Box::pin(async move { Ok(json!(input.as_i64().unwrap_or(0) + 1)) })
    });

    Entrypoint::new("sequential", move |input, _previous, runtime| {
        let increment = increment.clone();
        Box::pin(async move {
            let mut value = input;
            for _ in 0..steps {
                value = runtime.submit(&increment, value).await?;
            }
            Ok(Final::from(value))
        })
    })
    .with_checkpointer(Arc::new(InMemoryCheckpointSaver::new()))
}

fn bench_invoke(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("invoke_sequential");

    for steps in [1usize, 10, 50] {
        let workflow = sequential_workflow(steps);
        group.bench_with_input(BenchmarkId::from_parameter(steps), &steps, |b, _| {
            b.to_async(&rt).iter(|| async {
                let value = workflow
                    .invoke(black_box(json!(0)), RunConfig::for_thread("bench"))
                    .await
                    .unwrap();
                black_box(value)
            });
        });
    }

    group.finish();
}

fn bench_first_event_latency(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let workflow = sequential_workflow(10);

    c.bench_function("stream_first_event", |b| {
        b.to_async(&rt).iter(|| async {
            let mut stream = workflow
                .stream(json!(0), RunConfig::for_thread("bench"), [StreamMode::Tasks])
                .await
                .unwrap();
            black_box(stream.next().await)
        });
    });
}

criterion_group!(benches, bench_invoke, bench_first_event_latency);
criterion_main!(benches);
