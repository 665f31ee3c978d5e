use core::{hint::black_box, time::Duration};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::stream::{FuturesUnordered, StreamExt};
use grpc_pool::{Dialer, Pool, PoolConfig, Result};
use portable_atomic::{AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio::runtime::Builder;

/// Dials instantly so the benchmark measures pool overhead only.
#[derive(Clone, Default)]
struct NoopDialer {
    dials: Arc<AtomicUsize>,
}

impl Dialer for NoopDialer {
    type Handle = usize;

    async fn dial(&self, _block: bool) -> Result<usize> {
        Ok(self.dials.fetch_add(1, Ordering::Relaxed))
    }

    fn target(&self) -> &str {
        "bench://noop"
    }
}

#[derive(Clone, Copy, Debug)]
struct PoolBenchParams {
    max_conns: i32,
    max_refs: i32,
    concurrency: usize,
}

fn acquire_release_bench(c: &mut Criterion) {
    let max_conns_cases = [1, 4, 16];
    let max_refs_cases = [1, 8, 64];
    let concurrency_cases = [1, 8, 64];

    let mut cases = Vec::new();
    for &max_conns in &max_conns_cases {
        for &max_refs in &max_refs_cases {
            for &concurrency in &concurrency_cases {
                cases.push(PoolBenchParams {
                    max_conns,
                    max_refs,
                    concurrency,
                });
            }
        }
    }
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    for params in &cases {
        let mut group = c.benchmark_group("pool/acquire_release");
        group.throughput(Throughput::Elements(params.concurrency as u64));

        let pool = rt.block_on(async {
            let pool = Pool::new(
                PoolConfig {
                    max_conns: params.max_conns,
                    max_idle_conns: params.max_conns,
                    max_refs: params.max_refs,
                    ..PoolConfig::new("bench://noop")
                },
                NoopDialer::default(),
            )
            .unwrap();
            pool.run().await;
            pool
        });

        group.bench_function(
            format!(
                "conns/{}/refs/{}/conc/{}",
                params.max_conns, params.max_refs, params.concurrency
            ),
            |b| {
                b.to_async(&rt).iter_custom(|iters| {
                    let pool = pool.clone();
                    async move {
                        let start = Instant::now();
                        for _ in 0..iters {
                            let mut tasks = FuturesUnordered::new();
                            for _ in 0..params.concurrency {
                                let pool = pool.clone();
                                tasks.push(tokio::spawn(async move {
                                    let conn = pool.acquire(Duration::from_secs(5)).await.unwrap();
                                    black_box(conn.handle().unwrap());
                                }));
                            }
                            while let Some(res) = tasks.next().await {
                                res.unwrap();
                            }
                        }
                        start.elapsed()
                    }
                });
            },
        );
        group.finish();

        rt.block_on(pool.close());
    }
}

criterion_group!(benches, acquire_release_bench);
criterion_main!(benches);
