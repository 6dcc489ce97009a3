use criterion::black_box;
use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;
use percolator_client::test_util::MockCluster;
use percolator_client::BackoffContext;
use percolator_client::Config;
use percolator_client::TransactionClient;
use std::sync::Arc;

fn cluster_with_regions() -> Arc<MockCluster> {
    let cluster = Arc::new(MockCluster::new());
    // Keys are two bytes; split into 4 regions.
    for split in [vec![64_u8], vec![128_u8], vec![192_u8]] {
        cluster.split(split);
    }
    cluster
}

fn bench_commit_64_keys_4regions(c: &mut Criterion) {
    let cluster = cluster_with_regions();
    let client = TransactionClient::new(cluster.clone(), cluster, Config::default());

    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    c.bench_function("txn/commit_64_keys_4regions", |b| {
        b.iter(|| {
            let client = client.clone();
            rt.block_on(async move {
                let mut txn = client.begin().await.expect("begin");
                for i in 0..64_u8 {
                    txn.put(vec![i * 4, i], vec![i; 16])
                        .await
                        .expect("put");
                }
                let commit_ts = txn
                    .commit(&BackoffContext::background())
                    .await
                    .expect("commit");
                if let Some(handle) = txn.take_background_task() {
                    handle.await.expect("secondaries");
                }
                black_box(commit_ts);
            })
        })
    });
}

fn bench_snapshot_scan_4regions(c: &mut Criterion) {
    let cluster = cluster_with_regions();
    for i in 0..=255_u8 {
        cluster.must_put_value(vec![i, 0], vec![i; 16]);
    }
    let client = TransactionClient::new(cluster.clone(), cluster, Config::default());

    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
    let version = rt
        .block_on(client.current_timestamp())
        .expect("timestamp");
    c.bench_function("txn/snapshot_scan_4regions", |b| {
        b.iter(|| {
            let snapshot = client.snapshot(version);
            rt.block_on(async move {
                let pairs = snapshot.scan(.., 256).await.expect("scan");
                black_box(pairs);
            })
        })
    });
}

criterion_group!(benches, bench_commit_64_keys_4regions, bench_snapshot_scan_4regions);
criterion_main!(benches);
