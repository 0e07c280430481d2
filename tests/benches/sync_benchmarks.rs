//! # Chain Sync Benchmarks
//!
//! | Area | Operation |
//! |------|-----------|
//! | Fork detection | Majority verdict over peer verification results |
//! | Network status | Median height over the peer list |
//! | Block queue | Push and drain of a downloaded batch |

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qc_18_chain_sync::domain::{median_height, PeerVerificationResult};
use qc_18_chain_sync::network::detect_fork;
use qc_18_chain_sync::service::BlockQueue;
use qc_18_chain_sync::test_utils::{build_chain, peer_address, test_delegates};
use qc_18_chain_sync::Peer;

// ============================================================================
// Fork detection
// ============================================================================

fn bench_detect_fork(c: &mut Criterion) {
    let mut group = c.benchmark_group("qc-18-fork-detection");

    for size in [10u8, 50, 200] {
        // Two thirds of the peers share a common height below our tip.
        let peers: Vec<Peer> = (1..=size)
            .map(|n| {
                let common = if n % 3 == 0 { 1000 } else { 990 };
                Peer::new(peer_address(n))
                    .with_height(1005)
                    .with_verification(PeerVerificationResult::new(1000, 1005, common))
            })
            .collect();

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("detect_fork", size), &peers, |b, peers| {
            b.iter(|| black_box(detect_fork(peers, 1000, 5000)))
        });
    }

    group.finish();
}

// ============================================================================
// Network height
// ============================================================================

fn bench_median_height(c: &mut Criterion) {
    let mut group = c.benchmark_group("qc-18-network-status");

    for size in [10usize, 100, 1000] {
        let heights: Vec<u64> = (0..size as u64).map(|i| 10_000 + (i * 7919) % 97).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(
            BenchmarkId::new("median_height", size),
            &heights,
            |b, heights| b.iter(|| black_box(median_height(heights))),
        );
    }

    group.finish();
}

// ============================================================================
// Block queue
// ============================================================================

fn bench_block_queue(c: &mut Criterion) {
    let mut group = c.benchmark_group("qc-18-block-queue");
    let chain = build_chain(500, 8, &test_delegates(101));

    group.throughput(Throughput::Elements(chain.len() as u64));
    group.bench_function("push_and_clear_500", |b| {
        b.iter(|| {
            let queue = BlockQueue::new();
            queue.push(chain.clone());
            black_box(queue.clear())
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_detect_fork,
    bench_median_height,
    bench_block_queue
);
criterion_main!(benches);
