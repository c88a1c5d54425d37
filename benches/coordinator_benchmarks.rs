//! Benchmarks for the Trinity coordinator
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use trinity_coordinator::config::{ConsensusConfig, EndpointSpec, RouterConfig};
use trinity_coordinator::consensus::{ChainVote, ConsensusVerifier};
use trinity_coordinator::crypto;
use trinity_coordinator::{ChainId, EndpointRegistry};

fn crypto_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("crypto");

    group.throughput(Throughput::Bytes(1024));
    group.bench_function("sha256_1kb", |b| {
        let data = vec![0u8; 1024];
        b.iter(|| crypto::sha256(black_box(&data)));
    });

    // SEAL_DATA body: AES-256-GCM with the chain byte as AAD
    group.throughput(Throughput::Bytes(1024));
    group.bench_function("seal_1kb", |b| {
        let key = [0x42u8; 32];
        let nonce = [0x24u8; 12];
        let data = vec![0u8; 1024];
        b.iter(|| {
            crypto::aes256_gcm_encrypt(
                black_box(&key),
                black_box(&nonce),
                black_box(&data),
                black_box(&[ChainId::Ton.as_u8()]),
            )
        });
    });

    group.finish();
}

fn coordinator_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("coordinator");

    group.bench_function("select_endpoint", |b| {
        let registry = EndpointRegistry::new(RouterConfig::default());
        for i in 0..16 {
            registry.register(
                ChainId::Solana,
                EndpointSpec {
                    url: format!("https://solana-{i}.example"),
                    region: "bench".into(),
                    initial_latency_ms: 50.0 + f64::from(i),
                    initial_reliability: 99.5,
                },
            );
        }
        b.iter(|| registry.select_endpoint(black_box(ChainId::Solana)));
    });

    group.bench_function("vote_aggregation_2_of_3", |b| {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let hash = crypto::sha256(b"bench");
        let mut n = 0u64;
        b.iter(|| {
            n += 1;
            let verifier = ConsensusVerifier::new(ConsensusConfig::default());
            let operation_id = format!("op-{n}");
            runtime.block_on(async {
                for chain in [ChainId::Arbitrum, ChainId::Solana] {
                    let _ = verifier
                        .submit_vote(ChainVote::new(chain, operation_id.as_str(), hash))
                        .await;
                }
            });
        });
    });

    group.finish();
}

criterion_group!(benches, crypto_benchmarks, coordinator_benchmarks);
criterion_main!(benches);
