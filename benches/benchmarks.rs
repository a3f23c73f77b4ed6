//! Performance benchmarks for wgbridge
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use wgbridge::uapi::{self, ClientConfig, Configurable, Entry, Operation};
use wgbridge::wg::PrivateKey;

fn bench_key_generation(c: &mut Criterion) {
    c.bench_function("key_generation", |b| {
        b.iter(|| {
            let _key = PrivateKey::generate();
        });
    });
}

fn bench_public_key_derivation(c: &mut Criterion) {
    let private_key = PrivateKey::generate();

    c.bench_function("public_key_derivation", |b| {
        b.iter(|| {
            let _public = black_box(&private_key).public_key();
        });
    });
}

fn bench_key_encoding(c: &mut Criterion) {
    let key = PrivateKey::generate();
    let encoded = key.to_base64();

    let mut group = c.benchmark_group("key_encoding");

    group.bench_function("to_base64", |b| {
        b.iter(|| black_box(&key).to_base64());
    });

    group.bench_function("from_base64", |b| {
        b.iter(|| PrivateKey::from_base64(black_box(&encoded)).unwrap());
    });

    group.finish();
}

fn bench_uapi_encode(c: &mut Criterion) {
    let config = ClientConfig::new(
        PrivateKey::generate(),
        PrivateKey::generate().public_key(),
        "203.0.113.10:51820".parse().unwrap(),
    )
    .allow_all_traffic();

    c.bench_function("uapi_encode_client", |b| {
        b.iter(|| black_box(&config).uapi());
    });
}

/// A status response of the shape a transport renders, with `peers`
/// peer sections.
fn sample_status(peers: usize) -> Vec<u8> {
    let mut op = Operation::new();
    op.push(Entry::PrivateKey(PrivateKey::generate()));
    op.push(Entry::ListenPort(51820));
    for i in 0..peers {
        op.push(Entry::PublicKey(PrivateKey::generate().public_key()));
        op.push(Entry::ProtocolVersion);
        op.push(Entry::Endpoint(
            format!("192.0.2.{}:51820", (i % 250) + 1).parse().unwrap(),
        ));
        op.push(Entry::LastHandshakeSec(1_700_000_000));
        op.push(Entry::LastHandshakeNsec(0));
        op.push(Entry::TxBytes(1024));
        op.push(Entry::RxBytes(2048));
        op.push(Entry::PersistentKeepalive(25));
        op.push(Entry::AllowedIp(
            format!("10.0.{}.0/24", i % 250).parse().unwrap(),
        ));
    }
    op.push(Entry::Errno(0));
    let mut bytes = op.encode();
    bytes.push(b'\n');
    bytes
}

fn bench_uapi_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("uapi_parse");

    for peer_count in [1usize, 5, 10, 50].iter() {
        let bytes = sample_status(*peer_count);
        group.bench_with_input(
            BenchmarkId::from_parameter(peer_count),
            &bytes,
            |b, bytes| {
                b.iter(|| uapi::parse(black_box(bytes)).unwrap());
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_key_generation,
    bench_public_key_derivation,
    bench_key_encoding,
    bench_uapi_encode,
    bench_uapi_parse,
);

criterion_main!(benches);
