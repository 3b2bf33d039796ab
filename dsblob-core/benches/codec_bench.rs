use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tempfile::TempDir;

use dsblob_core::{BlobCodec, BlobHash, BlobManager, EngineConfig};

/// Half repetitive, half hash-derived bytes, roughly like dataset chunks
fn sample(size: usize) -> Vec<u8> {
    let mut data = Vec::with_capacity(size);
    let mut seed = BlobHash::from_data(b"bench");
    while data.len() < size / 2 {
        data.extend_from_slice(seed.as_bytes());
        seed = BlobHash::from_data(seed.as_bytes());
    }
    data.resize(size, b'x');
    data
}

fn bench_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash");
    for size in [4 * 1024, 256 * 1024, 4 * 1024 * 1024] {
        let data = sample(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| BlobHash::from_data(black_box(data)));
        });
    }
    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let codecs = [
        ("plain", BlobCodec::plain()),
        ("zstd", BlobCodec::with_options(Some(3), None)),
        ("zstd_sealed", BlobCodec::with_options(Some(3), Some(("bench", [7u8; 32])))),
    ];
    let data = sample(256 * 1024);
    let hash = BlobHash::from_data(&data);

    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Bytes(data.len() as u64));
    for (name, codec) in &codecs {
        group.bench_function(BenchmarkId::new("encode", name), |b| {
            b.iter(|| codec.encode(black_box(&data)).unwrap());
        });
        let frame = codec.encode(&data).unwrap().bytes;
        group.bench_function(BenchmarkId::new("open", name), |b| {
            b.iter(|| codec.open(&hash, black_box(&frame)).unwrap());
        });
    }
    group.finish();
}

fn bench_put(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let temp_dir = TempDir::new().unwrap();
    let manager = rt
        .block_on(BlobManager::open(&EngineConfig::local(temp_dir.path().join("blobs"))))
        .unwrap();

    let mut counter = 0u64;
    c.bench_function("manager_put_64k", |b| {
        b.iter(|| {
            counter += 1;
            let mut data = sample(64 * 1024);
            data[..8].copy_from_slice(&counter.to_le_bytes());
            rt.block_on(manager.put(Bytes::from(data))).unwrap()
        });
    });

    let hash = rt.block_on(manager.put(Bytes::from(sample(64 * 1024)))).unwrap();
    c.bench_function("manager_get_64k", |b| {
        b.iter(|| rt.block_on(manager.get(black_box(&hash))).unwrap());
    });
}

criterion_group!(benches, bench_hashing, bench_codec, bench_put);
criterion_main!(benches);
