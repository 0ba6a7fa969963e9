//! Subprotocol frame codec benchmark suite.
//!
//! Benchmarks DATA frame encode/decode at typical tunnel payload sizes and
//! the chunked encoding of a large send batch.
//!
//! Run with: cargo bench --bench frame_codec
//! Results saved to: target/criterion/

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};

use iap_tunnel::subprotocol::{
    MAX_DATA_FRAME_SIZE, create_data_frame, extract_subprotocol_data, extract_subprotocol_tag,
};

// ============================================================================
// Benchmark Parameters
// ============================================================================

/// Typical payload sizes: keystroke, MTU-ish, full frame.
const PAYLOAD_SIZES: &[usize] = &[64, 1400, MAX_DATA_FRAME_SIZE];

/// Send batch size for the chunking benchmark.
const BATCH_SIZE: usize = 1024 * 1024;

// ============================================================================
// Benchmark: Encode
// ============================================================================

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode");

    for &size in PAYLOAD_SIZES {
        let payload = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("data_frame", size), &payload, |b, p| {
            b.iter(|| create_data_frame(black_box(p)));
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Decode
// ============================================================================

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_decode");

    for &size in PAYLOAD_SIZES {
        let frame = create_data_frame(&vec![0xa5u8; size]);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("data_frame", size), &frame, |b, f| {
            b.iter(|| {
                let (tag, body) = extract_subprotocol_tag(black_box(f)).unwrap();
                let (payload, _) = extract_subprotocol_data(body).unwrap();
                (tag, payload.len())
            });
        });
    }

    group.finish();
}

// ============================================================================
// Benchmark: Chunked Send Batch
// ============================================================================

fn bench_chunked_batch(c: &mut Criterion) {
    let payload = vec![0xa5u8; BATCH_SIZE];

    let mut group = c.benchmark_group("send_batch");
    group.throughput(Throughput::Bytes(BATCH_SIZE as u64));
    group.bench_function("chunk_and_encode_1mib", |b| {
        b.iter(|| {
            let mut frames = 0usize;
            for chunk in black_box(&payload[..]).chunks(MAX_DATA_FRAME_SIZE) {
                frames += create_data_frame(chunk).len();
            }
            frames
        });
    });

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode, bench_chunked_batch);
criterion_main!(benches);
