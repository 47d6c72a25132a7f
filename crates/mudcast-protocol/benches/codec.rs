//! Codec benchmarks for mudcast-protocol.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use mudcast_protocol::{codec, Frame};

fn bench_encode_line(c: &mut Criterion) {
    let frame = Frame::channel_line("Public", format!("[Public] Bob: {}", "x".repeat(64)));

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Elements(1));
    group.bench_function("channel_line", |b| b.iter(|| codec::encode(black_box(&frame))));
    group.finish();
}

fn bench_decode_say(c: &mut Criterion) {
    let frame = Frame::say("Public", "x".repeat(64));
    let encoded = codec::encode(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("say", |b| b.iter(|| codec::decode(black_box(&encoded))));
    group.finish();
}

fn bench_stream_decode(c: &mut Criterion) {
    let mut batch = BytesMut::new();
    for i in 0..32 {
        codec::encode_into(&Frame::say("Public", format!("line {i}")), &mut batch).unwrap();
    }
    let batch = batch.freeze();

    c.bench_function("decode_from_32_frames", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&batch[..]);
            let mut count = 0;
            while let Ok(Some(frame)) = codec::decode_from(&mut buf) {
                black_box(frame);
                count += 1;
            }
            count
        })
    });
}

criterion_group!(
    benches,
    bench_encode_line,
    bench_decode_say,
    bench_stream_decode
);
criterion_main!(benches);
