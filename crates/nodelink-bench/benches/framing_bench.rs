use std::io::Cursor;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nodelink_net::codec::{read_frame, write_frame};
use nodelink_net::BrokerFrame;
use nodelink_types::{categories, NetworkRequest};
use nodelink_wire::request_message;

const MAX_FRAME: usize = 10 * 1024 * 1024;

fn send_frame(size: usize) -> BrokerFrame {
    let request = NetworkRequest::builder()
        .category(categories::RPC)
        .content(vec![3u8; size])
        .build();
    BrokerFrame::Send {
        id: 42,
        message: request_message(&request, "nodelink.requests", "nodelink.tmp.bench"),
    }
}

fn bench_frame_write(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let mut group = c.benchmark_group("frame_write");

    for size in [64, 4096, 65536].iter() {
        let frame = send_frame(*size);
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let mut out = Vec::with_capacity(size + 256);
                    write_frame(&mut out, black_box(&frame), MAX_FRAME).await.unwrap();
                    black_box(out)
                })
            });
        });
    }
    group.finish();
}

fn bench_frame_read(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let mut group = c.benchmark_group("frame_read");

    for size in [64, 4096, 65536].iter() {
        let bytes = rt.block_on(async {
            let mut out = Vec::new();
            write_frame(&mut out, &send_frame(*size), MAX_FRAME).await.unwrap();
            out
        });
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                rt.block_on(async {
                    let mut cursor = Cursor::new(black_box(bytes.as_slice()));
                    black_box(read_frame(&mut cursor, MAX_FRAME).await.unwrap())
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_frame_write, bench_frame_read);
criterion_main!(benches);
