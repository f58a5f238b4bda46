//! I/O 방식별 처리량 벤치마크

use std::fs::{self, File};
use std::io;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use netsend::strategy::{Buffered, Mapped, TransferStrategy};
use netsend::TransferStats;

const FILE_SIZE: usize = 8 * 1024 * 1024;

fn bench_buffered(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    fs::write(&path, vec![0x5au8; FILE_SIZE]).unwrap();

    let mut group = c.benchmark_group("buffered_copy");
    group.throughput(Throughput::Bytes(FILE_SIZE as u64));

    for buffer_size in [4096usize, 8192, 65536, 1 << 20] {
        group.bench_with_input(BenchmarkId::from_parameter(buffer_size), &buffer_size, |b, &size| {
            let strategy = Buffered::new(size, None);
            b.iter(|| {
                let mut source = File::open(&path).unwrap();
                let mut stats = TransferStats::new();
                strategy.copy(&mut source, &mut io::sink(), &mut stats).unwrap()
            });
        });
    }
    group.finish();
}

fn bench_mapped(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("payload.bin");
    let sink_path = dir.path().join("sink.bin");
    fs::write(&path, vec![0xa5u8; FILE_SIZE]).unwrap();

    let mut group = c.benchmark_group("mapped");
    group.throughput(Throughput::Bytes(FILE_SIZE as u64));
    group.bench_function("file_to_file", |b| {
        let strategy = Mapped::default();
        b.iter(|| {
            let mut source = File::open(&path).unwrap();
            let mut sink = File::create(&sink_path).unwrap();
            let mut stats = TransferStats::new();
            strategy.transfer(&mut source, &mut sink, &mut stats).unwrap()
        });
    });
    group.finish();
}

criterion_group!(benches, bench_buffered, bench_mapped);
criterion_main!(benches);
