//! Benchmarks for stream translation throughput.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use davis_core::{ChipVariant, DeviceInfo, OfflineDecoder, SessionConfig};

const EVENTS: u32 = 100_000;

/// Legacy stream: a timestamp, a row and an X address per event.
fn legacy_stream() -> Vec<u8> {
    let mut data = Vec::with_capacity(EVENTS as usize * 6);
    for i in 0..EVENTS {
        let timestamp = 0x8000 | (i & 0x7FFF) as u16;
        let y = 0x1000 | (i % 260) as u16;
        let x = 0x3000 | ((i * 3) % 346) as u16;
        // Wrap once per 32768 timestamps to keep time increasing.
        if i > 0 && i & 0x7FFF == 0 {
            data.extend_from_slice(&0x7001u16.to_le_bytes());
        }
        data.extend_from_slice(&timestamp.to_le_bytes());
        data.extend_from_slice(&y.to_le_bytes());
        data.extend_from_slice(&x.to_le_bytes());
    }
    data
}

/// MIPI stream: a reference per millisecond, one column and one 16-pixel
/// group per event word pair.
fn mipi_stream() -> Vec<u8> {
    let mut data = Vec::with_capacity(EVENTS as usize * 8);
    for i in 0..EVENTS {
        let sub = i % 1000;
        if sub == 0 {
            data.extend_from_slice(&(0x0800_0000 | (i / 1000)).to_be_bytes());
        }
        let column = 0x0400_0000 | (sub << 11) | (i % 640);
        let group = 0x8000_0000 | ((i % 60) << 18) | 0xA5A5;
        data.extend_from_slice(&column.to_be_bytes());
        data.extend_from_slice(&group.to_be_bytes());
    }
    data
}

fn bench_stream(c: &mut Criterion, name: &str, chip: ChipVariant, data: &[u8]) {
    let info = DeviceInfo::for_chip(chip, 1);
    let config = SessionConfig::default();

    let mut group = c.benchmark_group(name);
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("decode_buffer", |b| {
        b.iter(|| {
            let mut decoder = OfflineDecoder::new(&info, &config).unwrap();
            let mut containers = Vec::new();
            decoder.decode_buffer(black_box(data), &mut containers);
            decoder.finish(&mut containers);
            black_box(containers.len())
        })
    });

    group.finish();
}

fn legacy_benchmark(c: &mut Criterion) {
    bench_stream(c, "legacy_16bit", ChipVariant::Davis346, &legacy_stream());
}

fn mipi_benchmark(c: &mut Criterion) {
    bench_stream(c, "mipi_32bit", ChipVariant::MipiCx3, &mipi_stream());
}

criterion_group!(benches, legacy_benchmark, mipi_benchmark);
criterion_main!(benches);
