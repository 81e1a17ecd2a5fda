//! Hot-path benchmarks: header codec, sequence tracking and admission.
//!
//! Run with: `cargo bench --bench throughput`

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Instant;
use udpprobe::wire::{build_probe, HEADER_SIZE};
use udpprobe::{AdmissionConfig, AdmissionControl, OpMode, ProbeHeader, SequenceTracker, WallTime};

fn bench_header_codec(c: &mut Criterion) {
    let header = ProbeHeader::data(42, WallTime::new(1_700_000_000, 123_456_789), OpMode::Rtt);
    let encoded = header.encode();

    let mut group = c.benchmark_group("header");
    group.throughput(Throughput::Bytes(HEADER_SIZE as u64));
    group.bench_function("encode", |b| b.iter(|| black_box(&header).encode()));
    group.bench_function("decode", |b| {
        b.iter(|| ProbeHeader::decode(black_box(&encoded)))
    });
    group.finish();
}

fn bench_sequence_tracker(c: &mut Criterion) {
    c.bench_function("sequence/lossy_stream_1k", |b| {
        b.iter_batched(
            SequenceTracker::new,
            |mut tracker| {
                // Every tenth probe is lost
                for seq in (1..=1000u32).filter(|seq| seq % 10 != 0) {
                    let _ = tracker.observe(seq, f64::from(seq));
                }
                tracker
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_admission(c: &mut Criterion) {
    let config = AdmissionConfig::default().with_rate_limit(1.0e9);
    let source = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    let probes: Vec<Vec<u8>> = (1..=1000u32)
        .filter_map(|seq| {
            let header = ProbeHeader::data(seq, WallTime::new(1_700_000_000, seq), OpMode::OneWay);
            build_probe(&header, 56, None).ok()
        })
        .collect();

    let mut group = c.benchmark_group("admission");
    group.throughput(Throughput::Elements(probes.len() as u64));
    group.bench_function("admit_1k", |b| {
        b.iter_batched(
            || AdmissionControl::new(&config),
            |control| {
                let now = Instant::now();
                for probe in &probes {
                    black_box(control.admit(source, probe, now, 1_700_000_000.5));
                }
                control
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_header_codec,
    bench_sequence_tracker,
    bench_admission
);
criterion_main!(benches);
