//! Benchmarks for descriptor parsing and registry lookup.
//!
//! Covers the two hot paths of section discovery:
//! - Raw 32-byte descriptor row parsing
//! - Range lookup over a populated registry, hit and miss

extern crate rseqgate;

use criterion::{criterion_group, criterion_main, Criterion};
use rseqgate::registry::{
    DescriptorFlags, SectionDescriptor, SequenceRegistry, DESCRIPTOR_VERSION,
};
use std::hint::black_box;

fn crafted_row(start: u64, post_commit: u64, abort: u64) -> Vec<u8> {
    let mut row = Vec::with_capacity(32);
    row.extend_from_slice(&DESCRIPTOR_VERSION.to_le_bytes());
    row.extend_from_slice(&0_u32.to_le_bytes());
    row.extend_from_slice(&start.to_le_bytes());
    row.extend_from_slice(&post_commit.to_le_bytes());
    row.extend_from_slice(&abort.to_le_bytes());
    row
}

fn populated_registry(sections: u64) -> SequenceRegistry {
    SequenceRegistry::from_descriptors((0..sections).map(|index| SectionDescriptor {
        version: DESCRIPTOR_VERSION,
        flags: DescriptorFlags::empty(),
        start: 0x1000 + index * 0x100,
        commit: 0x1000 + index * 0x100 + 0x40,
        abort: 0x10_0000,
    }))
    .unwrap()
}

/// Benchmark parsing a single descriptor row.
fn bench_row_read(c: &mut Criterion) {
    let row = crafted_row(0x1000, 0x40, 0x10_0000);

    c.bench_function("descriptor_row_read", |b| {
        b.iter(|| {
            let mut offset = 0;
            let parsed = SectionDescriptor::row_read(black_box(&row), &mut offset).unwrap();
            black_box(parsed)
        });
    });
}

/// Benchmark range lookup in the middle of a 1024-section registry.
fn bench_locate_hit(c: &mut Criterion) {
    let registry = populated_registry(1024);

    c.bench_function("registry_locate_hit", |b| {
        b.iter(|| {
            let section = registry.locate(black_box(0x1000 + 512 * 0x100 + 0x20));
            black_box(section)
        });
    });
}

/// Benchmark a lookup that falls in the gap between sections.
fn bench_locate_miss(c: &mut Criterion) {
    let registry = populated_registry(1024);

    c.bench_function("registry_locate_miss", |b| {
        b.iter(|| {
            let section = registry.locate(black_box(0x1000 + 512 * 0x100 + 0x80));
            black_box(section)
        });
    });
}

/// Benchmark the exact section-start lookup the block compiler performs.
fn bench_locate_start(c: &mut Criterion) {
    let registry = populated_registry(1024);

    c.bench_function("registry_locate_start", |b| {
        b.iter(|| {
            let section = registry.locate_start(black_box(0x1000 + 256 * 0x100));
            black_box(section)
        });
    });
}

criterion_group!(
    benches,
    bench_row_read,
    bench_locate_hit,
    bench_locate_miss,
    bench_locate_start
);
criterion_main!(benches);
