use std::hint::black_box;
use std::io::Cursor;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use faceseek::fingerprint::fingerprint;
use faceseek::hamming::{encode_hex, hamming_distance};
use faceseek::index::Metric;
use image::{DynamicImage, ImageFormat, RgbImage};
use rand::prelude::*;

fn random_png(width: u32, height: u32) -> Vec<u8> {
    let mut rng = rand::rng();
    let mut pixels = vec![0u8; (width * height * 3) as usize];
    rng.fill_bytes(&mut pixels);
    let img = RgbImage::from_raw(width, height, pixels).unwrap();
    let mut buf = Cursor::new(vec![]);
    DynamicImage::ImageRgb8(img).write_to(&mut buf, ImageFormat::Png).unwrap();
    buf.into_inner()
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("Fingerprint");
    for size in [256, 1024] {
        let data = random_png(size, size);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_function(format!("fingerprint_{size}"), |b| {
            b.iter(|| fingerprint(black_box(&data)).unwrap())
        });
    }
    group.finish();
}

fn bench_hamming_hex(c: &mut Criterion) {
    let mut group = c.benchmark_group("Hamming hex");
    let mut rng = rand::rng();
    let hashes = (0..10000)
        .map(|_| encode_hex(&rng.random::<u64>().to_be_bytes()))
        .collect::<Vec<_>>();
    let query = hashes[0].clone();

    group.throughput(Throughput::Elements(hashes.len() as u64));
    group.bench_function("hamming_distance", |b| {
        b.iter(|| hashes.iter().map(|h| hamming_distance(&query, h).unwrap()).sum::<u32>())
    });
    group.finish();
}

fn bench_exact_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("Exact scan");
    let dim = 512;
    let mut rng = rand::rng();
    let data = (0..dim * 20000).map(|_| rng.random_range(-1.0f32..1.0)).collect::<Vec<_>>();
    let query = (0..dim).map(|_| rng.random_range(-1.0f32..1.0)).collect::<Vec<_>>();

    group.throughput(Throughput::Elements((data.len() / dim) as u64));
    for metric in [Metric::Cosine, Metric::L2sq] {
        group.bench_function(metric.as_str(), |b| {
            b.iter(|| {
                data.chunks_exact(dim)
                    .map(|row| metric.distance(black_box(&query), row))
                    .fold(f32::INFINITY, f32::min)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_hamming_hex, bench_exact_scan);
criterion_main!(benches);
