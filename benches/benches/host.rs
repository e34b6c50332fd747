use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use weed_host::testing::{FakeCallbacks, FakeEffect, FilterBuilder};
use weed_host::{flags, BasicConverter, Instance, Layer, LiveCounter, Negotiator};
use weed_plant::serialize::encode_plant;
use weed_plant::{best_palette_match, keys, FrameBuffer, Palette, Plant, PlantType};

fn palette_matching(c: &mut Criterion) {
    let list = [Palette::Yuv420P, Palette::Bgra32, Palette::Rgb24, Palette::Yuv888];
    let wanted = [Palette::Rgba32, Palette::Yuv422P, Palette::Argb32, Palette::Yuva4444P];
    c.bench_function("best_palette_match", |b| {
        b.iter(|| {
            for palette in wanted {
                black_box(best_palette_match(black_box(&list), palette));
            }
        });
    });
}

fn serialization(c: &mut Criterion) {
    let mut plant = Plant::new(PlantType::Channel);
    plant.set(keys::WIDTH, 640).unwrap();
    plant.set(keys::HEIGHT, 480).unwrap();
    plant.set(keys::CURRENT_PALETTE, Palette::Rgb24.code()).unwrap();
    plant.set(keys::NAME, "bench").unwrap();
    let mut frame = FrameBuffer::new(Palette::Rgb24, 640, 480, 16);
    frame.fill(0x40);
    let mut bytes = Vec::new();
    encode_plant(&mut bytes, &plant, Some(&frame));

    let mut group = c.benchmark_group("serialize");
    group.bench_function("encode_640x480", |b| {
        let mut out = Vec::with_capacity(bytes.len());
        b.iter(|| {
            out.clear();
            encode_plant(&mut out, black_box(&plant), Some(&frame));
        });
    });
    group.bench_function("decode_640x480", |b| {
        b.iter(|| weed_plant::serialize::plant_from_bytes(black_box(&bytes)).unwrap());
    });
    group.finish();
}

fn threaded_pipeline(c: &mut Criterion) {
    let filter = FilterBuilder::new("invert")
        .flags(flags::FILTER_HINT_MAY_THREAD)
        .register(Arc::new(FakeCallbacks::new(FakeEffect::Invert)));
    let instance = Instance::create(&filter, &LiveCounter::default()).unwrap();
    instance.init().unwrap();
    let converter = BasicConverter;

    let mut group = c.benchmark_group("pipeline");
    group.measurement_time(Duration::from_secs(10));
    for threads in [1, 2, 4] {
        let negotiator = Negotiator {
            threads,
            ..Negotiator::new(&converter)
        };
        let mut layers = vec![Layer::from_frame(FrameBuffer::new(Palette::Rgb24, 1280, 720, 16))];
        group.bench_with_input(BenchmarkId::new("invert_720p", threads), &threads, |b, _| {
            b.iter(|| negotiator.apply(&instance, &mut layers, None, None, 0).unwrap());
        });
    }
    group.finish();
}

criterion_group!(benches, palette_matching, serialization, threaded_pipeline);
criterion_main!(benches);
