//! Benchmarks for shader assembly and host-side packing.
//!
//! Run with: `cargo bench`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use tfpe::render::{RenderConfig, RenderPass, RenderPrimitive};
use tfpe::simulation::SimulationPass;
use tfpe::{FeedbackAttribute, InputAttribute, Uniform, VarType};

const CAPACITY: u32 = 1024;

fn simulation(feedback: usize) -> SimulationPass {
    let mut pass = SimulationPass::new(CAPACITY);
    for i in 0..feedback {
        let attribute = FeedbackAttribute::new(
            format!("field{i}"),
            VarType::Vec3,
            vec![0.0f32; 3 * CAPACITY as usize],
            CAPACITY,
        )
        .unwrap();
        pass.add_feedback(attribute).unwrap();
    }
    pass.add_input(InputAttribute::new("mass", VarType::F32, vec![1.0f32; CAPACITY as usize], CAPACITY).unwrap())
        .unwrap();
    pass.add_uniform(Uniform::new("gravity", 9.8f32)).unwrap();
    pass.set_script("field0Out[index] = field0[index] * gravity * mass[index];");
    pass
}

fn bench_simulation_source(c: &mut Criterion) {
    let mut group = c.benchmark_group("simulation_source");

    for feedback in [1, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(feedback), &feedback, |b, &feedback| {
            let mut pass = simulation(feedback);
            b.iter(|| black_box(pass.source().unwrap()))
        });
    }

    group.bench_function("without_library", |b| {
        let mut pass = simulation(4).without_library();
        b.iter(|| black_box(pass.source().unwrap()))
    });

    group.finish();
}

fn bench_render_source(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_source");
    let attributes = vec![
        ("position".to_string(), VarType::Vec3),
        ("color".to_string(), VarType::Vec4),
    ];

    for (name, primitive) in [("points", RenderPrimitive::Points), ("sprites", RenderPrimitive::Sprites)] {
        group.bench_function(name, |b| {
            let mut pass = RenderPass::new(RenderConfig::default().with_primitive(primitive));
            b.iter(|| {
                black_box(pass.vertex_source(&attributes).unwrap());
                black_box(pass.fragment_source().unwrap())
            })
        });
    }

    group.finish();
}

fn bench_attribute_packing(c: &mut Criterion) {
    let mut group = c.benchmark_group("attribute_packing");

    for count in [1_000u32, 100_000] {
        let data = vec![0.5f32; 3 * count as usize];
        group.bench_with_input(BenchmarkId::new("vec3", count), &count, |b, &count| {
            b.iter(|| black_box(FeedbackAttribute::new("position", VarType::Vec3, data.clone(), count).unwrap()))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_simulation_source, bench_render_source, bench_attribute_packing);
criterion_main!(benches);
