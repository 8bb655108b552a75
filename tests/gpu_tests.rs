//! Transition passes on a real adapter.
//!
//! These need a GPU and are skipped by default.
//! Run with: cargo test --test gpu_tests -- --ignored

use tfpe::prelude::*;

// Two workgroups of 64, the second partly idle.
const N: u32 = 100;

fn engine() -> Engine<WgpuContext> {
    let ctx = WgpuContext::offscreen(64, 64).expect("no usable adapter");
    let mut engine = Engine::new(ctx, EngineConfig::new(N).with_workgroup_size(64));
    engine
        .add_feedback_variable("position", VarType::Vec3, vec![0.0f32; 3 * N as usize])
        .unwrap();
    engine
        .add_feedback_variable("mode", VarType::U32, (0..N).collect::<Vec<u32>>())
        .unwrap();
    engine.add_output_variable("reach", VarType::F32).unwrap();
    engine.add_uniform("offset", 1.0f32).unwrap();
    engine.set_script(
        "positionOut[index] = position[index] + vec3<f32>(offset, 0.0, 0.0);\nreach[index] = length(positionOut[index]);",
    );
    engine
}

#[test]
#[ignore = "requires a GPU adapter"]
fn test_script_runs_on_the_device_and_buffers_swap() {
    let mut engine = engine();
    let report = engine.build().unwrap();
    assert!(report.is_clean());

    for _ in 0..3 {
        engine.update(0.016).unwrap();
    }
    engine.ensure_healthy().unwrap();

    let position = engine.read_feedback("position").unwrap();
    let position = position.as_f32().unwrap();
    assert_eq!(position.len(), 3 * N as usize);
    for p in position.chunks(3) {
        assert_eq!(p, &[3.0, 0.0, 0.0]);
    }

    // Untouched by the script, carried forward through every swap.
    let mode = engine.read_feedback("mode").unwrap();
    assert_eq!(mode.as_u32().unwrap(), (0..N).collect::<Vec<u32>>().as_slice());

    let reach = engine.read_output("reach").unwrap();
    assert!(reach.as_f32().unwrap().iter().all(|&r| (r - 3.0).abs() < 1e-6));
}

#[test]
#[ignore = "requires a GPU adapter"]
fn test_uniform_changes_reach_the_transition() {
    let mut engine = engine();
    engine.build().unwrap();

    engine.update(0.016).unwrap();
    engine.set_value("offset", 0.5f32).unwrap();
    assert_eq!(engine.uniform_on_device("offset").unwrap(), Value::F32(0.5));
    engine.update(0.016).unwrap();

    let position = engine.read_feedback("position").unwrap();
    assert!(position.as_f32().unwrap().chunks(3).all(|p| p[0] == 1.5));
}

#[test]
#[ignore = "requires a GPU adapter"]
fn test_partial_active_count_leaves_the_rest_untouched() {
    let mut engine = engine();
    engine.build().unwrap();
    assert_eq!(engine.set_active_count(10), 10);
    engine.update(0.016).unwrap();

    engine.set_active_count(N);
    let position = engine.read_feedback("position").unwrap();
    let xs: Vec<f32> = position.as_f32().unwrap().chunks(3).map(|p| p[0]).collect();
    assert!(xs[..10].iter().all(|&x| x == 1.0));
    assert!(xs[10..].iter().all(|&x| x == 0.0));
}
