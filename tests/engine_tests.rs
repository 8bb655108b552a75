//! Engine integration tests on the headless device.
//!
//! Run with: cargo test --test engine_tests

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tfpe::context::{CaptureFrame, Command, FaultCode, HeadlessContext};
use tfpe::prelude::*;
use tfpe::simulation::{SimulationPass, BUILTINS};
use tfpe::{FeedbackAttribute, Variable};

const N: u32 = 8;

/// Host stand-in for `positionOut = position + (1, 0, 0)`.
fn step_x(frame: &mut CaptureFrame) {
    frame.pass_through();
    for i in 0..frame.entities() {
        if let Some(p) = frame.read_f32("position", i) {
            frame.write_f32("positionOut", i, &[p[0] + 1.0, p[1], p[2]]);
        }
    }
}

fn engine(ctx: HeadlessContext) -> Engine<HeadlessContext> {
    engine_with(ctx, EngineConfig::new(N).with_workgroup_size(64))
}

fn engine_with(ctx: HeadlessContext, config: EngineConfig) -> Engine<HeadlessContext> {
    let capacity = config.capacity as usize;
    let mut engine = Engine::new(ctx, config);
    engine
        .add_feedback_variable("position", VarType::Vec3, vec![0.0f32; 3 * capacity])
        .unwrap();
    engine.set_script("positionOut[index] = position[index] + vec3<f32>(1.0, 0.0, 0.0);");
    engine
}

fn xs(engine: &mut Engine<HeadlessContext>) -> Vec<f32> {
    let data = engine.read_feedback("position").unwrap();
    data.as_f32().unwrap().chunks(3).map(|p| p[0]).collect()
}

// ========== Ping-pong ==========

#[test]
fn test_state_advances_once_per_update() {
    let mut engine = engine(HeadlessContext::new().with_kernel(step_x));
    engine.build().unwrap();

    for t in 1..=5 {
        engine.update(0.016).unwrap();
        assert!(xs(&mut engine).iter().all(|&x| x == t as f32), "after {t} ticks");
    }
    assert_eq!(engine.simulation().ticks(), 5);
}

#[test]
fn test_configurations_swap_roles_every_tick() {
    let mut engine = engine(HeadlessContext::new());
    engine.build().unwrap();

    let read = engine.simulation().read_config().unwrap().handle;
    let write = engine.simulation().write_config().unwrap().handle;
    assert_ne!(read, write);

    engine.update(0.016).unwrap();
    assert_eq!(engine.simulation().read_config().unwrap().handle, write);
    assert_eq!(engine.simulation().write_config().unwrap().handle, read);

    engine.update(0.016).unwrap();
    assert_eq!(engine.simulation().read_config().unwrap().handle, read);
    assert_eq!(engine.simulation().write_config().unwrap().handle, write);
}

#[test]
fn test_capture_writes_the_other_buffer_of_each_pair() {
    let mut engine = engine(HeadlessContext::new());
    engine.build().unwrap();

    let pair = engine.simulation().feedback().next().unwrap().buffers().unwrap();
    let read = engine.simulation().read_config().unwrap().handle;
    let bound = engine.context().vertex_array_bindings(read).unwrap();
    assert!(bound.iter().any(|b| b.buffer == pair.input));
    assert!(bound.iter().all(|b| b.buffer != pair.output));

    engine.context_mut().clear_commands();
    engine.update(0.016).unwrap();

    let targets = engine
        .context()
        .commands()
        .iter()
        .find_map(|c| match c {
            Command::BeginCapture { targets } => Some(targets.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(targets, vec![pair.output]);

    let swapped = engine.simulation().feedback().next().unwrap().buffers().unwrap();
    assert_eq!(swapped.input, pair.output);
    assert_eq!(swapped.output, pair.input);
}

#[test]
fn test_paused_clock_draws_without_ticking() {
    let mut engine = engine(HeadlessContext::new().with_kernel(step_x));
    engine.build().unwrap();
    engine.time_mut().pause();

    let stats = engine.update(0.016).unwrap();
    assert!(!stats.ticked);
    assert_eq!(engine.context().stats().draws, 1);
    assert!(xs(&mut engine).iter().all(|&x| x == 0.0));
}

// ========== Uniforms ==========

#[test]
fn test_uniform_round_trips_through_the_device() {
    let mut engine = engine(HeadlessContext::new());
    engine.add_uniform("gravity", 9.8f32).unwrap();
    engine.set_script("positionOut[index] = position[index] - vec3<f32>(0.0, gravity * delta_time, 0.0);");
    engine.build().unwrap();

    assert_eq!(engine.uniform_on_device("gravity").unwrap(), Value::F32(9.8));
    engine.set_value("gravity", 3.0f32).unwrap();
    assert_eq!(engine.uniform_on_device("sim/gravity").unwrap(), Value::F32(3.0));

    assert!(matches!(
        engine.set_value("gravity", 1u32),
        Err(EngineError::TypeMismatch { .. })
    ));
    assert!(matches!(
        engine.set_value("missing", 1.0f32),
        Err(EngineError::UnknownVariable(_))
    ));
}

#[test]
fn test_unchanged_values_are_not_uploaded() {
    let mut engine = engine(HeadlessContext::new());
    engine.add_uniform("gravity", 9.8f32).unwrap();
    engine.set_script("positionOut[index] = position[index] * gravity;");
    engine.build().unwrap();

    let before = engine.context().stats().uniform_uploads;
    engine.set_value("gravity", 9.8f32).unwrap();
    assert_eq!(engine.context().stats().uniform_uploads, before);

    engine.set_value("gravity", 1.0f32).unwrap();
    engine.set_value("gravity", 1.0f32).unwrap();
    assert_eq!(engine.context().stats().uniform_uploads, before + 1);
}

#[test]
fn test_transition_sees_entity_count_and_clock() {
    let seen = Rc::new(Cell::new((0u32, 0.0f32)));
    let sink = seen.clone();
    let ctx = HeadlessContext::new().with_kernel(move |frame: &mut CaptureFrame| {
        sink.set((
            frame.uniform_u32("entity_count").unwrap_or(0),
            frame.uniform_f32("delta_time").unwrap_or(0.0),
        ));
        frame.pass_through();
    });
    let mut engine = engine(ctx);
    engine.set_script("positionOut[index] = position[index] + vec3<f32>(delta_time);");
    engine.build().unwrap();

    engine.set_active_count(5);
    engine.update(0.02).unwrap();

    let (count, delta) = seen.get();
    assert_eq!(count, 5);
    assert!((delta - 0.02).abs() < 1e-6);
}

// ========== Attributes ==========

#[test]
fn test_input_attribute_replacement_reaches_its_buffer() {
    let mut engine = engine(HeadlessContext::new());
    engine
        .add_input_attribute("offset", VarType::F32, vec![0.0f32; N as usize])
        .unwrap();
    engine.set_script("positionOut[index] = position[index] + vec3<f32>(offset[index], 0.0, 0.0);");
    engine.build().unwrap();

    engine.set_attribute_data("offset", vec![2.0f32; N as usize]).unwrap();
    let buffer = engine
        .simulation()
        .variables()
        .iter()
        .find_map(|v| match v {
            Variable::Input(i) => i.buffer(),
            _ => None,
        })
        .unwrap();
    let bytes = engine.context().buffer_contents(buffer).unwrap();
    assert_eq!(&bytes[..4], &2.0f32.to_le_bytes());

    assert!(matches!(
        engine.set_attribute_data("offset", vec![0.0f32; N as usize + 1]),
        Err(EngineError::DataLength { .. })
    ));
}

#[test]
fn test_output_variables_are_captured_after_feedback() {
    let ctx = HeadlessContext::new().with_kernel(|frame: &mut CaptureFrame| {
        frame.pass_through();
        for i in 0..frame.entities() {
            frame.write_f32("speed", i, &[i as f32 * 2.0]);
        }
    });
    let mut engine = engine(ctx);
    engine.add_output_variable("speed", VarType::F32).unwrap();
    engine.set_script(
        "positionOut[index] = position[index];\nspeed[index] = length(position[index]);",
    );
    engine.build().unwrap();
    engine.context_mut().clear_commands();
    engine.update(0.016).unwrap();

    let targets = engine
        .context()
        .commands()
        .iter()
        .find_map(|c| match c {
            Command::BeginCapture { targets } => Some(targets.len()),
            _ => None,
        })
        .unwrap();
    assert_eq!(targets, 2);

    let speed = engine.read_output("speed").unwrap();
    assert_eq!(speed.as_f32().unwrap()[..4], [0.0, 2.0, 4.0, 6.0]);
}

// ========== Capacity ==========

#[test]
fn test_active_count_is_clamped_to_capacity() {
    let mut engine = engine_with(HeadlessContext::new(), EngineConfig::new(N).with_active_count(20));
    assert_eq!(engine.active_count(), N);
    assert_eq!(engine.set_active_count(100), N);
    assert_eq!(engine.set_active_count(3), 3);

    engine.build().unwrap();
    assert_eq!(engine.update(0.016).unwrap().entities, 3);
}

#[test]
fn test_simulation_rejects_ticks_over_capacity() {
    let mut ctx = HeadlessContext::new();
    let mut pass = SimulationPass::new(4).with_workgroup_size(64);
    pass.add_feedback(FeedbackAttribute::new("x", VarType::F32, vec![0.0f32; 4], 4).unwrap())
        .unwrap();
    pass.build(&mut ctx, LocationPolicy::Acknowledge).unwrap();

    assert!(matches!(
        pass.tick(&mut ctx, 5),
        Err(EngineError::CapacityExceeded {
            requested: 5,
            capacity: 4
        })
    ));
    assert_eq!(pass.ticks(), 0);
    assert!(pass.tick(&mut ctx, 4).is_ok());
}

// ========== Build ==========

#[test]
fn test_every_declared_variable_is_bound() {
    let mut engine = engine(HeadlessContext::new());
    engine.add_uniform("gravity", 9.8f32).unwrap();
    engine
        .add_input_attribute("mass", VarType::F32, vec![1.0f32; N as usize])
        .unwrap();
    engine.add_output_variable("energy", VarType::F32).unwrap();
    engine.set_script(
        "positionOut[index] = position[index] * gravity;\nenergy[index] = mass[index] * gravity;",
    );

    let report = engine.build().unwrap();
    assert!(report.is_clean());

    for variable in engine.simulation().variables() {
        let bound = match variable {
            Variable::Uniform(u) if BUILTINS.contains(&u.name()) => continue,
            Variable::Uniform(u) => u.is_bound(),
            Variable::Input(i) => i.location().is_some(),
            Variable::Output(o) => o.location().is_some(),
            Variable::Feedback(f) => f.input_location().is_some() && f.output_location().is_some(),
        };
        assert!(bound, "{} is unbound", variable.name());
    }
}

#[test]
fn test_failed_compile_leaves_nothing_behind() {
    let mut engine = engine(HeadlessContext::new());
    engine.set_script("positionOut[index] = ;");

    assert!(matches!(engine.build(), Err(EngineError::Compile { .. })));
    assert_eq!(engine.state(), EngineState::Unbuilt);
    assert_eq!(engine.context().live_resources(), (0, 0, 0));
}

#[test]
fn test_failed_render_build_releases_the_simulation() {
    let mut engine = Engine::new(HeadlessContext::new(), EngineConfig::new(N));
    engine
        .add_feedback_variable("heading", VarType::Vec3, vec![0.0f32; 3 * N as usize])
        .unwrap();
    engine.set_script("headingOut[index] = heading[index];");

    assert!(engine.build().is_err());
    assert_eq!(engine.state(), EngineState::Unbuilt);
    assert_eq!(engine.simulation().state(), EngineState::Unbuilt);
    assert_eq!(engine.context().live_resources(), (0, 0, 0));
}

#[test]
fn test_unused_uniform_is_reported_and_ignored() {
    let mut engine = engine(HeadlessContext::new());
    engine.add_uniform("wind", 0.5f32).unwrap();
    let report = engine.build().unwrap();

    let unresolved: Vec<_> = report.unresolved().collect();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].name, "wind");
    assert_eq!(unresolved[0].program, "simulation");

    let before = engine.context().stats().uniform_uploads;
    for path in ["wind", "sim/wind"] {
        match engine.set_value(path, 2.0f32) {
            Err(EngineError::LocationNotFound(miss)) => {
                assert_eq!(miss.name, "wind");
                assert_eq!(miss.program, "simulation");
            }
            other => panic!("expected LocationNotFound for {path}, got {other:?}"),
        }
    }
    assert_eq!(engine.context().stats().uniform_uploads, before);
    engine.update(0.016).unwrap();
}

#[test]
fn test_values_set_before_build_are_stored() {
    let mut engine = engine(HeadlessContext::new());
    engine.add_uniform("wind", 0.5f32).unwrap();
    engine.set_value("wind", 2.0f32).unwrap();
    engine.build().unwrap();
    assert!(engine.set_value("wind", 3.0f32).is_err());
}

#[test]
fn test_strict_policy_fails_on_unused_variables() {
    let config = EngineConfig::new(N).with_location_policy(LocationPolicy::Strict);
    let mut engine = engine_with(HeadlessContext::new(), config);
    engine.add_uniform("wind", 0.5f32).unwrap();

    match engine.build() {
        Err(EngineError::LocationNotFound(miss)) => assert_eq!(miss.name, "wind"),
        other => panic!("expected LocationNotFound, got {:?}", other.map(|_| ())),
    }
    assert_eq!(engine.state(), EngineState::Unbuilt);
    assert_eq!(engine.context().live_resources(), (0, 0, 0));
}

#[test]
fn test_empty_declaration_set_is_rejected() {
    let mut engine = Engine::new(HeadlessContext::new(), EngineConfig::new(N));
    engine.set_script("");
    assert!(matches!(engine.build(), Err(EngineError::NoFeedbackVariables)));
}

// ========== Faults ==========

#[test]
fn test_device_faults_are_logged_with_their_operation() {
    let mut engine = engine(HeadlessContext::new());
    engine.build().unwrap();
    engine
        .context_mut()
        .inject_fault("draw", FaultCode::OutOfMemory, "capture buffer lost");

    let stats = engine.update(0.016).unwrap();
    assert_eq!(stats.faults, 1);

    let faults: Vec<_> = engine.faults().cloned().collect();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].operation, "tick");
    assert_eq!(faults[0].code, FaultCode::OutOfMemory);

    assert!(matches!(engine.ensure_healthy(), Err(EngineError::RuntimeDevice(_))));
    assert!(engine.ensure_healthy().is_ok());

    // The loop keeps running.
    assert_eq!(engine.update(0.016).unwrap().faults, 0);
}

#[test]
fn test_failed_tick_still_logs_its_fault() {
    let mut engine = engine(HeadlessContext::new().with_kernel(step_x));
    engine.build().unwrap();
    engine
        .context_mut()
        .fail_command("draw", FaultCode::Validation, "dispatch rejected");

    assert!(matches!(engine.update(0.016), Err(EngineError::Gpu(_))));
    let faults: Vec<_> = engine.take_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].operation, "tick");
    assert_eq!(faults[0].code, FaultCode::Validation);
    assert_eq!(engine.simulation().ticks(), 0);

    engine.update(0.016).unwrap();
    assert!(xs(&mut engine).iter().all(|&x| x == 1.0));
}

#[test]
fn test_failed_uniform_flush_still_logs_its_fault() {
    let mut engine = engine(HeadlessContext::new());
    engine.add_uniform("gravity", 9.8f32).unwrap();
    engine.set_script("positionOut[index] = position[index] * gravity;");
    engine.build().unwrap();
    // The first frame uploads the camera's view projection.
    engine
        .context_mut()
        .fail_command("upload_uniform", FaultCode::OutOfMemory, "uniform buffer lost");

    assert!(engine.update(0.016).is_err());
    let faults = engine.take_faults();
    assert_eq!(faults.len(), 1);
    assert_eq!(faults[0].operation, "flush_uniforms");
}

#[test]
fn test_fault_log_is_bounded() {
    let config = EngineConfig::new(N).with_fault_log_limit(2);
    let mut engine = engine_with(HeadlessContext::new(), config);
    engine.build().unwrap();
    for message in ["a", "b", "c"] {
        engine
            .context_mut()
            .inject_fault("end_frame", FaultCode::Validation, message);
        engine.update(0.016).unwrap();
    }

    let messages: Vec<String> = engine.take_faults().into_iter().map(|f| f.message).collect();
    assert_eq!(messages, vec!["b".to_string(), "c".to_string()]);
    assert_eq!(engine.faults().count(), 0);
}

// ========== Lifecycle ==========

#[test]
fn test_dispose_releases_everything_and_allows_rebuild() {
    let signals = Rc::new(RefCell::new(Vec::new()));
    let sink = signals.clone();
    let mut engine = engine(HeadlessContext::new().with_kernel(step_x));
    engine.on_signal(move |s| sink.borrow_mut().push(s.clone()));

    engine.build().unwrap();
    engine.update(0.016).unwrap();
    engine.update(0.016).unwrap();
    engine.dispose();

    assert_eq!(engine.state(), EngineState::Disposed);
    assert_eq!(engine.context().live_resources(), (0, 0, 0));
    assert!(engine.update(0.016).is_err());

    engine.build().unwrap();
    assert!(xs(&mut engine).iter().all(|&x| x == 0.0));
    engine.update(0.016).unwrap();
    assert!(xs(&mut engine).iter().all(|&x| x == 1.0));

    assert_eq!(
        *signals.borrow(),
        vec![EngineSignal::Ready, EngineSignal::Disposed, EngineSignal::Ready]
    );
}

#[test]
fn test_pool_seeds_an_engine() {
    let mut pool = ParticlePool::new(N).with_seed(3);
    pool.populate(6, |ctx| ParticleSeed {
        position: ctx.random_in_sphere(1.0),
        state: ctx.index,
        ..Default::default()
    });

    let mut engine = Engine::new(HeadlessContext::new(), EngineConfig::new(N));
    pool.seed(&mut engine).unwrap();
    engine.set_script("positionOut[index] = position[index] + velocity[index] * delta_time;");
    engine.build().unwrap();

    assert_eq!(engine.active_count(), 6);
    let states = engine.read_feedback("state").unwrap();
    assert_eq!(states.as_u32().unwrap(), &[0, 1, 2, 3, 4, 5]);
}
