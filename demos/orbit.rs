//! Satellites climbing to an orbit.
//!
//! Every satellite starts in "transiting" mode and moves outward toward the
//! orbit radius. Once it reaches 98% of the radius the script flips its mode
//! to "orbiting" and it circles the origin from then on. The mode lives in
//! the `state` feedback attribute; the engine knows nothing about it.
//!
//! Run with: cargo run --example orbit
//!
//! Left-drag orbits the camera, the wheel zooms, Space pauses.

use tfpe::prelude::*;
use tracing_subscriber::EnvFilter;

const SATELLITES: u32 = 20_000;

const TRANSITING: u32 = 0;
const ORBITING: u32 = 1;

fn main() -> Result<(), SimulationError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = EngineConfig::new(SATELLITES)
        .with_point_size(0.01)
        .with_clear([0.01, 0.01, 0.03, 1.0]);

    tfpe::window::run_with(
        "TFPE - Orbit",
        config,
        |engine| {
            let mut pool = ParticlePool::new(SATELLITES).with_seed(7);
            pool.populate(SATELLITES, |ctx| ParticleSeed {
                position: ctx.random_in_sphere(0.3),
                state: TRANSITING,
                color: Vec4::new(0.3, 0.6, 1.0, 1.0),
                ..Default::default()
            });
            pool.seed(engine)?;

            engine.add_uniform("orbit_radius", 1.0f32)?;
            engine.add_uniform("climb_rate", 0.8f32)?;
            engine.add_uniform("angular_speed", 0.6f32)?;
            engine.set_script(
                r#"
    var p = position[index];
    var mode = state[index];
    let r = max(length(p.xz), 0.0001);
    let dir = p.xz / r;
    if mode == 0u {
        let t = min(climb_rate * delta_time, 1.0);
        let next_r = approach(r, orbit_radius, t);
        p = vec3<f32>(dir.x * next_r, p.y * (1.0 - t), dir.y * next_r);
        if next_r / orbit_radius >= 0.98 {
            mode = 1u;
        }
    } else {
        let angle = angular_speed * delta_time / orbit_radius;
        let c = cos(angle);
        let s = sin(angle);
        p = vec3<f32>(p.x * c - p.z * s, p.y, p.x * s + p.z * c);
    }
    positionOut[index] = p;
    stateOut[index] = mode;
    colorOut[index] = select(vec4<f32>(0.3, 0.6, 1.0, 1.0), vec4<f32>(1.0, 0.6, 0.2, 1.0), mode == 1u);
"#,
            );
            engine.camera_mut().distance = 3.5;
            Ok(())
        },
        |engine, stats| {
            if stats.frame % 240 != 0 {
                return;
            }
            match engine.read_feedback("state") {
                Ok(states) => {
                    let orbiting = states
                        .as_u32()
                        .map(|s| s.iter().filter(|&&m| m == ORBITING).count())
                        .unwrap_or(0);
                    tracing::info!(frame = stats.frame, orbiting, total = stats.entities, "orbit progress");
                }
                Err(e) => tracing::warn!(error = %e, "state read-back failed"),
            }
        },
    )
}
