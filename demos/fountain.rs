//! A sprite fountain with respawning particles.
//!
//! Particles fall under gravity and respawn at the nozzle when their
//! lifetime runs out. Respawn randomness comes from the built-in WGSL
//! library (`rand`, `rand_range`, `hsv_to_rgb`).
//!
//! Run with: cargo run --example fountain

use tfpe::prelude::*;
use tracing_subscriber::EnvFilter;

const PARTICLES: u32 = 50_000;

fn main() -> Result<(), SimulationError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = EngineConfig::new(PARTICLES)
        .with_primitive(RenderPrimitive::Sprites)
        .with_point_size(0.012);

    tfpe::window::run("TFPE - Fountain", config, |engine| {
        let mut pool = ParticlePool::new(PARTICLES).with_seed(42);
        pool.populate(PARTICLES, |ctx| {
            // Stagger lifetimes so the fountain starts already flowing.
            let lifetime = ctx.progress() * 3.0;
            ParticleSeed {
                position: Vec3::new(0.0, -0.8, 0.0),
                velocity: Vec3::ZERO,
                lifetime,
                color: ctx.rainbow(0.7, 1.0).extend(1.0),
                ..Default::default()
            }
        });
        pool.seed(engine)?;

        engine.add_uniform("gravity", 1.6f32)?;
        engine.add_uniform("spread", 0.35f32)?;
        engine.set_script(
            r#"
    var p = position[index];
    var v = velocity[index];
    var life = lifetime[index] - delta_time;
    if life <= 0.0 {
        let seed = hash(index ^ bitcast<u32>(time));
        p = vec3<f32>(0.0, -0.8, 0.0);
        v = vec3<f32>(
            rand_range(seed, -spread, spread),
            rand_range(seed + 1u, 1.6, 2.2),
            rand_range(seed + 2u, -spread, spread),
        );
        life = rand_range(seed + 3u, 1.5, 3.0);
        colorOut[index] = vec4<f32>(hsv_to_rgb(rand(seed + 4u), 0.7, 1.0), 1.0);
    }
    v.y -= gravity * delta_time;
    p += v * delta_time;
    positionOut[index] = p;
    velocityOut[index] = v;
    lifetimeOut[index] = life;
"#,
        );
        Ok(())
    })
}
