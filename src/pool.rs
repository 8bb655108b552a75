//! Host-side staging for particle state.
//!
//! [`ParticlePool`] holds a fixed-capacity structure of arrays (position,
//! velocity, lifetime, colour, state) filled by a spawn closure, then hands
//! each array to an engine as a feedback attribute:
//!
//! ```ignore
//! let mut pool = ParticlePool::new(50_000).with_seed(7);
//! pool.populate(50_000, |ctx| ParticleSeed {
//!     position: ctx.random_in_sphere(1.0),
//!     velocity: ctx.random_direction() * 0.2,
//!     color: ctx.random_hue(0.8, 1.0).extend(1.0),
//!     ..Default::default()
//! });
//! pool.seed(&mut engine)?;
//! ```
//!
//! Spawning is deterministic for a given seed.

use std::f32::consts::TAU;

use glam::{Vec3, Vec4};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::context::GraphicsContext;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::variable::VarType;

pub const POSITION: &str = "position";
pub const VELOCITY: &str = "velocity";
pub const LIFETIME: &str = "lifetime";
pub const COLOR: &str = "color";
pub const STATE: &str = "state";

/// Per-particle helpers handed to a spawn closure.
pub struct SpawnContext {
    /// Index of the particle being spawned.
    pub index: u32,
    /// Number of particles in this spawn.
    pub count: u32,
    /// Half-size of the spawn volume.
    pub bounds: f32,
    rng: SmallRng,
}

impl SpawnContext {
    pub(crate) fn new(index: u32, count: u32, bounds: f32, seed: u64) -> Self {
        let mixed = seed ^ (index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
        Self {
            index,
            count,
            bounds,
            rng: SmallRng::seed_from_u64(mixed),
        }
    }

    /// Position of this particle in the spawn, in [0, 1).
    #[inline]
    pub fn progress(&self) -> f32 {
        self.index as f32 / self.count.max(1) as f32
    }

    // ========== Random primitives ==========

    #[inline]
    pub fn random(&mut self) -> f32 {
        self.rng.gen()
    }

    #[inline]
    pub fn random_range(&mut self, min: f32, max: f32) -> f32 {
        if max <= min {
            return min;
        }
        self.rng.gen_range(min..max)
    }

    #[inline]
    pub fn random_uint(&mut self, min: u32, max: u32) -> u32 {
        if max <= min {
            return min;
        }
        self.rng.gen_range(min..max)
    }

    // ========== Shapes ==========

    /// Uniform point inside a sphere.
    pub fn random_in_sphere(&mut self, radius: f32) -> Vec3 {
        let r = radius * self.rng.gen::<f32>().cbrt();
        self.random_direction() * r
    }

    pub fn random_on_sphere(&mut self, radius: f32) -> Vec3 {
        self.random_direction() * radius
    }

    pub fn random_in_cube(&mut self, half_size: f32) -> Vec3 {
        Vec3::new(
            self.random_range(-half_size, half_size),
            self.random_range(-half_size, half_size),
            self.random_range(-half_size, half_size),
        )
    }

    pub fn random_in_bounds(&mut self) -> Vec3 {
        self.random_in_cube(self.bounds)
    }

    /// Uniform point inside a disk in the XZ plane.
    pub fn random_in_disk(&mut self, radius: f32) -> Vec3 {
        let theta = self.rng.gen_range(0.0..TAU);
        let r = radius * self.rng.gen::<f32>().sqrt();
        Vec3::new(r * theta.cos(), 0.0, r * theta.sin())
    }

    pub fn random_on_ring(&mut self, radius: f32) -> Vec3 {
        let theta = self.rng.gen_range(0.0..TAU);
        Vec3::new(radius * theta.cos(), 0.0, radius * theta.sin())
    }

    /// Evenly spaced point on a circle in the XZ plane.
    pub fn circle_position(&self, radius: f32) -> Vec3 {
        let angle = self.progress() * TAU;
        Vec3::new(radius * angle.cos(), 0.0, radius * angle.sin())
    }

    /// Point of a `cols x rows x layers` lattice spanning the bounds.
    pub fn grid_position(&self, cols: u32, rows: u32, layers: u32) -> Vec3 {
        let (cols, rows, layers) = (cols.max(1), rows.max(1), layers.max(1));
        let i = self.index % (cols * rows * layers);
        let axis = |n: u32, of: u32| (n as f32 / (of - 1).max(1) as f32) * 2.0 - 1.0;
        Vec3::new(
            axis(i % cols, cols),
            axis((i / cols) % rows, rows),
            axis(i / (cols * rows), layers),
        ) * self.bounds
    }

    // ========== Directions ==========

    /// Uniform unit vector.
    pub fn random_direction(&mut self) -> Vec3 {
        let z: f32 = self.rng.gen_range(-1.0..1.0);
        let theta = self.rng.gen_range(0.0..TAU);
        let r = (1.0 - z * z).max(0.0).sqrt();
        Vec3::new(r * theta.cos(), r * theta.sin(), z)
    }

    /// Velocity tangent to the circle through `position` around the Y axis,
    /// in the XZ plane.
    pub fn tangent_velocity(&self, position: Vec3, speed: f32) -> Vec3 {
        let tangent = Vec3::new(-position.z, 0.0, position.x);
        if tangent.length_squared() > 1e-4 {
            tangent.normalize() * speed
        } else {
            Vec3::new(speed, 0.0, 0.0)
        }
    }

    pub fn outward_velocity(&mut self, position: Vec3, speed: f32) -> Vec3 {
        if position.length_squared() > 1e-4 {
            position.normalize() * speed
        } else {
            self.random_direction() * speed
        }
    }

    // ========== Colour ==========

    pub fn random_hue(&mut self, saturation: f32, value: f32) -> Vec3 {
        let hue = self.rng.gen::<f32>();
        hsv_to_rgb(hue, saturation, value)
    }

    /// Hue sweep over the spawn.
    pub fn rainbow(&self, saturation: f32, value: f32) -> Vec3 {
        hsv_to_rgb(self.progress(), saturation, value)
    }
}

pub fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Vec3 {
    let h = h.rem_euclid(1.0) * 6.0;
    let c = v * s;
    let x = c * (1.0 - (h % 2.0 - 1.0).abs());
    let (r, g, b) = match h as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    Vec3::new(r, g, b) + Vec3::splat(v - c)
}

/// Initial state of one particle.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParticleSeed {
    pub position: Vec3,
    pub velocity: Vec3,
    /// Seconds left to live; scripts decide what expiry means.
    pub lifetime: f32,
    pub color: Vec4,
    /// Script-defined mode flag.
    pub state: u32,
}

impl Default for ParticleSeed {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            velocity: Vec3::ZERO,
            lifetime: 1.0,
            color: Vec4::ONE,
            state: 0,
        }
    }
}

/// Fixed-capacity structure-of-arrays particle staging.
#[derive(Clone, Debug)]
pub struct ParticlePool {
    capacity: u32,
    seed: u64,
    bounds: f32,
    positions: Vec<Vec3>,
    velocities: Vec<Vec3>,
    lifetimes: Vec<f32>,
    colors: Vec<Vec4>,
    states: Vec<u32>,
}

impl ParticlePool {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            seed: 0,
            bounds: 1.0,
            positions: Vec::new(),
            velocities: Vec::new(),
            lifetimes: Vec::new(),
            colors: Vec::new(),
            states: Vec::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_bounds(mut self, bounds: f32) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    pub fn velocities(&self) -> &[Vec3] {
        &self.velocities
    }

    pub fn lifetimes(&self) -> &[f32] {
        &self.lifetimes
    }

    pub fn colors(&self) -> &[Vec4] {
        &self.colors
    }

    pub fn states(&self) -> &[u32] {
        &self.states
    }

    /// Replace the contents with `count` spawned particles (clamped to
    /// capacity). Returns the number spawned.
    pub fn populate<F>(&mut self, count: u32, mut spawn: F) -> usize
    where
        F: FnMut(&mut SpawnContext) -> ParticleSeed,
    {
        let count = count.min(self.capacity);
        self.clear();
        for index in 0..count {
            let mut ctx = SpawnContext::new(index, count, self.bounds, self.seed);
            self.push(spawn(&mut ctx));
        }
        tracing::debug!(count, seed = self.seed, "particle pool populated");
        self.len()
    }

    /// Append one particle. Returns `false` when the pool is full.
    pub fn push(&mut self, particle: ParticleSeed) -> bool {
        if self.len() >= self.capacity as usize {
            return false;
        }
        self.positions.push(particle.position);
        self.velocities.push(particle.velocity);
        self.lifetimes.push(particle.lifetime);
        self.colors.push(particle.color);
        self.states.push(particle.state);
        true
    }

    pub fn get(&self, index: usize) -> Option<ParticleSeed> {
        Some(ParticleSeed {
            position: *self.positions.get(index)?,
            velocity: *self.velocities.get(index)?,
            lifetime: *self.lifetimes.get(index)?,
            color: *self.colors.get(index)?,
            state: *self.states.get(index)?,
        })
    }

    pub fn clear(&mut self) {
        self.positions.clear();
        self.velocities.clear();
        self.lifetimes.clear();
        self.colors.clear();
        self.states.clear();
    }

    /// Declare `position`, `velocity`, `lifetime`, `color` and `state` as
    /// feedback attributes of `engine` and set its active count to the pool
    /// size.
    pub fn seed<C: GraphicsContext>(&self, engine: &mut Engine<C>) -> Result<(), EngineError> {
        if self.capacity > engine.capacity() {
            return Err(EngineError::CapacityExceeded {
                requested: self.capacity,
                capacity: engine.capacity(),
            });
        }
        engine.add_feedback_variable(POSITION, VarType::Vec3, self.positions.clone())?;
        engine.add_feedback_variable(VELOCITY, VarType::Vec3, self.velocities.clone())?;
        engine.add_feedback_variable(LIFETIME, VarType::F32, self.lifetimes.clone())?;
        engine.add_feedback_variable(COLOR, VarType::Vec4, self.colors.clone())?;
        engine.add_feedback_variable(STATE, VarType::U32, self.states.clone())?;
        engine.set_active_count(self.len() as u32);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HeadlessContext;
    use crate::engine::EngineConfig;

    #[test]
    fn test_progress() {
        let ctx = SpawnContext::new(50, 100, 1.0, 0);
        assert!((ctx.progress() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_random_in_sphere_stays_inside() {
        let mut ctx = SpawnContext::new(0, 1, 1.0, 3);
        for _ in 0..200 {
            assert!(ctx.random_in_sphere(0.5).length() <= 0.5 + 1e-4);
        }
    }

    #[test]
    fn test_grid_corners() {
        let ctx = SpawnContext::new(0, 27, 2.0, 0);
        assert_eq!(ctx.grid_position(3, 3, 3), Vec3::splat(-2.0));
        let last = SpawnContext::new(26, 27, 2.0, 0);
        assert_eq!(last.grid_position(3, 3, 3), Vec3::splat(2.0));
    }

    #[test]
    fn test_tangent_velocity_circles_the_y_axis() {
        let ctx = SpawnContext::new(0, 1, 1.0, 0);
        let position = Vec3::new(0.6, 0.2, -0.3);
        let v = ctx.tangent_velocity(position, 2.0);
        assert!((v.length() - 2.0).abs() < 1e-5);
        assert_eq!(v.y, 0.0);
        assert!(v.dot(Vec3::new(position.x, 0.0, position.z)).abs() < 1e-5);
    }

    #[test]
    fn test_hsv_primaries() {
        assert!((hsv_to_rgb(0.0, 1.0, 1.0) - Vec3::X).length() < 1e-5);
        assert!((hsv_to_rgb(1.0 / 3.0, 1.0, 1.0) - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn test_populate_is_deterministic_and_clamped() {
        let spawn = |ctx: &mut SpawnContext| ParticleSeed {
            position: ctx.random_in_cube(1.0),
            ..Default::default()
        };
        let mut a = ParticlePool::new(10).with_seed(42);
        let mut b = ParticlePool::new(10).with_seed(42);
        assert_eq!(a.populate(25, spawn), 10);
        b.populate(25, spawn);
        assert_eq!(a.positions(), b.positions());
        assert!(!a.push(ParticleSeed::default()));
    }

    #[test]
    fn test_seed_declares_feedback_attributes() {
        let mut pool = ParticlePool::new(4);
        pool.populate(3, |ctx| ParticleSeed {
            position: ctx.circle_position(1.0),
            state: ctx.index,
            ..Default::default()
        });
        let mut engine = Engine::new(HeadlessContext::new(), EngineConfig::new(4));
        pool.seed(&mut engine).unwrap();
        assert_eq!(engine.active_count(), 3);
        engine.build().unwrap();

        let states = engine.read_feedback(STATE).unwrap();
        assert_eq!(states.as_u32(), Some(&[0, 1, 2][..]));
    }
}
