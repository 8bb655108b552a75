//! # TFPE - Transform Feedback Particle Engine
//!
//! GPU-resident particle simulation with ping-pong buffers.
//!
//! Per-entity state lives in pairs of device buffers. Every frame a generated
//! transition stage reads one buffer of each pair and captures its results
//! into the other, the pairs swap roles, and the render stage draws straight
//! from the buffers that were just written. Nothing round-trips through the
//! host.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tfpe::prelude::*;
//!
//! fn main() -> Result<(), SimulationError> {
//!     tfpe::window::run("Drift", EngineConfig::new(10_000), |engine| {
//!         let mut pool = ParticlePool::new(10_000);
//!         pool.populate(10_000, |ctx| ParticleSeed {
//!             position: ctx.random_in_sphere(0.5),
//!             ..Default::default()
//!         });
//!         pool.seed(engine)?;
//!         engine.add_uniform("speed", 0.2f32)?;
//!         engine.set_script("positionOut[index] = position[index] + velocity[index] * speed * delta_time;");
//!         Ok(())
//!     })
//! }
//! ```
//!
//! ## Variables
//!
//! | Kind | Host writes | Device buffers | WGSL |
//! |------|-------------|----------------|------|
//! | [`Uniform`] | every changed value | one small uniform buffer | `var<uniform> name` |
//! | [`InputAttribute`] | whole array | one | `var<storage, read> name` |
//! | [`FeedbackAttribute`] | initial state | a swapping pair | `name` + `nameOut` |
//! | [`OutputAttribute`] | never | one, captured | `var<storage, read_write> name` |
//!
//! Scripts address the current entity through `index` and write every
//! captured output at that index. Untouched feedback fields carry forward.
//!
//! ## Devices
//!
//! The engine never reaches for a global device. [`gpu::WgpuContext`] drives
//! real hardware; [`context::HeadlessContext`] runs the same compile, link
//! and capture contract in host memory for tests.

pub mod camera;
pub mod context;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod pool;
pub mod program;
pub mod render;
pub mod shader;
pub mod shader_utils;
pub mod simulation;
pub mod textures;
pub mod time;
pub mod variable;
pub mod window;

pub use bytemuck;
pub use camera::Camera;
pub use context::{GraphicsContext, HeadlessContext};
pub use engine::{BuildReport, Engine, EngineConfig, EngineSignal, EngineState, FrameStats, UniformScope};
pub use error::{EngineError, GpuError, LocationNotFound, SimulationError, TextureError};
pub use glam::{Mat4, Vec2, Vec3, Vec4};
pub use gpu::WgpuContext;
pub use pool::{ParticlePool, ParticleSeed, SpawnContext};
pub use program::LocationPolicy;
pub use render::{RenderConfig, RenderPrimitive};
pub use textures::{AddressMode, FilterMode, TextureConfig};
pub use time::Time;
pub use variable::{
    AttributeData, FeedbackAttribute, InputAttribute, OutputAttribute, Uniform, Value, VarType, Variable,
    VariableKind,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use tfpe::prelude::*;
/// ```
pub mod prelude {
    pub use crate::camera::Camera;
    pub use crate::context::{GraphicsContext, HeadlessContext};
    pub use crate::engine::{BuildReport, Engine, EngineConfig, EngineSignal, EngineState, FrameStats, UniformScope};
    pub use crate::error::{EngineError, SimulationError};
    pub use crate::gpu::WgpuContext;
    pub use crate::pool::{ParticlePool, ParticleSeed, SpawnContext};
    pub use crate::program::LocationPolicy;
    pub use crate::render::{RenderConfig, RenderPrimitive};
    pub use crate::textures::{AddressMode, FilterMode, TextureConfig};
    pub use crate::time::Time;
    pub use crate::variable::{AttributeData, Value, VarType};
    pub use crate::{Mat4, Vec2, Vec3, Vec4};
}
