//! The integration driver.
//!
//! [`Engine`] owns a graphics context, a [`SimulationPass`] and a
//! [`RenderPass`], and runs one frame per [`Engine::update`]:
//!
//! 1. advance the clock and stage the `time`/`delta_time`/`view_proj` uniforms
//! 2. flush every changed uniform (value-diffed, one upload each)
//! 3. run one simulation tick over the active entities
//! 4. draw the active entities from the feedback buffers that are now current
//!
//! Device faults are polled after each state-changing step and kept in a
//! bounded log tagged with the step that raised them. They never stop the
//! loop; callers inspect them through [`Engine::faults`].
//!
//! # Example
//!
//! ```ignore
//! use tfpe::prelude::*;
//!
//! let mut engine = Engine::new(ctx, EngineConfig::new(10_000));
//! engine.add_feedback_variable("position", VarType::Vec3, positions)?;
//! engine.add_uniform("speed", 1.0f32)?;
//! engine.set_script("positionOut[index] = position[index] * (1.0 + speed * delta_time);");
//! engine.build()?;
//! loop {
//!     engine.update(1.0 / 60.0)?;
//! }
//! ```

use std::collections::VecDeque;

use crate::camera::Camera;
use crate::context::{DeviceFault, GraphicsContext, TextureHandle};
use crate::error::{EngineError, LocationNotFound};
use crate::program::LocationPolicy;
use crate::render::{RenderConfig, RenderPass, RenderPrimitive};
use crate::simulation::{SimulationPass, DEFAULT_WORKGROUP_SIZE};
use crate::textures::TextureConfig;
use crate::time::Time;
use crate::variable::{AttributeData, FeedbackAttribute, InputAttribute, OutputAttribute, Uniform, Value, VarType};

/// Lifecycle of an engine or one of its passes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EngineState {
    /// Declarations may change; nothing exists on the device.
    #[default]
    Unbuilt,
    /// Programs and buffers exist; no tick has run.
    Built,
    /// At least one tick has run.
    Running,
    /// Device resources were released. Can be built again.
    Disposed,
}

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Entities allocated in every attribute buffer.
    pub capacity: u32,
    /// Entities simulated and drawn per frame; `None` means all.
    pub active_count: Option<u32>,
    pub workgroup_size: u32,
    pub render: RenderConfig,
    pub location_policy: LocationPolicy,
    /// Faults kept before the oldest are dropped.
    pub fault_log_limit: usize,
}

impl EngineConfig {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            active_count: None,
            workgroup_size: DEFAULT_WORKGROUP_SIZE,
            render: RenderConfig::default(),
            location_policy: LocationPolicy::default(),
            fault_log_limit: 64,
        }
    }

    pub fn with_active_count(mut self, count: u32) -> Self {
        self.active_count = Some(count);
        self
    }

    pub fn with_workgroup_size(mut self, size: u32) -> Self {
        self.workgroup_size = size;
        self
    }

    pub fn with_primitive(mut self, primitive: RenderPrimitive) -> Self {
        self.render.primitive = primitive;
        self
    }

    pub fn with_point_size(mut self, size: f32) -> Self {
        self.render.point_size = size;
        self
    }

    pub fn with_clear(mut self, clear: [f64; 4]) -> Self {
        self.render.clear = clear;
        self
    }

    pub fn with_location_policy(mut self, policy: LocationPolicy) -> Self {
        self.location_policy = policy;
        self
    }

    pub fn with_fault_log_limit(mut self, limit: usize) -> Self {
        self.fault_log_limit = limit.max(1);
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new(10_000)
    }
}

/// Variables each program does not expose after a successful build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub simulation: Vec<LocationNotFound>,
    pub render: Vec<LocationNotFound>,
}

impl BuildReport {
    /// Whether every declared variable resolved.
    pub fn is_clean(&self) -> bool {
        self.simulation.is_empty() && self.render.is_empty()
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &LocationNotFound> {
        self.simulation.iter().chain(&self.render)
    }
}

/// What one [`Engine::update`] did.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FrameStats {
    pub frame: u64,
    /// Effective (scaled, clamped) delta in seconds.
    pub delta: f32,
    pub elapsed: f32,
    /// Entities simulated and drawn.
    pub entities: u32,
    /// Whether a simulation tick ran (it does not while the clock is paused).
    pub ticked: bool,
    pub uniform_uploads: usize,
    /// Device faults raised during this frame.
    pub faults: usize,
}

/// Coarse lifecycle notifications for the host layer.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineSignal {
    Ready,
    Error(String),
    Disposed,
}

/// Which pass a uniform belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UniformScope {
    Simulation,
    Render,
    Both,
}

type SignalListener = Box<dyn FnMut(&EngineSignal)>;

/// Simulation plus render, driven one frame at a time.
pub struct Engine<C: GraphicsContext> {
    ctx: C,
    config: EngineConfig,
    simulation: SimulationPass,
    render: RenderPass,
    time: Time,
    camera: Camera,
    active: u32,
    state: EngineState,
    faults: VecDeque<DeviceFault>,
    listeners: Vec<SignalListener>,
}

impl<C: GraphicsContext> Engine<C> {
    pub fn new(ctx: C, config: EngineConfig) -> Self {
        let active = config
            .active_count
            .unwrap_or(config.capacity)
            .min(config.capacity);
        Self {
            simulation: SimulationPass::new(config.capacity).with_workgroup_size(config.workgroup_size),
            render: RenderPass::new(config.render),
            ctx,
            time: Time::new(),
            camera: Camera::new(),
            active,
            state: EngineState::Unbuilt,
            faults: VecDeque::new(),
            listeners: Vec::new(),
            config,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn capacity(&self) -> u32 {
        self.config.capacity
    }

    pub fn active_count(&self) -> u32 {
        self.active
    }

    pub fn context(&self) -> &C {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut C {
        &mut self.ctx
    }

    pub fn simulation(&self) -> &SimulationPass {
        &self.simulation
    }

    pub fn render(&self) -> &RenderPass {
        &self.render
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    pub fn time(&self) -> &Time {
        &self.time
    }

    pub fn time_mut(&mut self) -> &mut Time {
        &mut self.time
    }

    /// Register a listener for lifecycle signals.
    pub fn on_signal(&mut self, listener: impl FnMut(&EngineSignal) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    fn emit(&mut self, signal: EngineSignal) {
        for listener in &mut self.listeners {
            listener(&signal);
        }
    }

    // ========== Declarations ==========

    /// Declare a simulated per-entity field, read as `name` and written as
    /// `nameOut` by the script.
    pub fn add_feedback_variable(
        &mut self,
        name: &str,
        ty: VarType,
        initial: impl Into<AttributeData>,
    ) -> Result<(), EngineError> {
        let attribute = FeedbackAttribute::new(name, ty, initial, self.config.capacity)?;
        self.simulation.add_feedback(attribute)
    }

    /// Declare per-entity data the script reads but never writes.
    pub fn add_input_attribute(
        &mut self,
        name: &str,
        ty: VarType,
        data: impl Into<AttributeData>,
    ) -> Result<(), EngineError> {
        let attribute = InputAttribute::new(name, ty, data, self.config.capacity)?;
        self.simulation.add_input(attribute)
    }

    /// Declare a captured output with no host-side input.
    pub fn add_output_variable(&mut self, name: &str, ty: VarType) -> Result<(), EngineError> {
        let attribute = OutputAttribute::new(name, ty, self.config.capacity)?;
        self.simulation.add_output(attribute)
    }

    /// Declare a simulation uniform.
    pub fn add_uniform(&mut self, name: &str, value: impl Into<Value>) -> Result<(), EngineError> {
        self.add_uniform_scoped(name, value, UniformScope::Simulation)
    }

    pub fn add_uniform_scoped(
        &mut self,
        name: &str,
        value: impl Into<Value>,
        scope: UniformScope,
    ) -> Result<(), EngineError> {
        let value = value.into();
        match scope {
            UniformScope::Simulation => self.simulation.add_uniform(Uniform::new(name, value)),
            UniformScope::Render => self.render.add_uniform(Uniform::new(name, value)),
            UniformScope::Both => {
                if self.simulation.uniform(name).is_some() || self.render.uniform(name).is_some() {
                    return Err(EngineError::DuplicateName(name.to_string()));
                }
                self.simulation.add_uniform(Uniform::new(name, value))?;
                self.render.add_uniform(Uniform::new(name, value))
            }
        }
    }

    /// Install the per-tick transition body.
    pub fn set_script(&mut self, body: impl Into<String>) {
        self.simulation.set_script(body);
    }

    /// Add a WGSL function callable from the script.
    pub fn add_function(&mut self, source: impl Into<String>) {
        self.simulation.add_function(source);
    }

    /// Replace the default render vertex body.
    pub fn set_render_script(&mut self, body: impl Into<String>) {
        self.render.set_vertex_body(body);
    }

    /// Replace the default render fragment body.
    pub fn set_fragment_script(&mut self, body: impl Into<String>) {
        self.render.set_fragment_body(body);
    }

    pub fn add_render_function(&mut self, source: impl Into<String>) {
        self.render.add_function(source);
    }

    pub fn create_texture(&mut self, config: &TextureConfig) -> Result<TextureHandle, EngineError> {
        let texture = self.ctx.create_texture(config)?;
        self.poll_faults("create_texture");
        Ok(texture)
    }

    // ========== Lifecycle ==========

    /// Compile, link, allocate and bind both passes.
    ///
    /// Either both passes are built or neither is: on failure every device
    /// resource created so far is released and the state is unchanged.
    pub fn build(&mut self) -> Result<BuildReport, EngineError> {
        if !matches!(self.state, EngineState::Unbuilt | EngineState::Disposed) {
            return Err(EngineError::InvalidState {
                operation: "build",
                state: self.state,
            });
        }
        match self.build_passes() {
            Ok(report) => {
                self.poll_faults("build");
                self.state = EngineState::Built;
                tracing::info!(
                    capacity = self.config.capacity,
                    active = self.active,
                    unresolved = report.unresolved().count(),
                    "engine built"
                );
                self.emit(EngineSignal::Ready);
                Ok(report)
            }
            Err(e) => {
                self.poll_faults("build");
                tracing::error!(error = %e, "engine build failed");
                self.emit(EngineSignal::Error(e.to_string()));
                Err(e)
            }
        }
    }

    fn build_passes(&mut self) -> Result<BuildReport, EngineError> {
        let policy = self.config.location_policy;
        let simulation = self.simulation.build(&mut self.ctx, policy)?;
        match self.render.build(&mut self.ctx, &self.simulation, policy) {
            Ok(render) => Ok(BuildReport { simulation, render }),
            Err(e) => {
                self.simulation.reset(&mut self.ctx);
                Err(e)
            }
        }
    }

    /// Release every device resource. Declarations are kept, so the engine
    /// can be built again.
    pub fn dispose(&mut self) {
        if matches!(self.state, EngineState::Unbuilt | EngineState::Disposed) {
            return;
        }
        self.render.dispose(&mut self.ctx);
        self.simulation.dispose(&mut self.ctx);
        self.poll_faults("dispose");
        self.state = EngineState::Disposed;
        tracing::info!("engine disposed");
        self.emit(EngineSignal::Disposed);
    }

    // ========== Frame loop ==========

    /// Run one frame: advance the clock, tick once, draw once.
    ///
    /// While the clock is paused the tick is skipped and the current state is
    /// drawn again.
    pub fn update(&mut self, delta: f32) -> Result<FrameStats, EngineError> {
        if !matches!(self.state, EngineState::Built | EngineState::Running) {
            return Err(EngineError::InvalidState {
                operation: "update",
                state: self.state,
            });
        }
        let faults_before = self.faults.len();
        let delta = self.time.advance(delta);
        let elapsed = self.time.elapsed();
        let (width, height) = self.ctx.viewport();

        self.simulation.set_clock(elapsed, delta)?;
        self.render.set_frame(self.camera.view_proj(width, height), elapsed)?;
        let flushed = match self.simulation.flush_uniforms(&mut self.ctx) {
            Ok(sim) => self.render.flush_uniforms(&mut self.ctx).map(|render| sim + render),
            Err(e) => Err(e),
        };
        self.poll_faults("flush_uniforms");
        let uploads = flushed?;

        let ticked = !self.time.is_paused();
        if ticked {
            let result = self.simulation.tick(&mut self.ctx, self.active);
            self.poll_faults("tick");
            result?;
            self.state = EngineState::Running;
        }

        self.ctx.begin_frame(self.config.render.clear)?;
        self.poll_faults("begin_frame");
        let drawn = self.render.draw(&mut self.ctx, &self.simulation, self.active);
        self.poll_faults("draw");
        let ended = self.ctx.end_frame();
        self.poll_faults("end_frame");
        drawn?;
        ended?;

        Ok(FrameStats {
            frame: self.time.frame(),
            delta,
            elapsed,
            entities: self.active,
            ticked,
            uniform_uploads: uploads,
            faults: self.faults.len().saturating_sub(faults_before),
        })
    }

    /// Change the active entity count. Returns the effective count, clamped
    /// to capacity.
    pub fn set_active_count(&mut self, count: u32) -> u32 {
        if count > self.config.capacity {
            tracing::warn!(
                requested = count,
                capacity = self.config.capacity,
                "active count clamped to capacity"
            );
        }
        self.active = count.min(self.config.capacity);
        self.active
    }

    // ========== Controls ==========

    /// Set a uniform by path: `sim/<name>`, `render/<name>`, or a bare name
    /// (every pass that declares it). Uploads immediately when bound and
    /// changed.
    ///
    /// Once built, fails with [`EngineError::LocationNotFound`] when none of
    /// the targeted programs uses the uniform. The value is still stored.
    pub fn set_value(&mut self, path: &str, value: impl Into<Value>) -> Result<(), EngineError> {
        let value = value.into();
        let (scope, name) = match path.split_once('/') {
            Some(("sim", name)) => (UniformScope::Simulation, name),
            Some(("render", name)) => (UniformScope::Render, name),
            Some(_) => return Err(EngineError::UnknownVariable(path.to_string())),
            None => (UniformScope::Both, path),
        };

        let in_sim = self.simulation.uniform(name).is_some();
        let in_render = self.render.uniform(name).is_some();
        let (sim, render) = match scope {
            UniformScope::Simulation => (true, false),
            UniformScope::Render => (false, true),
            UniformScope::Both => (in_sim, in_render),
        };
        if !sim && !render {
            return Err(EngineError::UnknownVariable(path.to_string()));
        }
        let mut bound = false;
        let mut missing = None;
        if sim {
            self.simulation.set_uniform(&mut self.ctx, name, value)?;
            match self.simulation.uniform(name) {
                Some(u) if u.is_bound() => bound = true,
                _ => missing = Some("simulation"),
            }
        }
        if render {
            self.render.set_uniform(&mut self.ctx, name, value)?;
            match self.render.uniform(name) {
                Some(u) if u.is_bound() => bound = true,
                _ => missing = missing.or(Some("render")),
            }
        }
        self.poll_faults("set_value");

        // Before a build the value is only stored; it flushes when bound.
        let built = matches!(self.state, EngineState::Built | EngineState::Running);
        match missing {
            Some(program) if built && !bound => Err(LocationNotFound {
                program: program.to_string(),
                name: name.to_string(),
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// Replace an input or feedback attribute's data (whole-buffer upload).
    pub fn set_attribute_data(&mut self, name: &str, data: impl Into<AttributeData>) -> Result<(), EngineError> {
        self.simulation.set_input_data(&mut self.ctx, name, data.into())?;
        self.poll_faults("set_attribute_data");
        Ok(())
    }

    // ========== Read-back ==========

    /// Current state of a feedback attribute for the active entities.
    pub fn read_feedback(&mut self, name: &str) -> Result<AttributeData, EngineError> {
        let data = self.simulation.read_feedback(&mut self.ctx, name, self.active)?;
        self.poll_faults("read_feedback");
        Ok(data)
    }

    pub fn read_output(&mut self, name: &str) -> Result<AttributeData, EngineError> {
        let data = self.simulation.read_output(&mut self.ctx, name, self.active)?;
        self.poll_faults("read_output");
        Ok(data)
    }

    /// Read a uniform back from the device by path, as [`Engine::set_value`]
    /// resolves it. Bare names prefer the simulation pass.
    pub fn uniform_on_device(&mut self, path: &str) -> Result<Value, EngineError> {
        let uniform = match path.split_once('/') {
            Some(("sim", name)) => self.simulation.uniform(name),
            Some(("render", name)) => self.render.uniform(name),
            Some(_) => None,
            None => self.simulation.uniform(path).or_else(|| self.render.uniform(path)),
        }
        .ok_or_else(|| EngineError::UnknownVariable(path.to_string()))?;
        uniform.download(&mut self.ctx)
    }

    // ========== Faults ==========

    fn poll_faults(&mut self, operation: &'static str) {
        while let Some(report) = self.ctx.poll_error() {
            let fault = DeviceFault::new(operation, report);
            tracing::warn!(operation, code = ?fault.code, message = %fault.message, "device fault");
            if self.faults.len() >= self.config.fault_log_limit {
                self.faults.pop_front();
            }
            self.faults.push_back(fault);
        }
    }

    /// Logged device faults, oldest first.
    pub fn faults(&self) -> impl Iterator<Item = &DeviceFault> {
        self.faults.iter()
    }

    pub fn take_faults(&mut self) -> Vec<DeviceFault> {
        self.faults.drain(..).collect()
    }

    /// Turn the oldest logged fault into an error, for callers that treat
    /// device faults as fatal.
    pub fn ensure_healthy(&mut self) -> Result<(), EngineError> {
        self.poll_faults("ensure_healthy");
        match self.faults.pop_front() {
            Some(fault) => Err(EngineError::RuntimeDevice(fault)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HeadlessContext;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn engine() -> Engine<HeadlessContext> {
        let mut engine = Engine::new(HeadlessContext::new(), EngineConfig::new(16).with_workgroup_size(64));
        engine
            .add_feedback_variable("position", VarType::Vec3, vec![0.0f32; 48])
            .unwrap();
        engine.add_uniform("speed", 1.0f32).unwrap();
        engine.set_script("positionOut[index] = position[index] + vec3<f32>(speed * delta_time);");
        engine
    }

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new(100)
            .with_active_count(50)
            .with_primitive(RenderPrimitive::Sprites)
            .with_location_policy(LocationPolicy::Strict);
        assert_eq!(config.active_count, Some(50));
        assert_eq!(config.render.primitive, RenderPrimitive::Sprites);
        assert_eq!(config.location_policy, LocationPolicy::Strict);
    }

    #[test]
    fn test_lifecycle_signals() {
        let signals = Rc::new(RefCell::new(Vec::new()));
        let mut engine = engine();
        let sink = signals.clone();
        engine.on_signal(move |s| sink.borrow_mut().push(s.clone()));

        assert!(engine.build().unwrap().is_clean());
        engine.update(0.016).unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        engine.dispose();

        assert_eq!(
            *signals.borrow(),
            vec![EngineSignal::Ready, EngineSignal::Disposed]
        );
    }

    #[test]
    fn test_update_requires_build() {
        let mut engine = engine();
        assert!(matches!(
            engine.update(0.016),
            Err(EngineError::InvalidState { operation: "update", .. })
        ));
    }

    #[test]
    fn test_set_value_paths() {
        let mut engine = engine();
        engine
            .add_uniform_scoped("tint", glam::Vec3::ONE, UniformScope::Render)
            .unwrap();
        engine.set_render_script(
            "out.clip_position = view_proj * vec4<f32>(position, 1.0);\nout.color = vec4<f32>(tint, 1.0);\nout.uv = vec2<f32>(0.0);",
        );
        engine.build().unwrap();

        engine.set_value("sim/speed", 2.0f32).unwrap();
        engine.set_value("tint", glam::Vec3::X).unwrap();
        assert_eq!(engine.uniform_on_device("speed").unwrap(), Value::F32(2.0));
        assert_eq!(
            engine.uniform_on_device("render/tint").unwrap(),
            Value::Vec3(glam::Vec3::X)
        );
        assert!(matches!(
            engine.set_value("render/speed", 1.0f32),
            Err(EngineError::UnknownVariable(_))
        ));
        assert!(matches!(
            engine.set_value("speed", 1u32),
            Err(EngineError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_paused_clock_skips_tick() {
        let mut engine = engine();
        engine.build().unwrap();
        engine.time_mut().pause();
        let stats = engine.update(0.016).unwrap();
        assert!(!stats.ticked);
        assert_eq!(engine.simulation().ticks(), 0);
    }
}
