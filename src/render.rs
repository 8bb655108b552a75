//! The render pass.
//!
//! Draws the simulation's current state: every [`FeedbackAttribute`] becomes a
//! per-instance vertex input of the render program, fed from whichever buffer
//! of its pair is the input after the latest tick. Nothing is copied between
//! passes; only the vertex-array configuration changes.
//!
//! The default program projects a `position` attribute (`vec2` or `vec3`)
//! through `view_proj` and colours it from a `color` attribute when one
//! exists. Custom bodies replace either stage; they see the same variables:
//!
//! - vertex: every feedback attribute by name, `index` (entity),
//!   `vertex_index`, `view_proj`, `point_size`, `time`, user uniforms, and the
//!   `out: VertexOutput` to fill
//! - fragment: `in: VertexOutput`, uniforms; returns the pixel colour
//!
//! [`FeedbackAttribute`]: crate::variable::FeedbackAttribute

use std::collections::HashMap;

use glam::Mat4;

use crate::context::{
    GraphicsContext, Location, Primitive, ProgramDesc, ProgramHandle, StageSource, VertexArrayHandle,
    VertexBinding,
};
use crate::engine::EngineState;
use crate::error::{EngineError, LocationNotFound};
use crate::program::{LocationPolicy, Program};
use crate::shader::{Declaration, EntryPoint, ShaderSourceBuilder, ShaderStage};
use crate::simulation::SimulationPass;
use crate::variable::{validate_name, Qualifier, Uniform, Value, VarType};

pub const VIEW_PROJ: &str = "view_proj";
pub const POINT_SIZE: &str = "point_size";
pub const TIME: &str = "time";

const BUILTINS: [&str; 3] = [VIEW_PROJ, POINT_SIZE, TIME];

const VERTEX_OUTPUT: &str = r#"struct VertexOutput {
    @builtin(position) clip_position: vec4<f32>,
    @location(0) color: vec4<f32>,
    @location(1) uv: vec2<f32>,
}"#;

/// How each entity is drawn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RenderPrimitive {
    /// One point per entity.
    #[default]
    Points,
    /// A camera-facing quad per entity, sized by `point_size`.
    Sprites,
}

impl RenderPrimitive {
    pub fn vertices_per_entity(&self) -> u32 {
        match self {
            RenderPrimitive::Points => 1,
            RenderPrimitive::Sprites => 6,
        }
    }

    fn device(&self) -> Primitive {
        match self {
            RenderPrimitive::Points => Primitive::Points,
            RenderPrimitive::Sprites => Primitive::Triangles,
        }
    }
}

/// Render pass configuration.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RenderConfig {
    pub primitive: RenderPrimitive,
    /// Sprite half-size in clip units at distance one.
    pub point_size: f32,
    pub clear: [f64; 4],
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            primitive: RenderPrimitive::Points,
            point_size: 0.015,
            clear: [0.02, 0.02, 0.05, 1.0],
        }
    }
}

impl RenderConfig {
    pub fn with_primitive(mut self, primitive: RenderPrimitive) -> Self {
        self.primitive = primitive;
        self
    }

    pub fn with_point_size(mut self, size: f32) -> Self {
        self.point_size = size;
        self
    }

    pub fn with_clear(mut self, clear: [f64; 4]) -> Self {
        self.clear = clear;
        self
    }
}

/// Owns the render program, its uniforms and its cached vertex arrays.
pub struct RenderPass {
    config: RenderConfig,
    uniforms: Vec<Uniform>,
    functions: Vec<String>,
    vertex_body: Option<String>,
    fragment_body: Option<String>,
    program: Option<Program>,
    /// Resolved vertex inputs, by feedback attribute name.
    inputs: Vec<(String, Location)>,
    vertex_arrays: HashMap<Vec<VertexBinding>, VertexArrayHandle>,
    capacity: u32,
    state: EngineState,
}

impl RenderPass {
    pub fn new(config: RenderConfig) -> Self {
        let uniforms = vec![
            Uniform::new(VIEW_PROJ, Mat4::IDENTITY),
            Uniform::new(POINT_SIZE, config.point_size),
            Uniform::new(TIME, 0.0f32),
        ];
        Self {
            config,
            uniforms,
            functions: Vec::new(),
            vertex_body: None,
            fragment_body: None,
            program: None,
            inputs: Vec::new(),
            vertex_arrays: HashMap::new(),
            capacity: 0,
            state: EngineState::Unbuilt,
        }
    }

    pub fn config(&self) -> &RenderConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn program_handle(&self) -> Option<ProgramHandle> {
        self.program.as_ref().map(Program::handle)
    }

    /// Cached vertex-array configurations, one per distinct buffer set.
    pub fn vertex_array_count(&self) -> usize {
        self.vertex_arrays.len()
    }

    pub fn add_uniform(&mut self, uniform: Uniform) -> Result<(), EngineError> {
        if !matches!(self.state, EngineState::Unbuilt | EngineState::Disposed) {
            return Err(EngineError::InvalidState {
                operation: "declare render uniforms",
                state: self.state,
            });
        }
        validate_name(uniform.name())?;
        if self.uniforms.iter().any(|u| u.name() == uniform.name()) {
            return Err(EngineError::DuplicateName(uniform.name().to_string()));
        }
        self.uniforms.push(uniform);
        Ok(())
    }

    pub fn uniform(&self, name: &str) -> Option<&Uniform> {
        self.uniforms.iter().find(|u| u.name() == name)
    }

    pub fn add_function(&mut self, source: impl Into<String>) {
        self.functions.push(source.into());
    }

    /// Replace the default vertex body.
    pub fn set_vertex_body(&mut self, body: impl Into<String>) {
        self.vertex_body = Some(body.into());
    }

    /// Replace the default fragment body. It must return a `vec4<f32>`.
    pub fn set_fragment_body(&mut self, body: impl Into<String>) {
        self.fragment_body = Some(body.into());
    }

    fn assign_slots(&mut self) {
        let mut slot = 0;
        for uniform in &mut self.uniforms {
            uniform.set_slot(slot);
            slot += uniform.var_type().binding_slots();
        }
    }

    fn default_vertex_body(&self, attributes: &[(String, VarType)]) -> Result<String, EngineError> {
        let find = |name: &str| attributes.iter().find(|(n, _)| n == name).map(|(_, ty)| *ty);
        let position = match find("position") {
            Some(VarType::Vec3) => "position",
            Some(VarType::Vec2) => "vec3<f32>(position, 0.0)",
            _ => {
                return Err(EngineError::InvalidDeclaration {
                    name: "position".to_string(),
                    reason: "the default render program needs a vec2 or vec3 `position` attribute",
                })
            }
        };
        let color = match find("color") {
            Some(VarType::Vec4) => "color",
            Some(VarType::Vec3) => "vec4<f32>(color, 1.0)",
            _ => "vec4<f32>(clamp(world * 0.5 + 0.5, vec3<f32>(0.0), vec3<f32>(1.0)), 1.0)",
        };
        Ok(match self.config.primitive {
            RenderPrimitive::Points => format!(
                r#"let world = {position};
out.clip_position = view_proj * vec4<f32>(world, 1.0);
out.color = {color};
out.uv = vec2<f32>(0.0);"#
            ),
            RenderPrimitive::Sprites => format!(
                r#"var corners = array<vec2<f32>, 6>(
    vec2<f32>(-1.0, -1.0), vec2<f32>(1.0, -1.0), vec2<f32>(1.0, 1.0),
    vec2<f32>(-1.0, -1.0), vec2<f32>(1.0, 1.0), vec2<f32>(-1.0, 1.0),
);
let quad = corners[vertex_index % 6u];
let world = {position};
var clip = view_proj * vec4<f32>(world, 1.0);
clip.x += quad.x * point_size * clip.w;
clip.y += quad.y * point_size * clip.w;
out.clip_position = clip;
out.color = {color};
out.uv = quad;"#
            ),
        })
    }

    fn default_fragment_body(&self) -> &'static str {
        match self.config.primitive {
            RenderPrimitive::Points => "return in.color;",
            RenderPrimitive::Sprites => {
                r#"let d = length(in.uv);
if d > 1.0 {
    discard;
}
return vec4<f32>(in.color.rgb, in.color.a * (1.0 - smoothstep(0.8, 1.0, d)));"#
            }
        }
    }

    /// Assemble the vertex stage for the given attributes. Needs no device.
    pub fn vertex_source(&mut self, attributes: &[(String, VarType)]) -> Result<String, EngineError> {
        self.assign_slots();
        let mut builder = ShaderSourceBuilder::new(EntryPoint::Vertex {
            output: "VertexOutput".to_string(),
        });
        builder.structure(VERTEX_OUTPUT);
        for f in &self.functions {
            builder.function(f.as_str());
        }
        for uniform in &self.uniforms {
            builder.declare(uniform.declaration())?;
        }
        for (location, (name, ty)) in attributes.iter().enumerate() {
            builder.declare(Declaration::new(Qualifier::In, name, *ty, location as u32))?;
        }
        let body = match &self.vertex_body {
            Some(body) => body.clone(),
            None => self.default_vertex_body(attributes)?,
        };
        builder.main(body);
        Ok(builder.build())
    }

    pub fn fragment_source(&mut self) -> Result<String, EngineError> {
        self.assign_slots();
        let mut builder = ShaderSourceBuilder::new(EntryPoint::Fragment {
            input: Some("VertexOutput".to_string()),
            output: true,
        });
        builder.structure(VERTEX_OUTPUT);
        for f in &self.functions {
            builder.function(f.as_str());
        }
        for uniform in &self.uniforms {
            builder.declare(uniform.declaration())?;
        }
        let body = self
            .fragment_body
            .clone()
            .unwrap_or_else(|| self.default_fragment_body().to_string());
        builder.main(body);
        Ok(builder.build())
    }

    /// Compile and link against the attributes `simulation` declares.
    pub fn build<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        simulation: &SimulationPass,
        policy: LocationPolicy,
    ) -> Result<Vec<LocationNotFound>, EngineError> {
        if !matches!(self.state, EngineState::Unbuilt | EngineState::Disposed) {
            return Err(EngineError::InvalidState {
                operation: "build the render pass",
                state: self.state,
            });
        }
        let attributes: Vec<(String, VarType)> = simulation
            .feedback()
            .map(|f| (f.name().to_string(), f.var_type()))
            .collect();
        for (name, _) in &attributes {
            if self.uniforms.iter().any(|u| u.name() == name) {
                return Err(EngineError::DuplicateName(name.clone()));
            }
        }

        let desc = ProgramDesc {
            label: "render".to_string(),
            stages: vec![
                StageSource {
                    stage: ShaderStage::Vertex,
                    source: self.vertex_source(&attributes)?,
                },
                StageSource {
                    stage: ShaderStage::Fragment,
                    source: self.fragment_source()?,
                },
            ],
            captured: Vec::new(),
            primitive: self.config.primitive.device(),
        };
        let mut program = Program::build(ctx, &desc)?;

        match self.bind(ctx, &mut program, &attributes, policy) {
            Ok(unresolved) => {
                self.program = Some(program);
                self.capacity = simulation.capacity();
                self.state = EngineState::Built;
                tracing::info!(
                    primitive = ?self.config.primitive,
                    inputs = self.inputs.len(),
                    "render pass built"
                );
                Ok(unresolved)
            }
            Err(e) => {
                self.release();
                program.dispose(ctx);
                Err(e)
            }
        }
    }

    fn bind<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        program: &mut Program,
        attributes: &[(String, VarType)],
        policy: LocationPolicy,
    ) -> Result<Vec<LocationNotFound>, EngineError> {
        let mut unresolved = Vec::new();
        for uniform in &mut self.uniforms {
            match uniform.bind(ctx, program) {
                Ok(_) => {}
                Err(EngineError::LocationNotFound(miss)) => {
                    if BUILTINS.contains(&uniform.name()) {
                        continue;
                    }
                    if policy == LocationPolicy::Strict {
                        return Err(miss.into());
                    }
                    tracing::warn!(name = %miss.name, program = %miss.program, "render uniform has no location");
                    unresolved.push(miss);
                }
                Err(e) => return Err(e),
            }
        }
        self.inputs.clear();
        for (name, _) in attributes {
            match program.locate(ctx, name) {
                Ok(location) => self.inputs.push((name.clone(), location)),
                Err(miss) if policy == LocationPolicy::Strict => return Err(miss.into()),
                Err(miss) => {
                    tracing::warn!(name = %miss.name, "vertex input has no location");
                    unresolved.push(miss);
                }
            }
        }
        Ok(unresolved)
    }

    fn release(&mut self) {
        self.inputs.clear();
        for uniform in &mut self.uniforms {
            uniform.unbind();
        }
    }

    /// Set the per-frame built-ins; they upload with the next flush.
    pub fn set_frame(&mut self, view_proj: Mat4, time: f32) -> Result<(), EngineError> {
        for uniform in &mut self.uniforms {
            let value = match uniform.name() {
                VIEW_PROJ => Value::Mat4(view_proj),
                TIME => Value::F32(time),
                _ => continue,
            };
            uniform.set(value)?;
        }
        Ok(())
    }

    pub fn set_uniform<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        name: &str,
        value: Value,
    ) -> Result<bool, EngineError> {
        let uniform = self
            .uniforms
            .iter_mut()
            .find(|u| u.name() == name)
            .ok_or_else(|| EngineError::UnknownVariable(name.to_string()))?;
        uniform.set(value)?;
        uniform.upload(ctx)
    }

    pub fn flush_uniforms<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) -> Result<usize, EngineError> {
        let mut uploads = 0;
        for uniform in &mut self.uniforms {
            if uniform.upload(ctx)? {
                uploads += 1;
            }
        }
        Ok(uploads)
    }

    /// The vertex array over `simulation`'s current input buffers, created on
    /// first use and cached afterwards.
    pub fn current_vertex_array<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        simulation: &SimulationPass,
    ) -> Result<VertexArrayHandle, EngineError> {
        let program = self.program_handle().ok_or(EngineError::InvalidState {
            operation: "draw",
            state: self.state,
        })?;
        let current = simulation.current_buffers();
        let bindings: Vec<VertexBinding> = self
            .inputs
            .iter()
            .filter_map(|(name, location)| {
                current
                    .iter()
                    .find(|(f, _)| f.name() == name)
                    .map(|(_, buffer)| VertexBinding {
                        location: *location,
                        buffer: *buffer,
                    })
            })
            .collect();
        if let Some(vao) = self.vertex_arrays.get(&bindings) {
            return Ok(*vao);
        }
        let vao = ctx.create_vertex_array(program, &bindings)?;
        tracing::debug!(id = vao.0, "render vertex array created");
        self.vertex_arrays.insert(bindings, vao);
        Ok(vao)
    }

    /// Draw `count` entities from the simulation's current state. Must run
    /// inside a frame.
    pub fn draw<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        simulation: &SimulationPass,
        count: u32,
    ) -> Result<(), EngineError> {
        if self.state != EngineState::Built {
            return Err(EngineError::InvalidState {
                operation: "draw",
                state: self.state,
            });
        }
        if count > self.capacity {
            return Err(EngineError::CapacityExceeded {
                requested: count,
                capacity: self.capacity,
            });
        }
        let vao = self.current_vertex_array(ctx, simulation)?;
        ctx.bind_vertex_array(vao)?;
        ctx.draw(self.config.primitive.vertices_per_entity(), count)?;
        Ok(())
    }

    pub fn dispose<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) {
        for (_, vao) in self.vertex_arrays.drain() {
            ctx.destroy_vertex_array(vao);
        }
        self.release();
        if let Some(program) = self.program.take() {
            program.dispose(ctx);
        }
        if self.state != EngineState::Unbuilt {
            self.state = EngineState::Disposed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::HeadlessContext;
    use crate::variable::FeedbackAttribute;

    fn simulation(ctx: &mut HeadlessContext) -> SimulationPass {
        let mut sim = SimulationPass::new(8);
        sim.add_feedback(FeedbackAttribute::new("position", VarType::Vec3, vec![0.0f32; 24], 8).unwrap())
            .unwrap();
        sim.add_feedback(FeedbackAttribute::new("color", VarType::Vec4, vec![1.0f32; 32], 8).unwrap())
            .unwrap();
        sim.build(ctx, LocationPolicy::Acknowledge).unwrap();
        sim
    }

    fn validate(source: &str) {
        let module = naga::front::wgsl::parse_str(source).unwrap_or_else(|e| panic!("{}", e.emit_to_string(source)));
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .unwrap_or_else(|e| panic!("{}", e.emit_to_string(source)));
    }

    #[test]
    fn test_default_sources_validate() {
        let attributes = vec![("position".to_string(), VarType::Vec2)];
        for primitive in [RenderPrimitive::Points, RenderPrimitive::Sprites] {
            let mut pass = RenderPass::new(RenderConfig::default().with_primitive(primitive));
            validate(&pass.vertex_source(&attributes).unwrap());
            validate(&pass.fragment_source().unwrap());
        }
    }

    #[test]
    fn test_default_body_needs_position() {
        let mut pass = RenderPass::new(RenderConfig::default());
        let attributes = vec![("mass".to_string(), VarType::F32)];
        assert!(matches!(
            pass.vertex_source(&attributes),
            Err(EngineError::InvalidDeclaration { .. })
        ));
    }

    #[test]
    fn test_vertex_arrays_follow_the_ping_pong() {
        let mut ctx = HeadlessContext::new();
        let mut sim = simulation(&mut ctx);
        let mut pass = RenderPass::new(RenderConfig::default());
        assert!(pass.build(&mut ctx, &sim, LocationPolicy::Acknowledge).unwrap().is_empty());

        let mut seen = Vec::new();
        for _ in 0..4 {
            sim.tick(&mut ctx, 8).unwrap();
            ctx.begin_frame([0.0; 4]).unwrap();
            pass.draw(&mut ctx, &sim, 8).unwrap();
            ctx.end_frame().unwrap();
            seen.push(pass.current_vertex_array(&mut ctx, &sim).unwrap());
        }
        assert_eq!(pass.vertex_array_count(), 2);
        assert_eq!(seen[0], seen[2]);
        assert_ne!(seen[0], seen[1]);

        let position = sim.feedback().next().and_then(|f| f.buffers()).unwrap();
        let bound = ctx.vertex_array_bindings(seen[3]).unwrap();
        assert!(bound.iter().any(|b| b.buffer == position.input));
    }

    #[test]
    fn test_draw_rejects_over_capacity() {
        let mut ctx = HeadlessContext::new();
        let sim = simulation(&mut ctx);
        let mut pass = RenderPass::new(RenderConfig::default());
        pass.build(&mut ctx, &sim, LocationPolicy::Acknowledge).unwrap();
        ctx.begin_frame([0.0; 4]).unwrap();
        assert!(matches!(
            pass.draw(&mut ctx, &sim, 9),
            Err(EngineError::CapacityExceeded { requested: 9, capacity: 8 })
        ));
    }

    #[test]
    fn test_unused_user_uniform_is_reported() {
        let mut ctx = HeadlessContext::new();
        let sim = simulation(&mut ctx);
        let mut pass = RenderPass::new(RenderConfig::default());
        pass.add_uniform(Uniform::new("tint", 1.0f32)).unwrap();
        let unresolved = pass.build(&mut ctx, &sim, LocationPolicy::Acknowledge).unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].name, "tint");
    }
}
