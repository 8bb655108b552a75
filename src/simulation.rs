//! The simulation pass.
//!
//! A transition program advances every entity once per tick. Each
//! [`FeedbackAttribute`] is read from its input buffer and captured into its
//! output buffer; after the capture the two swap roles, so tick K's output is
//! tick K+1's input without any copy.
//!
//! # Tick protocol
//!
//! 1. bind the "read" vertex-array configuration
//! 2. begin capture into every output buffer
//! 3. draw one point per active entity
//! 4. end capture
//! 5. swap every feedback buffer pair
//! 6. swap the "read" and "write" configurations
//!
//! All six steps go to the same in-order queue, so no draw ever reads a buffer
//! it also writes.
//!
//! # Script environment
//!
//! The per-tick script runs inside the wrapped entry point with:
//!
//! - `index: u32` - the entity being advanced
//! - `entity_count: u32`, `time: f32`, `delta_time: f32`
//! - every declared variable: `x[index]` reads a feedback or input attribute,
//!   `xOut[index] = ...` writes a captured output
//! - the [`shader_utils`] function library
//!
//! Captured outputs start each tick as a copy of their input, so a script
//! only writes the fields it changes.

use crate::context::{
    BufferHandle, GraphicsContext, Location, Primitive, ProgramDesc, ProgramHandle, StageSource,
    VertexArrayHandle, VertexBinding,
};
use crate::engine::EngineState;
use crate::error::{EngineError, LocationNotFound};
use crate::program::{LocationPolicy, Program};
use crate::shader::{EntryPoint, ShaderSourceBuilder};
use crate::shader_utils;
use crate::variable::{
    validate_name, AttributeData, BufferPair, FeedbackAttribute, InputAttribute, OutputAttribute, Uniform, Value,
    Variable,
};

/// Active entity count uniform, the bound every transition checks.
pub const ENTITY_COUNT: &str = "entity_count";
/// Scaled seconds since start.
pub const TIME: &str = "time";
/// Scaled seconds since the previous frame.
pub const DELTA_TIME: &str = "delta_time";

pub const BUILTINS: [&str; 3] = [ENTITY_COUNT, TIME, DELTA_TIME];

pub const DEFAULT_WORKGROUP_SIZE: u32 = 256;

/// A vertex-array configuration and the bindings it was created with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VertexArrayConfig {
    pub handle: VertexArrayHandle,
    pub bindings: Vec<VertexBinding>,
}

impl VertexArrayConfig {
    pub(crate) fn create<C: GraphicsContext + ?Sized>(
        ctx: &mut C,
        program: ProgramHandle,
        bindings: Vec<VertexBinding>,
    ) -> Result<Self, EngineError> {
        let handle = ctx.create_vertex_array(program, &bindings)?;
        Ok(Self { handle, bindings })
    }

    /// Buffer bound at `location`, if any.
    pub fn buffer_at(&self, location: Location) -> Option<BufferHandle> {
        self.bindings
            .iter()
            .find(|b| b.location == location)
            .map(|b| b.buffer)
    }
}

/// Owns the transition program, the simulated variables and the ping-pong state.
pub struct SimulationPass {
    capacity: u32,
    workgroup_size: u32,
    variables: Vec<Variable>,
    script: String,
    structs: Vec<String>,
    functions: Vec<String>,
    library: bool,
    program: Option<Program>,
    read: Option<VertexArrayConfig>,
    write: Option<VertexArrayConfig>,
    state: EngineState,
    ticks: u64,
}

impl SimulationPass {
    /// A pass over `capacity` entities. Capacity never changes afterwards.
    pub fn new(capacity: u32) -> Self {
        let variables = vec![
            Variable::Uniform(Uniform::new(ENTITY_COUNT, 0u32)),
            Variable::Uniform(Uniform::new(TIME, 0.0f32)),
            Variable::Uniform(Uniform::new(DELTA_TIME, 0.0f32)),
        ];
        Self {
            capacity,
            workgroup_size: DEFAULT_WORKGROUP_SIZE,
            variables,
            script: String::new(),
            structs: Vec::new(),
            functions: Vec::new(),
            library: true,
            program: None,
            read: None,
            write: None,
            state: EngineState::Unbuilt,
            ticks: 0,
        }
    }

    pub fn with_workgroup_size(mut self, size: u32) -> Self {
        self.workgroup_size = size.max(1);
        self
    }

    /// Leave the built-in function library out of the transition stage.
    pub fn without_library(mut self) -> Self {
        self.library = false;
        self
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Completed ticks since the last build.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn program_handle(&self) -> Option<ProgramHandle> {
        self.program.as_ref().map(Program::handle)
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Configuration the next tick reads from.
    pub fn read_config(&self) -> Option<&VertexArrayConfig> {
        self.read.as_ref()
    }

    /// Configuration bound to the buffers the next tick captures into.
    pub fn write_config(&self) -> Option<&VertexArrayConfig> {
        self.write.as_ref()
    }

    fn ensure_declarable(&self) -> Result<(), EngineError> {
        match self.state {
            EngineState::Unbuilt | EngineState::Disposed => Ok(()),
            state => Err(EngineError::InvalidState {
                operation: "declare variables",
                state,
            }),
        }
    }

    /// Add a variable. Names (and synthesized `<name>Out`) must be unique.
    pub fn declare(&mut self, variable: Variable) -> Result<(), EngineError> {
        self.ensure_declarable()?;
        validate_name(variable.name())?;
        for name in variable.declared_names() {
            let taken = self
                .variables
                .iter()
                .flat_map(|v| v.declared_names())
                .any(|existing| existing == name || format!("{existing}_sampler") == name);
            if taken {
                return Err(EngineError::DuplicateName(name.to_string()));
            }
        }
        tracing::debug!(name = variable.name(), kind = ?variable.kind(), "simulation variable declared");
        self.variables.push(variable);
        Ok(())
    }

    pub fn add_feedback(&mut self, attribute: FeedbackAttribute) -> Result<(), EngineError> {
        self.declare(Variable::Feedback(attribute))
    }

    pub fn add_input(&mut self, attribute: InputAttribute) -> Result<(), EngineError> {
        self.declare(Variable::Input(attribute))
    }

    pub fn add_output(&mut self, attribute: OutputAttribute) -> Result<(), EngineError> {
        self.declare(Variable::Output(attribute))
    }

    pub fn add_uniform(&mut self, uniform: Uniform) -> Result<(), EngineError> {
        self.declare(Variable::Uniform(uniform))
    }

    /// Install the per-tick transition body.
    pub fn set_script(&mut self, body: impl Into<String>) {
        self.script = body.into();
    }

    pub fn add_function(&mut self, source: impl Into<String>) {
        self.functions.push(source.into());
    }

    pub fn add_struct(&mut self, source: impl Into<String>) {
        self.structs.push(source.into());
    }

    pub fn feedback(&self) -> impl Iterator<Item = &FeedbackAttribute> {
        self.variables.iter().filter_map(Variable::as_feedback)
    }

    fn feedback_count(&self) -> usize {
        self.feedback().count()
    }

    pub fn uniform(&self, name: &str) -> Option<&Uniform> {
        self.variables.iter().find_map(|v| match v {
            Variable::Uniform(u) if u.name() == name => Some(u),
            _ => None,
        })
    }

    fn uniform_mut(&mut self, name: &str) -> Option<&mut Uniform> {
        self.variables
            .iter_mut()
            .filter_map(Variable::as_uniform_mut)
            .find(|u| u.name() == name)
    }

    /// Feedback and input slots first so each pair shares one binding index.
    fn assign_slots(&mut self) {
        let feedback = self.feedback_count() as u32;
        let (mut uniform, mut pair, mut input, mut output) = (0, 0, feedback, feedback);
        for variable in &mut self.variables {
            match variable {
                Variable::Uniform(u) => {
                    u.set_slot(uniform);
                    uniform += u.var_type().binding_slots();
                }
                Variable::Feedback(f) => {
                    f.set_slot(pair);
                    pair += 1;
                }
                Variable::Input(i) => {
                    i.set_slot(input);
                    input += 1;
                }
                Variable::Output(o) => {
                    o.set_slot(output);
                    output += 1;
                }
            }
        }
    }

    /// Captured output names in binding order.
    fn captured_names(&self) -> Vec<String> {
        let feedback = self.feedback().map(|f| f.output_name().to_string());
        let outputs = self.variables.iter().filter_map(|v| match v {
            Variable::Output(o) => Some(o.name().to_string()),
            _ => None,
        });
        feedback.chain(outputs).collect()
    }

    fn wrapped_script(&self) -> String {
        let mut body = format!("if index >= {ENTITY_COUNT} {{\n    return;\n}}\n");
        for f in self.feedback() {
            body.push_str(&format!("{}[index] = {}[index];\n", f.output_name(), f.name()));
        }
        body.push_str(&self.script);
        body
    }

    /// Assemble the transition stage source. Needs no device.
    pub fn source(&mut self) -> Result<String, EngineError> {
        self.assign_slots();
        let mut builder = ShaderSourceBuilder::new(EntryPoint::Transition {
            workgroup_size: self.workgroup_size,
        });
        for s in &self.structs {
            builder.structure(s.as_str());
        }
        if self.library {
            for f in shader_utils::library() {
                builder.function(f);
            }
        }
        for f in &self.functions {
            builder.function(f.as_str());
        }
        for variable in &self.variables {
            for declaration in variable.declarations() {
                builder.declare(declaration)?;
            }
        }
        builder.main(self.wrapped_script());
        Ok(builder.build())
    }

    /// The fragment stage a transition program carries; never rasterized.
    pub fn fragment_source() -> String {
        let mut builder = ShaderSourceBuilder::new(EntryPoint::Fragment {
            input: None,
            output: false,
        });
        builder.main("discard;");
        builder.build()
    }

    /// Compile, link, allocate and bind. Either everything succeeds or the
    /// pass is left exactly as it was.
    ///
    /// Returns the variables the program does not expose (acknowledged under
    /// [`LocationPolicy::Acknowledge`]).
    pub fn build<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        policy: LocationPolicy,
    ) -> Result<Vec<LocationNotFound>, EngineError> {
        if !matches!(self.state, EngineState::Unbuilt | EngineState::Disposed) {
            return Err(EngineError::InvalidState {
                operation: "build the simulation",
                state: self.state,
            });
        }
        if self.feedback_count() == 0 {
            return Err(EngineError::NoFeedbackVariables);
        }

        let desc = ProgramDesc {
            label: "simulation".to_string(),
            stages: vec![
                StageSource {
                    stage: crate::shader::ShaderStage::Transition,
                    source: self.source()?,
                },
                StageSource {
                    stage: crate::shader::ShaderStage::Fragment,
                    source: Self::fragment_source(),
                },
            ],
            captured: self.captured_names(),
            primitive: Primitive::Points,
        };
        let mut program = Program::build(ctx, &desc)?;

        match self.allocate_and_bind(ctx, &mut program, policy) {
            Ok(unresolved) => {
                self.program = Some(program);
                self.state = EngineState::Built;
                self.ticks = 0;
                tracing::info!(
                    capacity = self.capacity,
                    feedback = self.feedback_count(),
                    unresolved = unresolved.len(),
                    "simulation pass built"
                );
                Ok(unresolved)
            }
            Err(e) => {
                self.release(ctx);
                program.dispose(ctx);
                Err(e)
            }
        }
    }

    fn allocate_and_bind<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        program: &mut Program,
        policy: LocationPolicy,
    ) -> Result<Vec<LocationNotFound>, EngineError> {
        for variable in &mut self.variables {
            variable.allocate(ctx)?;
        }

        let mut unresolved = Vec::new();
        for variable in &mut self.variables {
            match variable.bind(ctx, program) {
                Ok(()) => {}
                Err(EngineError::LocationNotFound(miss)) => {
                    if BUILTINS.contains(&variable.name()) {
                        tracing::debug!(name = %miss.name, "built-in unused by the script");
                        continue;
                    }
                    if policy == LocationPolicy::Strict {
                        return Err(miss.into());
                    }
                    match variable {
                        Variable::Feedback(_) => tracing::warn!(
                            name = %miss.name,
                            program = %miss.program,
                            "feedback attribute has no location; it will not advance"
                        ),
                        _ => tracing::warn!(
                            name = %miss.name,
                            program = %miss.program,
                            "variable has no location; its uploads are no-ops"
                        ),
                    }
                    unresolved.push(miss);
                }
                Err(e) => return Err(e),
            }
        }

        let handle = program.handle();
        let read = VertexArrayConfig::create(ctx, handle, self.input_bindings(|pair| pair.input))?;
        let write = match VertexArrayConfig::create(ctx, handle, self.input_bindings(|pair| pair.output)) {
            Ok(write) => write,
            Err(e) => {
                ctx.destroy_vertex_array(read.handle);
                return Err(e);
            }
        };
        self.read = Some(read);
        self.write = Some(write);
        Ok(unresolved)
    }

    /// Input-side bindings, taking each feedback buffer from `pick`.
    fn input_bindings(&self, pick: impl Fn(&BufferPair) -> BufferHandle) -> Vec<VertexBinding> {
        let mut bindings = Vec::new();
        for variable in &self.variables {
            match variable {
                Variable::Feedback(f) => {
                    if let (Some(location), Some(pair)) = (f.input_location(), f.buffers()) {
                        bindings.push(VertexBinding {
                            location,
                            buffer: pick(&pair),
                        });
                    }
                }
                Variable::Input(i) => {
                    if let (Some(location), Some(buffer)) = (i.location(), i.buffer()) {
                        bindings.push(VertexBinding { location, buffer });
                    }
                }
                _ => {}
            }
        }
        bindings
    }

    /// Captured output targets for the next tick, in binding order.
    fn capture_targets(&self) -> Vec<VertexBinding> {
        let feedback = self.feedback().filter_map(|f| {
            Some(VertexBinding {
                location: f.output_location()?,
                buffer: f.buffers()?.output,
            })
        });
        let outputs = self.variables.iter().filter_map(|v| match v {
            Variable::Output(o) => Some(VertexBinding {
                location: o.location()?,
                buffer: o.buffer()?,
            }),
            _ => None,
        });
        feedback.chain(outputs).collect()
    }

    /// Set the clock uniforms; they upload with the next flush.
    pub fn set_clock(&mut self, time: f32, delta: f32) -> Result<(), EngineError> {
        if let Some(u) = self.uniform_mut(TIME) {
            u.set(time)?;
        }
        if let Some(u) = self.uniform_mut(DELTA_TIME) {
            u.set(delta)?;
        }
        Ok(())
    }

    /// Store a uniform value and upload it if bound and changed.
    ///
    /// Returns whether a device upload happened.
    pub fn set_uniform<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        name: &str,
        value: Value,
    ) -> Result<bool, EngineError> {
        let uniform = self
            .uniform_mut(name)
            .ok_or_else(|| EngineError::UnknownVariable(name.to_string()))?;
        uniform.set(value)?;
        uniform.upload(ctx)
    }

    /// Upload every changed uniform. Returns the number of uploads.
    pub fn flush_uniforms<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) -> Result<usize, EngineError> {
        let mut uploads = 0;
        for uniform in self.variables.iter_mut().filter_map(Variable::as_uniform_mut) {
            if uniform.upload(ctx)? {
                uploads += 1;
            }
        }
        Ok(uploads)
    }

    /// Replace an input attribute's data (whole-buffer re-upload).
    pub fn set_input_data<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        name: &str,
        data: AttributeData,
    ) -> Result<(), EngineError> {
        for variable in &mut self.variables {
            match variable {
                Variable::Input(i) if i.name() == name => return i.set_data(ctx, data),
                Variable::Feedback(f) if f.name() == name => return f.upload(ctx, data),
                _ => {}
            }
        }
        Err(EngineError::UnknownVariable(name.to_string()))
    }

    /// Advance `count` entities by one tick.
    pub fn tick<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C, count: u32) -> Result<(), EngineError> {
        if !matches!(self.state, EngineState::Built | EngineState::Running) {
            return Err(EngineError::InvalidState {
                operation: "tick",
                state: self.state,
            });
        }
        if count > self.capacity {
            return Err(EngineError::CapacityExceeded {
                requested: count,
                capacity: self.capacity,
            });
        }
        let read = match &self.read {
            Some(read) => read.handle,
            None => {
                return Err(EngineError::InvalidState {
                    operation: "tick",
                    state: self.state,
                })
            }
        };

        self.set_uniform(ctx, ENTITY_COUNT, Value::U32(count))?;

        ctx.bind_vertex_array(read)?;
        ctx.begin_capture(&self.capture_targets())?;
        let drawn = ctx.draw(1, count);
        ctx.end_capture()?;
        drawn?;

        for variable in &mut self.variables {
            if let Variable::Feedback(f) = variable {
                f.swap();
            }
        }
        std::mem::swap(&mut self.read, &mut self.write);

        self.ticks += 1;
        self.state = EngineState::Running;
        Ok(())
    }

    /// Current input buffers of every feedback attribute, by name.
    pub fn current_buffers(&self) -> Vec<(&FeedbackAttribute, BufferHandle)> {
        self.feedback()
            .filter_map(|f| f.buffers().map(|pair| (f, pair.input)))
            .collect()
    }

    pub fn read_feedback<C: GraphicsContext + ?Sized>(
        &self,
        ctx: &mut C,
        name: &str,
        count: u32,
    ) -> Result<AttributeData, EngineError> {
        self.check_count(count)?;
        self.feedback()
            .find(|f| f.name() == name)
            .ok_or_else(|| EngineError::UnknownVariable(name.to_string()))?
            .download(ctx, count)
    }

    pub fn read_output<C: GraphicsContext + ?Sized>(
        &self,
        ctx: &mut C,
        name: &str,
        count: u32,
    ) -> Result<AttributeData, EngineError> {
        self.check_count(count)?;
        self.variables
            .iter()
            .find_map(|v| match v {
                Variable::Output(o) if o.name() == name => Some(o),
                _ => None,
            })
            .ok_or_else(|| EngineError::UnknownVariable(name.to_string()))?
            .read(ctx, count)
    }

    fn check_count(&self, count: u32) -> Result<(), EngineError> {
        if count > self.capacity {
            return Err(EngineError::CapacityExceeded {
                requested: count,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn release<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) {
        for config in [self.read.take(), self.write.take()].into_iter().flatten() {
            ctx.destroy_vertex_array(config.handle);
        }
        for variable in &mut self.variables {
            variable.release(ctx);
        }
    }

    /// Release every device resource and return to `Unbuilt`, for a build
    /// that is abandoned before it was ever used.
    pub fn reset<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) {
        self.dispose(ctx);
        self.state = EngineState::Unbuilt;
        self.ticks = 0;
    }

    /// Release every device resource. The pass can be built again.
    pub fn dispose<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) {
        self.release(ctx);
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
    use crate::variable::VarType;

    fn pass() -> SimulationPass {
        let mut pass = SimulationPass::new(4).with_workgroup_size(64);
        pass.add_feedback(FeedbackAttribute::new("position", VarType::Vec3, vec![0.0f32; 12], 4).unwrap())
            .unwrap();
        pass.add_feedback(FeedbackAttribute::new("mode", VarType::U32, vec![0u32; 4], 4).unwrap())
            .unwrap();
        pass.add_uniform(Uniform::new("speed", 1.0f32)).unwrap();
        pass.set_script("positionOut[index] = position[index] + vec3<f32>(speed * delta_time);");
        pass
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
    fn test_generated_source_validates() {
        let mut pass = pass();
        let source = pass.source().unwrap();
        assert!(source.contains("positionOut[index] = position[index];"));
        assert!(source.contains("if index >= entity_count"));
        assert!(source.contains("@group(2) @binding(1) var<storage, read_write> modeOut: array<u32>;"));
        validate(&source);
        validate(&SimulationPass::fragment_source());
    }

    #[test]
    fn test_duplicate_and_reserved_names() {
        let mut pass = pass();
        assert!(matches!(
            pass.add_uniform(Uniform::new("positionOut", 0.0f32)),
            Err(EngineError::DuplicateName(_))
        ));
        assert!(matches!(
            pass.add_uniform(Uniform::new("time", 0.0f32)),
            Err(EngineError::DuplicateName(_))
        ));
        assert!(matches!(
            pass.add_uniform(Uniform::new("index", 0u32)),
            Err(EngineError::InvalidName(_))
        ));
    }

    #[test]
    fn test_build_requires_feedback() {
        let mut ctx = HeadlessContext::new();
        let mut pass = SimulationPass::new(4);
        assert!(matches!(
            pass.build(&mut ctx, LocationPolicy::Acknowledge),
            Err(EngineError::NoFeedbackVariables)
        ));
    }

    #[test]
    fn test_tick_swaps_roles_not_contents() {
        let mut ctx = HeadlessContext::new();
        let mut pass = pass();
        assert!(pass.build(&mut ctx, LocationPolicy::Acknowledge).unwrap().is_empty());

        let before = pass.feedback().next().and_then(|f| f.buffers()).unwrap();
        let write_before = pass.write_config().unwrap().clone();
        pass.tick(&mut ctx, 4).unwrap();
        let after = pass.feedback().next().and_then(|f| f.buffers()).unwrap();

        assert_eq!(after.input, before.output);
        assert_eq!(after.output, before.input);
        assert_eq!(pass.read_config().unwrap(), &write_before);
        assert_eq!(pass.state(), EngineState::Running);
    }

    #[test]
    fn test_tick_rejects_over_capacity() {
        let mut ctx = HeadlessContext::new();
        let mut pass = pass();
        pass.build(&mut ctx, LocationPolicy::Acknowledge).unwrap();
        assert!(matches!(
            pass.tick(&mut ctx, 5),
            Err(EngineError::CapacityExceeded { requested: 5, capacity: 4 })
        ));
        assert_eq!(pass.ticks(), 0);
    }

    #[test]
    fn test_dispose_releases_everything() {
        let mut ctx = HeadlessContext::new();
        let mut pass = pass();
        pass.build(&mut ctx, LocationPolicy::Acknowledge).unwrap();
        pass.dispose(&mut ctx);
        assert_eq!(ctx.live_resources(), (0, 0, 0));
        assert_eq!(pass.state(), EngineState::Disposed);
        assert!(pass.program_handle().is_none());

        pass.build(&mut ctx, LocationPolicy::Acknowledge).unwrap();
        assert_eq!(pass.state(), EngineState::Built);
    }

    #[test]
    fn test_reset_returns_to_unbuilt() {
        let mut ctx = HeadlessContext::new();
        let mut pass = pass();
        pass.build(&mut ctx, LocationPolicy::Acknowledge).unwrap();
        pass.reset(&mut ctx);
        assert_eq!(ctx.live_resources(), (0, 0, 0));
        assert_eq!(pass.state(), EngineState::Unbuilt);
        assert_eq!(pass.ticks(), 0);
    }

    #[test]
    fn test_set_clock_stores_builtins() {
        let mut pass = pass();
        pass.set_clock(2.5, 0.25).unwrap();
        assert_eq!(pass.uniform(TIME).unwrap().value(), Value::F32(2.5));
        assert_eq!(pass.uniform(DELTA_TIME).unwrap().value(), Value::F32(0.25));
    }
}
