//! A deterministic in-process device.
//!
//! Compiles and links with the same naga front-end as the real device, keeps
//! buffers in host memory and records every command. Capture draws run an
//! optional host kernel standing in for the transition stage; without one,
//! each captured output `xOut` receives a copy of its input `x`.

use std::collections::{HashMap, VecDeque};

use super::reflect::{self, ElementFormat, LinkedProgram, ProgramKind, ResourceClass};
use super::{
    BufferHandle, BufferUsage, ErrorReport, FaultCode, GraphicsContext, Location, ProgramDesc, ProgramHandle,
    TextureHandle, VertexArrayHandle, VertexBinding,
};
use crate::error::{EngineError, GpuError, LocationNotFound};
use crate::shader::{CAPTURE_GROUP, INPUT_GROUP};
use crate::textures::TextureConfig;

/// One recorded device command.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    CreateBuffer { buffer: BufferHandle, size: u64, usage: BufferUsage },
    WriteBuffer { buffer: BufferHandle, offset: u64, len: usize },
    ReadBuffer { buffer: BufferHandle },
    DestroyBuffer { buffer: BufferHandle },
    CreateProgram { program: ProgramHandle, label: String },
    DestroyProgram { program: ProgramHandle },
    UploadUniform { program: ProgramHandle, location: Location },
    CreateTexture { texture: TextureHandle },
    BindTexture { program: ProgramHandle, location: Location, texture: TextureHandle },
    CreateVertexArray { vao: VertexArrayHandle, program: ProgramHandle },
    DestroyVertexArray { vao: VertexArrayHandle },
    BindVertexArray { vao: VertexArrayHandle },
    BeginCapture { targets: Vec<BufferHandle> },
    Draw { vertices_per_entity: u32, entities: u32, captured: bool },
    EndCapture,
    BeginFrame,
    EndFrame,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::CreateBuffer { .. } => "create_buffer",
            Command::WriteBuffer { .. } => "write_buffer",
            Command::ReadBuffer { .. } => "read_buffer",
            Command::DestroyBuffer { .. } => "destroy_buffer",
            Command::CreateProgram { .. } => "create_program",
            Command::DestroyProgram { .. } => "destroy_program",
            Command::UploadUniform { .. } => "upload_uniform",
            Command::CreateTexture { .. } => "create_texture",
            Command::BindTexture { .. } => "bind_texture",
            Command::CreateVertexArray { .. } => "create_vertex_array",
            Command::DestroyVertexArray { .. } => "destroy_vertex_array",
            Command::BindVertexArray { .. } => "bind_vertex_array",
            Command::BeginCapture { .. } => "begin_capture",
            Command::Draw { .. } => "draw",
            Command::EndCapture => "end_capture",
            Command::BeginFrame => "begin_frame",
            Command::EndFrame => "end_frame",
        }
    }
}

/// Running totals of device work.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeadlessStats {
    pub uniform_uploads: u64,
    pub buffer_writes: u64,
    pub bytes_written: u64,
    pub captures: u64,
    pub draws: u64,
}

struct Lane {
    format: ElementFormat,
    bytes: Vec<u8>,
}

impl Lane {
    fn element(&self, index: u32) -> Option<std::ops::Range<usize>> {
        let start = index as usize * self.format.stride as usize;
        let end = start + self.format.components as usize * 4;
        (end <= self.bytes.len()).then_some(start..end)
    }
}

/// Inputs and outputs of one capture draw, as seen by a host kernel.
pub struct CaptureFrame {
    entities: u32,
    uniforms: HashMap<String, Vec<u8>>,
    inputs: HashMap<String, Lane>,
    outputs: HashMap<String, Lane>,
}

impl CaptureFrame {
    /// Number of entities the draw covers.
    pub fn entities(&self) -> u32 {
        self.entities
    }

    pub fn uniform(&self, name: &str) -> Option<&[u8]> {
        self.uniforms.get(name).map(Vec::as_slice)
    }

    pub fn uniform_f32(&self, name: &str) -> Option<f32> {
        let bytes = self.uniform(name)?.get(..4)?;
        Some(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn uniform_u32(&self, name: &str) -> Option<u32> {
        let bytes = self.uniform(name)?.get(..4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Raw components of element `index` of an input (or already-written output).
    pub fn read(&self, name: &str, index: u32) -> Option<Vec<u32>> {
        let lane = self.inputs.get(name).or_else(|| self.outputs.get(name))?;
        let range = lane.element(index)?;
        Some(bytemuck::pod_collect_to_vec(&lane.bytes[range]))
    }

    pub fn read_f32(&self, name: &str, index: u32) -> Option<Vec<f32>> {
        self.read(name, index)
            .map(|words| words.into_iter().map(f32::from_bits).collect())
    }

    /// Write raw components of element `index` of a captured output.
    pub fn write(&mut self, name: &str, index: u32, words: &[u32]) -> bool {
        let Some(lane) = self.outputs.get_mut(name) else {
            return false;
        };
        let Some(range) = lane.element(index) else {
            return false;
        };
        let n = words.len().min(lane.format.components as usize);
        let bytes: &[u8] = bytemuck::cast_slice(&words[..n]);
        lane.bytes[range.start..range.start + bytes.len()].copy_from_slice(bytes);
        true
    }

    pub fn write_f32(&mut self, name: &str, index: u32, values: &[f32]) -> bool {
        let words: Vec<u32> = values.iter().map(|v| v.to_bits()).collect();
        self.write(name, index, &words)
    }

    /// Copy every `x` into `xOut` for the covered entities.
    pub fn pass_through(&mut self) {
        let entities = self.entities;
        for (name, output) in self.outputs.iter_mut() {
            let Some(input) = name.strip_suffix("Out").and_then(|n| self.inputs.get(n)) else {
                continue;
            };
            for index in 0..entities {
                if let (Some(src), Some(dst)) = (input.element(index), output.element(index)) {
                    if src.len() == dst.len() {
                        output.bytes[dst].copy_from_slice(&input.bytes[src]);
                    }
                }
            }
        }
    }
}

/// A host stand-in for the transition stage.
pub type CaptureKernel = Box<dyn FnMut(&mut CaptureFrame)>;

struct HostBuffer {
    usage: BufferUsage,
    bytes: Vec<u8>,
}

struct HostProgram {
    linked: LinkedProgram,
    uniforms: HashMap<Location, Vec<u8>>,
    textures: HashMap<Location, TextureHandle>,
}

struct HostVertexArray {
    program: ProgramHandle,
    bindings: Vec<VertexBinding>,
}

/// In-memory [`GraphicsContext`] for tests and tooling.
pub struct HeadlessContext {
    next_id: u64,
    buffers: HashMap<BufferHandle, HostBuffer>,
    programs: HashMap<ProgramHandle, HostProgram>,
    vertex_arrays: HashMap<VertexArrayHandle, HostVertexArray>,
    textures: HashMap<TextureHandle, (u32, u32)>,
    current: Option<VertexArrayHandle>,
    capture: Option<Vec<VertexBinding>>,
    in_frame: bool,
    log: Vec<Command>,
    stats: HeadlessStats,
    errors: VecDeque<ErrorReport>,
    pending_faults: Vec<(&'static str, ErrorReport)>,
    pending_failures: Vec<(&'static str, ErrorReport)>,
    kernel: Option<CaptureKernel>,
    viewport: (u32, u32),
}

impl Default for HeadlessContext {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessContext {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            buffers: HashMap::new(),
            programs: HashMap::new(),
            vertex_arrays: HashMap::new(),
            textures: HashMap::new(),
            current: None,
            capture: None,
            in_frame: false,
            log: Vec::new(),
            stats: HeadlessStats::default(),
            errors: VecDeque::new(),
            pending_faults: Vec::new(),
            pending_failures: Vec::new(),
            kernel: None,
            viewport: (800, 600),
        }
    }

    /// Run `kernel` for every capture draw instead of the pass-through copy.
    pub fn with_kernel<F>(mut self, kernel: F) -> Self
    where
        F: FnMut(&mut CaptureFrame) + 'static,
    {
        self.kernel = Some(Box::new(kernel));
        self
    }

    pub fn set_kernel<F>(&mut self, kernel: F)
    where
        F: FnMut(&mut CaptureFrame) + 'static,
    {
        self.kernel = Some(Box::new(kernel));
    }

    /// Every command issued so far, in order.
    pub fn commands(&self) -> &[Command] {
        &self.log
    }

    pub fn clear_commands(&mut self) {
        self.log.clear();
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats
    }

    /// Report `code` the next time a command named `after` runs.
    pub fn inject_fault(&mut self, after: &'static str, code: FaultCode, message: impl Into<String>) {
        self.pending_faults.push((
            after,
            ErrorReport {
                code,
                message: message.into(),
            },
        ));
    }

    /// Make the next `draw` or `upload_uniform` named `command` fail, reporting
    /// `code` the way a device reports a rejected command.
    pub fn fail_command(&mut self, command: &'static str, code: FaultCode, message: impl Into<String>) {
        self.pending_failures.push((
            command,
            ErrorReport {
                code,
                message: message.into(),
            },
        ));
    }

    /// Live buffers, programs and vertex arrays.
    pub fn live_resources(&self) -> (usize, usize, usize) {
        (self.buffers.len(), self.programs.len(), self.vertex_arrays.len())
    }

    pub fn vertex_array_bindings(&self, vao: VertexArrayHandle) -> Option<&[VertexBinding]> {
        self.vertex_arrays.get(&vao).map(|v| v.bindings.as_slice())
    }

    /// Host copy of a buffer without recording a command.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer).map(|b| b.bytes.as_slice())
    }

    pub fn buffer_usage(&self, buffer: BufferHandle) -> Option<BufferUsage> {
        self.buffers.get(&buffer).map(|b| b.usage)
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record(&mut self, command: Command) {
        let name = command.name();
        if let Some(i) = self.pending_faults.iter().position(|(after, _)| *after == name) {
            let (_, report) = self.pending_faults.remove(i);
            self.errors.push_back(report);
        }
        self.log.push(command);
    }

    fn check_failure(&mut self, name: &'static str) -> Result<(), GpuError> {
        let Some(i) = self.pending_failures.iter().position(|(command, _)| *command == name) else {
            return Ok(());
        };
        let (_, report) = self.pending_failures.remove(i);
        let message = format!("{name} rejected: {}", report.message);
        self.errors.push_back(report);
        Err(GpuError::InvalidCommand(message))
    }

    fn program(&self, program: ProgramHandle) -> Result<&HostProgram, GpuError> {
        self.programs.get(&program).ok_or(GpuError::UnknownHandle {
            kind: "program",
            id: program.0,
        })
    }

    fn check_buffer(&self, buffer: BufferHandle) -> Result<&HostBuffer, GpuError> {
        self.buffers.get(&buffer).ok_or(GpuError::UnknownHandle {
            kind: "buffer",
            id: buffer.0,
        })
    }

    fn current(&self) -> Result<(&HostVertexArray, &HostProgram), GpuError> {
        let vao = self
            .current
            .and_then(|vao| self.vertex_arrays.get(&vao))
            .ok_or_else(|| GpuError::InvalidCommand("no vertex array bound".into()))?;
        Ok((vao, self.program(vao.program)?))
    }

    fn lane(&self, program: &HostProgram, binding: &VertexBinding) -> Result<(String, Lane), GpuError> {
        let global = program
            .linked
            .binding(binding.location)
            .ok_or_else(|| GpuError::InvalidCommand(format!("{:?} is not a program binding", binding.location)))?;
        let ResourceClass::Storage { element, .. } = global.class else {
            return Err(GpuError::InvalidCommand(format!("`{}` is not a storage array", global.name)));
        };
        let bytes = self.check_buffer(binding.buffer)?.bytes.clone();
        Ok((
            global.name.clone(),
            Lane {
                format: element,
                bytes,
            },
        ))
    }

    fn run_capture(&mut self, entities: u32) -> Result<(), GpuError> {
        let targets = self.capture.clone().unwrap_or_default();
        let (vao, program) = self.current()?;
        if !matches!(program.linked.kind, ProgramKind::Transition { .. }) {
            return Err(GpuError::InvalidCommand("capture requires a transition program".into()));
        }

        let mut inputs = HashMap::new();
        for binding in &vao.bindings {
            if targets.iter().any(|t| t.buffer == binding.buffer) {
                return Err(GpuError::InvalidCommand(format!(
                    "buffer #{} is bound for both read and capture",
                    binding.buffer.0
                )));
            }
            let (name, lane) = self.lane(program, binding)?;
            inputs.insert(name, lane);
        }

        let mut outputs = HashMap::new();
        let mut written = Vec::new();
        for target in &targets {
            let (name, lane) = self.lane(program, target)?;
            written.push((name.clone(), target.buffer));
            outputs.insert(name, lane);
        }

        for lane in inputs.values().chain(outputs.values()) {
            if entities as usize * lane.format.stride as usize > lane.bytes.len() {
                return Err(GpuError::InvalidCommand(format!(
                    "{} entities overrun a {} byte buffer",
                    entities,
                    lane.bytes.len()
                )));
            }
        }

        let uniforms = program
            .linked
            .bindings
            .iter()
            .filter(|b| b.class == ResourceClass::Uniform)
            .filter_map(|b| {
                let location = Location::Binding {
                    group: b.group,
                    binding: b.binding,
                };
                program.uniforms.get(&location).map(|bytes| (b.name.clone(), bytes.clone()))
            })
            .collect();

        let mut frame = CaptureFrame {
            entities,
            uniforms,
            inputs,
            outputs,
        };
        match self.kernel.as_mut() {
            Some(kernel) => kernel(&mut frame),
            None => frame.pass_through(),
        }

        for (name, buffer) in written {
            if let (Some(lane), Some(host)) = (frame.outputs.remove(&name), self.buffers.get_mut(&buffer)) {
                host.bytes = lane.bytes;
            }
        }
        self.stats.captures += 1;
        Ok(())
    }
}

impl GraphicsContext for HeadlessContext {
    fn create_buffer(&mut self, _label: &str, size: u64, usage: BufferUsage) -> Result<BufferHandle, GpuError> {
        let buffer = BufferHandle(self.next_id());
        self.buffers.insert(
            buffer,
            HostBuffer {
                usage,
                bytes: vec![0; size as usize],
            },
        );
        self.record(Command::CreateBuffer { buffer, size, usage });
        Ok(buffer)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let host = self.buffers.get_mut(&buffer).ok_or(GpuError::UnknownHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        let start = offset as usize;
        let end = start + data.len();
        if end > host.bytes.len() {
            return Err(GpuError::InvalidCommand(format!(
                "write of {} bytes at {} overruns a {} byte buffer",
                data.len(),
                offset,
                host.bytes.len()
            )));
        }
        host.bytes[start..end].copy_from_slice(data);
        self.stats.buffer_writes += 1;
        self.stats.bytes_written += data.len() as u64;
        self.record(Command::WriteBuffer {
            buffer,
            offset,
            len: data.len(),
        });
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>, GpuError> {
        let bytes = self.check_buffer(buffer)?.bytes.clone();
        self.record(Command::ReadBuffer { buffer });
        Ok(bytes)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer).is_some() {
            self.record(Command::DestroyBuffer { buffer });
        }
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramHandle, EngineError> {
        let linked = reflect::build_program(desc)?;
        let program = ProgramHandle(self.next_id());
        self.programs.insert(
            program,
            HostProgram {
                linked,
                uniforms: HashMap::new(),
                textures: HashMap::new(),
            },
        );
        self.record(Command::CreateProgram {
            program,
            label: desc.label.clone(),
        });
        Ok(program)
    }

    fn locate(&self, program: ProgramHandle, name: &str) -> Result<Location, LocationNotFound> {
        match self.programs.get(&program) {
            Some(p) => p.linked.locate(name),
            None => Err(LocationNotFound {
                program: format!("#{}", program.0),
                name: name.to_string(),
            }),
        }
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        if self.programs.remove(&program).is_some() {
            self.vertex_arrays.retain(|_, vao| vao.program != program);
            self.record(Command::DestroyProgram { program });
        }
    }

    fn upload_uniform(&mut self, program: ProgramHandle, location: Location, data: &[u8]) -> Result<(), GpuError> {
        self.check_failure("upload_uniform")?;
        let host = self.programs.get_mut(&program).ok_or(GpuError::UnknownHandle {
            kind: "program",
            id: program.0,
        })?;
        let size = match host.linked.binding(location) {
            Some(b) if b.class == ResourceClass::Uniform => b.size as usize,
            _ => {
                return Err(GpuError::InvalidCommand(format!(
                    "{:?} is not a uniform of program '{}'",
                    location, host.linked.label
                )))
            }
        };
        if data.len() > size {
            return Err(GpuError::InvalidCommand(format!(
                "{} byte payload for a {} byte uniform",
                data.len(),
                size
            )));
        }
        host.uniforms.insert(location, data.to_vec());
        self.stats.uniform_uploads += 1;
        self.record(Command::UploadUniform { program, location });
        Ok(())
    }

    fn read_uniform(&mut self, program: ProgramHandle, location: Location) -> Result<Vec<u8>, GpuError> {
        let host = self.program(program)?;
        match host.linked.binding(location) {
            Some(b) if b.class == ResourceClass::Uniform => Ok(host
                .uniforms
                .get(&location)
                .cloned()
                .unwrap_or_else(|| vec![0; b.size as usize])),
            _ => Err(GpuError::InvalidCommand(format!("{:?} is not a uniform", location))),
        }
    }

    fn create_texture(&mut self, config: &TextureConfig) -> Result<TextureHandle, GpuError> {
        let texture = TextureHandle(self.next_id());
        self.textures.insert(texture, (config.width, config.height));
        self.record(Command::CreateTexture { texture });
        Ok(texture)
    }

    fn bind_texture(&mut self, program: ProgramHandle, location: Location, texture: TextureHandle) -> Result<(), GpuError> {
        if !self.textures.contains_key(&texture) {
            return Err(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            });
        }
        let host = self.programs.get_mut(&program).ok_or(GpuError::UnknownHandle {
            kind: "program",
            id: program.0,
        })?;
        match host.linked.binding(location) {
            Some(b) if b.class == ResourceClass::Texture => {}
            _ => return Err(GpuError::InvalidCommand(format!("{:?} is not a texture", location))),
        }
        host.textures.insert(location, texture);
        self.record(Command::BindTexture {
            program,
            location,
            texture,
        });
        Ok(())
    }

    fn create_vertex_array(&mut self, program: ProgramHandle, bindings: &[VertexBinding]) -> Result<VertexArrayHandle, GpuError> {
        let host = self.program(program)?;
        for binding in bindings {
            self.check_buffer(binding.buffer)?;
            let valid = match binding.location {
                Location::Binding { group, .. } => {
                    group == INPUT_GROUP && host.linked.binding(binding.location).is_some()
                }
                Location::Attribute(location) => host.linked.vertex_input(location).is_some(),
            };
            if !valid {
                return Err(GpuError::InvalidCommand(format!(
                    "{:?} is not an input of program '{}'",
                    binding.location, host.linked.label
                )));
            }
        }
        let vao = VertexArrayHandle(self.next_id());
        self.vertex_arrays.insert(
            vao,
            HostVertexArray {
                program,
                bindings: bindings.to_vec(),
            },
        );
        self.record(Command::CreateVertexArray { vao, program });
        Ok(vao)
    }

    fn destroy_vertex_array(&mut self, vao: VertexArrayHandle) {
        if self.vertex_arrays.remove(&vao).is_some() {
            if self.current == Some(vao) {
                self.current = None;
            }
            self.record(Command::DestroyVertexArray { vao });
        }
    }

    fn bind_vertex_array(&mut self, vao: VertexArrayHandle) -> Result<(), GpuError> {
        if !self.vertex_arrays.contains_key(&vao) {
            return Err(GpuError::UnknownHandle {
                kind: "vertex array",
                id: vao.0,
            });
        }
        self.current = Some(vao);
        self.record(Command::BindVertexArray { vao });
        Ok(())
    }

    fn begin_capture(&mut self, targets: &[VertexBinding]) -> Result<(), GpuError> {
        if self.capture.is_some() {
            return Err(GpuError::InvalidCommand("capture already active".into()));
        }
        for target in targets {
            self.check_buffer(target.buffer)?;
            if !matches!(target.location, Location::Binding { group, .. } if group == CAPTURE_GROUP) {
                return Err(GpuError::InvalidCommand(format!(
                    "{:?} is not a captured output",
                    target.location
                )));
            }
        }
        self.capture = Some(targets.to_vec());
        self.record(Command::BeginCapture {
            targets: targets.iter().map(|t| t.buffer).collect(),
        });
        Ok(())
    }

    fn draw(&mut self, vertices_per_entity: u32, entities: u32) -> Result<(), GpuError> {
        self.check_failure("draw")?;
        let captured = self.capture.is_some();
        if captured {
            self.run_capture(entities)?;
        } else {
            let (vao, program) = self.current()?;
            if !matches!(program.linked.kind, ProgramKind::Render { .. }) {
                return Err(GpuError::InvalidCommand("transition programs only run inside a capture".into()));
            }
            if !self.in_frame {
                return Err(GpuError::InvalidCommand("draw outside a frame".into()));
            }
            for binding in &vao.bindings {
                let Location::Attribute(location) = binding.location else {
                    continue;
                };
                let stride = program
                    .linked
                    .vertex_input(location)
                    .map(|i| i.format.stride as usize)
                    .unwrap_or(0);
                let len = self.check_buffer(binding.buffer)?.bytes.len();
                if entities as usize * stride > len {
                    return Err(GpuError::InvalidCommand(format!(
                        "{} entities overrun a {} byte vertex buffer",
                        entities, len
                    )));
                }
            }
            self.stats.draws += 1;
        }
        self.record(Command::Draw {
            vertices_per_entity,
            entities,
            captured,
        });
        Ok(())
    }

    fn end_capture(&mut self) -> Result<(), GpuError> {
        if self.capture.take().is_none() {
            return Err(GpuError::InvalidCommand("no capture active".into()));
        }
        self.record(Command::EndCapture);
        Ok(())
    }

    fn begin_frame(&mut self, _clear: [f64; 4]) -> Result<(), GpuError> {
        self.in_frame = true;
        self.record(Command::BeginFrame);
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), GpuError> {
        if !self.in_frame {
            return Err(GpuError::InvalidCommand("end_frame without begin_frame".into()));
        }
        self.in_frame = false;
        self.record(Command::EndFrame);
        Ok(())
    }

    fn viewport(&self) -> (u32, u32) {
        self.viewport
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.viewport = (width, height);
        }
    }

    fn poll_error(&mut self) -> Option<ErrorReport> {
        self.errors.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Primitive, StageSource};
    use crate::shader::ShaderStage;

    const COPY: &str = r#"
@group(1) @binding(0) var<storage, read> x: array<f32>;
@group(2) @binding(0) var<storage, read_write> xOut: array<f32>;
@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) { xOut[id.x] = x[id.x]; }
"#;

    fn program(ctx: &mut HeadlessContext) -> ProgramHandle {
        ctx.create_program(&ProgramDesc {
            label: "copy".into(),
            stages: vec![StageSource {
                stage: ShaderStage::Transition,
                source: COPY.into(),
            }],
            captured: vec!["xOut".into()],
            primitive: Primitive::Points,
        })
        .unwrap()
    }

    #[test]
    fn test_pass_through_capture() {
        let mut ctx = HeadlessContext::new();
        let p = program(&mut ctx);
        let a = ctx.create_buffer("a", 8, BufferUsage::Dynamic).unwrap();
        let b = ctx.create_buffer("b", 8, BufferUsage::Capture).unwrap();
        ctx.write_buffer(a, 0, bytemuck::cast_slice(&[3.0f32, 4.0])).unwrap();

        let input = Location::Binding { group: 1, binding: 0 };
        let output = Location::Binding { group: 2, binding: 0 };
        let vao = ctx
            .create_vertex_array(p, &[VertexBinding { location: input, buffer: a }])
            .unwrap();
        ctx.bind_vertex_array(vao).unwrap();
        ctx.begin_capture(&[VertexBinding { location: output, buffer: b }]).unwrap();
        ctx.draw(1, 2).unwrap();
        ctx.end_capture().unwrap();

        let out: Vec<f32> = bytemuck::pod_collect_to_vec(&ctx.read_buffer(b).unwrap());
        assert_eq!(out, vec![3.0, 4.0]);
        assert_eq!(ctx.stats().captures, 1);
    }

    #[test]
    fn test_aliasing_read_and_capture_is_rejected() {
        let mut ctx = HeadlessContext::new();
        let p = program(&mut ctx);
        let a = ctx.create_buffer("a", 8, BufferUsage::Dynamic).unwrap();
        let vao = ctx
            .create_vertex_array(
                p,
                &[VertexBinding {
                    location: Location::Binding { group: 1, binding: 0 },
                    buffer: a,
                }],
            )
            .unwrap();
        ctx.bind_vertex_array(vao).unwrap();
        ctx.begin_capture(&[VertexBinding {
            location: Location::Binding { group: 2, binding: 0 },
            buffer: a,
        }])
        .unwrap();
        assert!(matches!(ctx.draw(1, 2), Err(GpuError::InvalidCommand(_))));
    }

    #[test]
    fn test_injected_fault_surfaces_once() {
        let mut ctx = HeadlessContext::new();
        ctx.inject_fault("create_buffer", FaultCode::OutOfMemory, "no room");
        assert!(ctx.poll_error().is_none());
        ctx.create_buffer("a", 4, BufferUsage::Static).unwrap();
        let report = ctx.poll_error().unwrap();
        assert_eq!(report.code, FaultCode::OutOfMemory);
        ctx.create_buffer("b", 4, BufferUsage::Static).unwrap();
        assert!(ctx.poll_error().is_none());
    }

    #[test]
    fn test_write_overrun_is_rejected() {
        let mut ctx = HeadlessContext::new();
        let a = ctx.create_buffer("a", 4, BufferUsage::Static).unwrap();
        assert!(ctx.write_buffer(a, 0, &[0u8; 8]).is_err());
        assert!(ctx.write_buffer(BufferHandle(99), 0, &[0u8; 4]).is_err());
    }
}
