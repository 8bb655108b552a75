//! The wgpu-backed [`GraphicsContext`].
//!
//! Transition programs become compute pipelines dispatched one invocation
//! per entity; render programs become render pipelines whose vertex
//! buffers step once per instance, so one instance draws one entity.
//! Render draws issued during a frame are recorded and encoded into a
//! single pass when the frame ends.

use std::collections::{HashMap, VecDeque};
use std::sync::{mpsc, Arc, Mutex};

use wgpu::util::DeviceExt;
use winit::window::Window;

use crate::context::reflect::{self, GlobalBinding, LinkedProgram, ProgramKind, ResourceClass};
use crate::context::{
    BufferHandle, BufferUsage, ErrorReport, FaultCode, GraphicsContext, Location, Primitive,
    ProgramDesc, ProgramHandle, TextureHandle, VertexArrayHandle, VertexBinding,
};
use crate::error::{EngineError, GpuError, LocationNotFound};
use crate::shader::{ShaderStage, CAPTURE_GROUP, INPUT_GROUP, UNIFORM_GROUP};
use crate::textures::TextureConfig;

const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;
const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8UnormSrgb;

type ErrorQueue = Arc<Mutex<VecDeque<ErrorReport>>>;

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

struct GpuTexture {
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
}

enum Pipeline {
    Compute {
        pipeline: wgpu::ComputePipeline,
        workgroup_size: u32,
    },
    Render(wgpu::RenderPipeline),
}

struct GpuProgram {
    linked: LinkedProgram,
    pipeline: Pipeline,
    layouts: Vec<wgpu::BindGroupLayout>,
    uniforms: HashMap<Location, wgpu::Buffer>,
    textures: HashMap<Location, TextureHandle>,
    /// Vertex buffer slot per `@location`.
    slots: HashMap<u32, u32>,
    uniform_group: Option<wgpu::BindGroup>,
    capture_groups: HashMap<Vec<VertexBinding>, wgpu::BindGroup>,
}

struct GpuVertexArray {
    program: ProgramHandle,
    bindings: Vec<VertexBinding>,
    /// Storage inputs of a transition program.
    input_group: Option<wgpu::BindGroup>,
}

struct DrawCall {
    vao: VertexArrayHandle,
    vertices: u32,
    instances: u32,
}

struct Frame {
    encoder: wgpu::CommandEncoder,
    output: Option<wgpu::SurfaceTexture>,
    view: wgpu::TextureView,
    /// Pending until the first pass of the frame is encoded.
    clear: Option<wgpu::Color>,
    draws: Vec<DrawCall>,
}

struct WindowTarget {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
}

/// A [`GraphicsContext`] on a real device, presenting to a window or
/// rendering into an offscreen texture.
pub struct WgpuContext {
    device: wgpu::Device,
    queue: wgpu::Queue,
    window: Option<WindowTarget>,
    offscreen: Option<wgpu::Texture>,
    format: wgpu::TextureFormat,
    size: (u32, u32),
    depth: wgpu::TextureView,
    fallback: GpuTexture,
    next_id: u64,
    buffers: HashMap<BufferHandle, GpuBuffer>,
    programs: HashMap<ProgramHandle, GpuProgram>,
    vertex_arrays: HashMap<VertexArrayHandle, GpuVertexArray>,
    textures: HashMap<TextureHandle, GpuTexture>,
    current: Option<VertexArrayHandle>,
    capture: Option<Vec<VertexBinding>>,
    frame: Option<Frame>,
    errors: ErrorQueue,
}

impl WgpuContext {
    /// Open a device presenting to `window`.
    pub fn new(window: Arc<Window>) -> Result<Self, GpuError> {
        pollster::block_on(Self::new_async(window))
    }

    async fn new_async(window: Arc<Window>) -> Result<Self, GpuError> {
        let size = window.inner_size();
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });
        let surface = instance.create_surface(window)?;
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or(GpuError::NoAdapter)?;
        let (device, queue) = request_device(&adapter).await?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or(GpuError::NoAdapter)?;
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: wgpu::PresentMode::AutoVsync,
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &config);

        tracing::info!(
            adapter = %adapter.get_info().name,
            backend = ?adapter.get_info().backend,
            format = ?surface_format,
            "device ready"
        );

        let size = (config.width, config.height);
        Ok(Self::assemble(
            device,
            queue,
            Some(WindowTarget { surface, config }),
            None,
            surface_format,
            size,
        ))
    }

    /// Open a device rendering into a `width` x `height` texture.
    pub fn offscreen(width: u32, height: u32) -> Result<Self, GpuError> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::PRIMARY,
                ..Default::default()
            });
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .ok_or(GpuError::NoAdapter)?;
            let (device, queue) = request_device(&adapter).await?;
            tracing::info!(adapter = %adapter.get_info().name, "offscreen device ready");

            let size = (width.max(1), height.max(1));
            let target = create_offscreen_texture(&device, size);
            Ok(Self::assemble(device, queue, None, Some(target), OFFSCREEN_FORMAT, size))
        })
    }

    fn assemble(
        device: wgpu::Device,
        queue: wgpu::Queue,
        window: Option<WindowTarget>,
        offscreen: Option<wgpu::Texture>,
        format: wgpu::TextureFormat,
        size: (u32, u32),
    ) -> Self {
        let errors: ErrorQueue = Arc::new(Mutex::new(VecDeque::new()));

        let sink = Arc::clone(&errors);
        device.on_uncaptured_error(Box::new(move |error: wgpu::Error| {
            let report = ErrorReport {
                code: classify(&error),
                message: error.to_string(),
            };
            if let Ok(mut queue) = sink.lock() {
                queue.push_back(report);
            }
        }));
        let sink = Arc::clone(&errors);
        device.set_device_lost_callback(move |reason, message| {
            if let Ok(mut queue) = sink.lock() {
                queue.push_back(ErrorReport {
                    code: FaultCode::Lost,
                    message: format!("{:?}: {}", reason, message),
                });
            }
        });

        let depth = create_depth_texture(&device, size);
        let fallback = create_texture(&device, &queue, &TextureConfig::solid(255, 255, 255, 255));

        Self {
            device,
            queue,
            window,
            offscreen,
            format,
            size,
            depth,
            fallback,
            next_id: 0,
            buffers: HashMap::new(),
            programs: HashMap::new(),
            vertex_arrays: HashMap::new(),
            textures: HashMap::new(),
            current: None,
            capture: None,
            frame: None,
            errors,
        }
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Format of the color target render programs draw into.
    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn buffer(&self, handle: BufferHandle) -> Result<&GpuBuffer, GpuError> {
        self.buffers.get(&handle).ok_or(GpuError::UnknownHandle {
            kind: "buffer",
            id: handle.0,
        })
    }

    fn program(&self, handle: ProgramHandle) -> Result<&GpuProgram, GpuError> {
        self.programs.get(&handle).ok_or(GpuError::UnknownHandle {
            kind: "program",
            id: handle.0,
        })
    }

    fn program_mut(&mut self, handle: ProgramHandle) -> Result<&mut GpuProgram, GpuError> {
        self.programs.get_mut(&handle).ok_or(GpuError::UnknownHandle {
            kind: "program",
            id: handle.0,
        })
    }

    fn vertex_array(&self, handle: VertexArrayHandle) -> Result<&GpuVertexArray, GpuError> {
        self.vertex_arrays.get(&handle).ok_or(GpuError::UnknownHandle {
            kind: "vertex array",
            id: handle.0,
        })
    }

    fn current(&self) -> Result<(VertexArrayHandle, ProgramHandle), GpuError> {
        let handle = self
            .current
            .ok_or_else(|| GpuError::InvalidCommand("no vertex array bound".into()))?;
        Ok((handle, self.vertex_array(handle)?.program))
    }

    /// Copy `size` bytes of `source` into a mappable buffer and read them.
    fn read_back(&self, source: &wgpu::Buffer, size: u64) -> Result<Vec<u8>, GpuError> {
        let size = align4(size);
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Readback Encoder"),
            });
        encoder.copy_buffer_to_buffer(source, 0, &staging, 0, size);
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| GpuError::BufferMapping(e.to_string()))?
            .map_err(|e| GpuError::BufferMapping(e.to_string()))?;

        let bytes = slice.get_mapped_range().to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn ensure_uniform_group(&mut self, handle: ProgramHandle) -> Result<(), GpuError> {
        let program = self.program(handle)?;
        if program.uniform_group.is_some() {
            return Ok(());
        }

        let mut entries = Vec::new();
        for binding in program.linked.group(UNIFORM_GROUP) {
            let location = Location::Binding {
                group: binding.group,
                binding: binding.binding,
            };
            let resource = match binding.class {
                ResourceClass::Uniform => match program.uniforms.get(&location) {
                    Some(buffer) => buffer.as_entire_binding(),
                    None => continue,
                },
                ResourceClass::Texture => {
                    wgpu::BindingResource::TextureView(&self.bound_texture(program, location).view)
                }
                ResourceClass::Sampler => {
                    let texture = Location::Binding {
                        group: binding.group,
                        binding: binding.binding.saturating_sub(1),
                    };
                    wgpu::BindingResource::Sampler(&self.bound_texture(program, texture).sampler)
                }
                ResourceClass::Storage { .. } => {
                    return Err(GpuError::InvalidCommand(format!(
                        "storage array `{}` declared in the uniform group",
                        binding.name
                    )))
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: binding.binding,
                resource,
            });
        }

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Uniform Bind Group"),
            layout: &program.layouts[UNIFORM_GROUP as usize],
            entries: &entries,
        });
        self.program_mut(handle)?.uniform_group = Some(group);
        Ok(())
    }

    fn bound_texture(&self, program: &GpuProgram, location: Location) -> &GpuTexture {
        program
            .textures
            .get(&location)
            .and_then(|handle| self.textures.get(handle))
            .unwrap_or(&self.fallback)
    }

    fn ensure_capture_group(&mut self, handle: ProgramHandle, targets: &[VertexBinding]) -> Result<(), GpuError> {
        let program = self.program(handle)?;
        if program.capture_groups.contains_key(targets) {
            return Ok(());
        }
        let layout = &program.layouts[CAPTURE_GROUP as usize];
        let entries = storage_entries(&self.buffers, program.linked.group(CAPTURE_GROUP), targets)?;
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Capture Bind Group"),
            layout,
            entries: &entries,
        });
        self.program_mut(handle)?
            .capture_groups
            .insert(targets.to_vec(), group);
        Ok(())
    }

    /// Encode one transition dispatch over `entities`.
    fn encode_dispatch(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        targets: &[VertexBinding],
        entities: u32,
    ) -> Result<(), GpuError> {
        let (vao_handle, program_handle) = self.current()?;
        self.ensure_uniform_group(program_handle)?;
        self.ensure_capture_group(program_handle, targets)?;

        let program = self.program(program_handle)?;
        let vao = self.vertex_array(vao_handle)?;
        let Pipeline::Compute {
            pipeline,
            workgroup_size,
        } = &program.pipeline
        else {
            return Err(GpuError::InvalidCommand("render programs cannot capture".into()));
        };
        let workgroups = entities.div_ceil(*workgroup_size);
        let limit = self.device.limits().max_compute_workgroups_per_dimension;
        if workgroups > limit {
            return Err(GpuError::InvalidCommand(format!(
                "{} entities need {} workgroups, the device allows {}",
                entities, workgroups, limit
            )));
        }
        let (Some(uniforms), Some(inputs), Some(outputs)) = (
            program.uniform_group.as_ref(),
            vao.input_group.as_ref(),
            program.capture_groups.get(targets),
        ) else {
            return Err(GpuError::InvalidCommand("transition bind groups are incomplete".into()));
        };

        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some("Transition Pass"),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(UNIFORM_GROUP, uniforms, &[]);
        pass.set_bind_group(INPUT_GROUP, inputs, &[]);
        pass.set_bind_group(CAPTURE_GROUP, outputs, &[]);
        pass.dispatch_workgroups(workgroups, 1, 1);
        Ok(())
    }

    /// Encode the frame's recorded draws into one render pass.
    fn flush_draws(&mut self, frame: &mut Frame) -> Result<(), GpuError> {
        if frame.draws.is_empty() && frame.clear.is_none() {
            return Ok(());
        }
        let draws = std::mem::take(&mut frame.draws);
        for draw in &draws {
            let program = self.vertex_array(draw.vao)?.program;
            self.ensure_uniform_group(program)?;
        }

        let (load, depth_load) = match frame.clear.take() {
            Some(color) => (wgpu::LoadOp::Clear(color), wgpu::LoadOp::Clear(1.0)),
            None => (wgpu::LoadOp::Load, wgpu::LoadOp::Load),
        };
        let mut pass = frame.encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Render Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &frame.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &self.depth,
                depth_ops: Some(wgpu::Operations {
                    load: depth_load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        for draw in &draws {
            let vao = self.vertex_array(draw.vao)?;
            let program = self.program(vao.program)?;
            let Pipeline::Render(pipeline) = &program.pipeline else {
                return Err(GpuError::InvalidCommand("transition programs only run inside a capture".into()));
            };
            pass.set_pipeline(pipeline);
            if let Some(uniforms) = &program.uniform_group {
                pass.set_bind_group(UNIFORM_GROUP, uniforms, &[]);
            }
            for binding in &vao.bindings {
                let Location::Attribute(location) = binding.location else {
                    continue;
                };
                if let Some(&slot) = program.slots.get(&location) {
                    pass.set_vertex_buffer(slot, self.buffer(binding.buffer)?.buffer.slice(..));
                }
            }
            pass.draw(0..draw.vertices, 0..draw.instances);
        }
        Ok(())
    }

    fn create_pipeline(&self, linked: &LinkedProgram, layouts: &[wgpu::BindGroupLayout]) -> Result<Pipeline, EngineError> {
        let layout_refs: Vec<&wgpu::BindGroupLayout> = layouts.iter().collect();
        let layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{} Pipeline Layout", linked.label)),
            bind_group_layouts: &layout_refs,
            push_constant_ranges: &[],
        });
        let module = |stage: ShaderStage| -> Result<wgpu::ShaderModule, EngineError> {
            let compiled = linked.stage(stage).ok_or_else(|| EngineError::Link {
                program: linked.label.clone(),
                log: format!("missing {:?} stage", stage),
            })?;
            Ok(self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&format!("{} {:?} Shader", linked.label, stage)),
                source: wgpu::ShaderSource::Wgsl(compiled.source.as_str().into()),
            }))
        };

        match linked.kind {
            ProgramKind::Transition { workgroup_size } => {
                // The fragment stage is compiled for validation only; nothing rasterizes.
                let shader = module(ShaderStage::Transition)?;
                let pipeline = self.device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(&linked.label),
                    layout: Some(&layout),
                    module: &shader,
                    entry_point: None,
                    compilation_options: Default::default(),
                    cache: None,
                });
                Ok(Pipeline::Compute {
                    pipeline,
                    workgroup_size: workgroup_size.max(1),
                })
            }
            ProgramKind::Render { primitive } => {
                let vertex = module(ShaderStage::Vertex)?;
                let fragment = module(ShaderStage::Fragment)?;

                let attributes: Vec<[wgpu::VertexAttribute; 1]> = linked
                    .vertex_inputs
                    .iter()
                    .map(|input| {
                        [wgpu::VertexAttribute {
                            format: input.format.vertex_format(),
                            offset: 0,
                            shader_location: input.location,
                        }]
                    })
                    .collect();
                let buffers: Vec<wgpu::VertexBufferLayout> = linked
                    .vertex_inputs
                    .iter()
                    .zip(&attributes)
                    .map(|(input, attribute)| wgpu::VertexBufferLayout {
                        array_stride: input.format.stride as u64,
                        step_mode: wgpu::VertexStepMode::Instance,
                        attributes: attribute,
                    })
                    .collect();

                let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                    label: Some(&linked.label),
                    layout: Some(&layout),
                    vertex: wgpu::VertexState {
                        module: &vertex,
                        entry_point: None,
                        buffers: &buffers,
                        compilation_options: Default::default(),
                    },
                    fragment: Some(wgpu::FragmentState {
                        module: &fragment,
                        entry_point: None,
                        targets: &[Some(wgpu::ColorTargetState {
                            format: self.format,
                            blend: Some(wgpu::BlendState::ALPHA_BLENDING),
                            write_mask: wgpu::ColorWrites::ALL,
                        })],
                        compilation_options: Default::default(),
                    }),
                    primitive: wgpu::PrimitiveState {
                        topology: match primitive {
                            Primitive::Points => wgpu::PrimitiveTopology::PointList,
                            Primitive::Triangles => wgpu::PrimitiveTopology::TriangleList,
                        },
                        ..Default::default()
                    },
                    depth_stencil: Some(wgpu::DepthStencilState {
                        format: DEPTH_FORMAT,
                        depth_write_enabled: true,
                        depth_compare: wgpu::CompareFunction::Less,
                        stencil: wgpu::StencilState::default(),
                        bias: wgpu::DepthBiasState::default(),
                    }),
                    multisample: wgpu::MultisampleState::default(),
                    multiview: None,
                    cache: None,
                });
                Ok(Pipeline::Render(pipeline))
            }
        }
    }

    fn acquire(&mut self) -> Result<(Option<wgpu::SurfaceTexture>, wgpu::TextureView), GpuError> {
        if let Some(target) = &self.window {
            let output = match target.surface.get_current_texture() {
                Ok(output) => output,
                Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                    tracing::debug!("surface lost, reconfiguring");
                    target.surface.configure(&self.device, &target.config);
                    target.surface.get_current_texture()?
                }
                Err(e) => return Err(e.into()),
            };
            let view = output
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default());
            return Ok((Some(output), view));
        }
        let texture = self
            .offscreen
            .as_ref()
            .ok_or_else(|| GpuError::InvalidCommand("context has no render target".into()))?;
        Ok((None, texture.create_view(&wgpu::TextureViewDescriptor::default())))
    }
}

impl GraphicsContext for WgpuContext {
    fn create_buffer(&mut self, label: &str, size: u64, usage: BufferUsage) -> Result<BufferHandle, GpuError> {
        // Every attribute buffer is read as storage, captured into and drawn from.
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: align4(size.max(4)),
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::VERTEX
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let handle = BufferHandle(self.next_id());
        tracing::trace!(label, size, ?usage, id = handle.0, "buffer created");
        self.buffers.insert(handle, GpuBuffer { buffer, size });
        Ok(handle)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<(), GpuError> {
        let target = self.buffer(buffer)?;
        let end = offset + data.len() as u64;
        if end > target.size {
            return Err(GpuError::InvalidCommand(format!(
                "write of {} bytes at {} overruns a {} byte buffer",
                data.len(),
                offset,
                target.size
            )));
        }
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 || data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(GpuError::InvalidCommand(format!(
                "write of {} bytes at {} is not 4-byte aligned",
                data.len(),
                offset
            )));
        }
        self.queue.write_buffer(&target.buffer, offset, data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>, GpuError> {
        let source = self.buffer(buffer)?;
        let mut bytes = self.read_back(&source.buffer, source.size)?;
        bytes.truncate(source.size as usize);
        Ok(bytes)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(gpu) = self.buffers.remove(&buffer) {
            for program in self.programs.values_mut() {
                program
                    .capture_groups
                    .retain(|targets, _| targets.iter().all(|t| t.buffer != buffer));
            }
            gpu.buffer.destroy();
        }
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramHandle, EngineError> {
        let linked = reflect::build_program(desc)?;
        let (groups, visibility) = match linked.kind {
            ProgramKind::Transition { .. } => (CAPTURE_GROUP + 1, wgpu::ShaderStages::COMPUTE),
            ProgramKind::Render { .. } => (
                UNIFORM_GROUP + 1,
                wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
            ),
        };
        if let Some(stray) = linked.bindings.iter().find(|b| b.used && b.group >= groups) {
            return Err(EngineError::Link {
                program: desc.label.clone(),
                log: format!("`{}` is bound in unsupported group {}", stray.name, stray.group),
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let layouts: Vec<wgpu::BindGroupLayout> = (0..groups)
            .map(|group| {
                let entries: Vec<wgpu::BindGroupLayoutEntry> = linked
                    .group(group)
                    .map(|binding| layout_entry(binding, visibility))
                    .collect();
                self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(&format!("{} Group {}", desc.label, group)),
                    entries: &entries,
                })
            })
            .collect();
        let pipeline = self.create_pipeline(&linked, &layouts);
        let scope = pollster::block_on(self.device.pop_error_scope());
        let pipeline = pipeline?;
        if let Some(error) = scope {
            return Err(EngineError::Link {
                program: desc.label.clone(),
                log: error.to_string(),
            });
        }

        let uniforms = linked
            .group(UNIFORM_GROUP)
            .filter(|b| b.class == ResourceClass::Uniform)
            .map(|b| {
                let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(&b.name),
                    size: b.size.max(16).next_multiple_of(16),
                    usage: wgpu::BufferUsages::UNIFORM
                        | wgpu::BufferUsages::COPY_DST
                        | wgpu::BufferUsages::COPY_SRC,
                    mapped_at_creation: false,
                });
                (
                    Location::Binding {
                        group: b.group,
                        binding: b.binding,
                    },
                    buffer,
                )
            })
            .collect();
        let slots = linked
            .vertex_inputs
            .iter()
            .enumerate()
            .map(|(slot, input)| (input.location, slot as u32))
            .collect();

        let handle = ProgramHandle(self.next_id());
        tracing::debug!(label = %desc.label, id = handle.0, kind = ?linked.kind, "pipeline created");
        self.programs.insert(
            handle,
            GpuProgram {
                linked,
                pipeline,
                layouts,
                uniforms,
                textures: HashMap::new(),
                slots,
                uniform_group: None,
                capture_groups: HashMap::new(),
            },
        );
        Ok(handle)
    }

    fn locate(&self, program: ProgramHandle, name: &str) -> Result<Location, LocationNotFound> {
        match self.programs.get(&program) {
            Some(gpu) => gpu.linked.locate(name),
            None => Err(LocationNotFound {
                program: format!("#{}", program.0),
                name: name.to_string(),
            }),
        }
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        if self.programs.remove(&program).is_some() {
            self.vertex_arrays.retain(|_, vao| vao.program != program);
            if let Some(current) = self.current {
                if !self.vertex_arrays.contains_key(&current) {
                    self.current = None;
                }
            }
        }
    }

    fn upload_uniform(&mut self, program: ProgramHandle, location: Location, data: &[u8]) -> Result<(), GpuError> {
        let gpu = self.program(program)?;
        let size = gpu.linked.binding(location).map(|b| b.size).unwrap_or(0);
        let buffer = gpu
            .uniforms
            .get(&location)
            .ok_or_else(|| GpuError::InvalidCommand(format!("{:?} is not a uniform", location)))?;
        if data.len() as u64 > size {
            return Err(GpuError::InvalidCommand(format!(
                "{} bytes do not fit a {} byte uniform",
                data.len(),
                size
            )));
        }
        self.queue.write_buffer(buffer, 0, data);
        Ok(())
    }

    fn read_uniform(&mut self, program: ProgramHandle, location: Location) -> Result<Vec<u8>, GpuError> {
        let gpu = self.program(program)?;
        let size = gpu.linked.binding(location).map(|b| b.size).unwrap_or(0);
        let buffer = gpu
            .uniforms
            .get(&location)
            .ok_or_else(|| GpuError::InvalidCommand(format!("{:?} is not a uniform", location)))?;
        let mut bytes = self.read_back(buffer, buffer.size())?;
        bytes.truncate(size as usize);
        Ok(bytes)
    }

    fn create_texture(&mut self, config: &TextureConfig) -> Result<TextureHandle, GpuError> {
        if config.data.len() != (config.width * config.height * 4) as usize {
            return Err(GpuError::InvalidCommand(format!(
                "{} bytes of pixels for a {}x{} texture",
                config.data.len(),
                config.width,
                config.height
            )));
        }
        let texture = create_texture(&self.device, &self.queue, config);
        let handle = TextureHandle(self.next_id());
        self.textures.insert(handle, texture);
        Ok(handle)
    }

    fn bind_texture(&mut self, program: ProgramHandle, location: Location, texture: TextureHandle) -> Result<(), GpuError> {
        if !self.textures.contains_key(&texture) {
            return Err(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.0,
            });
        }
        let gpu = self.program_mut(program)?;
        if !matches!(gpu.linked.binding(location), Some(b) if b.class == ResourceClass::Texture) {
            return Err(GpuError::InvalidCommand(format!("{:?} is not a texture", location)));
        }
        gpu.textures.insert(location, texture);
        gpu.uniform_group = None;
        Ok(())
    }

    fn create_vertex_array(&mut self, program: ProgramHandle, bindings: &[VertexBinding]) -> Result<VertexArrayHandle, GpuError> {
        for binding in bindings {
            self.buffer(binding.buffer)?;
        }
        let gpu = self.program(program)?;
        let input_group = match gpu.pipeline {
            Pipeline::Compute { .. } => {
                let entries = storage_entries(&self.buffers, gpu.linked.group(INPUT_GROUP), bindings)?;
                Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some("Input Bind Group"),
                    layout: &gpu.layouts[INPUT_GROUP as usize],
                    entries: &entries,
                }))
            }
            Pipeline::Render(_) => {
                if let Some(missing) = gpu.linked.vertex_inputs.iter().find(|input| {
                    !bindings
                        .iter()
                        .any(|b| b.location == Location::Attribute(input.location))
                }) {
                    return Err(GpuError::InvalidCommand(format!(
                        "vertex input `{}` has no buffer",
                        missing.name
                    )));
                }
                None
            }
        };

        let handle = VertexArrayHandle(self.next_id());
        self.vertex_arrays.insert(
            handle,
            GpuVertexArray {
                program,
                bindings: bindings.to_vec(),
                input_group,
            },
        );
        Ok(handle)
    }

    fn destroy_vertex_array(&mut self, vao: VertexArrayHandle) {
        self.vertex_arrays.remove(&vao);
        if self.current == Some(vao) {
            self.current = None;
        }
    }

    fn bind_vertex_array(&mut self, vao: VertexArrayHandle) -> Result<(), GpuError> {
        self.vertex_array(vao)?;
        self.current = Some(vao);
        Ok(())
    }

    fn begin_capture(&mut self, targets: &[VertexBinding]) -> Result<(), GpuError> {
        if self.capture.is_some() {
            return Err(GpuError::InvalidCommand("capture already active".into()));
        }
        for target in targets {
            self.buffer(target.buffer)?;
            if !matches!(target.location, Location::Binding { group, .. } if group == CAPTURE_GROUP) {
                return Err(GpuError::InvalidCommand(format!(
                    "{:?} is not a captured output",
                    target.location
                )));
            }
        }
        self.capture = Some(targets.to_vec());
        Ok(())
    }

    fn draw(&mut self, vertices_per_entity: u32, entities: u32) -> Result<(), GpuError> {
        if let Some(targets) = self.capture.clone() {
            if entities == 0 {
                return Ok(());
            }
            // Inside a frame the dispatch joins the frame's encoder so that
            // draws recorded before it see the old contents.
            match self.frame.take() {
                Some(mut frame) => {
                    let result = self
                        .flush_draws(&mut frame)
                        .and_then(|_| self.encode_dispatch(&mut frame.encoder, &targets, entities));
                    self.frame = Some(frame);
                    result
                }
                None => {
                    let mut encoder = self
                        .device
                        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                            label: Some("Transition Encoder"),
                        });
                    self.encode_dispatch(&mut encoder, &targets, entities)?;
                    self.queue.submit(std::iter::once(encoder.finish()));
                    Ok(())
                }
            }
        } else {
            let (vao, program) = self.current()?;
            if !matches!(self.program(program)?.pipeline, Pipeline::Render(_)) {
                return Err(GpuError::InvalidCommand("transition programs only run inside a capture".into()));
            }
            let frame = self
                .frame
                .as_mut()
                .ok_or_else(|| GpuError::InvalidCommand("draw outside a frame".into()))?;
            frame.draws.push(DrawCall {
                vao,
                vertices: vertices_per_entity,
                instances: entities,
            });
            Ok(())
        }
    }

    fn end_capture(&mut self) -> Result<(), GpuError> {
        if self.capture.take().is_none() {
            return Err(GpuError::InvalidCommand("no capture active".into()));
        }
        Ok(())
    }

    fn begin_frame(&mut self, clear: [f64; 4]) -> Result<(), GpuError> {
        if self.frame.is_some() {
            return Err(GpuError::InvalidCommand("frame already begun".into()));
        }
        let (output, view) = self.acquire()?;
        let encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Render Encoder"),
            });
        let [r, g, b, a] = clear;
        self.frame = Some(Frame {
            encoder,
            output,
            view,
            clear: Some(wgpu::Color { r, g, b, a }),
            draws: Vec::new(),
        });
        Ok(())
    }

    fn end_frame(&mut self) -> Result<(), GpuError> {
        let mut frame = self
            .frame
            .take()
            .ok_or_else(|| GpuError::InvalidCommand("end_frame without begin_frame".into()))?;
        let flushed = self.flush_draws(&mut frame);
        self.queue.submit(std::iter::once(frame.encoder.finish()));
        if let Some(output) = frame.output {
            output.present();
        }
        flushed
    }

    fn viewport(&self) -> (u32, u32) {
        self.size
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.size = (width, height);
        if let Some(target) = &mut self.window {
            target.config.width = width;
            target.config.height = height;
            target.surface.configure(&self.device, &target.config);
        }
        if self.offscreen.is_some() {
            self.offscreen = Some(create_offscreen_texture(&self.device, self.size));
        }
        self.depth = create_depth_texture(&self.device, self.size);
    }

    fn poll_error(&mut self) -> Option<ErrorReport> {
        self.errors.lock().ok()?.pop_front()
    }
}

async fn request_device(adapter: &wgpu::Adapter) -> Result<(wgpu::Device, wgpu::Queue), GpuError> {
    let (device, queue) = adapter
        .request_device(
            &wgpu::DeviceDescriptor {
                label: Some("Device"),
                required_features: wgpu::Features::empty(),
                // One storage buffer per attribute on each side of the ping-pong.
                required_limits: adapter.limits(),
                memory_hints: Default::default(),
            },
            None,
        )
        .await?;
    Ok((device, queue))
}

fn classify(error: &wgpu::Error) -> FaultCode {
    match error {
        wgpu::Error::OutOfMemory { .. } => FaultCode::OutOfMemory,
        wgpu::Error::Validation { .. } => FaultCode::Validation,
        _ => FaultCode::Internal,
    }
}

fn layout_entry(binding: &GlobalBinding, visibility: wgpu::ShaderStages) -> wgpu::BindGroupLayoutEntry {
    let ty = match binding.class {
        ResourceClass::Uniform => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        ResourceClass::Storage { writable, .. } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only: !writable },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        ResourceClass::Texture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        ResourceClass::Sampler => wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
    };
    wgpu::BindGroupLayoutEntry {
        binding: binding.binding,
        visibility,
        ty,
        count: None,
    }
}

/// Bind group entries for every used storage binding, taken from `bindings`.
fn storage_entries<'a, 'b>(
    buffers: &'a HashMap<BufferHandle, GpuBuffer>,
    used: impl Iterator<Item = &'b GlobalBinding>,
    bindings: &[VertexBinding],
) -> Result<Vec<wgpu::BindGroupEntry<'a>>, GpuError> {
    used.map(|global| {
        let location = Location::Binding {
            group: global.group,
            binding: global.binding,
        };
        let handle = bindings
            .iter()
            .find(|b| b.location == location)
            .map(|b| b.buffer)
            .ok_or_else(|| GpuError::InvalidCommand(format!("`{}` has no buffer bound", global.name)))?;
        let gpu = buffers.get(&handle).ok_or(GpuError::UnknownHandle {
            kind: "buffer",
            id: handle.0,
        })?;
        Ok(wgpu::BindGroupEntry {
            binding: global.binding,
            resource: gpu.buffer.as_entire_binding(),
        })
    })
    .collect()
}

fn create_texture(device: &wgpu::Device, queue: &wgpu::Queue, config: &TextureConfig) -> GpuTexture {
    let texture = device.create_texture_with_data(
        queue,
        &wgpu::TextureDescriptor {
            label: Some("Texture"),
            size: wgpu::Extent3d {
                width: config.width,
                height: config.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8UnormSrgb,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        },
        wgpu::util::TextureDataOrder::LayerMajor,
        &config.data,
    );
    let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
    let filter = config.filter.to_wgpu();
    let address = config.address_mode.to_wgpu();
    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("Texture Sampler"),
        address_mode_u: address,
        address_mode_v: address,
        address_mode_w: address,
        mag_filter: filter,
        min_filter: filter,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    });
    GpuTexture { view, sampler }
}

fn create_depth_texture(device: &wgpu::Device, (width, height): (u32, u32)) -> wgpu::TextureView {
    let texture = device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Depth Texture"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: DEPTH_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
        view_formats: &[],
    });
    texture.create_view(&wgpu::TextureViewDescriptor::default())
}

fn create_offscreen_texture(device: &wgpu::Device, (width, height): (u32, u32)) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Offscreen Target"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format: OFFSCREEN_FORMAT,
        usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        view_formats: &[],
    })
}

fn align4(size: u64) -> u64 {
    size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align4_rounds_up() {
        assert_eq!(align4(0), 0);
        assert_eq!(align4(1), 4);
        assert_eq!(align4(12), 12);
        assert_eq!(align4(13), 16);
    }

    #[test]
    fn test_layout_entry_maps_resource_classes() {
        let binding = |class| GlobalBinding {
            name: "x".into(),
            group: 0,
            binding: 3,
            class,
            size: 4,
            used: true,
        };
        let uniform = layout_entry(&binding(ResourceClass::Uniform), wgpu::ShaderStages::COMPUTE);
        assert_eq!(uniform.binding, 3);
        assert!(matches!(
            uniform.ty,
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                ..
            }
        ));
        let sampler = layout_entry(&binding(ResourceClass::Sampler), wgpu::ShaderStages::FRAGMENT);
        assert!(matches!(
            sampler.ty,
            wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)
        ));
    }
}
