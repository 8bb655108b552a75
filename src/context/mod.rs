//! The device seam.
//!
//! Engine code never reaches for a global device. Every operation that needs
//! one takes a [`GraphicsContext`], so several engines can run side by side
//! and tests can substitute [`HeadlessContext`] for the real [`WgpuContext`].
//!
//! [`WgpuContext`]: crate::gpu::WgpuContext

mod headless;
pub mod reflect;

use std::fmt;

pub use headless::{CaptureFrame, Command, HeadlessContext, HeadlessStats};

use crate::error::{EngineError, GpuError, LocationNotFound};
use crate::shader::ShaderStage;
use crate::textures::TextureConfig;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// A handle that names nothing.
            pub const NULL: Self = Self(0);

            pub fn is_null(&self) -> bool {
                self.0 == 0
            }
        }
    };
}

handle!(
    /// A device buffer.
    BufferHandle
);
handle!(
    /// A compiled and linked program.
    ProgramHandle
);
handle!(
    /// A vertex-array configuration: buffers bound to program locations.
    VertexArrayHandle
);
handle!(
    /// A sampled texture.
    TextureHandle
);

/// Where a variable lives in a linked program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Location {
    /// A resource binding (uniforms, textures, storage arrays).
    Binding { group: u32, binding: u32 },
    /// A vertex attribute `@location`.
    Attribute(u32),
}

/// A buffer bound to a location inside a vertex-array configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub location: Location,
    pub buffer: BufferHandle,
}

/// Usage hint for a new buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    /// Written once.
    Static,
    /// Replaced frequently from the host.
    Dynamic,
    /// Written by the device during capture.
    Capture,
}

/// Primitive topology of a render program.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Primitive {
    #[default]
    Points,
    Triangles,
}

/// Source of one stage handed to [`GraphicsContext::create_program`].
#[derive(Clone, Debug)]
pub struct StageSource {
    pub stage: ShaderStage,
    pub source: String,
}

/// Everything needed to compile and link a program.
#[derive(Clone, Debug)]
pub struct ProgramDesc {
    pub label: String,
    pub stages: Vec<StageSource>,
    /// Captured output names, in binding order.
    pub captured: Vec<String>,
    pub primitive: Primitive,
}

/// Classified device error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultCode {
    Validation,
    OutOfMemory,
    Internal,
    Lost,
}

/// An error reported by the device, not yet attributed to an operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: FaultCode,
    pub message: String,
}

/// A device error attributed to the call that preceded it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceFault {
    pub operation: &'static str,
    pub code: FaultCode,
    pub message: String,
}

impl DeviceFault {
    pub fn new(operation: &'static str, report: ErrorReport) -> Self {
        Self {
            operation,
            code: report.code,
            message: report.message,
        }
    }
}

impl fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Device reported {:?} after {}: {}",
            self.code, self.operation, self.message
        )
    }
}

impl std::error::Error for DeviceFault {}

/// Command interface the engine issues device work through.
///
/// Commands execute in submission order on a single queue; nothing here is
/// asynchronous from the caller's point of view except that device-side
/// errors surface later through [`GraphicsContext::poll_error`].
pub trait GraphicsContext {
    // Buffers

    fn create_buffer(&mut self, label: &str, size: u64, usage: BufferUsage) -> Result<BufferHandle, GpuError>;

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> Result<(), GpuError>;

    /// Read a whole buffer back to the host, waiting for pending work.
    fn read_buffer(&mut self, buffer: BufferHandle) -> Result<Vec<u8>, GpuError>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    // Programs

    /// Compile every stage and link them. Fails without leaving a program behind.
    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramHandle, EngineError>;

    /// Resolve a declared name to its location in a linked program.
    fn locate(&self, program: ProgramHandle, name: &str) -> Result<Location, LocationNotFound>;

    fn destroy_program(&mut self, program: ProgramHandle);

    // Uniforms and textures

    fn upload_uniform(&mut self, program: ProgramHandle, location: Location, data: &[u8]) -> Result<(), GpuError>;

    fn read_uniform(&mut self, program: ProgramHandle, location: Location) -> Result<Vec<u8>, GpuError>;

    fn create_texture(&mut self, config: &TextureConfig) -> Result<TextureHandle, GpuError>;

    fn bind_texture(&mut self, program: ProgramHandle, location: Location, texture: TextureHandle) -> Result<(), GpuError>;

    // Vertex arrays

    fn create_vertex_array(&mut self, program: ProgramHandle, bindings: &[VertexBinding]) -> Result<VertexArrayHandle, GpuError>;

    fn destroy_vertex_array(&mut self, vao: VertexArrayHandle);

    /// Make `vao` and its program current for the next capture or draw.
    fn bind_vertex_array(&mut self, vao: VertexArrayHandle) -> Result<(), GpuError>;

    // Capture and draw

    /// Route the current program's captured outputs into `targets`.
    fn begin_capture(&mut self, targets: &[VertexBinding]) -> Result<(), GpuError>;

    /// Run the current program over `entities`. Inside a capture this is the
    /// transition dispatch; otherwise it rasterizes `vertices_per_entity`
    /// vertices per entity.
    fn draw(&mut self, vertices_per_entity: u32, entities: u32) -> Result<(), GpuError>;

    fn end_capture(&mut self) -> Result<(), GpuError>;

    // Frames

    fn begin_frame(&mut self, clear: [f64; 4]) -> Result<(), GpuError>;

    fn end_frame(&mut self) -> Result<(), GpuError>;

    fn viewport(&self) -> (u32, u32);

    fn resize(&mut self, width: u32, height: u32);

    /// Pop the oldest device error raised since the last poll.
    fn poll_error(&mut self) -> Option<ErrorReport>;
}
