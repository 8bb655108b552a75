//! Error types for TFPE.
//!
//! [`EngineError`] is the taxonomy every engine operation reports through:
//! compile and link failures abort a build, while unresolved locations and
//! device faults are recoverable but always observable.

use std::fmt;

use crate::context::DeviceFault;
use crate::engine::EngineState;
use crate::shader::ShaderStage;
use crate::variable::VarType;

/// Errors raised by a graphics context.
#[derive(Debug)]
pub enum GpuError {
    /// Failed to create a surface for rendering.
    SurfaceCreation(wgpu::CreateSurfaceError),
    /// No compatible GPU adapter found.
    NoAdapter,
    /// Failed to create GPU device.
    DeviceCreation(wgpu::RequestDeviceError),
    /// Failed to map buffer for reading.
    BufferMapping(String),
    /// The surface could not provide a frame.
    Surface(wgpu::SurfaceError),
    /// A handle does not name a live resource of this context.
    UnknownHandle { kind: &'static str, id: u64 },
    /// A command was issued in a state that does not allow it.
    InvalidCommand(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::SurfaceCreation(e) => write!(f, "Failed to create GPU surface: {}", e),
            GpuError::NoAdapter => write!(f, "No compatible GPU adapter found. Ensure your system has a GPU with WebGPU/Vulkan/Metal/DX12 support."),
            GpuError::DeviceCreation(e) => write!(f, "Failed to create GPU device: {}", e),
            GpuError::BufferMapping(msg) => write!(f, "Failed to map GPU buffer: {}", msg),
            GpuError::Surface(e) => write!(f, "Failed to acquire surface frame: {}", e),
            GpuError::UnknownHandle { kind, id } => write!(f, "Unknown {} handle #{}", kind, id),
            GpuError::InvalidCommand(msg) => write!(f, "Invalid device command: {}", msg),
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuError::SurfaceCreation(e) => Some(e),
            GpuError::DeviceCreation(e) => Some(e),
            GpuError::Surface(e) => Some(e),
            _ => None,
        }
    }
}

impl From<wgpu::CreateSurfaceError> for GpuError {
    fn from(e: wgpu::CreateSurfaceError) -> Self {
        GpuError::SurfaceCreation(e)
    }
}

impl From<wgpu::RequestDeviceError> for GpuError {
    fn from(e: wgpu::RequestDeviceError) -> Self {
        GpuError::DeviceCreation(e)
    }
}

impl From<wgpu::SurfaceError> for GpuError {
    fn from(e: wgpu::SurfaceError) -> Self {
        GpuError::Surface(e)
    }
}

/// Errors that can occur during texture loading.
#[derive(Debug)]
pub enum TextureError {
    /// Failed to load image file.
    ImageLoad(image::ImageError),
    /// Failed to read file from disk.
    Io(std::io::Error),
    /// Pixel data does not match the declared dimensions.
    SizeMismatch { expected: usize, found: usize },
}

impl fmt::Display for TextureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextureError::ImageLoad(e) => write!(f, "Failed to load image: {}", e),
            TextureError::Io(e) => write!(f, "Failed to read texture file: {}", e),
            TextureError::SizeMismatch { expected, found } => {
                write!(f, "RGBA data size mismatch: expected {} bytes, found {}", expected, found)
            }
        }
    }
}

impl std::error::Error for TextureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TextureError::ImageLoad(e) => Some(e),
            TextureError::Io(e) => Some(e),
            TextureError::SizeMismatch { .. } => None,
        }
    }
}

impl From<image::ImageError> for TextureError {
    fn from(e: image::ImageError) -> Self {
        TextureError::ImageLoad(e)
    }
}

impl From<std::io::Error> for TextureError {
    fn from(e: std::io::Error) -> Self {
        TextureError::Io(e)
    }
}

/// A declared variable the linked program does not expose.
///
/// Returned whenever a name cannot be resolved to a location, typically
/// because the compiler dropped a variable the shader body never touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationNotFound {
    /// Label of the program the lookup ran against.
    pub program: String,
    /// Name that failed to resolve.
    pub name: String,
}

impl fmt::Display for LocationNotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "`{}` has no location in program '{}' (unused by the shader body?)",
            self.name, self.program
        )
    }
}

impl std::error::Error for LocationNotFound {}

/// Errors reported by the engine and its passes.
#[derive(Debug)]
pub enum EngineError {
    /// A shader stage failed to compile.
    Compile {
        stage: ShaderStage,
        source: String,
        log: String,
    },
    /// Program linking failed.
    Link { program: String, log: String },
    /// A declared variable could not be resolved.
    LocationNotFound(LocationNotFound),
    /// The device reported an error after a state-changing call.
    RuntimeDevice(DeviceFault),
    /// The graphics context failed.
    Gpu(GpuError),
    /// Texture creation failed.
    Texture(TextureError),
    /// More entities were requested than the pool holds.
    CapacityExceeded { requested: u32, capacity: u32 },
    /// An operation was attempted in the wrong lifecycle state.
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },
    /// Two variables share a name.
    DuplicateName(String),
    /// A variable name is not a valid shader identifier.
    InvalidName(String),
    /// A declaration is not allowed in the stage it was added to.
    InvalidDeclaration { name: String, reason: &'static str },
    /// No variable with this name (or path) was declared.
    UnknownVariable(String),
    /// A value does not match the declared type.
    TypeMismatch {
        name: String,
        expected: VarType,
        found: VarType,
    },
    /// Per-entity data has the wrong length.
    DataLength {
        name: String,
        expected: usize,
        found: usize,
    },
    /// The simulation has nothing to simulate.
    NoFeedbackVariables,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Compile { stage, log, .. } => {
                write!(f, "{} stage failed to compile:\n{}", stage.label(), log)
            }
            EngineError::Link { program, log } => {
                write!(f, "Program '{}' failed to link: {}", program, log)
            }
            EngineError::LocationNotFound(e) => write!(f, "{}", e),
            EngineError::RuntimeDevice(fault) => write!(f, "{}", fault),
            EngineError::Gpu(e) => write!(f, "GPU error: {}", e),
            EngineError::Texture(e) => write!(f, "Texture error: {}", e),
            EngineError::CapacityExceeded { requested, capacity } => write!(
                f,
                "Requested {} entities but the pool holds {}",
                requested, capacity
            ),
            EngineError::InvalidState { operation, state } => {
                write!(f, "Cannot {} while the engine is {:?}", operation, state)
            }
            EngineError::DuplicateName(name) => write!(f, "Variable `{}` is declared twice", name),
            EngineError::InvalidName(name) => {
                write!(f, "`{}` is not a valid shader identifier", name)
            }
            EngineError::InvalidDeclaration { name, reason } => {
                write!(f, "Cannot declare `{}`: {}", name, reason)
            }
            EngineError::UnknownVariable(name) => write!(f, "No variable named `{}`", name),
            EngineError::TypeMismatch { name, expected, found } => write!(
                f,
                "`{}` is declared as {} but was given {}",
                name,
                expected.wgsl(),
                found.wgsl()
            ),
            EngineError::DataLength { name, expected, found } => write!(
                f,
                "`{}` expects {} values but was given {}",
                name, expected, found
            ),
            EngineError::NoFeedbackVariables => {
                write!(f, "The simulation declares no feedback variables")
            }
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::LocationNotFound(e) => Some(e),
            EngineError::Gpu(e) => Some(e),
            EngineError::Texture(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GpuError> for EngineError {
    fn from(e: GpuError) -> Self {
        EngineError::Gpu(e)
    }
}

impl From<TextureError> for EngineError {
    fn from(e: TextureError) -> Self {
        EngineError::Texture(e)
    }
}

impl From<LocationNotFound> for EngineError {
    fn from(e: LocationNotFound) -> Self {
        EngineError::LocationNotFound(e)
    }
}

/// Errors that can occur when running a windowed simulation.
#[derive(Debug)]
pub enum SimulationError {
    /// Failed to create event loop.
    EventLoop(winit::error::EventLoopError),
    /// Failed to create window.
    Window(winit::error::OsError),
    /// GPU initialization failed.
    Gpu(GpuError),
    /// The engine could not be set up or built.
    Engine(EngineError),
}

impl fmt::Display for SimulationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimulationError::EventLoop(e) => write!(f, "Failed to create event loop: {}", e),
            SimulationError::Window(e) => write!(f, "Failed to create window: {}", e),
            SimulationError::Gpu(e) => write!(f, "GPU error: {}", e),
            SimulationError::Engine(e) => write!(f, "Engine error: {}", e),
        }
    }
}

impl std::error::Error for SimulationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SimulationError::EventLoop(e) => Some(e),
            SimulationError::Window(e) => Some(e),
            SimulationError::Gpu(e) => Some(e),
            SimulationError::Engine(e) => Some(e),
        }
    }
}

impl From<winit::error::EventLoopError> for SimulationError {
    fn from(e: winit::error::EventLoopError) -> Self {
        SimulationError::EventLoop(e)
    }
}

impl From<winit::error::OsError> for SimulationError {
    fn from(e: winit::error::OsError) -> Self {
        SimulationError::Window(e)
    }
}

impl From<GpuError> for SimulationError {
    fn from(e: GpuError) -> Self {
        SimulationError::Gpu(e)
    }
}

impl From<EngineError> for SimulationError {
    fn from(e: EngineError) -> Self {
        SimulationError::Engine(e)
    }
}
