//! Variable model: typed shader variables and their device-side behavior.
//!
//! Every variable owns its declaration, the location it resolved to once a
//! program exists, and the upload/download rules of its kind:
//!
//! | Kind | Qualifier | Device storage | Host uploads |
//! |------|-----------|----------------|--------------|
//! | [`Uniform`] | `uniform` | one small uniform slot | yes, value-diffed |
//! | [`InputAttribute`] | `in` | one buffer | yes, whole buffer |
//! | [`OutputAttribute`] | `out` | one buffer | never (device-written) |
//! | [`FeedbackAttribute`] | `inout` | buffer pair | input buffer only |
//!
//! Variables are plain data until a [`Program`] is built; binding resolves
//! their locations and flushes any value stored in the meantime.

use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::context::{BufferHandle, BufferUsage, GraphicsContext, Location, TextureHandle};
use crate::error::{EngineError, LocationNotFound};
use crate::program::Program;
use crate::shader::Declaration;

/// Storage qualifier of a variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Qualifier {
    Uniform,
    In,
    Out,
    /// Read as input, captured as `<name>Out`.
    InOut,
}

impl Qualifier {
    pub fn keyword(&self) -> &'static str {
        match self {
            Qualifier::Uniform => "uniform",
            Qualifier::In => "in",
            Qualifier::Out => "out",
            Qualifier::InOut => "inout",
        }
    }
}

/// Scalar component kind of a variable or attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    Float,
    Sint,
    Uint,
}

/// Shader type of a variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VarType {
    F32,
    I32,
    U32,
    Vec2,
    Vec3,
    Vec4,
    Mat4,
    /// A sampled 2D texture; declares `<name>` and `<name>_sampler`.
    Texture2d,
}

impl VarType {
    /// Get the WGSL type name.
    pub fn wgsl(&self) -> &'static str {
        match self {
            VarType::F32 => "f32",
            VarType::I32 => "i32",
            VarType::U32 => "u32",
            VarType::Vec2 => "vec2<f32>",
            VarType::Vec3 => "vec3<f32>",
            VarType::Vec4 => "vec4<f32>",
            VarType::Mat4 => "mat4x4<f32>",
            VarType::Texture2d => "texture_2d<f32>",
        }
    }

    /// Number of 32-bit components in one value.
    pub fn components(&self) -> usize {
        match self {
            VarType::F32 | VarType::I32 | VarType::U32 => 1,
            VarType::Vec2 => 2,
            VarType::Vec3 => 3,
            VarType::Vec4 => 4,
            VarType::Mat4 => 16,
            VarType::Texture2d => 0,
        }
    }

    pub fn scalar_kind(&self) -> Option<ScalarKind> {
        match self {
            VarType::I32 => Some(ScalarKind::Sint),
            VarType::U32 => Some(ScalarKind::Uint),
            VarType::Texture2d => None,
            _ => Some(ScalarKind::Float),
        }
    }

    /// Whether the type can back a per-entity attribute.
    pub fn is_attribute(&self) -> bool {
        !matches!(self, VarType::Mat4 | VarType::Texture2d)
    }

    /// Words between consecutive elements of a storage array.
    ///
    /// `vec3<f32>` is padded to 16 bytes.
    pub fn stride_words(&self) -> usize {
        match self {
            VarType::Vec3 => 4,
            other => other.components(),
        }
    }

    /// Bytes per element in device attribute buffers.
    pub fn stride_bytes(&self) -> u64 {
        self.stride_words() as u64 * 4
    }

    /// Binding slots a uniform of this type occupies.
    pub(crate) fn binding_slots(&self) -> u32 {
        match self {
            VarType::Texture2d => 2,
            _ => 1,
        }
    }
}

/// A uniform payload.
///
/// Equality is strict: an upload is skipped only when the new value compares
/// equal to the last uploaded one.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    F32(f32),
    I32(i32),
    U32(u32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
    Texture(TextureHandle),
}

impl Value {
    pub fn var_type(&self) -> VarType {
        match self {
            Value::F32(_) => VarType::F32,
            Value::I32(_) => VarType::I32,
            Value::U32(_) => VarType::U32,
            Value::Vec2(_) => VarType::Vec2,
            Value::Vec3(_) => VarType::Vec3,
            Value::Vec4(_) => VarType::Vec4,
            Value::Mat4(_) => VarType::Mat4,
            Value::Texture(_) => VarType::Texture2d,
        }
    }

    /// Zero value of a type. Textures default to the null handle.
    pub fn zero(ty: VarType) -> Self {
        match ty {
            VarType::F32 => Value::F32(0.0),
            VarType::I32 => Value::I32(0),
            VarType::U32 => Value::U32(0),
            VarType::Vec2 => Value::Vec2(Vec2::ZERO),
            VarType::Vec3 => Value::Vec3(Vec3::ZERO),
            VarType::Vec4 => Value::Vec4(Vec4::ZERO),
            VarType::Mat4 => Value::Mat4(Mat4::ZERO),
            VarType::Texture2d => Value::Texture(TextureHandle::NULL),
        }
    }

    /// Little-endian payload in uniform layout. Textures have no payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::F32(v) => v.to_le_bytes().to_vec(),
            Value::I32(v) => v.to_le_bytes().to_vec(),
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::Vec2(v) => bytemuck::cast_slice(&v.to_array()).to_vec(),
            Value::Vec3(v) => bytemuck::cast_slice(&v.to_array()).to_vec(),
            Value::Vec4(v) => bytemuck::cast_slice(&v.to_array()).to_vec(),
            Value::Mat4(m) => bytemuck::cast_slice(&m.to_cols_array()).to_vec(),
            Value::Texture(_) => Vec::new(),
        }
    }

    /// Decode a payload previously produced by [`Value::to_bytes`].
    pub fn from_bytes(ty: VarType, bytes: &[u8]) -> Option<Self> {
        if ty == VarType::Texture2d || bytes.len() < ty.components() * 4 {
            return None;
        }
        let words: Vec<u32> = bytemuck::pod_collect_to_vec(&bytes[..ty.components() * 4]);
        let f = |i: usize| f32::from_bits(words[i]);
        Some(match ty {
            VarType::F32 => Value::F32(f(0)),
            VarType::I32 => Value::I32(words[0] as i32),
            VarType::U32 => Value::U32(words[0]),
            VarType::Vec2 => Value::Vec2(Vec2::new(f(0), f(1))),
            VarType::Vec3 => Value::Vec3(Vec3::new(f(0), f(1), f(2))),
            VarType::Vec4 => Value::Vec4(Vec4::new(f(0), f(1), f(2), f(3))),
            VarType::Mat4 => {
                let cols: Vec<f32> = words.iter().map(|w| f32::from_bits(*w)).collect();
                Value::Mat4(Mat4::from_cols_slice(&cols))
            }
            VarType::Texture2d => return None,
        })
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<Vec2> for Value {
    fn from(v: Vec2) -> Self {
        Value::Vec2(v)
    }
}

impl From<Vec3> for Value {
    fn from(v: Vec3) -> Self {
        Value::Vec3(v)
    }
}

impl From<Vec4> for Value {
    fn from(v: Vec4) -> Self {
        Value::Vec4(v)
    }
}

impl From<Mat4> for Value {
    fn from(v: Mat4) -> Self {
        Value::Mat4(v)
    }
}

impl From<TextureHandle> for Value {
    fn from(v: TextureHandle) -> Self {
        Value::Texture(v)
    }
}

/// Per-entity host data for an attribute, flattened component-wise.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeData {
    F32(Vec<f32>),
    I32(Vec<i32>),
    U32(Vec<u32>),
}

impl AttributeData {
    /// Zeroed data for `count` entities of type `ty`.
    pub fn zeroed(ty: VarType, count: usize) -> Self {
        let len = ty.components() * count;
        match ty.scalar_kind() {
            Some(ScalarKind::Sint) => AttributeData::I32(vec![0; len]),
            Some(ScalarKind::Uint) => AttributeData::U32(vec![0; len]),
            _ => AttributeData::F32(vec![0.0; len]),
        }
    }

    pub fn scalar_kind(&self) -> ScalarKind {
        match self {
            AttributeData::F32(_) => ScalarKind::Float,
            AttributeData::I32(_) => ScalarKind::Sint,
            AttributeData::U32(_) => ScalarKind::Uint,
        }
    }

    /// Number of scalar components stored.
    pub fn len(&self) -> usize {
        match self {
            AttributeData::F32(v) => v.len(),
            AttributeData::I32(v) => v.len(),
            AttributeData::U32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match self {
            AttributeData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<&[u32]> {
        match self {
            AttributeData::U32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match self {
            AttributeData::I32(v) => Some(v),
            _ => None,
        }
    }

    fn word(&self, i: usize) -> u32 {
        match self {
            AttributeData::F32(v) => v[i].to_bits(),
            AttributeData::I32(v) => v[i] as u32,
            AttributeData::U32(v) => v[i],
        }
    }

    /// Check that this data fits an attribute of type `ty` with `capacity`
    /// entities. Returns the number of entities it describes.
    pub(crate) fn validate(
        &self,
        name: &str,
        ty: VarType,
        capacity: u32,
    ) -> Result<usize, EngineError> {
        let found = scalar_type(self.scalar_kind(), ty.components());
        if !ty.is_attribute() || ty.scalar_kind() != Some(self.scalar_kind()) {
            return Err(EngineError::TypeMismatch {
                name: name.to_string(),
                expected: ty,
                found,
            });
        }
        let components = ty.components();
        let max = components * capacity as usize;
        if self.len() % components != 0 || self.len() > max {
            return Err(EngineError::DataLength {
                name: name.to_string(),
                expected: max,
                found: self.len(),
            });
        }
        Ok(self.len() / components)
    }

    /// Pack into device layout for `capacity` entities, zero-filling the rest.
    pub(crate) fn pack(&self, ty: VarType, capacity: u32) -> Vec<u8> {
        let components = ty.components();
        let stride = ty.stride_words();
        let entities = self.len() / components.max(1);
        let mut words = vec![0u32; stride * capacity as usize];
        for entity in 0..entities.min(capacity as usize) {
            for c in 0..components {
                words[entity * stride + c] = self.word(entity * components + c);
            }
        }
        bytemuck::cast_slice(&words).to_vec()
    }

    /// Unpack `count` entities of type `ty` from device layout.
    pub(crate) fn unpack(ty: VarType, bytes: &[u8], count: usize) -> Self {
        let words: Vec<u32> = bytemuck::pod_collect_to_vec(bytes);
        let components = ty.components();
        let stride = ty.stride_words();
        let mut flat = Vec::with_capacity(count * components);
        for entity in 0..count {
            for c in 0..components {
                flat.push(words.get(entity * stride + c).copied().unwrap_or(0));
            }
        }
        match ty.scalar_kind() {
            Some(ScalarKind::Sint) => {
                AttributeData::I32(flat.into_iter().map(|w| w as i32).collect())
            }
            Some(ScalarKind::Uint) => AttributeData::U32(flat),
            _ => AttributeData::F32(flat.into_iter().map(f32::from_bits).collect()),
        }
    }
}

fn scalar_type(kind: ScalarKind, components: usize) -> VarType {
    match (kind, components) {
        (ScalarKind::Sint, _) => VarType::I32,
        (ScalarKind::Uint, _) => VarType::U32,
        (ScalarKind::Float, 2) => VarType::Vec2,
        (ScalarKind::Float, 3) => VarType::Vec3,
        (ScalarKind::Float, 4) => VarType::Vec4,
        (ScalarKind::Float, _) => VarType::F32,
    }
}

impl From<Vec<f32>> for AttributeData {
    fn from(v: Vec<f32>) -> Self {
        AttributeData::F32(v)
    }
}

impl From<&[f32]> for AttributeData {
    fn from(v: &[f32]) -> Self {
        AttributeData::F32(v.to_vec())
    }
}

impl From<Vec<i32>> for AttributeData {
    fn from(v: Vec<i32>) -> Self {
        AttributeData::I32(v)
    }
}

impl From<Vec<u32>> for AttributeData {
    fn from(v: Vec<u32>) -> Self {
        AttributeData::U32(v)
    }
}

impl From<Vec<Vec2>> for AttributeData {
    fn from(v: Vec<Vec2>) -> Self {
        AttributeData::F32(v.iter().flat_map(|x| x.to_array()).collect())
    }
}

impl From<Vec<Vec3>> for AttributeData {
    fn from(v: Vec<Vec3>) -> Self {
        AttributeData::F32(v.iter().flat_map(|x| x.to_array()).collect())
    }
}

impl From<Vec<Vec4>> for AttributeData {
    fn from(v: Vec<Vec4>) -> Self {
        AttributeData::F32(v.iter().flat_map(|x| x.to_array()).collect())
    }
}

/// What a variable kind can do on the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// Host code may write its value.
    pub uploadable: bool,
    /// Backed by exactly one device buffer.
    pub single_buffer_backed: bool,
    /// Backed by an input/output buffer pair.
    pub double_buffer_backed: bool,
}

/// The closed set of variable kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VariableKind {
    Uniform,
    Input,
    Output,
    Feedback,
}

impl VariableKind {
    pub const ALL: [VariableKind; 4] = [
        VariableKind::Uniform,
        VariableKind::Input,
        VariableKind::Output,
        VariableKind::Feedback,
    ];

    pub const fn capabilities(self) -> Capabilities {
        match self {
            VariableKind::Uniform => Capabilities {
                uploadable: true,
                single_buffer_backed: false,
                double_buffer_backed: false,
            },
            VariableKind::Input => Capabilities {
                uploadable: true,
                single_buffer_backed: true,
                double_buffer_backed: false,
            },
            VariableKind::Output => Capabilities {
                uploadable: false,
                single_buffer_backed: true,
                double_buffer_backed: false,
            },
            VariableKind::Feedback => Capabilities {
                uploadable: true,
                single_buffer_backed: false,
                double_buffer_backed: true,
            },
        }
    }

    pub const fn qualifier(self) -> Qualifier {
        match self {
            VariableKind::Uniform => Qualifier::Uniform,
            VariableKind::Input => Qualifier::In,
            VariableKind::Output => Qualifier::Out,
            VariableKind::Feedback => Qualifier::InOut,
        }
    }
}

/// Check that `name` can be used as a shader identifier.
pub fn validate_name(name: &str) -> Result<(), EngineError> {
    const RESERVED: &[&str] = &[
        "index", "fn", "let", "var", "const", "struct", "return", "if", "else", "loop", "for",
        "while", "break", "continue", "true", "false", "main", "in", "out", "target", "type",
        "mod", "self", "set", "filter", "match", "pass", "mut", "move", "static", "ref",
        "alias", "override", "enable", "requires", "diagnostic", "discard", "switch", "case",
        "default", "continuing", "const_assert", "ptr",
        // types
        "bool", "f16", "f32", "i32", "u32", "array", "atomic", "vec2", "vec3", "vec4",
        "mat2x2", "mat2x3", "mat2x4", "mat3x2", "mat3x3", "mat3x4", "mat4x2", "mat4x3", "mat4x4",
        "sampler", "sampler_comparison", "texture_1d", "texture_2d", "texture_2d_array",
        "texture_3d", "texture_cube", "texture_depth_2d", "texture_storage_2d",
    ];
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !head_ok || !tail_ok || name.starts_with("__") || RESERVED.contains(&name) {
        return Err(EngineError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// A constant-per-draw parameter.
#[derive(Clone, Debug)]
pub struct Uniform {
    name: String,
    ty: VarType,
    slot: u32,
    value: Value,
    uploaded: Option<Value>,
    binding: Option<(crate::context::ProgramHandle, Location)>,
    uploads: u64,
}

impl Uniform {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            name: name.into(),
            ty: value.var_type(),
            slot: 0,
            value,
            uploaded: None,
            binding: None,
            uploads: 0,
        }
    }

    pub(crate) fn set_slot(&mut self, slot: u32) {
        self.slot = slot;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn var_type(&self) -> VarType {
        self.ty
    }

    pub fn value(&self) -> Value {
        self.value
    }

    pub fn location(&self) -> Option<Location> {
        self.binding.map(|(_, location)| location)
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    /// Whether the stored value differs from the last uploaded one.
    pub fn is_dirty(&self) -> bool {
        self.uploaded != Some(self.value)
    }

    /// Number of device uploads performed so far.
    pub fn upload_count(&self) -> u64 {
        self.uploads
    }

    pub fn declaration(&self) -> Declaration {
        Declaration::new(Qualifier::Uniform, &self.name, self.ty, self.slot)
    }

    /// Store a new value. It reaches the device on the next [`Uniform::upload`].
    pub fn set(&mut self, value: impl Into<Value>) -> Result<(), EngineError> {
        let value = value.into();
        if value.var_type() != self.ty {
            return Err(EngineError::TypeMismatch {
                name: self.name.clone(),
                expected: self.ty,
                found: value.var_type(),
            });
        }
        self.value = value;
        Ok(())
    }

    /// Resolve this uniform against `program` and flush the pending value.
    pub fn bind<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        program: &mut Program,
    ) -> Result<Location, EngineError> {
        let location = program.locate(ctx, &self.name)?;
        self.binding = Some((program.handle(), location));
        self.uploaded = None;
        self.upload(ctx)?;
        Ok(location)
    }

    /// Write the value to the device if bound and changed.
    ///
    /// Returns whether an upload was issued.
    pub fn upload<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) -> Result<bool, EngineError> {
        let Some((program, location)) = self.binding else {
            return Ok(false);
        };
        if self.uploaded == Some(self.value) {
            return Ok(false);
        }
        match self.value {
            Value::Texture(texture) => ctx.bind_texture(program, location, texture)?,
            value => ctx.upload_uniform(program, location, &value.to_bytes())?,
        }
        self.uploaded = Some(self.value);
        self.uploads += 1;
        Ok(true)
    }

    /// Read the uploaded payload back from the device.
    pub fn download<C: GraphicsContext + ?Sized>(&self, ctx: &mut C) -> Result<Value, EngineError> {
        let Some((program, location)) = self.binding else {
            return Err(LocationNotFound {
                program: String::from("<unbound>"),
                name: self.name.clone(),
            }
            .into());
        };
        if let Value::Texture(_) = self.value {
            return Ok(self.uploaded.unwrap_or(self.value));
        }
        let bytes = ctx.read_uniform(program, location)?;
        Value::from_bytes(self.ty, &bytes).ok_or_else(|| {
            EngineError::DataLength {
                name: self.name.clone(),
                expected: self.ty.components() * 4,
                found: bytes.len(),
            }
        })
    }

    pub(crate) fn unbind(&mut self) {
        self.binding = None;
        self.uploaded = None;
    }
}

/// Per-entity data supplied from one device buffer.
#[derive(Clone, Debug)]
pub struct InputAttribute {
    name: String,
    ty: VarType,
    slot: u32,
    data: AttributeData,
    buffer: Option<BufferHandle>,
    location: Option<Location>,
    capacity: u32,
}

impl InputAttribute {
    pub fn new(
        name: impl Into<String>,
        ty: VarType,
        data: impl Into<AttributeData>,
        capacity: u32,
    ) -> Result<Self, EngineError> {
        let name = name.into();
        let data = data.into();
        data.validate(&name, ty, capacity)?;
        Ok(Self {
            name,
            ty,
            slot: 0,
            data,
            buffer: None,
            location: None,
            capacity,
        })
    }

    pub(crate) fn set_slot(&mut self, slot: u32) {
        self.slot = slot;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn var_type(&self) -> VarType {
        self.ty
    }

    pub fn data(&self) -> &AttributeData {
        &self.data
    }

    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    pub fn location(&self) -> Option<Location> {
        self.location
    }

    pub fn declaration(&self) -> Declaration {
        Declaration::new(Qualifier::In, &self.name, self.ty, self.slot)
    }

    /// Create the device buffer and upload the current data.
    pub fn allocate<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) -> Result<BufferHandle, EngineError> {
        let size = self.ty.stride_bytes() * self.capacity as u64;
        let buffer = ctx.create_buffer(&self.name, size, BufferUsage::Dynamic)?;
        self.buffer = Some(buffer);
        ctx.write_buffer(buffer, 0, &self.data.pack(self.ty, self.capacity))?;
        Ok(buffer)
    }

    pub fn bind<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &C,
        program: &mut Program,
    ) -> Result<Location, LocationNotFound> {
        let location = program.locate(ctx, &self.name)?;
        self.location = Some(location);
        Ok(location)
    }

    /// Replace the value array; re-uploads the whole buffer when allocated.
    pub fn set_data<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        data: impl Into<AttributeData>,
    ) -> Result<(), EngineError> {
        let data = data.into();
        data.validate(&self.name, self.ty, self.capacity)?;
        self.data = data;
        if let Some(buffer) = self.buffer {
            ctx.write_buffer(buffer, 0, &self.data.pack(self.ty, self.capacity))?;
        }
        Ok(())
    }

    pub(crate) fn release<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) {
        if let Some(buffer) = self.buffer.take() {
            ctx.destroy_buffer(buffer);
        }
        self.location = None;
    }
}

/// A captured output with no host-side input.
#[derive(Clone, Debug)]
pub struct OutputAttribute {
    name: String,
    ty: VarType,
    slot: u32,
    buffer: Option<BufferHandle>,
    location: Option<Location>,
    capacity: u32,
}

impl OutputAttribute {
    pub fn new(name: impl Into<String>, ty: VarType, capacity: u32) -> Result<Self, EngineError> {
        let name = name.into();
        if !ty.is_attribute() {
            return Err(EngineError::TypeMismatch {
                name,
                expected: VarType::Vec4,
                found: ty,
            });
        }
        Ok(Self {
            name,
            ty,
            slot: 0,
            buffer: None,
            location: None,
            capacity,
        })
    }

    pub(crate) fn set_slot(&mut self, slot: u32) {
        self.slot = slot;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn var_type(&self) -> VarType {
        self.ty
    }

    pub fn buffer(&self) -> Option<BufferHandle> {
        self.buffer
    }

    pub fn location(&self) -> Option<Location> {
        self.location
    }

    pub fn declaration(&self) -> Declaration {
        Declaration::new(Qualifier::Out, &self.name, self.ty, self.slot)
    }

    pub fn allocate<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) -> Result<BufferHandle, EngineError> {
        let size = self.ty.stride_bytes() * self.capacity as u64;
        let buffer = ctx.create_buffer(&self.name, size, BufferUsage::Capture)?;
        self.buffer = Some(buffer);
        Ok(buffer)
    }

    pub fn bind<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &C,
        program: &mut Program,
    ) -> Result<Location, LocationNotFound> {
        let location = program.locate(ctx, &self.name)?;
        self.location = Some(location);
        Ok(location)
    }

    /// Read the last captured values of the first `count` entities.
    pub fn read<C: GraphicsContext + ?Sized>(&self, ctx: &mut C, count: u32) -> Result<AttributeData, EngineError> {
        let buffer = self.buffer.ok_or(EngineError::UnknownVariable(self.name.clone()))?;
        let bytes = ctx.read_buffer(buffer)?;
        Ok(AttributeData::unpack(self.ty, &bytes, count as usize))
    }

    pub(crate) fn release<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) {
        if let Some(buffer) = self.buffer.take() {
            ctx.destroy_buffer(buffer);
        }
        self.location = None;
    }
}

/// The two buffers behind a feedback attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferPair {
    /// Read by the next capture draw and by the render pass.
    pub input: BufferHandle,
    /// Written by the device during a capture draw.
    pub output: BufferHandle,
}

impl BufferPair {
    /// Exchange roles. Handles move; buffer contents do not.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.input, &mut self.output);
    }
}

/// A simulated per-entity field: read as `<name>`, captured as `<name>Out`.
#[derive(Clone, Debug)]
pub struct FeedbackAttribute {
    name: String,
    output_name: String,
    ty: VarType,
    slot: u32,
    initial: AttributeData,
    pair: Option<BufferPair>,
    input_location: Option<Location>,
    output_location: Option<Location>,
    capacity: u32,
}

impl FeedbackAttribute {
    pub fn new(
        name: impl Into<String>,
        ty: VarType,
        initial: impl Into<AttributeData>,
        capacity: u32,
    ) -> Result<Self, EngineError> {
        let name = name.into();
        let initial = initial.into();
        initial.validate(&name, ty, capacity)?;
        Ok(Self {
            output_name: format!("{name}Out"),
            name,
            ty,
            slot: 0,
            initial,
            pair: None,
            input_location: None,
            output_location: None,
            capacity,
        })
    }

    pub(crate) fn set_slot(&mut self, slot: u32) {
        self.slot = slot;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the synthesized captured output.
    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    pub fn var_type(&self) -> VarType {
        self.ty
    }

    pub fn buffers(&self) -> Option<BufferPair> {
        self.pair
    }

    pub fn input_location(&self) -> Option<Location> {
        self.input_location
    }

    pub fn output_location(&self) -> Option<Location> {
        self.output_location
    }

    /// The input declaration followed by the synthesized output declaration.
    pub fn declarations(&self) -> [Declaration; 2] {
        [
            Declaration::new(Qualifier::In, &self.name, self.ty, self.slot),
            Declaration::new(Qualifier::Out, &self.output_name, self.ty, self.slot),
        ]
    }

    /// Create both buffers and seed the input buffer.
    pub fn allocate<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) -> Result<BufferPair, EngineError> {
        let size = self.ty.stride_bytes() * self.capacity as u64;
        let input = ctx.create_buffer(&format!("{} A", self.name), size, BufferUsage::Dynamic)?;
        let output = match ctx.create_buffer(&format!("{} B", self.name), size, BufferUsage::Capture) {
            Ok(buffer) => buffer,
            Err(e) => {
                ctx.destroy_buffer(input);
                return Err(e.into());
            }
        };
        let pair = BufferPair { input, output };
        self.pair = Some(pair);
        ctx.write_buffer(input, 0, &self.initial.pack(self.ty, self.capacity))?;
        Ok(pair)
    }

    /// Resolve the input and captured-output locations.
    pub fn bind<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &C,
        program: &mut Program,
    ) -> Result<(Location, Location), LocationNotFound> {
        let input = program.locate(ctx, &self.name);
        let output = program.locate(ctx, &self.output_name);
        self.input_location = input.as_ref().ok().copied();
        self.output_location = output.as_ref().ok().copied();
        Ok((input?, output?))
    }

    /// Upload host data into the input buffer.
    pub fn upload<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        data: impl Into<AttributeData>,
    ) -> Result<(), EngineError> {
        let data = data.into();
        data.validate(&self.name, self.ty, self.capacity)?;
        if let Some(pair) = self.pair {
            ctx.write_buffer(pair.input, 0, &data.pack(self.ty, self.capacity))?;
        }
        self.initial = data;
        Ok(())
    }

    /// Exchange the input and output buffers.
    pub fn swap(&mut self) {
        if let Some(pair) = self.pair.as_mut() {
            pair.swap();
        }
    }

    /// Read the current state (the input buffer) of the first `count` entities.
    pub fn download<C: GraphicsContext + ?Sized>(&self, ctx: &mut C, count: u32) -> Result<AttributeData, EngineError> {
        let pair = self.pair.ok_or(EngineError::UnknownVariable(self.name.clone()))?;
        let bytes = ctx.read_buffer(pair.input)?;
        Ok(AttributeData::unpack(self.ty, &bytes, count as usize))
    }

    pub(crate) fn release<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) {
        if let Some(pair) = self.pair.take() {
            ctx.destroy_buffer(pair.input);
            ctx.destroy_buffer(pair.output);
        }
        self.input_location = None;
        self.output_location = None;
    }
}

/// Any declared variable.
#[derive(Clone, Debug)]
pub enum Variable {
    Uniform(Uniform),
    Input(InputAttribute),
    Output(OutputAttribute),
    Feedback(FeedbackAttribute),
}

impl Variable {
    pub fn kind(&self) -> VariableKind {
        match self {
            Variable::Uniform(_) => VariableKind::Uniform,
            Variable::Input(_) => VariableKind::Input,
            Variable::Output(_) => VariableKind::Output,
            Variable::Feedback(_) => VariableKind::Feedback,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Variable::Uniform(v) => v.name(),
            Variable::Input(v) => v.name(),
            Variable::Output(v) => v.name(),
            Variable::Feedback(v) => v.name(),
        }
    }

    pub fn var_type(&self) -> VarType {
        match self {
            Variable::Uniform(v) => v.var_type(),
            Variable::Input(v) => v.var_type(),
            Variable::Output(v) => v.var_type(),
            Variable::Feedback(v) => v.var_type(),
        }
    }

    /// Names this variable occupies in a program.
    pub fn declared_names(&self) -> Vec<&str> {
        match self {
            Variable::Feedback(v) => vec![v.name(), v.output_name()],
            other => vec![other.name()],
        }
    }

    pub fn declarations(&self) -> Vec<Declaration> {
        match self {
            Variable::Uniform(v) => vec![v.declaration()],
            Variable::Input(v) => vec![v.declaration()],
            Variable::Output(v) => vec![v.declaration()],
            Variable::Feedback(v) => v.declarations().to_vec(),
        }
    }

    /// Create the device buffers the kind needs. Uniforms own none.
    pub fn allocate<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) -> Result<(), EngineError> {
        match self {
            Variable::Uniform(_) => Ok(()),
            Variable::Input(v) => v.allocate(ctx).map(|_| ()),
            Variable::Output(v) => v.allocate(ctx).map(|_| ()),
            Variable::Feedback(v) => v.allocate(ctx).map(|_| ()),
        }
    }

    /// Resolve locations against `program`, flushing pending uniform values.
    pub fn bind<C: GraphicsContext + ?Sized>(
        &mut self,
        ctx: &mut C,
        program: &mut Program,
    ) -> Result<(), EngineError> {
        match self {
            Variable::Uniform(v) => v.bind(ctx, program).map(|_| ()),
            Variable::Input(v) => v.bind(ctx, program).map(|_| ()).map_err(Into::into),
            Variable::Output(v) => v.bind(ctx, program).map(|_| ()).map_err(Into::into),
            Variable::Feedback(v) => v.bind(ctx, program).map(|_| ()).map_err(Into::into),
        }
    }

    /// Release device resources and forget resolved locations.
    pub fn release<C: GraphicsContext + ?Sized>(&mut self, ctx: &mut C) {
        match self {
            Variable::Uniform(v) => v.unbind(),
            Variable::Input(v) => v.release(ctx),
            Variable::Output(v) => v.release(ctx),
            Variable::Feedback(v) => v.release(ctx),
        }
    }

    pub fn as_uniform_mut(&mut self) -> Option<&mut Uniform> {
        match self {
            Variable::Uniform(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_feedback(&self) -> Option<&FeedbackAttribute> {
        match self {
            Variable::Feedback(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_are_exhaustive() {
        for kind in VariableKind::ALL {
            let caps = kind.capabilities();
            assert!(
                !(caps.single_buffer_backed && caps.double_buffer_backed),
                "{kind:?} cannot be backed by one and two buffers"
            );
        }
        assert!(!VariableKind::Output.capabilities().uploadable);
        assert!(VariableKind::Feedback.capabilities().double_buffer_backed);
        assert_eq!(VariableKind::Feedback.qualifier(), Qualifier::InOut);
    }

    #[test]
    fn test_value_round_trip_bytes() {
        let values = [
            Value::F32(1.5),
            Value::I32(-7),
            Value::U32(42),
            Value::Vec3(Vec3::new(1.0, 2.0, 3.0)),
            Value::Mat4(Mat4::from_translation(Vec3::new(4.0, 5.0, 6.0))),
        ];
        for value in values {
            let bytes = value.to_bytes();
            assert_eq!(Value::from_bytes(value.var_type(), &bytes), Some(value));
        }
    }

    #[test]
    fn test_vec3_attribute_packs_to_16_byte_stride() {
        let data = AttributeData::from(vec![Vec3::new(1.0, 2.0, 3.0)]);
        let packed = data.pack(VarType::Vec3, 2);
        assert_eq!(packed.len(), 32);

        let words: Vec<f32> = bytemuck::pod_collect_to_vec(&packed);
        assert_eq!(&words[..4], &[1.0, 2.0, 3.0, 0.0]);
        assert!(words[4..].iter().all(|w| *w == 0.0));

        let back = AttributeData::unpack(VarType::Vec3, &packed, 1);
        assert_eq!(back, data);
    }

    #[test]
    fn test_attribute_validation() {
        let ok = AttributeData::from(vec![0.0f32; 6]);
        assert_eq!(ok.validate("p", VarType::Vec3, 2).ok(), Some(2));

        let too_long = AttributeData::from(vec![0.0f32; 9]);
        assert!(matches!(
            too_long.validate("p", VarType::Vec3, 2),
            Err(EngineError::DataLength { .. })
        ));

        let wrong_kind = AttributeData::from(vec![0u32; 2]);
        assert!(matches!(
            wrong_kind.validate("p", VarType::F32, 2),
            Err(EngineError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_uniform_set_rejects_type_change() {
        let mut u = Uniform::new("speed", 1.0f32);
        assert!(u.set(2.0f32).is_ok());
        assert!(matches!(u.set(3u32), Err(EngineError::TypeMismatch { .. })));
        assert_eq!(u.value(), Value::F32(2.0));
        assert!(u.is_dirty());
    }

    #[test]
    fn test_feedback_declares_synthesized_output() {
        let fb = FeedbackAttribute::new("position", VarType::Vec2, vec![0.0f32; 2], 1).unwrap();
        let [input, output] = fb.declarations();
        assert_eq!(input.name, "position");
        assert_eq!(input.qualifier, Qualifier::In);
        assert_eq!(output.name, "positionOut");
        assert_eq!(output.qualifier, Qualifier::Out);
    }

    #[test]
    fn test_buffer_pair_swap_exchanges_handles() {
        let mut pair = BufferPair {
            input: BufferHandle(1),
            output: BufferHandle(2),
        };
        pair.swap();
        assert_eq!(pair.input, BufferHandle(2));
        assert_eq!(pair.output, BufferHandle(1));
        assert_ne!(pair.input, pair.output);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("velocity").is_ok());
        assert!(validate_name("_mode2").is_ok());
        assert!(validate_name("2fast").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("index").is_err());
        assert!(validate_name("__builtin").is_err());
    }

    #[test]
    fn test_wgsl_type_names_are_rejected_up_front() {
        for name in ["array", "f32", "vec3", "mat4x4", "sampler", "texture_2d", "override"] {
            assert!(
                matches!(validate_name(name), Err(EngineError::InvalidName(ref n)) if n == name),
                "{name} should be rejected"
            );
        }
        assert!(validate_name("vec3_scale").is_ok());
    }
}
