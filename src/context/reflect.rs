//! Compile, reflect and link WGSL stages with naga.
//!
//! Both contexts share this front-end so compile errors, link errors and
//! unresolved locations behave identically with and without a device.

use std::collections::BTreeMap;

use naga::valid::{Capabilities, ValidationFlags, Validator};

use super::{Location, Primitive, ProgramDesc, StageSource};
use crate::error::{EngineError, LocationNotFound};
use crate::shader::{ShaderStage, CAPTURE_GROUP};
use crate::variable::ScalarKind;

/// Layout of one storage element or vertex attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ElementFormat {
    pub scalar: ScalarKind,
    pub components: u32,
    /// Bytes between consecutive elements.
    pub stride: u32,
}

impl ElementFormat {
    pub fn vertex_format(&self) -> wgpu::VertexFormat {
        use wgpu::VertexFormat as F;
        match (self.scalar, self.components) {
            (ScalarKind::Sint, _) => F::Sint32,
            (ScalarKind::Uint, _) => F::Uint32,
            (ScalarKind::Float, 2) => F::Float32x2,
            (ScalarKind::Float, 3) => F::Float32x3,
            (ScalarKind::Float, 4) => F::Float32x4,
            (ScalarKind::Float, _) => F::Float32,
        }
    }
}

/// What kind of resource a global binding is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceClass {
    Uniform,
    Storage { writable: bool, element: ElementFormat },
    Texture,
    Sampler,
}

/// A module-scope resource of a stage (or, after linking, of a program).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalBinding {
    pub name: String,
    pub group: u32,
    pub binding: u32,
    pub class: ResourceClass,
    /// Size in bytes of the declared type; one element for runtime-sized arrays.
    pub size: u64,
    /// Whether any entry point reads or writes it.
    pub used: bool,
}

/// A `@location` input of a vertex entry point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VertexInput {
    pub name: String,
    pub location: u32,
    pub format: ElementFormat,
}

/// Reflection data of one compiled stage.
#[derive(Clone, Debug, Default)]
pub struct StageReflection {
    pub globals: Vec<GlobalBinding>,
    pub vertex_inputs: Vec<VertexInput>,
    /// `@location`s written (vertex) or read (fragment) across the stage interface.
    pub interface: Vec<u32>,
    pub workgroup_size: [u32; 3],
}

/// A validated stage ready to hand to a device.
#[derive(Debug)]
pub struct CompiledStage {
    pub stage: ShaderStage,
    pub source: String,
    pub module: naga::Module,
    pub reflection: StageReflection,
}

/// Parse and validate one stage, then reflect its interface.
pub fn compile_stage(stage: &StageSource) -> Result<CompiledStage, EngineError> {
    let source = &stage.source;
    let compile_error = |log: String| EngineError::Compile {
        stage: stage.stage,
        source: source.clone(),
        log,
    };

    let module = naga::front::wgsl::parse_str(source).map_err(|e| compile_error(e.emit_to_string(source)))?;
    let info = Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| compile_error(e.emit_to_string(source)))?;

    let entry_name = stage.stage.entry_name();
    let (ep_index, entry) = module
        .entry_points
        .iter()
        .enumerate()
        .find(|(_, ep)| ep.stage == stage.stage.naga() && ep.name == entry_name)
        .ok_or_else(|| {
            compile_error(format!(
                "no {} entry point named `{}`",
                stage.stage.label(),
                entry_name
            ))
        })?;

    let usage = info.get_entry_point(ep_index);
    let mut globals = Vec::new();
    for (handle, var) in module.global_variables.iter() {
        let Some(binding) = var.binding.as_ref() else {
            continue;
        };
        let inner = &module.types[var.ty].inner;
        let class = match var.space {
            naga::AddressSpace::Uniform => ResourceClass::Uniform,
            naga::AddressSpace::Storage { access } => {
                let element = match *inner {
                    naga::TypeInner::Array { base, stride, .. } => {
                        element_format(&module.types[base].inner, Some(stride))
                    }
                    _ => None,
                };
                match element {
                    Some(element) => ResourceClass::Storage {
                        writable: access.contains(naga::StorageAccess::STORE),
                        element,
                    },
                    None => {
                        return Err(compile_error(format!(
                            "storage global `{}` must be an array of scalars or vectors",
                            var.name.as_deref().unwrap_or("?")
                        )))
                    }
                }
            }
            naga::AddressSpace::Handle => match inner {
                naga::TypeInner::Image { .. } => ResourceClass::Texture,
                naga::TypeInner::Sampler { .. } => ResourceClass::Sampler,
                _ => continue,
            },
            _ => continue,
        };
        globals.push(GlobalBinding {
            name: var.name.clone().unwrap_or_default(),
            group: binding.group,
            binding: binding.binding,
            class,
            size: inner.size(module.to_ctx()) as u64,
            used: !usage[handle].is_empty(),
        });
    }

    let mut vertex_inputs = Vec::new();
    let mut interface = Vec::new();
    match stage.stage {
        ShaderStage::Vertex => {
            for arg in &entry.function.arguments {
                if let Some(naga::Binding::Location { location, .. }) = arg.binding {
                    let format = element_format(&module.types[arg.ty].inner, None).ok_or_else(|| {
                        compile_error(format!("vertex input @location({location}) has an unsupported type"))
                    })?;
                    vertex_inputs.push(VertexInput {
                        name: arg.name.clone().unwrap_or_default(),
                        location,
                        format,
                    });
                }
            }
            if let Some(result) = &entry.function.result {
                interface = locations(&module, result.ty, result.binding.as_ref());
            }
        }
        ShaderStage::Fragment => {
            for arg in &entry.function.arguments {
                interface.extend(locations(&module, arg.ty, arg.binding.as_ref()));
            }
        }
        ShaderStage::Transition => {}
    }

    Ok(CompiledStage {
        stage: stage.stage,
        source: source.clone(),
        reflection: StageReflection {
            globals,
            vertex_inputs,
            interface,
            workgroup_size: entry.workgroup_size,
        },
        module,
    })
}

fn element_format(inner: &naga::TypeInner, stride: Option<u32>) -> Option<ElementFormat> {
    let (scalar, components) = match *inner {
        naga::TypeInner::Scalar(scalar) => (scalar, 1),
        naga::TypeInner::Vector { size, scalar } => (scalar, size as u32),
        _ => return None,
    };
    if scalar.width != 4 {
        return None;
    }
    let scalar = match scalar.kind {
        naga::ScalarKind::Float => ScalarKind::Float,
        naga::ScalarKind::Sint => ScalarKind::Sint,
        naga::ScalarKind::Uint => ScalarKind::Uint,
        _ => return None,
    };
    let natural = if components == 3 { 16 } else { components * 4 };
    Some(ElementFormat {
        scalar,
        components,
        stride: stride.unwrap_or(natural),
    })
}

fn locations(module: &naga::Module, ty: naga::Handle<naga::Type>, binding: Option<&naga::Binding>) -> Vec<u32> {
    if let Some(naga::Binding::Location { location, .. }) = binding {
        return vec![*location];
    }
    match &module.types[ty].inner {
        naga::TypeInner::Struct { members, .. } => members
            .iter()
            .filter_map(|m| match m.binding {
                Some(naga::Binding::Location { location, .. }) => Some(location),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// What a linked program runs as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgramKind {
    /// A transition stage dispatched over entities.
    Transition { workgroup_size: u32 },
    /// A vertex/fragment pair.
    Render { primitive: Primitive },
}

/// Program-wide interface after linking.
#[derive(Debug)]
pub struct LinkedProgram {
    pub label: String,
    pub kind: ProgramKind,
    pub stages: Vec<CompiledStage>,
    /// Merged globals, ordered by (group, binding).
    pub bindings: Vec<GlobalBinding>,
    pub vertex_inputs: Vec<VertexInput>,
    pub captured: Vec<String>,
}

impl LinkedProgram {
    pub fn locate(&self, name: &str) -> Result<Location, LocationNotFound> {
        if let Some(b) = self.bindings.iter().find(|b| b.name == name && b.used) {
            return Ok(Location::Binding {
                group: b.group,
                binding: b.binding,
            });
        }
        if let Some(input) = self.vertex_inputs.iter().find(|i| i.name == name) {
            return Ok(Location::Attribute(input.location));
        }
        Err(LocationNotFound {
            program: self.label.clone(),
            name: name.to_string(),
        })
    }

    pub fn binding(&self, location: Location) -> Option<&GlobalBinding> {
        match location {
            Location::Binding { group, binding } => self
                .bindings
                .iter()
                .find(|b| b.group == group && b.binding == binding && b.used),
            Location::Attribute(_) => None,
        }
    }

    pub fn vertex_input(&self, location: u32) -> Option<&VertexInput> {
        self.vertex_inputs.iter().find(|i| i.location == location)
    }

    /// Used bindings of one group.
    pub fn group(&self, group: u32) -> impl Iterator<Item = &GlobalBinding> {
        self.bindings.iter().filter(move |b| b.group == group && b.used)
    }

    pub fn stage(&self, stage: ShaderStage) -> Option<&CompiledStage> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

/// Compile every stage of `desc` and link them into one program.
pub fn build_program(desc: &ProgramDesc) -> Result<LinkedProgram, EngineError> {
    let stages = desc
        .stages
        .iter()
        .map(compile_stage)
        .collect::<Result<Vec<_>, _>>()?;
    link(&desc.label, stages, &desc.captured, desc.primitive)
}

/// Merge stage interfaces and check the captured-output contract.
pub fn link(
    label: &str,
    stages: Vec<CompiledStage>,
    captured: &[String],
    primitive: Primitive,
) -> Result<LinkedProgram, EngineError> {
    let link_error = |log: String| EngineError::Link {
        program: label.to_string(),
        log,
    };
    let has = |stage: ShaderStage| stages.iter().filter(|s| s.stage == stage).count();
    let (transitions, vertices, fragments) = (
        has(ShaderStage::Transition),
        has(ShaderStage::Vertex),
        has(ShaderStage::Fragment),
    );
    let kind = match (transitions, vertices, fragments) {
        (1, 0, 0 | 1) => {
            let transition = stages.iter().find(|s| s.stage == ShaderStage::Transition);
            let [x, y, z] = transition.map(|s| s.reflection.workgroup_size).unwrap_or([1, 1, 1]);
            if y != 1 || z != 1 {
                return Err(link_error(format!(
                    "transition workgroups must be one-dimensional, found ({x}, {y}, {z})"
                )));
            }
            ProgramKind::Transition { workgroup_size: x }
        }
        (0, 1, 1) => ProgramKind::Render { primitive },
        _ => {
            return Err(link_error(format!(
                "expected one transition stage or a vertex/fragment pair, found {} transition, {} vertex, {} fragment",
                transitions, vertices, fragments
            )))
        }
    };

    let mut merged: BTreeMap<(u32, u32), GlobalBinding> = BTreeMap::new();
    for stage in &stages {
        for global in &stage.reflection.globals {
            match merged.get_mut(&(global.group, global.binding)) {
                Some(existing) => {
                    if existing.name != global.name || existing.class != global.class {
                        return Err(link_error(format!(
                            "@group({}) @binding({}) is `{}` in one stage and `{}` in another",
                            global.group, global.binding, existing.name, global.name
                        )));
                    }
                    existing.used |= global.used;
                }
                None => {
                    merged.insert((global.group, global.binding), global.clone());
                }
            }
        }
    }
    let bindings: Vec<GlobalBinding> = merged.into_values().collect();

    match kind {
        ProgramKind::Transition { .. } => {
            let outputs: Vec<&GlobalBinding> = bindings.iter().filter(|b| b.group == CAPTURE_GROUP).collect();
            let names: Vec<&str> = outputs.iter().map(|b| b.name.as_str()).collect();
            if names.len() != captured.len() || names.iter().zip(captured).any(|(a, b)| *a != b) {
                return Err(link_error(format!(
                    "captured outputs {:?} do not match the declared outputs {:?}",
                    captured, names
                )));
            }
            for (i, output) in outputs.iter().enumerate() {
                if output.binding != i as u32 {
                    return Err(link_error(format!(
                        "captured output `{}` is bound at {} but captured as #{}",
                        output.name, output.binding, i
                    )));
                }
                if !matches!(output.class, ResourceClass::Storage { writable: true, .. }) {
                    return Err(link_error(format!(
                        "captured output `{}` is not a writable storage array",
                        output.name
                    )));
                }
            }
        }
        ProgramKind::Render { .. } => {
            if !captured.is_empty() {
                return Err(link_error("render programs cannot capture outputs".to_string()));
            }
            let written = stages
                .iter()
                .find(|s| s.stage == ShaderStage::Vertex)
                .map(|s| s.reflection.interface.clone())
                .unwrap_or_default();
            if let Some(fragment) = stages.iter().find(|s| s.stage == ShaderStage::Fragment) {
                if let Some(missing) = fragment.reflection.interface.iter().find(|l| !written.contains(l)) {
                    return Err(link_error(format!(
                        "fragment input @location({missing}) is not written by the vertex stage"
                    )));
                }
            }
        }
    }

    let vertex_inputs = stages
        .iter()
        .find(|s| s.stage == ShaderStage::Vertex)
        .map(|s| s.reflection.vertex_inputs.clone())
        .unwrap_or_default();

    Ok(LinkedProgram {
        label: label.to_string(),
        kind,
        stages,
        bindings,
        vertex_inputs,
        captured: captured.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSITION: &str = r#"
@group(0) @binding(0) var<uniform> speed: f32;
@group(0) @binding(1) var<uniform> unused: f32;
@group(1) @binding(0) var<storage, read> x: array<f32>;
@group(2) @binding(0) var<storage, read_write> xOut: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    xOut[id.x] = x[id.x] + speed;
}
"#;

    fn desc(source: &str, captured: &[&str]) -> ProgramDesc {
        ProgramDesc {
            label: "test".into(),
            stages: vec![StageSource {
                stage: ShaderStage::Transition,
                source: source.into(),
            }],
            captured: captured.iter().map(|s| s.to_string()).collect(),
            primitive: Primitive::Points,
        }
    }

    #[test]
    fn test_reflects_usage_and_layout() {
        let program = build_program(&desc(TRANSITION, &["xOut"])).unwrap();
        assert_eq!(program.kind, ProgramKind::Transition { workgroup_size: 64 });
        assert_eq!(
            program.locate("speed"),
            Ok(Location::Binding { group: 0, binding: 0 })
        );
        assert!(program.locate("unused").is_err());
        assert_eq!(
            program.locate("xOut"),
            Ok(Location::Binding { group: 2, binding: 0 })
        );
        let x = program.binding(Location::Binding { group: 1, binding: 0 }).unwrap();
        assert_eq!(
            x.class,
            ResourceClass::Storage {
                writable: false,
                element: ElementFormat {
                    scalar: ScalarKind::Float,
                    components: 1,
                    stride: 4
                }
            }
        );
    }

    #[test]
    fn test_capture_list_must_match() {
        let err = build_program(&desc(TRANSITION, &["yOut"])).unwrap_err();
        assert!(matches!(err, EngineError::Link { .. }));
        let err = build_program(&desc(TRANSITION, &[])).unwrap_err();
        assert!(matches!(err, EngineError::Link { .. }));
    }

    #[test]
    fn test_compile_error_carries_source_and_log() {
        let broken = "@compute @workgroup_size(1) fn main() { let x = ; }";
        match build_program(&desc(broken, &[])) {
            Err(EngineError::Compile { stage, source, log }) => {
                assert_eq!(stage, ShaderStage::Transition);
                assert_eq!(source, broken);
                assert!(!log.is_empty());
            }
            other => panic!("expected a compile error, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_entry_point_is_a_compile_error() {
        let source = "@compute @workgroup_size(1) fn other() {}";
        assert!(matches!(
            build_program(&desc(source, &[])),
            Err(EngineError::Compile { .. })
        ));
    }

    #[test]
    fn test_vec3_storage_stride_is_16() {
        let source = r#"
@group(1) @binding(0) var<storage, read> p: array<vec3<f32>>;
@group(2) @binding(0) var<storage, read_write> pOut: array<vec3<f32>>;
@compute @workgroup_size(1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) { pOut[id.x] = p[id.x]; }
"#;
        let program = build_program(&desc(source, &["pOut"])).unwrap();
        match program.bindings[0].class {
            ResourceClass::Storage { element, .. } => assert_eq!(element.stride, 16),
            other => panic!("unexpected class {:?}", other),
        }
    }
}
