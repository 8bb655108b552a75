//! WGSL source assembly.
//!
//! [`ShaderSourceBuilder`] collects the pieces of one shader stage and emits
//! them in a fixed section order, independent of call timing:
//!
//! 1. directives (generated-by banner, `enable`/`diagnostic` lines)
//! 2. structs
//! 3. functions
//! 4. headers
//! 5. variable declarations
//! 6. the wrapped entry point
//!
//! Structs and functions keep their insertion order verbatim so later
//! functions can call earlier ones. Declarations are sorted by binding so the
//! output does not depend on the order variables were added in.
//!
//! Nothing here touches a device; the builder is a pure string function.

use std::collections::HashSet;
use std::fmt::Write as _;

use crate::error::EngineError;
use crate::variable::{Qualifier, VarType};

/// Bind group holding uniforms and textures.
pub const UNIFORM_GROUP: u32 = 0;
/// Bind group holding per-entity inputs of a transition stage.
pub const INPUT_GROUP: u32 = 1;
/// Bind group holding captured outputs of a transition stage.
pub const CAPTURE_GROUP: u32 = 2;

/// The stage a source string is compiled as.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    /// Per-entity state transition, run as a compute dispatch.
    Transition,
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn label(&self) -> &'static str {
        match self {
            ShaderStage::Transition => "transition",
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
        }
    }

    /// Name of the wrapped entry point.
    pub fn entry_name(&self) -> &'static str {
        match self {
            ShaderStage::Transition => "main",
            ShaderStage::Vertex => "vs_main",
            ShaderStage::Fragment => "fs_main",
        }
    }

    pub(crate) fn naga(&self) -> naga::ShaderStage {
        match self {
            ShaderStage::Transition => naga::ShaderStage::Compute,
            ShaderStage::Vertex => naga::ShaderStage::Vertex,
            ShaderStage::Fragment => naga::ShaderStage::Fragment,
        }
    }
}

/// How the main body is wrapped into an entry point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntryPoint {
    /// `@compute` entry; the body sees `index: u32`.
    Transition { workgroup_size: u32 },
    /// `@vertex` entry returning `output`; the body fills `out` and sees
    /// `index` (instance) and `vertex_index`.
    Vertex { output: String },
    /// `@fragment` entry. With no input and no output the body runs for its
    /// side effects only (e.g. `discard`).
    Fragment {
        input: Option<String>,
        output: bool,
    },
}

impl EntryPoint {
    pub fn stage(&self) -> ShaderStage {
        match self {
            EntryPoint::Transition { .. } => ShaderStage::Transition,
            EntryPoint::Vertex { .. } => ShaderStage::Vertex,
            EntryPoint::Fragment { .. } => ShaderStage::Fragment,
        }
    }
}

/// One declared variable as it appears in a stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Declaration {
    pub qualifier: Qualifier,
    pub name: String,
    pub ty: VarType,
    /// Binding index (uniforms, storage) or `@location` (vertex inputs).
    pub slot: u32,
}

impl Declaration {
    pub fn new(qualifier: Qualifier, name: &str, ty: VarType, slot: u32) -> Self {
        Self {
            qualifier,
            name: name.to_string(),
            ty,
            slot,
        }
    }

    /// Name of the captured output an `inout` declaration synthesizes.
    pub fn output_name(&self) -> String {
        format!("{}Out", self.name)
    }

    /// Identifiers this declaration introduces into a stage.
    fn names(&self) -> Vec<String> {
        match (self.qualifier, self.ty) {
            (Qualifier::Uniform, VarType::Texture2d) => {
                vec![self.name.clone(), format!("{}_sampler", self.name)]
            }
            (Qualifier::InOut, _) => vec![self.name.clone(), self.output_name()],
            _ => vec![self.name.clone()],
        }
    }

    fn check(&self, stage: ShaderStage) -> Result<(), EngineError> {
        let reject = |reason| {
            Err(EngineError::InvalidDeclaration {
                name: self.name.clone(),
                reason,
            })
        };
        if self.qualifier != Qualifier::Uniform && !self.ty.is_attribute() {
            return reject("attributes must be scalar or vector typed");
        }
        match (stage, self.qualifier) {
            (_, Qualifier::Uniform) | (ShaderStage::Transition, _) => Ok(()),
            (ShaderStage::Vertex, Qualifier::In) => Ok(()),
            (ShaderStage::Vertex, _) => reject("vertex stages only read attributes"),
            (ShaderStage::Fragment, _) => reject("fragment stages only declare uniforms"),
        }
    }

    /// Module-scope WGSL for this declaration. Vertex inputs have none.
    fn module_scope(&self, stage: ShaderStage) -> Option<String> {
        let ty = self.ty.wgsl();
        let name = &self.name;
        let slot = self.slot;
        match self.qualifier {
            Qualifier::Uniform if self.ty == VarType::Texture2d => Some(format!(
                "@group({UNIFORM_GROUP}) @binding({slot}) var {name}: {ty};\n\
                 @group({UNIFORM_GROUP}) @binding({}) var {name}_sampler: sampler;",
                slot + 1
            )),
            Qualifier::Uniform => Some(format!(
                "@group({UNIFORM_GROUP}) @binding({slot}) var<uniform> {name}: {ty};"
            )),
            Qualifier::In if stage == ShaderStage::Vertex => None,
            Qualifier::In => Some(format!(
                "@group({INPUT_GROUP}) @binding({slot}) var<storage, read> {name}: array<{ty}>;"
            )),
            Qualifier::Out => Some(format!(
                "@group({CAPTURE_GROUP}) @binding({slot}) var<storage, read_write> {name}: array<{ty}>;"
            )),
            Qualifier::InOut => Some(format!(
                "@group({INPUT_GROUP}) @binding({slot}) var<storage, read> {name}: array<{ty}>;\n\
                 @group({CAPTURE_GROUP}) @binding({slot}) var<storage, read_write> {}: array<{ty}>;",
                self.output_name()
            )),
        }
    }

    /// Sort key: module-scope group, then binding.
    fn order(&self) -> (u32, u32) {
        match self.qualifier {
            Qualifier::Uniform => (UNIFORM_GROUP, self.slot),
            Qualifier::In | Qualifier::InOut => (INPUT_GROUP, self.slot),
            Qualifier::Out => (CAPTURE_GROUP, self.slot),
        }
    }
}

/// Assembles one WGSL stage from ordered sections.
#[derive(Clone, Debug)]
pub struct ShaderSourceBuilder {
    entry: EntryPoint,
    directives: Vec<String>,
    structs: Vec<String>,
    functions: Vec<String>,
    headers: Vec<String>,
    declarations: Vec<Declaration>,
    names: HashSet<String>,
    main: String,
}

impl ShaderSourceBuilder {
    pub fn new(entry: EntryPoint) -> Self {
        Self {
            entry,
            directives: Vec::new(),
            structs: Vec::new(),
            functions: Vec::new(),
            headers: Vec::new(),
            declarations: Vec::new(),
            names: HashSet::new(),
            main: String::new(),
        }
    }

    pub fn stage(&self) -> ShaderStage {
        self.entry.stage()
    }

    /// Add an `enable`/`diagnostic` style directive line.
    pub fn directive(&mut self, line: impl Into<String>) -> &mut Self {
        self.directives.push(line.into());
        self
    }

    pub fn structure(&mut self, source: impl Into<String>) -> &mut Self {
        self.structs.push(source.into());
        self
    }

    pub fn function(&mut self, source: impl Into<String>) -> &mut Self {
        self.functions.push(source.into());
        self
    }

    /// Add free-form module-scope source (constants, aliases).
    pub fn header(&mut self, source: impl Into<String>) -> &mut Self {
        self.headers.push(source.into());
        self
    }

    /// Declare a variable. Names, including synthesized ones, must be unique.
    pub fn declare(&mut self, declaration: Declaration) -> Result<&mut Self, EngineError> {
        declaration.check(self.stage())?;
        let names = declaration.names();
        if let Some(taken) = names.iter().find(|n| self.names.contains(*n)) {
            return Err(EngineError::DuplicateName(taken.clone()));
        }
        self.names.extend(names);
        self.declarations.push(declaration);
        Ok(self)
    }

    /// Set the entry point body, replacing any previous one.
    pub fn main(&mut self, body: impl Into<String>) -> &mut Self {
        self.main = body.into();
        self
    }

    pub fn declarations(&self) -> &[Declaration] {
        &self.declarations
    }

    /// Emit the complete source.
    pub fn build(&self) -> String {
        let stage = self.stage();
        let mut out = String::new();

        let _ = writeln!(out, "// Generated by tfpe ({} stage)", stage.label());
        for line in &self.directives {
            let _ = writeln!(out, "{}", line.trim_end());
        }
        out.push('\n');

        for section in [&self.structs, &self.functions, &self.headers] {
            for block in section.iter() {
                let _ = writeln!(out, "{}\n", block.trim());
            }
        }

        let mut declarations: Vec<&Declaration> = self.declarations.iter().collect();
        declarations.sort_by_key(|d| d.order());
        let mut any = false;
        for decl in &declarations {
            if let Some(text) = decl.module_scope(stage) {
                let _ = writeln!(out, "{}", text);
                any = true;
            }
        }
        if any {
            out.push('\n');
        }

        out.push_str(&self.wrap_entry(&declarations));
        out
    }

    fn wrap_entry(&self, declarations: &[&Declaration]) -> String {
        let body = indent(&self.main, "    ");
        match &self.entry {
            EntryPoint::Transition { workgroup_size } => format!(
                r#"@compute @workgroup_size({workgroup_size})
fn main(@builtin(global_invocation_id) invocation_id: vec3<u32>) {{
    let index = invocation_id.x;
{body}
}}
"#
            ),
            EntryPoint::Vertex { output } => {
                let mut params = vec![
                    "@builtin(vertex_index) vertex_index: u32".to_string(),
                    "@builtin(instance_index) index: u32".to_string(),
                ];
                let mut inputs: Vec<&&Declaration> = declarations
                    .iter()
                    .filter(|d| d.qualifier == Qualifier::In)
                    .collect();
                inputs.sort_by_key(|d| d.slot);
                for d in inputs {
                    params.push(format!("@location({}) {}: {}", d.slot, d.name, d.ty.wgsl()));
                }
                format!(
                    r#"@vertex
fn vs_main(
    {params}
) -> {output} {{
    var out: {output};
{body}
    return out;
}}
"#,
                    params = params.join(",\n    ")
                )
            }
            EntryPoint::Fragment { input, output } => {
                let params = input
                    .as_ref()
                    .map(|ty| format!("in: {ty}"))
                    .unwrap_or_default();
                let ret = if *output { " -> @location(0) vec4<f32>" } else { "" };
                format!("@fragment\nfn fs_main({params}){ret} {{\n{body}\n}}\n")
            }
        }
    }
}

fn indent(body: &str, prefix: &str) -> String {
    body.trim_matches('\n')
        .lines()
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("{prefix}{line}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate(source: &str) -> Result<(), String> {
        let module = naga::front::wgsl::parse_str(source).map_err(|e| e.emit_to_string(source))?;
        naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|e| format!("{:?}", e))?;
        Ok(())
    }

    fn transition() -> ShaderSourceBuilder {
        ShaderSourceBuilder::new(EntryPoint::Transition { workgroup_size: 64 })
    }

    #[test]
    fn test_sections_follow_fixed_order() {
        let mut b = transition();
        b.main("positionOut[index] = position[index] + 1.0;");
        b.header("const SPEED: f32 = 2.0;");
        b.function("fn twice(x: f32) -> f32 { return x * 2.0; }");
        b.structure("struct Pair { a: f32, b: f32, }");
        b.directive("diagnostic(off, derivative_uniformity);");
        b.declare(Declaration::new(Qualifier::InOut, "position", VarType::F32, 0))
            .unwrap();

        let src = b.build();
        let at = |needle: &str| src.find(needle).unwrap_or_else(|| panic!("missing {needle}"));
        assert!(at("diagnostic") < at("struct Pair"));
        assert!(at("struct Pair") < at("fn twice"));
        assert!(at("fn twice") < at("const SPEED"));
        assert!(at("const SPEED") < at("var<storage, read> position"));
        assert!(at("var<storage, read_write> positionOut") < at("@compute"));
        validate(&src).unwrap();
    }

    #[test]
    fn test_function_order_is_preserved() {
        let mut b = transition();
        b.function("fn first() -> f32 { return 1.0; }");
        b.function("fn second() -> f32 { return first() + 1.0; }");
        let src = b.build();
        assert!(src.find("fn first").unwrap() < src.find("fn second").unwrap());
        validate(&src).unwrap();
    }

    #[test]
    fn test_declarations_are_complete_in_any_order() {
        let decls = [
            Declaration::new(Qualifier::Uniform, "gravity", VarType::Vec3, 0),
            Declaration::new(Qualifier::Uniform, "drag", VarType::F32, 1),
            Declaration::new(Qualifier::In, "mass", VarType::F32, 0),
            Declaration::new(Qualifier::Out, "energy", VarType::F32, 0),
        ];
        let forward = {
            let mut b = transition();
            for d in decls.iter().cloned() {
                b.declare(d).unwrap();
            }
            b.build()
        };
        let reverse = {
            let mut b = transition();
            for d in decls.iter().rev().cloned() {
                b.declare(d).unwrap();
            }
            b.build()
        };
        assert_eq!(forward, reverse);

        for (needle, count) in [
            ("var<uniform> gravity: vec3<f32>;", 1),
            ("var<uniform> drag: f32;", 1),
            ("var<storage, read> mass: array<f32>;", 1),
            ("var<storage, read_write> energy: array<f32>;", 1),
        ] {
            assert_eq!(forward.matches(needle).count(), count, "{needle}");
        }
        validate(&forward).unwrap();
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut b = transition();
        b.declare(Declaration::new(Qualifier::InOut, "x", VarType::F32, 0))
            .unwrap();
        let err = b
            .declare(Declaration::new(Qualifier::Uniform, "xOut", VarType::F32, 0))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateName(name) if name == "xOut"));
        assert_eq!(b.declarations().len(), 1);
    }

    #[test]
    fn test_texture_uniform_declares_sampler() {
        let mut b = transition();
        b.declare(Declaration::new(Qualifier::Uniform, "noise", VarType::Texture2d, 3))
            .unwrap();
        let src = b.build();
        assert!(src.contains("@group(0) @binding(3) var noise: texture_2d<f32>;"));
        assert!(src.contains("@group(0) @binding(4) var noise_sampler: sampler;"));
        assert!(matches!(
            b.declare(Declaration::new(Qualifier::Uniform, "noise_sampler", VarType::F32, 5)),
            Err(EngineError::DuplicateName(_))
        ));
    }

    #[test]
    fn test_vertex_inputs_become_locations() {
        let mut b = ShaderSourceBuilder::new(EntryPoint::Vertex {
            output: "VertexOutput".into(),
        });
        b.structure("struct VertexOutput { @builtin(position) clip_position: vec4<f32>, }");
        b.declare(Declaration::new(Qualifier::Uniform, "view_proj", VarType::Mat4, 0))
            .unwrap();
        b.declare(Declaration::new(Qualifier::In, "velocity", VarType::Vec3, 1))
            .unwrap();
        b.declare(Declaration::new(Qualifier::In, "position", VarType::Vec3, 0))
            .unwrap();
        b.main("out.clip_position = view_proj * vec4<f32>(position, 1.0);");

        let src = b.build();
        assert!(!src.contains("var<storage"));
        assert!(src.find("@location(0) position").unwrap() < src.find("@location(1) velocity").unwrap());
        validate(&src).unwrap();
    }

    #[test]
    fn test_stage_rules() {
        let mut vertex = ShaderSourceBuilder::new(EntryPoint::Vertex {
            output: "VertexOutput".into(),
        });
        assert!(matches!(
            vertex.declare(Declaration::new(Qualifier::Out, "x", VarType::F32, 0)),
            Err(EngineError::InvalidDeclaration { .. })
        ));

        let mut t = transition();
        assert!(matches!(
            t.declare(Declaration::new(Qualifier::In, "m", VarType::Mat4, 0)),
            Err(EngineError::InvalidDeclaration { .. })
        ));
    }

    #[test]
    fn test_discard_fragment_is_valid() {
        let mut b = ShaderSourceBuilder::new(EntryPoint::Fragment {
            input: None,
            output: false,
        });
        b.main("discard;");
        let src = b.build();
        assert!(src.contains("fn fs_main() {"));
        validate(&src).unwrap();
    }
}
