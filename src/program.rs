//! A compiled, linked set of shader stages.

use std::collections::HashMap;

use crate::context::{GraphicsContext, Location, ProgramDesc, ProgramHandle};
use crate::error::{EngineError, LocationNotFound};

/// What a build does with declared variables the program does not expose.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LocationPolicy {
    /// Report them and continue; their uploads become no-ops.
    #[default]
    Acknowledge,
    /// Fail the build on the first one.
    Strict,
}

/// A device program plus its location cache.
///
/// Lookups are cached for the program's lifetime, misses included, so
/// re-binding a variable is idempotent and never re-queries the device.
#[derive(Debug)]
pub struct Program {
    label: String,
    handle: ProgramHandle,
    locations: HashMap<String, Option<Location>>,
}

impl Program {
    /// Compile and link `desc`. On failure no device program exists.
    pub fn build<C: GraphicsContext + ?Sized>(ctx: &mut C, desc: &ProgramDesc) -> Result<Self, EngineError> {
        let handle = ctx.create_program(desc)?;
        tracing::debug!(label = %desc.label, id = handle.0, "program linked");
        Ok(Self {
            label: desc.label.clone(),
            handle,
            locations: HashMap::new(),
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn handle(&self) -> ProgramHandle {
        self.handle
    }

    /// Resolve `name`, consulting the cache first.
    pub fn locate<C: GraphicsContext + ?Sized>(&mut self, ctx: &C, name: &str) -> Result<Location, LocationNotFound> {
        let handle = self.handle;
        let cached = *self
            .locations
            .entry(name.to_string())
            .or_insert_with(|| ctx.locate(handle, name).ok());
        cached.ok_or_else(|| LocationNotFound {
            program: self.label.clone(),
            name: name.to_string(),
        })
    }

    /// Names looked up so far that did not resolve.
    pub fn misses(&self) -> impl Iterator<Item = &str> {
        self.locations
            .iter()
            .filter(|(_, location)| location.is_none())
            .map(|(name, _)| name.as_str())
    }

    pub fn dispose<C: GraphicsContext + ?Sized>(self, ctx: &mut C) {
        ctx.destroy_program(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{HeadlessContext, Primitive, StageSource};
    use crate::shader::ShaderStage;

    fn desc(body: &str) -> ProgramDesc {
        ProgramDesc {
            label: "sim".into(),
            stages: vec![StageSource {
                stage: ShaderStage::Transition,
                source: format!(
                    "@group(0) @binding(0) var<uniform> a: f32;\n\
                     @group(0) @binding(1) var<uniform> b: f32;\n\
                     @compute @workgroup_size(1) fn main() {{ {body} }}"
                ),
            }],
            captured: Vec::new(),
            primitive: Primitive::Points,
        }
    }

    #[test]
    fn test_locate_caches_hits_and_misses() {
        let mut ctx = HeadlessContext::new();
        let mut program = Program::build(&mut ctx, &desc("let x = a;")).unwrap();

        assert_eq!(
            program.locate(&ctx, "a"),
            Ok(Location::Binding { group: 0, binding: 0 })
        );
        let miss = program.locate(&ctx, "b").unwrap_err();
        assert_eq!(miss.name, "b");
        assert_eq!(miss.program, "sim");
        assert_eq!(program.locate(&ctx, "a"), program.locate(&ctx, "a"));
        assert_eq!(program.misses().collect::<Vec<_>>(), vec!["b"]);
    }

    #[test]
    fn test_failed_build_leaves_no_program() {
        let mut ctx = HeadlessContext::new();
        assert!(Program::build(&mut ctx, &desc("let x = ;")).is_err());
        assert_eq!(ctx.live_resources(), (0, 0, 0));
    }
}
