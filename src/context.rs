//! Per-thread construction and resolution façade.

use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::debug;

use crate::dsl::{self, GroupDSL};
use crate::error::ShadingError;
use crate::global::GlobalLayout;
use crate::group::ShaderGroupTemplate;
use crate::instance::{ShaderFunction, ShaderInstance};
use crate::system::SystemShared;
use crate::template::{ShaderTemplate, ShaderUnitTemplate};

/// Owns the construction state of one worker thread.
///
/// A context can move to another thread but cannot be shared between threads
/// (`Send`, not `Sync`); make one per worker with
/// [`ShadingSystem::make_shading_context`](crate::ShadingSystem::make_shading_context).
/// Template names are unique per context.
pub struct ShadingContext {
    shared: Arc<SystemShared>,
    names: HashSet<String>,
    _not_sync: PhantomData<Cell<()>>,
}

impl ShadingContext {
    pub(crate) fn new(shared: Arc<SystemShared>) -> Self {
        Self {
            shared,
            names: HashSet::new(),
            _not_sync: PhantomData,
        }
    }

    fn claim_name(&mut self, name: &str) -> Result<(), ShadingError> {
        if !self.names.insert(name.to_string()) {
            return Err(ShadingError::DuplicateTemplateName(name.to_string()));
        }
        Ok(())
    }

    pub fn begin_shader_unit_template(&mut self, name: &str) -> Result<ShaderUnitTemplate, ShadingError> {
        self.claim_name(name)?;
        debug!(template = %name, "began shader unit template");
        Ok(ShaderUnitTemplate::new(name))
    }

    /// Compiles `source` into `unit` against the unit's own global layout, or
    /// the system layout if it registered none.
    pub fn compile_shader_unit_template(
        &self,
        unit: &mut ShaderUnitTemplate,
        source: &str,
    ) -> Result<(), ShadingError> {
        let globals: Arc<GlobalLayout> = self.shared.globals.read().clone();
        unit.compile(self.shared.compiler.as_ref(), &globals, source)
    }

    pub fn end_shader_unit_template(&self, unit: &mut ShaderUnitTemplate) -> Result<(), ShadingError> {
        unit.end()
    }

    pub fn begin_shader_group_template(&mut self, name: &str) -> Result<ShaderGroupTemplate, ShadingError> {
        self.claim_name(name)?;
        debug!(group = %name, "began shader group template");
        Ok(ShaderGroupTemplate::new(name))
    }

    /// Freezes the group using the system's unreachable-unit policy.
    pub fn end_shader_group_template(&self, group: &mut ShaderGroupTemplate) -> Result<(), ShadingError> {
        group.freeze(self.shared.config.allow_unreachable_units)
    }

    pub fn make_shader_instance<'t>(&self, template: &'t ShaderTemplate) -> ShaderInstance<'t> {
        template.make_instance()
    }

    /// Resolves `instance` against the system's closure registry. Idempotent:
    /// later calls return the first outcome.
    pub fn resolve_shader_instance(
        &self,
        instance: &mut ShaderInstance<'_>,
    ) -> Result<ShaderFunction, ShadingError> {
        instance.resolve(&self.shared.registry, &self.shared.reporter)
    }

    /// Builds and freezes a group from its JSON description. Members are
    /// copies of the named `library` templates.
    pub fn build_shader_group(
        &mut self,
        desc: &GroupDSL,
        library: &HashMap<String, ShaderTemplate>,
    ) -> anyhow::Result<ShaderGroupTemplate> {
        let mut group = self.begin_shader_group_template(&desc.name)?;
        dsl::apply_group(&mut group, desc, library)?;
        self.end_shader_group_template(&mut group)?;
        Ok(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ShadingSystem;
    use crate::error::ErrorKind;

    #[test]
    fn template_names_are_unique_per_context() {
        let system = ShadingSystem::new();
        let mut a = system.make_shading_context();
        let mut b = system.make_shading_context();

        a.begin_shader_unit_template("shared").unwrap();
        let err = a.begin_shader_group_template("shared").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NameConflict);
        assert!(b.begin_shader_unit_template("shared").is_ok());
    }

    #[test]
    fn failed_resolution_is_sticky() {
        let system = ShadingSystem::new();
        let mut ctx = system.make_shading_context();
        let mut unit = ctx.begin_shader_unit_template("needs_closure").unwrap();
        ctx.compile_shader_unit_template(
            &mut unit,
            "shader s(out closure c) { c = make_closure<missing>(); }",
        )
        .unwrap();
        let template = ShaderTemplate::from(unit);

        let mut instance = ctx.make_shader_instance(&template);
        let first = ctx.resolve_shader_instance(&mut instance).unwrap_err();
        assert_eq!(first, ShadingError::UnknownClosureType("missing".into()));

        // Registering afterwards does not revive an instance that already failed.
        system.register_closure_layout("missing", Default::default()).unwrap();
        assert_eq!(ctx.resolve_shader_instance(&mut instance).unwrap_err(), first);
        assert!(instance.function().is_none());
        assert_eq!(instance.error(), Some(&first));

        let mut fresh = ctx.make_shader_instance(&template);
        assert!(ctx.resolve_shader_instance(&mut fresh).is_ok());
    }
}
