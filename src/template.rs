//! Shader templates: compiled leaf units and the `Leaf | Composite` sum type
//! groups are built from.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::compiler::{CompileEnv, CompiledUnit, ShaderCompiler};
use crate::error::{Diagnostic, ShadingError};
use crate::global::GlobalLayout;
use crate::group::ShaderGroupTemplate;
use crate::instance::ShaderInstance;
use crate::interface::TextureHandle;
use crate::types::ShaderParam;

#[derive(Clone, Debug)]
enum UnitState {
    Pending,
    Compiled {
        unit: CompiledUnit,
        /// Layout the code's global slots refer to.
        globals: Arc<GlobalLayout>,
    },
    Failed(Vec<Diagnostic>),
}

/// One named `shader` definition.
///
/// Creation always succeeds. A template whose compilation failed stays around
/// as a named placeholder: it can be inspected, but adding it to a group or
/// resolving an instance of it reports the compile diagnostics.
#[derive(Clone, Debug)]
pub struct ShaderUnitTemplate {
    name: String,
    state: UnitState,
    globals: Option<Arc<GlobalLayout>>,
    textures: HashMap<String, TextureHandle>,
    ended: bool,
}

impl ShaderUnitTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: UnitState::Pending,
            globals: None,
            textures: HashMap::new(),
            ended: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn ensure_open(&self) -> Result<(), ShadingError> {
        if self.ended {
            return Err(ShadingError::AlreadyFrozen {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Overrides the system-wide global layout for this template. Takes effect
    /// on the next compile.
    pub fn register_globals(&mut self, layout: GlobalLayout) -> Result<(), ShadingError> {
        self.ensure_open()?;
        self.globals = Some(Arc::new(layout));
        Ok(())
    }

    pub fn register_texture(
        &mut self,
        name: impl Into<String>,
        handle: TextureHandle,
    ) -> Result<(), ShadingError> {
        self.ensure_open()?;
        self.textures.insert(name.into(), handle);
        Ok(())
    }

    pub fn texture(&self, name: &str) -> Option<TextureHandle> {
        self.textures.get(name).copied()
    }

    /// Compiles `source`, replacing any earlier result.
    pub fn compile(
        &mut self,
        compiler: &dyn ShaderCompiler,
        system_globals: &Arc<GlobalLayout>,
        source: &str,
    ) -> Result<(), ShadingError> {
        self.ensure_open()?;
        let globals = self.globals.clone().unwrap_or_else(|| Arc::clone(system_globals));
        let env = CompileEnv { globals: &globals };

        match compiler.compile(source, &env) {
            Ok(unit) => {
                info!(
                    template = %self.name,
                    shader = %unit.shader_name,
                    params = unit.params.len(),
                    "compiled shader unit"
                );
                self.state = UnitState::Compiled { unit, globals };
                Ok(())
            }
            Err(diagnostics) => {
                warn!(template = %self.name, errors = diagnostics.len(), "shader unit failed to compile");
                for d in &diagnostics {
                    debug!(template = %self.name, "{d}");
                }
                self.state = UnitState::Failed(diagnostics.clone());
                Err(ShadingError::Compile {
                    name: self.name.clone(),
                    diagnostics,
                })
            }
        }
    }

    pub(crate) fn end(&mut self) -> Result<(), ShadingError> {
        self.ensure_open()?;
        self.ended = true;
        Ok(())
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn is_compiled(&self) -> bool {
        matches!(self.state, UnitState::Compiled { .. })
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        match &self.state {
            UnitState::Failed(d) => d,
            _ => &[],
        }
    }

    pub fn compiled(&self) -> Option<&CompiledUnit> {
        match &self.state {
            UnitState::Compiled { unit, .. } => Some(unit),
            _ => None,
        }
    }

    /// The layout the compiled code reads globals from.
    pub fn global_layout(&self) -> Option<&Arc<GlobalLayout>> {
        match &self.state {
            UnitState::Compiled { globals, .. } => Some(globals),
            _ => None,
        }
    }

    /// The compiled unit, or why there is none.
    pub(crate) fn ready(&self) -> Result<&CompiledUnit, ShadingError> {
        match &self.state {
            UnitState::Compiled { unit, .. } => Ok(unit),
            UnitState::Pending => Err(ShadingError::NotCompiled {
                name: self.name.clone(),
            }),
            UnitState::Failed(diagnostics) => Err(ShadingError::Compile {
                name: self.name.clone(),
                diagnostics: diagnostics.clone(),
            }),
        }
    }

    pub fn params(&self) -> &[ShaderParam] {
        self.compiled().map_or(&[], |u| &u.params)
    }
}

/// Anything that can be a group member or back an instance.
#[derive(Clone, Debug)]
pub enum ShaderTemplate {
    Leaf(ShaderUnitTemplate),
    Composite(ShaderGroupTemplate),
}

impl ShaderTemplate {
    pub fn name(&self) -> &str {
        match self {
            ShaderTemplate::Leaf(u) => u.name(),
            ShaderTemplate::Composite(g) => g.name(),
        }
    }

    /// Parameter list as seen from outside: the compiled signature of a unit,
    /// or the arguments a frozen group exposes.
    pub fn params(&self) -> &[ShaderParam] {
        match self {
            ShaderTemplate::Leaf(u) => u.params(),
            ShaderTemplate::Composite(g) => g.params(),
        }
    }

    pub fn param(&self, name: &str) -> Option<(usize, &ShaderParam)> {
        self.params().iter().enumerate().find(|(_, p)| p.name == name)
    }

    /// Whether input `index` is read by the code behind it.
    pub fn input_used(&self, index: usize) -> bool {
        match self {
            ShaderTemplate::Leaf(u) => u.compiled().is_some_and(|c| c.input_used(index)),
            ShaderTemplate::Composite(g) => g.param_used(index),
        }
    }

    /// Dependency pass: nothing to do for a unit, freezing for a group.
    pub fn parse_dependencies(&mut self, allow_unreachable: bool) -> Result<(), ShadingError> {
        match self {
            ShaderTemplate::Leaf(_) => Ok(()),
            ShaderTemplate::Composite(g) => g.freeze(allow_unreachable),
        }
    }

    /// Fails unless the template can be linked: compiled, or frozen.
    pub fn check_ready(&self) -> Result<(), ShadingError> {
        match self {
            ShaderTemplate::Leaf(u) => u.ready().map(|_| ()),
            ShaderTemplate::Composite(g) if g.is_frozen() => Ok(()),
            ShaderTemplate::Composite(g) => Err(ShadingError::NotFrozen {
                name: g.name().to_string(),
            }),
        }
    }

    pub fn make_instance(&self) -> ShaderInstance<'_> {
        ShaderInstance::new(self)
    }

    pub fn as_leaf(&self) -> Option<&ShaderUnitTemplate> {
        match self {
            ShaderTemplate::Leaf(u) => Some(u),
            ShaderTemplate::Composite(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&ShaderGroupTemplate> {
        match self {
            ShaderTemplate::Composite(g) => Some(g),
            ShaderTemplate::Leaf(_) => None,
        }
    }
}

impl From<ShaderUnitTemplate> for ShaderTemplate {
    fn from(unit: ShaderUnitTemplate) -> Self {
        ShaderTemplate::Leaf(unit)
    }
}

impl From<ShaderGroupTemplate> for ShaderTemplate {
    fn from(group: ShaderGroupTemplate) -> Self {
        ShaderTemplate::Composite(group)
    }
}
