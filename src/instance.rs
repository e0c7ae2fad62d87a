//! Shader instances and the resolved entry point.

use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::closure::ClosureRegistry;
use crate::error::ShadingError;
use crate::global::{GlobalBlock, GlobalLayout};
use crate::interface::{DebugLevel, Reporter};
use crate::link::{LinkedShader, Linker, Runtime};
use crate::memory::ClosureSlot;
use crate::template::ShaderTemplate;
use crate::types::{ShaderParam, Value, ValueType};

struct EntryPoint {
    name: String,
    shader: LinkedShader,
    params: Vec<ShaderParam>,
    /// Initial parameter values: defaults for inputs, zero for outputs.
    initial: Vec<Value>,
    /// First `out closure` parameter; its value becomes the slot root.
    closure_output: Option<usize>,
    layout: Arc<GlobalLayout>,
    reporter: Reporter,
}

/// A resolved, immutable entry point. Cheap to clone and safe to invoke from
/// any number of threads at once; each call only touches the slot and global
/// block it is given.
#[derive(Clone)]
pub struct ShaderFunction {
    inner: Arc<EntryPoint>,
}

impl ShaderFunction {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn params(&self) -> &[ShaderParam] {
        &self.inner.params
    }

    pub fn global_layout(&self) -> &Arc<GlobalLayout> {
        &self.inner.layout
    }

    /// Runs the shader for one shading point. The closure tree is allocated
    /// from the slot's allocator and its root stored in the slot. A global
    /// block built for another layout is reported and leaves the slot empty.
    pub fn invoke(&self, slot: &mut ClosureSlot<'_>, globals: &GlobalBlock) {
        let entry = &*self.inner;
        if !globals.matches(&entry.layout) {
            entry.reporter.report(
                DebugLevel::Error,
                &format!("{}: global block does not match the layout the shader was compiled against", entry.name),
            );
            slot.set_root(None);
            return;
        }

        let mut params = entry.initial.clone();
        let mut rt = Runtime {
            slot: &mut *slot,
            globals,
            reporter: &entry.reporter,
        };
        entry.shader.run(&mut params, &mut rt);

        let root = entry
            .closure_output
            .and_then(|i| params.get(i))
            .and_then(Value::as_closure);
        slot.set_root(root);
    }
}

impl fmt::Debug for ShaderFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShaderFunction")
            .field("name", &self.inner.name)
            .field("params", &self.inner.params)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
enum Resolution {
    Unresolved,
    Resolved(ShaderFunction),
    Failed(ShadingError),
}

/// A per-use handle on a template. It borrows the template, so the template
/// outlives it by construction.
#[derive(Debug)]
pub struct ShaderInstance<'t> {
    template: &'t ShaderTemplate,
    state: Resolution,
}

impl<'t> ShaderInstance<'t> {
    pub(crate) fn new(template: &'t ShaderTemplate) -> Self {
        Self {
            template,
            state: Resolution::Unresolved,
        }
    }

    pub fn template(&self) -> &'t ShaderTemplate {
        self.template
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, Resolution::Resolved(_))
    }

    /// The entry point, once resolution has succeeded.
    pub fn function(&self) -> Option<&ShaderFunction> {
        match &self.state {
            Resolution::Resolved(f) => Some(f),
            _ => None,
        }
    }

    /// Why resolution failed, if it did.
    pub fn error(&self) -> Option<&ShadingError> {
        match &self.state {
            Resolution::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Links the template. Repeated calls return the first outcome, including
    /// a failure.
    pub(crate) fn resolve(
        &mut self,
        registry: &ClosureRegistry,
        reporter: &Reporter,
    ) -> Result<ShaderFunction, ShadingError> {
        match &self.state {
            Resolution::Resolved(f) => return Ok(f.clone()),
            Resolution::Failed(e) => return Err(e.clone()),
            Resolution::Unresolved => {}
        }

        match build_entry_point(self.template, registry, reporter) {
            Ok(function) => {
                info!(template = %self.template.name(), "resolved shader instance");
                self.state = Resolution::Resolved(function.clone());
                Ok(function)
            }
            Err(err) => {
                warn!(template = %self.template.name(), error = %err, "shader instance failed to resolve");
                self.state = Resolution::Failed(err.clone());
                Err(err)
            }
        }
    }
}

fn build_entry_point(
    template: &ShaderTemplate,
    registry: &ClosureRegistry,
    reporter: &Reporter,
) -> Result<ShaderFunction, ShadingError> {
    let mut linker = Linker::new(registry, template.name());
    let shader = linker.link(template)?;
    let layout = linker.into_layout();

    let params = template.params().to_vec();
    let mut initial = Vec::with_capacity(params.len());
    for (i, p) in params.iter().enumerate() {
        // Top-level inputs have no caller to feed them; they run on defaults.
        let value = match p.default {
            _ if p.is_output() => p.ty.zero(),
            Some(v) => v,
            None if !template.input_used(i) => p.ty.zero(),
            None => {
                return Err(ShadingError::UnboundInput {
                    group: template.name().to_string(),
                    unit: template.name().to_string(),
                    param: p.name.clone(),
                });
            }
        };
        initial.push(value);
    }
    let closure_output = params
        .iter()
        .position(|p| p.is_output() && p.ty == ValueType::Closure);

    Ok(ShaderFunction {
        inner: Arc::new(EntryPoint {
            name: template.name().to_string(),
            shader,
            params,
            initial,
            closure_output,
            layout,
            reporter: reporter.clone(),
        }),
    })
}
