//! Compiler collaborator seam and the builtin reference compiler.
//!
//! The runtime only ever talks to a [`ShaderCompiler`]. Whatever it returns is a
//! [`CompiledUnit`]: the parameter list, the facts the group pass and the linker
//! need (which inputs the code reads, which closure types and textures it
//! references), and an opaque [`UnitCode`] to execute.

mod ast;
mod ir;
mod lexer;
mod lower;
mod parser;

use std::fmt;
use std::sync::Arc;

use crate::closure::ClosureTypeDescriptor;
use crate::error::Diagnostic;
use crate::global::{GlobalBlock, GlobalLayout};
use crate::interface::{DebugLevel, Reporter, TextureHandle};
use crate::memory::ClosureSlot;
use crate::types::{Float3, ShaderParam, Value, ValueType};

/// What the compiler may resolve names against.
#[derive(Clone, Copy, Debug)]
pub struct CompileEnv<'a> {
    pub globals: &'a GlobalLayout,
}

/// One `make_closure<NAME>(...)` call site, checked against the registry when
/// the shader is resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosureRef {
    pub name: String,
    pub arg_types: Vec<ValueType>,
}

/// Executable body of one compiled unit.
///
/// The frame passed to [`UnitCode::execute`] has [`UnitCode::frame_size`]
/// slots; the unit's parameters occupy the first slots in declaration order,
/// inputs already filled in and outputs zeroed. Outputs are read back from the
/// same slots afterwards.
pub trait UnitCode: Send + Sync {
    fn frame_size(&self) -> usize;

    fn execute(&self, frame: &mut [Value], ctx: &mut ExecContext<'_, '_>);
}

#[derive(Clone)]
pub struct CompiledUnit {
    pub shader_name: String,
    pub params: Vec<ShaderParam>,
    /// Parallel to `params`; `false` for inputs the code never reads.
    pub used_inputs: Vec<bool>,
    /// Indexed by closure site.
    pub closures: Vec<ClosureRef>,
    /// Texture names, indexed by texture site.
    pub textures: Vec<String>,
    pub code: Arc<dyn UnitCode>,
}

impl CompiledUnit {
    pub fn param(&self, name: &str) -> Option<(usize, &ShaderParam)> {
        self.params.iter().enumerate().find(|(_, p)| p.name == name)
    }

    pub fn input_used(&self, index: usize) -> bool {
        self.used_inputs.get(index).copied().unwrap_or(false)
    }
}

impl fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("shader_name", &self.shader_name)
            .field("params", &self.params)
            .field("used_inputs", &self.used_inputs)
            .field("closures", &self.closures)
            .field("textures", &self.textures)
            .field("frame_size", &self.code.frame_size())
            .finish()
    }
}

pub trait ShaderCompiler: Send + Sync {
    fn compile(&self, source: &str, env: &CompileEnv<'_>) -> Result<CompiledUnit, Vec<Diagnostic>>;
}

/// Compiles the bundled shading-language subset to an interpreted IR.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinCompiler;

impl ShaderCompiler for BuiltinCompiler {
    fn compile(&self, source: &str, env: &CompileEnv<'_>) -> Result<CompiledUnit, Vec<Diagnostic>> {
        let tokens = lexer::tokenize(source).map_err(|d| vec![d])?;
        let ast = parser::Parser::new(tokens)
            .parse_shader()
            .map_err(|d| vec![d])?;
        lower::lower_shader(&ast, env)
    }
}

/// Everything shader code can reach while one unit executes.
pub struct ExecContext<'a, 's> {
    slot: &'a mut ClosureSlot<'s>,
    globals: &'a GlobalBlock,
    reporter: &'a Reporter,
    unit: &'a str,
    closures: &'a [Arc<ClosureTypeDescriptor>],
    textures: &'a [TextureHandle],
}

impl<'a, 's> ExecContext<'a, 's> {
    pub(crate) fn new(
        slot: &'a mut ClosureSlot<'s>,
        globals: &'a GlobalBlock,
        reporter: &'a Reporter,
        unit: &'a str,
        closures: &'a [Arc<ClosureTypeDescriptor>],
        textures: &'a [TextureHandle],
    ) -> Self {
        Self {
            slot,
            globals,
            reporter,
            unit,
            closures,
            textures,
        }
    }

    /// Reads the global bound to `slot` in the layout the unit was compiled
    /// against.
    pub fn global(&self, slot: usize, ty: ValueType) -> Value {
        self.globals
            .value(slot)
            .filter(|v| v.ty() == ty)
            .unwrap_or_else(|| ty.zero())
    }

    /// Allocates and fills a closure leaf for closure site `site`.
    pub fn make_closure(&mut self, site: usize, args: &[Value]) -> Value {
        let Some(descriptor) = self.closures.get(site) else {
            self.report(DebugLevel::Error, &format!("closure site {site} is not bound"));
            return Value::Closure(None);
        };
        let block = self.slot.write_leaf(descriptor, args);
        if block.is_none() {
            let message = format!(
                "closure allocation of {} bytes for '{}' failed",
                descriptor.size, descriptor.name
            );
            self.report(DebugLevel::Error, &message);
        }
        Value::Closure(block)
    }

    /// `lhs + rhs`; a null operand yields the other side.
    pub fn closure_add(&mut self, lhs: Value, rhs: Value) -> Value {
        match (lhs.as_closure(), rhs.as_closure()) {
            (Some(l), Some(r)) => {
                let block = self.slot.write_add(l, r);
                if block.is_none() {
                    self.report(DebugLevel::Error, "closure allocation for an add node failed");
                }
                Value::Closure(block)
            }
            (Some(only), None) | (None, Some(only)) => Value::Closure(Some(only)),
            (None, None) => Value::Closure(None),
        }
    }

    /// `weight * closure`; a null closure stays null.
    pub fn closure_mul(&mut self, weight: f32, closure: Value) -> Value {
        let Some(child) = closure.as_closure() else {
            return Value::Closure(None);
        };
        let block = self.slot.write_mul(weight, child);
        if block.is_none() {
            self.report(DebugLevel::Error, "closure allocation for a mul node failed");
        }
        Value::Closure(block)
    }

    pub fn sample_2d(&self, texture: usize, u: f32, v: f32) -> Float3 {
        match self.textures.get(texture) {
            Some(&handle) => self.reporter.interface().sample_2d(handle, u, v),
            None => Float3::ZERO,
        }
    }

    pub fn sample_alpha_2d(&self, texture: usize, u: f32, v: f32) -> f32 {
        match self.textures.get(texture) {
            Some(&handle) => self.reporter.interface().sample_alpha_2d(handle, u, v),
            None => 0.0,
        }
    }

    /// Routes a runtime message to the host, prefixed with the executing unit.
    pub fn report(&self, level: DebugLevel, message: &str) {
        self.reporter.report(level, &format!("{}: {message}", self.unit));
    }
}
