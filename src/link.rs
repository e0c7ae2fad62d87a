//! Resolution-time linking: binds closure and texture references, checks that
//! every unit agrees on one global layout, and turns a frozen group into a
//! list of steps that route outputs straight into downstream inputs.

use std::sync::Arc;

use crate::closure::{ClosureRegistry, ClosureTypeDescriptor};
use crate::compiler::{CompiledUnit, ExecContext, UnitCode};
use crate::error::ShadingError;
use crate::global::{GlobalBlock, GlobalLayout};
use crate::group::ShaderGroupTemplate;
use crate::interface::{Reporter, TextureHandle};
use crate::memory::ClosureSlot;
use crate::template::{ShaderTemplate, ShaderUnitTemplate};
use crate::types::{ParamDirection, ShaderParam, Value, ValueType};

pub(crate) struct LinkedUnit {
    name: String,
    params: Vec<ShaderParam>,
    code: Arc<dyn UnitCode>,
    closures: Vec<Arc<ClosureTypeDescriptor>>,
    textures: Vec<TextureHandle>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum InputSource {
    Upstream { step: usize, param: usize },
    GroupParam(usize),
    Constant(Value),
}

pub(crate) struct LinkedStep {
    shader: LinkedShader,
    /// One entry per parameter of the step; `None` for outputs.
    inputs: Vec<Option<InputSource>>,
}

pub(crate) struct LinkedGroup {
    params: Vec<ShaderParam>,
    steps: Vec<LinkedStep>,
    /// `(group param, step, step param)` for every exposed output.
    outputs: Vec<(usize, usize, usize)>,
}

pub(crate) enum LinkedShader {
    Leaf(LinkedUnit),
    Composite(LinkedGroup),
}

/// Per-invocation state shared by every unit of a linked program.
pub(crate) struct Runtime<'a, 's> {
    pub slot: &'a mut ClosureSlot<'s>,
    pub globals: &'a GlobalBlock,
    pub reporter: &'a Reporter,
}

pub(crate) struct Linker<'r> {
    registry: &'r ClosureRegistry,
    layout: Option<Arc<GlobalLayout>>,
    top: String,
}

impl<'r> Linker<'r> {
    pub fn new(registry: &'r ClosureRegistry, top: &str) -> Self {
        Self {
            registry,
            layout: None,
            top: top.to_string(),
        }
    }

    /// The global layout every linked unit was compiled against.
    pub fn into_layout(self) -> Arc<GlobalLayout> {
        self.layout.unwrap_or_else(|| Arc::new(GlobalLayout::new()))
    }

    pub fn link(&mut self, template: &ShaderTemplate) -> Result<LinkedShader, ShadingError> {
        template.check_ready()?;
        match template {
            ShaderTemplate::Leaf(unit) => self.link_unit(unit).map(LinkedShader::Leaf),
            ShaderTemplate::Composite(group) => self.link_group(group).map(LinkedShader::Composite),
        }
    }

    fn adopt_layout(&mut self, layout: Option<&Arc<GlobalLayout>>) -> Result<(), ShadingError> {
        let Some(layout) = layout else {
            return Ok(());
        };
        match &self.layout {
            None => self.layout = Some(Arc::clone(layout)),
            Some(current) if Arc::ptr_eq(current, layout) || **current == **layout => {}
            Some(_) => {
                return Err(ShadingError::GlobalLayoutMismatch {
                    name: self.top.clone(),
                });
            }
        }
        Ok(())
    }

    fn link_unit(&mut self, unit: &ShaderUnitTemplate) -> Result<LinkedUnit, ShadingError> {
        let compiled: &CompiledUnit = unit.ready()?;
        self.adopt_layout(unit.global_layout())?;

        let mut closures = Vec::with_capacity(compiled.closures.len());
        for site in &compiled.closures {
            let descriptor = self
                .registry
                .descriptor_by_name(&site.name)
                .ok_or_else(|| ShadingError::UnknownClosureType(site.name.clone()))?;
            let expected: Vec<_> = descriptor.fields.iter().map(|f| f.ty.value_type()).collect();
            if expected != site.arg_types {
                let fmt = |tys: &[ValueType]| {
                    tys.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                };
                return Err(ShadingError::ClosureArgumentMismatch {
                    closure: site.name.clone(),
                    detail: format!(
                        "fields are ({}), call passes ({})",
                        fmt(&expected),
                        fmt(&site.arg_types)
                    ),
                });
            }
            closures.push(descriptor);
        }

        let textures = compiled
            .textures
            .iter()
            .map(|t| {
                unit.texture(t).ok_or_else(|| ShadingError::UnknownTexture {
                    unit: unit.name().to_string(),
                    texture: t.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(LinkedUnit {
            name: unit.name().to_string(),
            params: compiled.params.clone(),
            code: Arc::clone(&compiled.code),
            closures,
            textures,
        })
    }

    fn link_group(&mut self, group: &ShaderGroupTemplate) -> Result<LinkedGroup, ShadingError> {
        let frozen = group.frozen().ok_or_else(|| ShadingError::NotFrozen {
            name: group.name().to_string(),
        })?;
        let members = group.members();

        let mut step_of = vec![None; members.len()];
        for (step, &m) in frozen.order.iter().enumerate() {
            step_of[m] = Some(step);
        }

        let mut steps = Vec::with_capacity(frozen.order.len());
        for &m in &frozen.order {
            let template = &members[m].template;
            let shader = self.link(template)?;

            let inputs = template
                .params()
                .iter()
                .enumerate()
                .map(|(p, param)| {
                    if !param.is_input() {
                        return None;
                    }
                    let upstream = group
                        .edges()
                        .iter()
                        .find(|e| e.target == m && e.target_param == p)
                        .and_then(|e| {
                            step_of[e.source].map(|step| InputSource::Upstream {
                                step,
                                param: e.source_param,
                            })
                        });
                    let exposed = group.exposed().iter().position(|x| {
                        x.unit == m && x.param == p && x.descriptor.direction == ParamDirection::In
                    });
                    let source = upstream
                        .or_else(|| exposed.map(InputSource::GroupParam))
                        .or_else(|| group.explicit_default(m, p).map(InputSource::Constant))
                        .or_else(|| param.default.map(InputSource::Constant))
                        .unwrap_or(InputSource::Constant(param.ty.zero()));
                    Some(source)
                })
                .collect();

            steps.push(LinkedStep { shader, inputs });
        }

        let outputs = group
            .exposed()
            .iter()
            .enumerate()
            .filter(|(_, x)| x.descriptor.direction == ParamDirection::Out)
            .filter_map(|(g, x)| step_of[x.unit].map(|step| (g, step, x.param)))
            .collect();

        Ok(LinkedGroup {
            params: frozen.params.clone(),
            steps,
            outputs,
        })
    }
}

impl LinkedShader {
    /// Runs the program over `params` (inputs filled, outputs written back).
    pub fn run(&self, params: &mut [Value], rt: &mut Runtime<'_, '_>) {
        match self {
            LinkedShader::Leaf(unit) => unit.run(params, rt),
            LinkedShader::Composite(group) => group.run(params, rt),
        }
    }

    fn params(&self) -> &[ShaderParam] {
        match self {
            LinkedShader::Leaf(unit) => &unit.params,
            LinkedShader::Composite(group) => &group.params,
        }
    }
}

impl LinkedUnit {
    fn run(&self, params: &mut [Value], rt: &mut Runtime<'_, '_>) {
        let mut frame = vec![Value::Float(0.0); self.code.frame_size().max(params.len())];
        frame[..params.len()].copy_from_slice(params);

        let mut ctx = ExecContext::new(
            &mut *rt.slot,
            rt.globals,
            rt.reporter,
            &self.name,
            &self.closures,
            &self.textures,
        );
        self.code.execute(&mut frame, &mut ctx);

        for (i, p) in self.params.iter().enumerate() {
            if p.is_output() {
                params[i] = frame[i];
            }
        }
    }
}

impl LinkedGroup {
    fn run(&self, params: &mut [Value], rt: &mut Runtime<'_, '_>) {
        let mut values: Vec<Vec<Value>> = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let mut args: Vec<Value> = step
                .inputs
                .iter()
                .map(|source| match source {
                    Some(InputSource::Upstream { step, param }) => values[*step][*param],
                    Some(InputSource::GroupParam(i)) => params[*i],
                    Some(InputSource::Constant(v)) => *v,
                    None => Value::Float(0.0),
                })
                .collect();
            step.zero_outputs(&mut args);
            step.shader.run(&mut args, rt);
            values.push(args);
        }
        for &(g, step, p) in &self.outputs {
            params[g] = values[step][p];
        }
    }
}

impl LinkedStep {
    fn zero_outputs(&self, args: &mut [Value]) {
        for (arg, param) in args.iter_mut().zip(self.shader.params()) {
            if param.is_output() {
                *arg = param.ty.zero();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::BuiltinCompiler;
    use crate::interface::{DebugLevel, TracingInterface};
    use crate::memory::ClosureArena;
    use crate::types::ArgDescriptor;

    fn unit(name: &str, source: &str) -> ShaderTemplate {
        let mut unit = ShaderUnitTemplate::new(name);
        unit.compile(&BuiltinCompiler, &Arc::new(GlobalLayout::new()), source)
            .unwrap();
        unit.into()
    }

    #[test]
    fn inputs_prefer_edges_then_group_params_then_defaults() {
        let pass = unit("pass", "shader pass(float i = 3, float j, out float o) { o = i + j; }");
        let mut group = ShaderGroupTemplate::new("g");
        group.add_unit("a", pass.clone(), false).unwrap();
        group.add_unit("b", pass, true).unwrap();
        group.connect("a", "o", "b", "i").unwrap();
        // Shadowed by the connection.
        group.init_input_default("b", "i", 9.0f32).unwrap();
        group
            .expose_argument("a", "j", ArgDescriptor::input("j", ValueType::Float))
            .unwrap();
        group
            .expose_argument("b", "o", ArgDescriptor::output("o", ValueType::Float))
            .unwrap();
        group.init_input_default("b", "j", 2.0f32).unwrap();
        group.freeze(false).unwrap();

        let registry = ClosureRegistry::new(64);
        let mut linker = Linker::new(&registry, "g");
        let Ok(LinkedShader::Composite(linked)) = linker.link(&ShaderTemplate::from(group)) else {
            panic!("expected a linked group");
        };
        assert_eq!(
            linked.steps[0].inputs,
            vec![
                Some(InputSource::Constant(Value::Float(3.0))),
                Some(InputSource::GroupParam(0)),
                None
            ]
        );
        assert_eq!(
            linked.steps[1].inputs,
            vec![
                Some(InputSource::Upstream { step: 0, param: 2 }),
                Some(InputSource::Constant(Value::Float(2.0))),
                None
            ]
        );

        let mut arena = ClosureArena::new();
        let mut slot = ClosureSlot::new(&mut arena);
        let globals = GlobalBlock::empty();
        let reporter = Reporter::new(Arc::new(TracingInterface), DebugLevel::Warning);
        let mut rt = Runtime {
            slot: &mut slot,
            globals: &globals,
            reporter: &reporter,
        };
        let mut params = vec![Value::Float(5.0), Value::Float(0.0)];
        LinkedShader::Composite(linked).run(&mut params, &mut rt);
        assert_eq!(params[1], Value::Float(10.0));
    }

    #[test]
    fn unregistered_textures_fail_to_link() {
        let template = unit(
            "textured",
            "shader textured(out color c) { c = texture2d_sample<albedo>(0, 0); }",
        );
        let registry = ClosureRegistry::new(64);
        let err = Linker::new(&registry, "textured").link(&template).err();
        assert_eq!(
            err,
            Some(ShadingError::UnknownTexture {
                unit: "textured".into(),
                texture: "albedo".into(),
            })
        );
    }
}
