//! Shader group templates: a graph of member templates wired output to input,
//! frozen into one evaluation order before it can be linked.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};

use crate::error::ShadingError;
use crate::graph::{Cycle, topo_sort, upstream_reachable};
use crate::template::ShaderTemplate;
use crate::types::{ArgDescriptor, ParamDirection, ShaderParam, Value};

#[derive(Clone, Debug)]
pub(crate) struct Member {
    pub name: String,
    pub template: ShaderTemplate,
}

/// A resolved `source.output -> target.input` edge, by member and parameter index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Edge {
    pub source: usize,
    pub source_param: usize,
    pub target: usize,
    pub target_param: usize,
}

/// A connection as the caller named it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub source_unit: String,
    pub source_param: String,
    pub target_unit: String,
    pub target_param: String,
}

#[derive(Clone, Debug)]
pub(crate) struct ExposedArg {
    pub unit: usize,
    pub param: usize,
    pub descriptor: ArgDescriptor,
}

#[derive(Clone, Debug)]
pub(crate) struct FrozenGroup {
    /// Active members in evaluation order.
    pub order: Vec<usize>,
    pub params: Vec<ShaderParam>,
    pub param_used: Vec<bool>,
    pub pruned: Vec<usize>,
}

#[derive(Clone, Debug)]
pub struct ShaderGroupTemplate {
    name: String,
    members: Vec<Member>,
    by_name: HashMap<String, usize>,
    root: Option<usize>,
    edges: Vec<Edge>,
    exposed: Vec<ExposedArg>,
    defaults: HashMap<(usize, usize), Value>,
    frozen: Option<FrozenGroup>,
}

impl ShaderGroupTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: Vec::new(),
            by_name: HashMap::new(),
            root: None,
            edges: Vec::new(),
            exposed: Vec::new(),
            defaults: HashMap::new(),
            frozen: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    fn ensure_open(&self) -> Result<(), ShadingError> {
        if self.is_frozen() {
            return Err(ShadingError::AlreadyFrozen {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    fn member(&self, unit: &str) -> Result<usize, ShadingError> {
        self.by_name
            .get(unit)
            .copied()
            .ok_or_else(|| ShadingError::UnknownUnit {
                group: self.name.clone(),
                unit: unit.to_string(),
            })
    }

    fn member_param(&self, unit: &str, param: &str) -> Result<(usize, usize, &ShaderParam), ShadingError> {
        let m = self.member(unit)?;
        let (p, sp) = self.members[m]
            .template
            .param(param)
            .ok_or_else(|| ShadingError::UnknownParameter {
                unit: unit.to_string(),
                param: param.to_string(),
            })?;
        Ok((m, p, sp))
    }

    fn input_taken(&self, unit: usize, param: usize) -> bool {
        self.edges
            .iter()
            .any(|e| e.target == unit && e.target_param == param)
            || self.exposed_input(unit, param).is_some()
    }

    fn exposed_input(&self, unit: usize, param: usize) -> Option<usize> {
        self.exposed.iter().position(|x| {
            x.unit == unit && x.param == param && x.descriptor.direction == ParamDirection::In
        })
    }

    /// Adds a member. The template must be compiled (a unit) or frozen (a group).
    pub fn add_unit(
        &mut self,
        name: impl Into<String>,
        template: impl Into<ShaderTemplate>,
        is_root: bool,
    ) -> Result<(), ShadingError> {
        self.ensure_open()?;
        let name = name.into();
        if self.by_name.contains_key(&name) {
            return Err(ShadingError::DuplicateUnitName {
                group: self.name.clone(),
                unit: name,
            });
        }
        if is_root {
            if let Some(existing) = self.root {
                return Err(ShadingError::MultipleRoots {
                    group: self.name.clone(),
                    existing: self.members[existing].name.clone(),
                    requested: name,
                });
            }
        }
        let template = template.into();
        template.check_ready()?;

        let index = self.members.len();
        debug!(group = %self.name, unit = %name, template = %template.name(), is_root, "added unit");
        self.by_name.insert(name.clone(), index);
        self.members.push(Member { name, template });
        if is_root {
            self.root = Some(index);
        }
        Ok(())
    }

    /// Routes `source_unit.source_param` (an output) into
    /// `target_unit.target_param` (an input). Types must match exactly and an
    /// input takes at most one source; one output may feed many inputs.
    pub fn connect(
        &mut self,
        source_unit: &str,
        source_param: &str,
        target_unit: &str,
        target_param: &str,
    ) -> Result<(), ShadingError> {
        self.ensure_open()?;
        let (source, sp, src) = self.member_param(source_unit, source_param)?;
        let (target, tp, dst) = self.member_param(target_unit, target_param)?;

        if !src.is_output() {
            return Err(ShadingError::DirectionMismatch {
                unit: source_unit.to_string(),
                param: source_param.to_string(),
                expected: ParamDirection::Out,
            });
        }
        if !dst.is_input() {
            return Err(ShadingError::DirectionMismatch {
                unit: target_unit.to_string(),
                param: target_param.to_string(),
                expected: ParamDirection::In,
            });
        }
        if src.ty != dst.ty {
            return Err(ShadingError::TypeMismatch {
                source_name: format!("{source_unit}.{source_param}"),
                source_type: src.ty,
                target_name: format!("{target_unit}.{target_param}"),
                target_type: dst.ty,
            });
        }
        if self.input_taken(target, tp) {
            return Err(ShadingError::AlreadyConnectedInput {
                unit: target_unit.to_string(),
                param: target_param.to_string(),
            });
        }

        self.edges.push(Edge {
            source,
            source_param: sp,
            target,
            target_param: tp,
        });
        Ok(())
    }

    /// Publishes `unit.param` as a parameter of the group itself. The
    /// descriptor's direction and type must match the inner parameter; its
    /// default, if any, only applies to inputs.
    pub fn expose_argument(
        &mut self,
        unit: &str,
        param: &str,
        descriptor: ArgDescriptor,
    ) -> Result<(), ShadingError> {
        self.ensure_open()?;
        let (m, p, inner) = self.member_param(unit, param)?;

        if descriptor.direction != inner.direction {
            return Err(ShadingError::DirectionMismatch {
                unit: unit.to_string(),
                param: param.to_string(),
                expected: descriptor.direction,
            });
        }
        if descriptor.ty != inner.ty {
            return Err(ShadingError::TypeMismatch {
                source_name: format!("{unit}.{param}"),
                source_type: inner.ty,
                target_name: format!("argument '{}'", descriptor.name),
                target_type: descriptor.ty,
            });
        }
        if let Some(default) = &descriptor.default {
            if inner.is_input() && default.ty() != inner.ty {
                return Err(ShadingError::TypeMismatch {
                    source_name: format!("default of argument '{}'", descriptor.name),
                    source_type: default.ty(),
                    target_name: format!("{unit}.{param}"),
                    target_type: inner.ty,
                });
            }
        }
        if self.exposed.iter().any(|x| x.descriptor.name == descriptor.name) {
            return Err(ShadingError::DuplicateArgument {
                group: self.name.clone(),
                name: descriptor.name,
            });
        }
        if inner.is_input() && self.input_taken(m, p) {
            return Err(ShadingError::AlreadyConnectedInput {
                unit: unit.to_string(),
                param: param.to_string(),
            });
        }

        self.exposed.push(ExposedArg {
            unit: m,
            param: p,
            descriptor,
        });
        Ok(())
    }

    /// Constant for an input that stays unconnected. Ignored if something is
    /// connected to the input by freeze time.
    pub fn init_input_default(
        &mut self,
        unit: &str,
        param: &str,
        value: impl Into<Value>,
    ) -> Result<(), ShadingError> {
        self.ensure_open()?;
        let value = value.into();
        let (m, p, inner) = self.member_param(unit, param)?;
        if !inner.is_input() {
            return Err(ShadingError::DirectionMismatch {
                unit: unit.to_string(),
                param: param.to_string(),
                expected: ParamDirection::In,
            });
        }
        if value.ty() != inner.ty {
            return Err(ShadingError::TypeMismatch {
                source_name: "default value".to_string(),
                source_type: value.ty(),
                target_name: format!("{unit}.{param}"),
                target_type: inner.ty,
            });
        }
        self.defaults.insert((m, p), value);
        Ok(())
    }

    /// Validates the graph and fixes the evaluation order. On failure the group
    /// stays editable.
    pub fn freeze(&mut self, allow_unreachable: bool) -> Result<(), ShadingError> {
        self.ensure_open()?;
        let root = self.root.ok_or_else(|| ShadingError::NoRoot {
            group: self.name.clone(),
        })?;

        let unit_edges: Vec<(usize, usize)> = self.edges.iter().map(|e| (e.source, e.target)).collect();
        let order = topo_sort(self.members.len(), &unit_edges).map_err(|Cycle(path)| {
            ShadingError::CyclicDependency {
                group: self.name.clone(),
                cycle: path.iter().map(|&i| self.members[i].name.clone()).collect(),
            }
        })?;

        let seeds = std::iter::once(root).chain(
            self.exposed
                .iter()
                .filter(|x| x.descriptor.direction == ParamDirection::Out)
                .map(|x| x.unit),
        );
        let active: HashSet<usize> = upstream_reachable(&unit_edges, seeds);

        let mut pruned = Vec::new();
        for (i, member) in self.members.iter().enumerate() {
            if active.contains(&i) {
                continue;
            }
            if !allow_unreachable {
                return Err(ShadingError::UnreachableUnit {
                    group: self.name.clone(),
                    unit: member.name.clone(),
                });
            }
            warn!(group = %self.name, unit = %member.name, "pruning unit that feeds neither root nor an exposed output");
            pruned.push(i);
        }

        let order: Vec<usize> = order.into_iter().filter(|i| active.contains(i)).collect();
        for &m in &order {
            let member = &self.members[m];
            for (p, param) in member.template.params().iter().enumerate() {
                if !param.is_input() {
                    continue;
                }
                let bound = self.input_taken(m, p)
                    || self.defaults.contains_key(&(m, p))
                    || param.default.is_some()
                    || !member.template.input_used(p);
                if !bound {
                    return Err(ShadingError::UnboundInput {
                        group: self.name.clone(),
                        unit: member.name.clone(),
                        param: param.name.clone(),
                    });
                }
            }
        }

        let mut params = Vec::with_capacity(self.exposed.len());
        let mut param_used = Vec::with_capacity(self.exposed.len());
        for x in &self.exposed {
            let member = &self.members[x.unit];
            let inner = &member.template.params()[x.param];
            let default = match x.descriptor.direction {
                ParamDirection::In => x
                    .descriptor
                    .default
                    .or_else(|| self.defaults.get(&(x.unit, x.param)).copied())
                    .or(inner.default),
                ParamDirection::Out => None,
            };
            params.push(ShaderParam {
                name: x.descriptor.name.clone(),
                direction: x.descriptor.direction,
                ty: x.descriptor.ty,
                default,
            });
            param_used.push(
                x.descriptor.direction == ParamDirection::In
                    && active.contains(&x.unit)
                    && member.template.input_used(x.param),
            );
        }

        let names: Vec<&str> = order.iter().map(|&i| self.members[i].name.as_str()).collect();
        info!(group = %self.name, order = ?names, params = params.len(), "froze shader group");

        self.frozen = Some(FrozenGroup {
            order,
            params,
            param_used,
            pruned,
        });
        Ok(())
    }

    /// Member names in evaluation order; empty until frozen.
    pub fn evaluation_order(&self) -> Vec<&str> {
        self.frozen.as_ref().map_or_else(Vec::new, |f| {
            f.order.iter().map(|&i| self.members[i].name.as_str()).collect()
        })
    }

    pub fn pruned_units(&self) -> Vec<&str> {
        self.frozen.as_ref().map_or_else(Vec::new, |f| {
            f.pruned.iter().map(|&i| self.members[i].name.as_str()).collect()
        })
    }

    /// Synthesized parameter list; empty until frozen.
    pub fn params(&self) -> &[ShaderParam] {
        self.frozen.as_ref().map_or(&[], |f| &f.params)
    }

    pub(crate) fn param_used(&self, index: usize) -> bool {
        self.frozen
            .as_ref()
            .and_then(|f| f.param_used.get(index).copied())
            .unwrap_or(false)
    }

    pub fn root(&self) -> Option<&str> {
        self.root.map(|r| self.members[r].name.as_str())
    }

    pub fn unit_names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|m| m.name.as_str())
    }

    pub fn unit(&self, name: &str) -> Option<&ShaderTemplate> {
        self.by_name.get(name).map(|&i| &self.members[i].template)
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.edges
            .iter()
            .map(|e| {
                let src = &self.members[e.source];
                let dst = &self.members[e.target];
                Connection {
                    source_unit: src.name.clone(),
                    source_param: src.template.params()[e.source_param].name.clone(),
                    target_unit: dst.name.clone(),
                    target_param: dst.template.params()[e.target_param].name.clone(),
                }
            })
            .collect()
    }

    pub(crate) fn members(&self) -> &[Member] {
        &self.members
    }

    pub(crate) fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub(crate) fn exposed(&self) -> &[ExposedArg] {
        &self.exposed
    }

    pub(crate) fn explicit_default(&self, unit: usize, param: usize) -> Option<Value> {
        self.defaults.get(&(unit, param)).copied()
    }

    pub(crate) fn frozen(&self) -> Option<&FrozenGroup> {
        self.frozen.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::compiler::BuiltinCompiler;
    use crate::error::ErrorKind;
    use crate::global::GlobalLayout;
    use crate::template::ShaderUnitTemplate;
    use crate::types::ValueType;

    fn unit(name: &str, src: &str) -> ShaderUnitTemplate {
        let mut u = ShaderUnitTemplate::new(name);
        u.compile(&BuiltinCompiler, &Arc::new(GlobalLayout::new()), src)
            .unwrap();
        u
    }

    fn source() -> ShaderUnitTemplate {
        unit("source", "shader source(float k = 1, out float v) { v = k; }")
    }

    fn pass() -> ShaderUnitTemplate {
        unit("pass", "shader pass(float x, out float v) { v = x; }")
    }

    #[test]
    fn edits_after_freeze_fail() {
        let mut g = ShaderGroupTemplate::new("g");
        g.add_unit("a", source(), true).unwrap();
        g.freeze(false).unwrap();
        assert!(matches!(g.freeze(false), Err(ShadingError::AlreadyFrozen { .. })));
        assert!(matches!(g.add_unit("b", source(), false), Err(ShadingError::AlreadyFrozen { .. })));
        assert!(matches!(
            g.init_input_default("a", "k", 2.0f32),
            Err(ShadingError::AlreadyFrozen { .. })
        ));
    }

    #[test]
    fn roots_are_exclusive_and_required() {
        let mut g = ShaderGroupTemplate::new("g");
        g.add_unit("a", source(), false).unwrap();
        assert_eq!(g.freeze(false), Err(ShadingError::NoRoot { group: "g".into() }));
        g.add_unit("b", source(), true).unwrap();
        let err = g.add_unit("c", source(), true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Graph);
        assert!(matches!(err, ShadingError::MultipleRoots { .. }));
    }

    #[test]
    fn connect_checks_endpoints() {
        let mut g = ShaderGroupTemplate::new("g");
        g.add_unit("a", source(), false).unwrap();
        g.add_unit("b", pass(), true).unwrap();

        assert!(matches!(g.connect("a", "v", "zz", "x"), Err(ShadingError::UnknownUnit { .. })));
        assert!(matches!(g.connect("a", "nope", "b", "x"), Err(ShadingError::UnknownParameter { .. })));
        assert!(matches!(
            g.connect("a", "k", "b", "x"),
            Err(ShadingError::DirectionMismatch { expected: ParamDirection::Out, .. })
        ));
        assert!(matches!(
            g.connect("a", "v", "b", "v"),
            Err(ShadingError::DirectionMismatch { expected: ParamDirection::In, .. })
        ));
        g.connect("a", "v", "b", "x").unwrap();
        assert_eq!(
            g.connections(),
            vec![Connection {
                source_unit: "a".into(),
                source_param: "v".into(),
                target_unit: "b".into(),
                target_param: "x".into(),
            }]
        );
    }

    #[test]
    fn exposed_inputs_count_as_connected() {
        let mut g = ShaderGroupTemplate::new("g");
        g.add_unit("a", source(), false).unwrap();
        g.add_unit("b", pass(), true).unwrap();
        g.expose_argument("b", "x", ArgDescriptor::input("gain", ValueType::Float))
            .unwrap();
        assert!(matches!(
            g.connect("a", "v", "b", "x"),
            Err(ShadingError::AlreadyConnectedInput { .. })
        ));
        assert!(matches!(
            g.expose_argument("b", "v", ArgDescriptor::output("gain", ValueType::Float)),
            Err(ShadingError::DuplicateArgument { .. })
        ));
        assert!(matches!(
            g.expose_argument("b", "v", ArgDescriptor::output("out", ValueType::Int)),
            Err(ShadingError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn unreachable_units_fail_or_are_pruned() {
        let build = || {
            let mut g = ShaderGroupTemplate::new("g");
            g.add_unit("a", source(), true).unwrap();
            g.add_unit("stray", pass(), false).unwrap();
            g
        };

        let mut strict = build();
        assert_eq!(
            strict.freeze(false),
            Err(ShadingError::UnreachableUnit {
                group: "g".into(),
                unit: "stray".into(),
            })
        );
        assert!(!strict.is_frozen());

        let mut lenient = build();
        lenient.freeze(true).unwrap();
        assert_eq!(lenient.evaluation_order(), vec!["a"]);
        assert_eq!(lenient.pruned_units(), vec!["stray"]);
    }

    #[test]
    fn synthesized_params_take_the_first_available_default() {
        let mut g = ShaderGroupTemplate::new("g");
        g.add_unit("a", source(), false).unwrap();
        g.add_unit("b", pass(), true).unwrap();
        g.connect("a", "v", "b", "x").unwrap();
        g.init_input_default("a", "k", 3.0f32).unwrap();
        g.expose_argument("a", "k", ArgDescriptor::input("k", ValueType::Float))
            .unwrap();
        g.expose_argument("b", "v", ArgDescriptor::output("result", ValueType::Float))
            .unwrap();
        g.freeze(false).unwrap();

        let params = g.params();
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].default, Some(Value::Float(3.0)));
        assert_eq!(params[1].direction, ParamDirection::Out);
        assert!(g.param_used(0));
        assert!(!g.param_used(1));
    }
}
