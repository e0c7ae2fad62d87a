use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::group::ShaderGroupTemplate;
use crate::template::ShaderTemplate;
use crate::types::{ArgDescriptor, Value, ValueType};

/// JSON description of a shader group: which library shaders to instantiate
/// and how to wire them.
///
/// ```json
/// {
///   "name": "tinted_lambert",
///   "units": [
///     { "name": "tint", "shader": "constant_color" },
///     { "name": "surface", "shader": "lambert_surface", "root": true }
///   ],
///   "connections": [
///     { "from": { "unit": "tint", "param": "rgb" },
///       "to": { "unit": "surface", "param": "base" } }
///   ],
///   "exposed": [{ "unit": "tint", "param": "value", "name": "tint_value", "default": [1, 0, 0] }],
///   "defaults": [{ "unit": "surface", "param": "roughness", "value": 0.5 }]
/// }
/// ```
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct GroupDSL {
    pub name: String,
    pub units: Vec<UnitDSL>,
    #[serde(default)]
    pub connections: Vec<Connection>,
    #[serde(default)]
    pub exposed: Vec<ExposedArgument>,
    #[serde(default)]
    pub defaults: Vec<InputDefault>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct UnitDSL {
    pub name: String,
    /// Library key of the template to instantiate.
    pub shader: String,
    #[serde(default)]
    pub root: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub unit: String,
    pub param: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct Connection {
    pub from: Endpoint,
    pub to: Endpoint,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ExposedArgument {
    pub unit: String,
    pub param: String,
    /// Name on the group; defaults to the inner parameter name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct InputDefault {
    pub unit: String,
    pub param: String,
    pub value: serde_json::Value,
}

pub fn parse_group_json(text: &str) -> Result<GroupDSL> {
    serde_json::from_str(text).context("failed to parse group json")
}

pub fn load_group_from_path(path: impl AsRef<Path>) -> Result<GroupDSL> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read group json at {}", path.display()))?;
    parse_group_json(&text).with_context(|| format!("in {}", path.display()))
}

fn param_type(group: &ShaderGroupTemplate, unit: &str, param: &str) -> Result<ValueType> {
    let template = group
        .unit(unit)
        .ok_or_else(|| anyhow!("unknown unit '{unit}' in group '{}'", group.name()))?;
    template
        .param(param)
        .map(|(_, p)| p.ty)
        .ok_or_else(|| anyhow!("unit '{unit}' has no parameter '{param}'"))
}

fn json_value(value: &serde_json::Value, unit: &str, param: &str, group: &ShaderGroupTemplate) -> Result<Value> {
    let ty = param_type(group, unit, param)?;
    Value::from_json(value, ty).ok_or_else(|| anyhow!("value {value} for '{unit}.{param}' is not a valid {ty}"))
}

/// Replays `desc` onto `group`: add units, connect, expose, set defaults.
/// Freezing is left to the caller.
pub fn apply_group(
    group: &mut ShaderGroupTemplate,
    desc: &GroupDSL,
    library: &HashMap<String, ShaderTemplate>,
) -> Result<()> {
    if desc.units.is_empty() {
        bail!("group '{}' has no units", desc.name);
    }

    for u in &desc.units {
        let template = library
            .get(&u.shader)
            .ok_or_else(|| anyhow!("unit '{}' references unknown shader '{}'", u.name, u.shader))?;
        group
            .add_unit(u.name.as_str(), template.clone(), u.root)
            .with_context(|| format!("failed to add unit '{}'", u.name))?;
    }

    for c in &desc.connections {
        group
            .connect(&c.from.unit, &c.from.param, &c.to.unit, &c.to.param)
            .with_context(|| {
                format!(
                    "failed to connect {}.{} -> {}.{}",
                    c.from.unit, c.from.param, c.to.unit, c.to.param
                )
            })?;
    }

    for x in &desc.exposed {
        let inner = group
            .unit(&x.unit)
            .and_then(|t| t.param(&x.param).map(|(_, p)| p.clone()))
            .ok_or_else(|| anyhow!("cannot expose unknown parameter '{}.{}'", x.unit, x.param))?;
        let mut descriptor = ArgDescriptor {
            name: x.name.clone().unwrap_or_else(|| inner.name.clone()),
            ty: inner.ty,
            direction: inner.direction,
            default: None,
        };
        if let Some(v) = &x.default {
            descriptor.default = Some(json_value(v, &x.unit, &x.param, group)?);
        }
        group
            .expose_argument(&x.unit, &x.param, descriptor)
            .with_context(|| format!("failed to expose {}.{}", x.unit, x.param))?;
    }

    for d in &desc.defaults {
        let value = json_value(&d.value, &d.unit, &d.param, group)?;
        group
            .init_input_default(&d.unit, &d.param, value)
            .with_context(|| format!("failed to set default for {}.{}", d.unit, d.param))?;
    }

    Ok(())
}
