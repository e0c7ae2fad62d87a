//! Core value and parameter types shared by templates, the compiler and execution.

use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

use crate::memory::BlockId;

/// Semantic type of a shader parameter, local, global or closure argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Float,
    Int,
    Bool,
    Float3,
    Closure,
}

impl ValueType {
    pub fn zero(self) -> Value {
        match self {
            ValueType::Float => Value::Float(0.0),
            ValueType::Int => Value::Int(0),
            ValueType::Bool => Value::Bool(false),
            ValueType::Float3 => Value::Float3(Float3::ZERO),
            ValueType::Closure => Value::Closure(None),
        }
    }

    /// Maps a shading-language type keyword onto its semantic type.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "float" => Some(ValueType::Float),
            "int" => Some(ValueType::Int),
            "bool" => Some(ValueType::Bool),
            "float3" | "color" | "vector" | "normal" => Some(ValueType::Float3),
            "closure" => Some(ValueType::Closure),
            _ => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueType::Float => "float",
            ValueType::Int => "int",
            ValueType::Bool => "bool",
            ValueType::Float3 => "float3",
            ValueType::Closure => "closure",
        };
        f.write_str(s)
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable, Serialize, Deserialize)]
pub struct Float3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Float3 {
    pub const ZERO: Float3 = Float3::new(0.0, 0.0, 0.0);

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub const fn splat(v: f32) -> Self {
        Self::new(v, v, v)
    }

    pub fn component(self, index: usize) -> f32 {
        match index {
            0 => self.x,
            1 => self.y,
            _ => self.z,
        }
    }
}

pub fn make_float3(x: f32, y: f32, z: f32) -> Float3 {
    Float3::new(x, y, z)
}

impl Add for Float3 {
    type Output = Float3;
    fn add(self, o: Float3) -> Float3 {
        Float3::new(self.x + o.x, self.y + o.y, self.z + o.z)
    }
}

impl Sub for Float3 {
    type Output = Float3;
    fn sub(self, o: Float3) -> Float3 {
        Float3::new(self.x - o.x, self.y - o.y, self.z - o.z)
    }
}

impl Mul for Float3 {
    type Output = Float3;
    fn mul(self, o: Float3) -> Float3 {
        Float3::new(self.x * o.x, self.y * o.y, self.z * o.z)
    }
}

impl Mul<f32> for Float3 {
    type Output = Float3;
    fn mul(self, s: f32) -> Float3 {
        Float3::new(self.x * s, self.y * s, self.z * s)
    }
}

impl Div for Float3 {
    type Output = Float3;
    fn div(self, o: Float3) -> Float3 {
        Float3::new(self.x / o.x, self.y / o.y, self.z / o.z)
    }
}

impl Div<f32> for Float3 {
    type Output = Float3;
    fn div(self, s: f32) -> Float3 {
        Float3::new(self.x / s, self.y / s, self.z / s)
    }
}

impl Neg for Float3 {
    type Output = Float3;
    fn neg(self) -> Float3 {
        Float3::new(-self.x, -self.y, -self.z)
    }
}

/// A runtime value. Closures are references into the caller's closure memory.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value {
    Float(f32),
    Int(i32),
    Bool(bool),
    Float3(Float3),
    Closure(Option<BlockId>),
}

impl Value {
    pub fn ty(&self) -> ValueType {
        match self {
            Value::Float(_) => ValueType::Float,
            Value::Int(_) => ValueType::Int,
            Value::Bool(_) => ValueType::Bool,
            Value::Float3(_) => ValueType::Float3,
            Value::Closure(_) => ValueType::Closure,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match *self {
            Value::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match *self {
            Value::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float3(&self) -> Option<Float3> {
        match *self {
            Value::Float3(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<BlockId> {
        match *self {
            Value::Closure(v) => v,
            _ => None,
        }
    }

    /// Interprets a JSON literal as a constant of type `ty`.
    ///
    /// Accepts numbers for `float`/`int`, booleans for `bool`, and either a
    /// 3-element array or a single number (splatted) for `float3`.
    pub fn from_json(value: &serde_json::Value, ty: ValueType) -> Option<Value> {
        match ty {
            ValueType::Float => value.as_f64().map(|v| Value::Float(v as f32)),
            ValueType::Int => value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(Value::Int),
            ValueType::Bool => value.as_bool().map(Value::Bool),
            ValueType::Float3 => {
                if let Some(v) = value.as_f64() {
                    return Some(Value::Float3(Float3::splat(v as f32)));
                }
                let arr = value.as_array()?;
                if arr.len() != 3 {
                    return None;
                }
                let x = arr[0].as_f64()? as f32;
                let y = arr[1].as_f64()? as f32;
                let z = arr[2].as_f64()? as f32;
                Some(Value::Float3(Float3::new(x, y, z)))
            }
            ValueType::Closure => value.is_null().then_some(Value::Closure(None)),
        }
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Float3> for Value {
    fn from(v: Float3) -> Self {
        Value::Float3(v)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamDirection {
    In,
    Out,
}

impl fmt::Display for ParamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamDirection::In => f.write_str("input"),
            ParamDirection::Out => f.write_str("output"),
        }
    }
}

/// One entry of a unit's (or frozen group's) parameter list.
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderParam {
    pub name: String,
    pub direction: ParamDirection,
    pub ty: ValueType,
    /// Template-declared default, only meaningful for inputs.
    pub default: Option<Value>,
}

impl ShaderParam {
    pub fn is_input(&self) -> bool {
        self.direction == ParamDirection::In
    }

    pub fn is_output(&self) -> bool {
        self.direction == ParamDirection::Out
    }
}

/// Describes how an inner unit parameter is published on its enclosing group.
#[derive(Clone, Debug, PartialEq)]
pub struct ArgDescriptor {
    pub name: String,
    pub ty: ValueType,
    pub direction: ParamDirection,
    pub default: Option<Value>,
}

impl ArgDescriptor {
    pub fn input(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
            direction: ParamDirection::In,
            default: None,
        }
    }

    pub fn output(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
            direction: ParamDirection::Out,
            default: None,
        }
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}
