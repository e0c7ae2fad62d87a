//! Renderer-declared global values.
//!
//! The host declares the record layout once; shaders read entries with
//! `global_value<name>`, resolved to an index at compile time. Each invocation
//! receives a read-only [`GlobalBlock`] built against the same layout.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ShadingError;
use crate::types::{Value, ValueType};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GlobalVar {
    pub name: String,
    pub ty: ValueType,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GlobalLayout {
    vars: Vec<GlobalVar>,
    index: HashMap<String, usize>,
}

impl GlobalLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: impl Into<String>, ty: ValueType) -> Result<usize, ShadingError> {
        let name = name.into();
        if ty == ValueType::Closure {
            return Err(ShadingError::TypeMismatch {
                source_name: format!("global '{name}'"),
                source_type: ty,
                target_name: "global value".to_string(),
                target_type: ValueType::Float,
            });
        }
        if self.index.contains_key(&name) {
            return Err(ShadingError::DuplicateGlobal(name));
        }
        let slot = self.vars.len();
        self.index.insert(name.clone(), slot);
        self.vars.push(GlobalVar { name, ty });
        Ok(slot)
    }

    pub fn from_vars<I, S>(vars: I) -> Result<Self, ShadingError>
    where
        I: IntoIterator<Item = (S, ValueType)>,
        S: Into<String>,
    {
        let mut layout = Self::new();
        for (name, ty) in vars {
            layout.declare(name, ty)?;
        }
        Ok(layout)
    }

    pub fn lookup(&self, name: &str) -> Option<(usize, ValueType)> {
        self.index.get(name).map(|&i| (i, self.vars[i].ty))
    }

    pub fn vars(&self) -> &[GlobalVar] {
        &self.vars
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

/// Per-invocation global values, zero-initialised from the layout.
#[derive(Clone, Debug)]
pub struct GlobalBlock {
    layout: Arc<GlobalLayout>,
    values: Vec<Value>,
}

impl GlobalBlock {
    pub fn new(layout: &Arc<GlobalLayout>) -> Self {
        let values = layout.vars.iter().map(|v| v.ty.zero()).collect();
        Self {
            layout: Arc::clone(layout),
            values,
        }
    }

    /// A block for shaders that read no globals.
    pub fn empty() -> Self {
        Self::new(&Arc::new(GlobalLayout::new()))
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), ShadingError> {
        let value = value.into();
        let (slot, ty) = self
            .layout
            .lookup(name)
            .ok_or_else(|| ShadingError::UndeclaredGlobal(name.to_string()))?;
        if value.ty() != ty {
            return Err(ShadingError::TypeMismatch {
                source_name: "assigned value".to_string(),
                source_type: value.ty(),
                target_name: format!("global '{name}'"),
                target_type: ty,
            });
        }
        self.values[slot] = value;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.layout.lookup(name).map(|(slot, _)| self.values[slot])
    }

    pub fn layout(&self) -> &Arc<GlobalLayout> {
        &self.layout
    }

    pub(crate) fn value(&self, slot: usize) -> Option<Value> {
        self.values.get(slot).copied()
    }

    pub(crate) fn matches(&self, layout: &Arc<GlobalLayout>) -> bool {
        Arc::ptr_eq(&self.layout, layout) || *self.layout == **layout
    }
}
