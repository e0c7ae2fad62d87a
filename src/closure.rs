//! Process-wide closure type registry.
//!
//! A closure type is a named, fixed-size record produced by shader execution.
//! Registration assigns a dense id starting at 1; [`INVALID_CLOSURE_ID`] (0) is
//! never handed out and doubles as the "no closure" marker. Every producer
//! (`make_closure`) and consumer ([`ClosureRecord`](crate::memory::ClosureRecord))
//! goes through the descriptor stored here instead of casting raw memory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytemuck::{bytes_of, pod_read_unaligned};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ShadingError;
use crate::memory::BlockId;
use crate::types::{Float3, Value, ValueType};

pub type ClosureId = u32;

pub const INVALID_CLOSURE_ID: ClosureId = 0;

/// Storage type of one closure field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Float,
    Int,
    Bool,
    Float3,
    /// Reference to a child closure node in the same closure memory.
    Closure,
}

impl FieldType {
    pub fn size(self) -> usize {
        match self {
            FieldType::Float | FieldType::Int | FieldType::Closure => 4,
            FieldType::Bool => 1,
            FieldType::Float3 => 12,
        }
    }

    pub fn align(self) -> usize {
        match self {
            FieldType::Bool => 1,
            _ => 4,
        }
    }

    pub fn value_type(self) -> ValueType {
        match self {
            FieldType::Float => ValueType::Float,
            FieldType::Int => ValueType::Int,
            FieldType::Bool => ValueType::Bool,
            FieldType::Float3 => ValueType::Float3,
            FieldType::Closure => ValueType::Closure,
        }
    }

    pub fn from_value_type(ty: ValueType) -> Self {
        match ty {
            ValueType::Float => FieldType::Float,
            ValueType::Int => FieldType::Int,
            ValueType::Bool => FieldType::Bool,
            ValueType::Float3 => FieldType::Float3,
            ValueType::Closure => FieldType::Closure,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClosureField {
    pub name: String,
    pub ty: FieldType,
    pub offset: usize,
}

impl ClosureField {
    pub fn new(name: impl Into<String>, ty: FieldType, offset: usize) -> Self {
        Self {
            name: name.into(),
            ty,
            offset,
        }
    }

    pub fn size(&self) -> usize {
        self.ty.size()
    }
}

/// Builds a packed field list with naturally aligned offsets.
#[derive(Clone, Debug, Default)]
pub struct ClosureLayout {
    fields: Vec<ClosureField>,
    size: usize,
}

impl ClosureLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        let offset = self.size.next_multiple_of(ty.align());
        self.size = offset + ty.size();
        self.fields.push(ClosureField::new(name, ty, offset));
        self
    }

    pub fn fields(&self) -> &[ClosureField] {
        &self.fields
    }

    /// Total record size, padded to 4 bytes.
    pub fn size(&self) -> usize {
        self.size.next_multiple_of(4)
    }

    pub fn into_parts(self) -> (Vec<ClosureField>, usize) {
        let size = self.size();
        (self.fields, size)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClosureTypeDescriptor {
    pub id: ClosureId,
    pub name: String,
    pub fields: Vec<ClosureField>,
    pub size: usize,
}

impl ClosureTypeDescriptor {
    pub fn field(&self, name: &str) -> Option<&ClosureField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Writes `value` into field `index` of `record`. The caller guarantees the
    /// value type matches; mismatches are ignored.
    pub(crate) fn write_field(&self, record: &mut [u8], index: usize, value: &Value) {
        let Some(field) = self.fields.get(index) else {
            return;
        };
        let Some(dst) = field
            .offset
            .checked_add(field.size())
            .and_then(|end| record.get_mut(field.offset..end))
        else {
            return;
        };
        match (field.ty, value) {
            (FieldType::Float, Value::Float(v)) => dst.copy_from_slice(bytes_of(v)),
            (FieldType::Int, Value::Int(v)) => dst.copy_from_slice(bytes_of(v)),
            (FieldType::Bool, Value::Bool(v)) => dst[0] = u8::from(*v),
            (FieldType::Float3, Value::Float3(v)) => dst.copy_from_slice(bytes_of(v)),
            (FieldType::Closure, Value::Closure(child)) => {
                let raw = child.map_or(BlockId::NONE_RAW, BlockId::raw);
                dst.copy_from_slice(bytes_of(&raw));
            }
            _ => {}
        }
    }

    /// Reads a field by name, validating the record length against the descriptor.
    pub fn read_field(&self, record: &[u8], name: &str) -> Result<Value, ShadingError> {
        let field = self
            .field(name)
            .ok_or_else(|| ShadingError::UnknownClosureField {
                closure: self.name.clone(),
                field: name.to_string(),
            })?;
        if record.len() < self.size {
            return Err(ShadingError::InvalidClosureLayout {
                name: self.name.clone(),
                reason: format!("record is {} bytes, expected {}", record.len(), self.size),
            });
        }
        let src = field
            .offset
            .checked_add(field.size())
            .and_then(|end| record.get(field.offset..end))
            .ok_or_else(|| ShadingError::InvalidClosureLayout {
                name: self.name.clone(),
                reason: format!("field '{}' lies outside the record", field.name),
            })?;
        Ok(match field.ty {
            FieldType::Float => Value::Float(pod_read_unaligned::<f32>(src)),
            FieldType::Int => Value::Int(pod_read_unaligned::<i32>(src)),
            FieldType::Bool => Value::Bool(src[0] != 0),
            FieldType::Float3 => Value::Float3(pod_read_unaligned::<Float3>(src)),
            FieldType::Closure => Value::Closure(BlockId::from_raw(pod_read_unaligned::<u32>(src))),
        })
    }

    /// Reads a field and checks it has the requested storage type.
    pub fn read_typed(
        &self,
        record: &[u8],
        name: &str,
        ty: FieldType,
    ) -> Result<Value, ShadingError> {
        let actual = self
            .field(name)
            .map(|f| f.ty)
            .ok_or_else(|| ShadingError::UnknownClosureField {
                closure: self.name.clone(),
                field: name.to_string(),
            })?;
        if actual != ty {
            return Err(ShadingError::FieldTypeMismatch {
                closure: self.name.clone(),
                field: name.to_string(),
                actual,
                requested: ty,
            });
        }
        self.read_field(record, name)
    }
}

fn validate_layout(
    name: &str,
    fields: &[ClosureField],
    size: usize,
    max_size: usize,
) -> Result<(), ShadingError> {
    let invalid = |reason: String| ShadingError::InvalidClosureLayout {
        name: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(invalid("closure name is empty".to_string()));
    }
    if size > max_size {
        return Err(invalid(format!("size {size} exceeds the limit of {max_size} bytes")));
    }
    // Leaf headers store the record size as a u32.
    if u32::try_from(size).is_err() {
        return Err(invalid(format!("size {size} does not fit a closure leaf header")));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut spans: Vec<(usize, usize, &str)> = Vec::with_capacity(fields.len());
    for f in fields {
        if !seen.insert(f.name.as_str()) {
            return Err(invalid(format!("field '{}' is declared twice", f.name)));
        }
        if f.offset % f.ty.align() != 0 {
            return Err(invalid(format!(
                "field '{}' at offset {} is not {}-byte aligned",
                f.name,
                f.offset,
                f.ty.align()
            )));
        }
        let Some(end) = f.offset.checked_add(f.size()).filter(|&end| end <= size) else {
            return Err(invalid(format!(
                "field '{}' at offset {} runs past the record size {size}",
                f.name, f.offset
            )));
        };
        spans.push((f.offset, end, f.name.as_str()));
    }

    spans.sort_unstable();
    for w in spans.windows(2) {
        if w[1].0 < w[0].1 {
            return Err(invalid(format!("fields '{}' and '{}' overlap", w[0].2, w[1].2)));
        }
    }
    Ok(())
}

#[derive(Default)]
struct RegistryState {
    by_name: HashMap<String, ClosureId>,
    // Index `i` holds the descriptor of id `i + 1`.
    descriptors: Vec<Arc<ClosureTypeDescriptor>>,
}

/// Name → id → layout table. Registration takes the write lock; lookups only
/// ever take the read lock and therefore never block each other.
pub struct ClosureRegistry {
    state: RwLock<RegistryState>,
    max_size: usize,
}

impl ClosureRegistry {
    pub fn new(max_size: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            max_size,
        }
    }

    /// Registers a closure type, or returns the existing id when `name` was
    /// already registered with an identical field list and size.
    pub fn register(
        &self,
        name: &str,
        fields: Vec<ClosureField>,
        size: usize,
    ) -> Result<ClosureId, ShadingError> {
        validate_layout(name, &fields, size, self.max_size)?;

        let mut state = self.state.write();
        if let Some(&id) = state.by_name.get(name) {
            let existing = &state.descriptors[(id - 1) as usize];
            if existing.fields == fields && existing.size == size {
                debug!(closure = %name, id, "closure type already registered");
                return Ok(id);
            }
            return Err(ShadingError::ClosureNameConflict {
                name: name.to_string(),
            });
        }

        let id = ClosureId::try_from(state.descriptors.len() + 1).map_err(|_| {
            ShadingError::InvalidClosureLayout {
                name: name.to_string(),
                reason: "closure id space exhausted".to_string(),
            }
        })?;
        state.descriptors.push(Arc::new(ClosureTypeDescriptor {
            id,
            name: name.to_string(),
            fields,
            size,
        }));
        state.by_name.insert(name.to_string(), id);
        info!(closure = %name, id, size, "registered closure type");
        Ok(id)
    }

    pub fn register_layout(&self, name: &str, layout: ClosureLayout) -> Result<ClosureId, ShadingError> {
        let (fields, size) = layout.into_parts();
        self.register(name, fields, size)
    }

    pub fn lookup(&self, name: &str) -> Option<ClosureId> {
        self.state.read().by_name.get(name).copied()
    }

    pub fn descriptor(&self, id: ClosureId) -> Option<Arc<ClosureTypeDescriptor>> {
        if id == INVALID_CLOSURE_ID {
            return None;
        }
        self.state.read().descriptors.get((id - 1) as usize).cloned()
    }

    pub fn descriptor_by_name(&self, name: &str) -> Option<Arc<ClosureTypeDescriptor>> {
        let state = self.state.read();
        let id = *state.by_name.get(name)?;
        state.descriptors.get((id - 1) as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.read().descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
