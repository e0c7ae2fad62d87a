//! Error taxonomy shared by construction, freezing and resolution.

use std::fmt;

use thiserror::Error;

use crate::types::{ParamDirection, ValueType};

/// A positional message produced by the shader compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// 1-based source line.
    pub line: usize,
    /// 1-based source column.
    pub column: usize,
    pub message: String,
}

impl Diagnostic {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

fn join_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Coarse classification a host uses to decide between retrying and giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NameConflict,
    Graph,
    Type,
    Compile,
    Resolution,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ShadingError {
    #[error("closure type '{name}' is already registered with a different layout")]
    ClosureNameConflict { name: String },

    #[error("invalid layout for closure type '{name}': {reason}")]
    InvalidClosureLayout { name: String, reason: String },

    #[error("template name '{0}' is already used in this shading context")]
    DuplicateTemplateName(String),

    #[error("group '{group}' already contains a unit named '{unit}'")]
    DuplicateUnitName { group: String, unit: String },

    #[error("group '{group}' already exposes an argument named '{name}'")]
    DuplicateArgument { group: String, name: String },

    #[error("global '{0}' is declared twice")]
    DuplicateGlobal(String),

    #[error("group '{group}' already has root '{existing}', cannot make '{requested}' root")]
    MultipleRoots {
        group: String,
        existing: String,
        requested: String,
    },

    #[error("group '{group}' has no root unit")]
    NoRoot { group: String },

    #[error("group '{group}' has no unit named '{unit}'")]
    UnknownUnit { group: String, unit: String },

    #[error("unit '{unit}' has no parameter named '{param}'")]
    UnknownParameter { unit: String, param: String },

    #[error("parameter '{unit}.{param}' is not an {expected} parameter")]
    DirectionMismatch {
        unit: String,
        param: String,
        expected: ParamDirection,
    },

    #[error("type mismatch: '{source_name}' is {source_type}, '{target_name}' is {target_type}")]
    TypeMismatch {
        source_name: String,
        source_type: ValueType,
        target_name: String,
        target_type: ValueType,
    },

    #[error("input '{unit}.{param}' already has an incoming connection")]
    AlreadyConnectedInput { unit: String, param: String },

    #[error("cyclic dependency in group '{group}': {}", .cycle.join(" -> "))]
    CyclicDependency { group: String, cycle: Vec<String> },

    #[error("input '{unit}.{param}' in group '{group}' is neither connected nor defaulted")]
    UnboundInput {
        group: String,
        unit: String,
        param: String,
    },

    #[error("unit '{unit}' in group '{group}' does not contribute to the root or any exposed output")]
    UnreachableUnit { group: String, unit: String },

    #[error("'{name}' is frozen and can no longer be modified")]
    AlreadyFrozen { name: String },

    #[error("group '{name}' must be frozen before it is used")]
    NotFrozen { name: String },

    #[error("unit template '{name}' has not been compiled")]
    NotCompiled { name: String },

    #[error("failed to compile '{name}': {}", join_diagnostics(.diagnostics))]
    Compile {
        name: String,
        diagnostics: Vec<Diagnostic>,
    },

    #[error("closure type '{0}' is not registered")]
    UnknownClosureType(String),

    #[error("make_closure<{closure}> arguments do not match its fields: {detail}")]
    ClosureArgumentMismatch { closure: String, detail: String },

    #[error("closure type '{closure}' has no field '{field}'")]
    UnknownClosureField { closure: String, field: String },

    #[error("closure field '{closure}.{field}' is {actual:?}, not {requested:?}")]
    FieldTypeMismatch {
        closure: String,
        field: String,
        actual: crate::closure::FieldType,
        requested: crate::closure::FieldType,
    },

    #[error("global '{0}' is not declared")]
    UndeclaredGlobal(String),

    #[error("texture '{texture}' used by '{unit}' is not registered")]
    UnknownTexture { unit: String, texture: String },

    #[error("units of '{name}' were compiled against different global layouts")]
    GlobalLayoutMismatch { name: String },
}

impl ShadingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ClosureNameConflict { .. }
            | Self::DuplicateTemplateName(_)
            | Self::DuplicateUnitName { .. }
            | Self::DuplicateArgument { .. }
            | Self::DuplicateGlobal(_) => ErrorKind::NameConflict,

            Self::MultipleRoots { .. }
            | Self::NoRoot { .. }
            | Self::UnknownUnit { .. }
            | Self::UnknownParameter { .. }
            | Self::DirectionMismatch { .. }
            | Self::AlreadyConnectedInput { .. }
            | Self::CyclicDependency { .. }
            | Self::UnboundInput { .. }
            | Self::UnreachableUnit { .. } => ErrorKind::Graph,

            Self::InvalidClosureLayout { .. }
            | Self::TypeMismatch { .. }
            | Self::UnknownClosureType(_)
            | Self::ClosureArgumentMismatch { .. }
            | Self::UnknownClosureField { .. }
            | Self::FieldTypeMismatch { .. }
            | Self::UndeclaredGlobal(_)
            | Self::UnknownTexture { .. }
            | Self::GlobalLayoutMismatch { .. } => ErrorKind::Type,

            Self::Compile { .. } | Self::NotCompiled { .. } => ErrorKind::Compile,

            Self::AlreadyFrozen { .. } | Self::NotFrozen { .. } => ErrorKind::Resolution,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_lists_every_diagnostic() {
        let err = ShadingError::Compile {
            name: "lambert".to_string(),
            diagnostics: vec![
                Diagnostic::new(2, 5, "unknown identifier 'foo'"),
                Diagnostic::new(3, 1, "expected ';'"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2:5: unknown identifier 'foo'"));
        assert!(msg.contains("3:1: expected ';'"));
        assert_eq!(err.kind(), ErrorKind::Compile);
    }

    #[test]
    fn cycle_is_rendered_as_path() {
        let err = ShadingError::CyclicDependency {
            group: "g".to_string(),
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "cyclic dependency in group 'g': a -> b -> a");
        assert_eq!(err.kind(), ErrorKind::Graph);
    }
}
