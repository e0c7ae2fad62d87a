//! Shader unit/group composition, resolution and closure runtime.
//!
//! A [`ShadingSystem`] owns the closure registry and host callbacks. Each
//! worker thread builds templates through its own [`ShadingContext`], freezes
//! groups into a fixed evaluation order, and resolves instances into
//! [`ShaderFunction`] entry points that any thread may invoke.

pub mod closure;
pub mod compiler;
pub mod config;
pub mod context;
pub mod dsl;
pub mod error;
pub mod global;
pub mod graph;
pub mod group;
pub mod instance;
pub mod interface;
mod link;
pub mod memory;
pub mod system;
pub mod template;
pub mod types;

pub use closure::{ClosureField, ClosureId, ClosureLayout, ClosureRegistry, ClosureTypeDescriptor, FieldType, INVALID_CLOSURE_ID};
pub use compiler::{BuiltinCompiler, CompileEnv, CompiledUnit, ShaderCompiler};
pub use config::ShadingSystemConfig;
pub use context::ShadingContext;
pub use error::{Diagnostic, ErrorKind, ShadingError};
pub use global::{GlobalBlock, GlobalLayout};
pub use group::ShaderGroupTemplate;
pub use instance::{ShaderFunction, ShaderInstance};
pub use interface::{DebugLevel, ShadingSystemInterface, TextureHandle, TracingInterface};
pub use memory::{BlockId, ClosureAllocator, ClosureArena, ClosureLeaf, ClosureNode, ClosureRecord, ClosureSlot};
pub use system::{ShadingSystem, ShadingSystemBuilder};
pub use template::{ShaderTemplate, ShaderUnitTemplate};
pub use types::{ArgDescriptor, Float3, ParamDirection, ShaderParam, Value, ValueType, make_float3};
