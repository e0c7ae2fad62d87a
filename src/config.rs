use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::interface::DebugLevel;

pub const DEFAULT_MAX_CLOSURE_SIZE: usize = 4096;

/// System-wide settings, fixed when the [`ShadingSystem`](crate::ShadingSystem)
/// is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ShadingSystemConfig {
    /// Prune group members that feed neither the root nor an exposed output
    /// instead of failing the freeze.
    pub allow_unreachable_units: bool,
    /// Messages below this level never reach the host `report` callback.
    pub report_level: DebugLevel,
    pub max_closure_size: usize,
}

impl Default for ShadingSystemConfig {
    fn default() -> Self {
        Self {
            allow_unreachable_units: false,
            report_level: DebugLevel::Warning,
            max_closure_size: DEFAULT_MAX_CLOSURE_SIZE,
        }
    }
}

impl ShadingSystemConfig {
    pub fn from_json_str(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("failed to parse shading system config json")
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read shading system config at {}", path.display()))?;
        Self::from_json_str(&text)
    }
}
