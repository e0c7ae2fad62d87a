//! Host callback interface registered once on the shading system.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::types::Float3;

/// Severity of a message routed to [`ShadingSystemInterface::report`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugLevel {
    Info,
    Warning,
    Error,
}

/// Opaque renderer-side texture reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub u64);

/// Callbacks implemented by the host renderer.
///
/// Implementations are shared by every thread that invokes a resolved shader,
/// so they must be reentrant.
pub trait ShadingSystemInterface: Send + Sync {
    fn report(&self, level: DebugLevel, message: &str) {
        match level {
            DebugLevel::Info => info!(target: "shade_forge::report", "{message}"),
            DebugLevel::Warning => warn!(target: "shade_forge::report", "{message}"),
            DebugLevel::Error => error!(target: "shade_forge::report", "{message}"),
        }
    }

    fn sample_2d(&self, texture: TextureHandle, u: f32, v: f32) -> Float3;

    fn sample_alpha_2d(&self, texture: TextureHandle, u: f32, v: f32) -> f32;
}

/// Interface used until the host registers its own: reports go to `tracing`,
/// textures sample as black and fully transparent.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingInterface;

impl ShadingSystemInterface for TracingInterface {
    fn sample_2d(&self, _texture: TextureHandle, _u: f32, _v: f32) -> Float3 {
        Float3::ZERO
    }

    fn sample_alpha_2d(&self, _texture: TextureHandle, _u: f32, _v: f32) -> f32 {
        0.0
    }
}

/// The registered interface plus the configured severity floor.
#[derive(Clone)]
pub(crate) struct Reporter {
    interface: Arc<dyn ShadingSystemInterface>,
    min_level: DebugLevel,
}

impl Reporter {
    pub fn new(interface: Arc<dyn ShadingSystemInterface>, min_level: DebugLevel) -> Self {
        Self {
            interface,
            min_level,
        }
    }

    pub fn report(&self, level: DebugLevel, message: &str) {
        if level >= self.min_level {
            self.interface.report(level, message);
        }
    }

    pub fn interface(&self) -> &dyn ShadingSystemInterface {
        self.interface.as_ref()
    }
}
