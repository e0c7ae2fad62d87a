//! The process-wide root: closure registry, host interface, compiler and
//! system globals. Every method takes `&self` and is safe to call from any
//! thread; per-thread work goes through [`ShadingContext`].

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::closure::{ClosureField, ClosureId, ClosureLayout, ClosureRegistry};
use crate::compiler::{BuiltinCompiler, ShaderCompiler};
use crate::config::ShadingSystemConfig;
use crate::context::ShadingContext;
use crate::error::ShadingError;
use crate::global::GlobalLayout;
use crate::interface::{Reporter, ShadingSystemInterface, TracingInterface};

pub(crate) struct SystemShared {
    pub registry: ClosureRegistry,
    pub reporter: Reporter,
    pub compiler: Arc<dyn ShaderCompiler>,
    pub globals: RwLock<Arc<GlobalLayout>>,
    pub config: ShadingSystemConfig,
    contexts: AtomicUsize,
}

#[derive(Clone)]
pub struct ShadingSystem {
    shared: Arc<SystemShared>,
}

#[derive(Default)]
pub struct ShadingSystemBuilder {
    interface: Option<Arc<dyn ShadingSystemInterface>>,
    compiler: Option<Arc<dyn ShaderCompiler>>,
    globals: Option<GlobalLayout>,
    config: ShadingSystemConfig,
}

impl ShadingSystemBuilder {
    pub fn interface(mut self, interface: Arc<dyn ShadingSystemInterface>) -> Self {
        self.interface = Some(interface);
        self
    }

    pub fn compiler(mut self, compiler: Arc<dyn ShaderCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn globals(mut self, layout: GlobalLayout) -> Self {
        self.globals = Some(layout);
        self
    }

    pub fn config(mut self, config: ShadingSystemConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ShadingSystem {
        let interface: Arc<dyn ShadingSystemInterface> =
            self.interface.unwrap_or_else(|| Arc::new(TracingInterface));
        let compiler: Arc<dyn ShaderCompiler> = self.compiler.unwrap_or_else(|| Arc::new(BuiltinCompiler));
        let globals = Arc::new(self.globals.unwrap_or_default());
        info!(
            globals = globals.len(),
            report_level = ?self.config.report_level,
            allow_unreachable_units = self.config.allow_unreachable_units,
            "created shading system"
        );
        ShadingSystem {
            shared: Arc::new(SystemShared {
                registry: ClosureRegistry::new(self.config.max_closure_size),
                reporter: Reporter::new(interface, self.config.report_level),
                compiler,
                globals: RwLock::new(globals),
                config: self.config,
                contexts: AtomicUsize::new(0),
            }),
        }
    }
}

impl Default for ShadingSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadingSystem {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ShadingSystemBuilder {
        ShadingSystemBuilder::default()
    }

    pub fn with_interface(interface: Arc<dyn ShadingSystemInterface>) -> Self {
        Self::builder().interface(interface).build()
    }

    /// A fresh per-thread context. Contexts share nothing mutable.
    pub fn make_shading_context(&self) -> ShadingContext {
        let n = self.shared.contexts.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(contexts = n, "made shading context");
        ShadingContext::new(Arc::clone(&self.shared))
    }

    pub fn context_count(&self) -> usize {
        self.shared.contexts.load(Ordering::Relaxed)
    }

    pub fn register_closure_type(
        &self,
        name: &str,
        fields: Vec<ClosureField>,
        size: usize,
    ) -> Result<ClosureId, ShadingError> {
        self.shared.registry.register(name, fields, size)
    }

    pub fn register_closure_layout(&self, name: &str, layout: ClosureLayout) -> Result<ClosureId, ShadingError> {
        self.shared.registry.register_layout(name, layout)
    }

    pub fn closure_registry(&self) -> &ClosureRegistry {
        &self.shared.registry
    }

    /// Replaces the system global layout. Templates compiled afterwards use
    /// it unless they register their own.
    pub fn register_globals(&self, layout: GlobalLayout) -> Arc<GlobalLayout> {
        let layout = Arc::new(layout);
        info!(globals = layout.len(), "registered global layout");
        *self.shared.globals.write() = Arc::clone(&layout);
        layout
    }

    pub fn global_layout(&self) -> Arc<GlobalLayout> {
        self.shared.globals.read().clone()
    }

    pub fn config(&self) -> &ShadingSystemConfig {
        &self.shared.config
    }
}
