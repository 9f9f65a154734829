//! Instruction Annotation Library
//!
//! Runs user-supplied script callbacks when execution states of a symbolic-execution engine
//! reach configured instructions of a monitored module.
//!
//! # Architecture
//!
//! - [`registry`] holds the static per-module annotation tables built from configuration
//! - [`hooks`] arms an instruction hook only while blocks of annotated modules are translated
//! - [`plugin`] dispatches hits: optional fork, return registration, callback, terminate or skip
//! - [`lineage`] keeps the per-state fork flag that limits each annotation to one child
//! - [`returns`] carries the one-shot callbacks fired when an annotated function returns
//!
//! The engine itself is reached through the traits in [`engine`]. The [`sim`] module provides
//! an in-memory engine that replays a recorded trace.
//!
//! # Example Usage
//!
//! ```no_run
//! use insn_annotation::{
//!     sim, AnnotationResult, AnnotationsConfig, CallbackTable, InMemoryKeyValueStore,
//!     InstructionAnnotation, KeyValueStore, SimState, Simulator, Trace,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let config: AnnotationsConfig = toml::from_str(
//!     r#"
//!     [annotations.license]
//!     module_name = "app"
//!     name = "on_check"
//!     pc = 0x401000
//!     param_count = 0
//!     fork = true
//!     convention = "cdecl"
//!     "#,
//! )
//! .unwrap();
//!
//! let callbacks = CallbackTable::new().with(
//!     "on_check",
//!     |_: &mut SimState, result: &mut AnnotationResult| -> insn_annotation::Result<()> {
//!         result.set_exit_cpu_loop(result.is_child());
//!         Ok(())
//!     },
//! );
//!
//! let trace = Trace::load(Path::new("trace.json")).unwrap();
//! let kvs: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
//! let mut plugin = InstructionAnnotation::new(
//!     config.build_registry().unwrap(),
//!     sim::collaborators(&trace, Some(kvs)),
//!     &callbacks,
//! )
//! .unwrap();
//!
//! let report = Simulator::new(&trace, &mut plugin).unwrap().run(&plugin).unwrap();
//! println!("{} fork(s)", report.stats.forks);
//! ```

// Public modules
pub mod config;
pub mod engine;
pub mod hooks;
pub mod lineage;
pub mod plugin;
pub mod registry;
pub mod returns;
pub mod script;
pub mod sim;
pub mod state;
pub mod stats;
pub mod types;

// Re-export main types for convenience
pub use config::{AnnotationEntry, AnnotationsConfig};
pub use engine::{
    ExecutionState, Executor, ForkCondition, FunctionMonitor, InMemoryKeyValueStore, KeyValueStore,
    ModuleDescriptor, ModuleMap, ProcessDetector,
};
pub use hooks::{HookInstaller, InstallerStats, InstructionHook};
pub use plugin::{Collaborators, InstructionAnnotation};
pub use registry::{
    AnnotationDescriptor, AnnotationRegistry, CallingConvention, ModuleAnnotationTable, Registration,
};
pub use returns::ReturnAnnotation;
pub use script::{AnnotationResult, CallbackResolver, CallbackTable, ScriptCallback};
pub use sim::{SimReport, SimState, Simulator, Trace};
pub use state::{PluginState, PluginStateStore};
pub use stats::DispatchStats;
pub use types::{AnnotationError, Result, StateId, StepOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: an empty configuration builds an empty registry
        let registry = AnnotationsConfig::new().build_registry().unwrap();
        assert!(registry.is_empty());
        assert!(!VERSION.is_empty());
    }
}
