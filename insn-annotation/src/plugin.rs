//! Instruction annotation plugin
//!
//! This module ties the registry, the hook installer and the script callbacks together. The
//! engine forwards translation events to [`InstructionAnnotation`] and calls
//! [`InstructionAnnotation::on_instruction`] whenever an instruction carrying an
//! [`InstructionHook`] executes.

use crate::engine::{
    Executor, ExecutionState, ForkCondition, FunctionMonitor, KeyValueStore, ModuleMap,
    ProcessDetector,
};
use crate::hooks::{HookInstaller, InstallerStats, InstructionHook};
use crate::lineage;
use crate::registry::{AnnotationDescriptor, AnnotationRegistry};
use crate::returns::ReturnAnnotation;
use crate::script::{AnnotationResult, CallbackResolver, ScriptCallback};
use crate::stats::{DispatchCounters, DispatchStats};
use crate::types::{AnnotationError, Result, StepOutcome};
use std::collections::HashMap;
use std::sync::Arc;

/// The engine plugins the dispatcher depends on
pub struct Collaborators<S> {
    pub modules: Arc<dyn ModuleMap<S>>,
    pub detector: Arc<dyn ProcessDetector<S>>,
    pub function_monitor: Arc<dyn FunctionMonitor<S>>,
    /// Store used to fork each annotation only once per run; without it, only the lineage
    /// flag limits forking
    pub kvs: Option<Arc<dyn KeyValueStore>>,
}

/// Runs script callbacks on annotated instructions
pub struct InstructionAnnotation<S> {
    registry: Arc<AnnotationRegistry>,
    installer: HookInstaller,
    modules: Arc<dyn ModuleMap<S>>,
    detector: Arc<dyn ProcessDetector<S>>,
    function_monitor: Arc<dyn FunctionMonitor<S>>,
    kvs: Option<Arc<dyn KeyValueStore>>,
    callbacks: HashMap<String, Arc<dyn ScriptCallback<S>>>,
    counters: Arc<DispatchCounters>,
}

impl<S: ExecutionState> InstructionAnnotation<S> {
    /// Create the plugin, binding every callback the registry references
    ///
    /// Fails if a hit or return callback name cannot be resolved.
    pub fn new(
        registry: AnnotationRegistry,
        collaborators: Collaborators<S>,
        resolver: &dyn CallbackResolver<S>,
    ) -> Result<Self> {
        let mut callbacks = HashMap::new();
        for name in registry.callback_names() {
            let callback = resolver
                .resolve(name)
                .ok_or_else(|| AnnotationError::MissingCallback(name.to_string()))?;
            callbacks.insert(name.to_string(), callback);
        }

        log::info!(
            "instruction annotations: {} annotation(s) in {} module(s), {} callback(s)",
            registry.len(),
            registry.modules().len(),
            callbacks.len()
        );

        let registry = Arc::new(registry);
        Ok(Self {
            installer: HookInstaller::new(Arc::clone(&registry)),
            registry,
            modules: collaborators.modules,
            detector: collaborators.detector,
            function_monitor: collaborators.function_monitor,
            kvs: collaborators.kvs,
            callbacks,
            counters: Arc::new(DispatchCounters::default()),
        })
    }

    pub fn registry(&self) -> &AnnotationRegistry {
        &self.registry
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    pub fn installer_stats(&self) -> InstallerStats {
        self.installer.stats()
    }

    /// The monitored process was loaded; start following translation events
    pub fn on_monitor_load(&mut self, _state: &S) {
        self.installer.subscribe();
    }

    pub fn on_translate_block_start(&mut self, state: &S, pc: u64) {
        self.installer.on_block_start(self.modules.as_ref(), state, pc);
    }

    /// Returns the hook the engine must attach to the instruction at `pc`, if annotated
    pub fn on_translate_instruction_start(&mut self, pc: u64) -> Option<InstructionHook> {
        self.installer.on_instruction_start(pc)
    }

    pub fn on_translate_block_complete(&mut self) {
        self.installer.on_block_complete();
    }

    /// An instruction carrying `hook` is executing on `state`
    pub fn on_instruction(
        &self,
        state: &mut S,
        executor: &mut dyn Executor<S>,
        hook: &InstructionHook,
    ) -> Result<StepOutcome> {
        let Some(annotation) = hook.table().find(hook.module_pc()) else {
            return Ok(StepOutcome::Continue);
        };

        if !self.detector.is_tracked(state) {
            return Ok(StepOutcome::Continue);
        }

        self.counters.record_hit();
        let mut result = AnnotationResult::new();

        // Forking happens on a symbolic condition, so switch before it
        state.switch_to_symbolic();

        if annotation.fork {
            self.fork_annotation(state, executor, annotation)?;
            result.set_child(lineage::take_child(state));
        }

        log::debug!(
            "state {}: instruction 0x{:x} triggered annotation {}",
            state.id(),
            annotation.pc,
            annotation.name
        );

        if let Some(return_name) = annotation.return_callback() {
            log::debug!("state {}: registering return annotation {}", state.id(), return_name);
            let callback = self.callback(return_name)?;
            self.function_monitor.register_return(
                state,
                ReturnAnnotation::new(return_name, annotation.pc, callback, Arc::clone(&self.counters)),
            );
            self.counters.record_return_registration();
        }

        self.callback(&annotation.name)?.invoke(state, &mut result)?;

        if result.exit_cpu_loop() {
            self.counters.record_termination();
            return Ok(StepOutcome::Terminate);
        }

        // Only meaningful right after the call instruction
        if result.do_skip() {
            log::debug!(
                "state {}: instruction 0x{:x} skipped current function {}",
                state.id(),
                annotation.pc,
                annotation.name
            );
            let sp = state.stack_pointer();
            self.function_monitor.erase_sp(state, sp);
            state.bypass_function(annotation.bypass_slots());

            self.counters.record_skip();
            self.counters.record_termination();
            return Ok(StepOutcome::Terminate);
        }

        Ok(StepOutcome::Continue)
    }

    fn fork_annotation(
        &self,
        state: &mut S,
        executor: &mut dyn Executor<S>,
        annotation: &AnnotationDescriptor,
    ) -> Result<()> {
        if lineage::is_child(state) {
            self.counters.record_suppressed_fork();
            return Ok(());
        }

        let key = annotation.lineage_key();

        // Exercise the annotated function only once per run
        if let Some(kvs) = &self.kvs {
            if kvs.put_if_absent(&key, "1") {
                self.counters.record_suppressed_fork();
                return Ok(());
            }
        }

        let child = executor.fork(state, ForkCondition::is_zero(key))?;
        lineage::set_child(child, true);
        log::debug!("forked state {} for annotation {}", child.id(), annotation.name);

        lineage::set_child(state, false);
        self.counters.record_fork();
        Ok(())
    }

    fn callback(&self, name: &str) -> Result<Arc<dyn ScriptCallback<S>>> {
        self.callbacks
            .get(name)
            .cloned()
            .ok_or_else(|| AnnotationError::MissingCallback(name.to_string()))
    }
}
