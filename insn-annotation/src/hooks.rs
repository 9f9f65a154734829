//! Hook installation
//!
//! Instruction hooks are only armed while a block of a module with annotations is being
//! translated. Most translated blocks belong to modules without annotations, so the common
//! case costs one module lookup and one hash lookup per block.

use crate::engine::ModuleMap;
use crate::registry::{AnnotationRegistry, ModuleAnnotationTable};
use std::sync::Arc;

/// Association between the block being translated and its module's annotation table
#[derive(Debug, Clone)]
pub struct HookScope {
    module: String,
    table: Arc<ModuleAnnotationTable>,
    addend: u64,
}

impl HookScope {
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Convert a runtime program counter to the module's static address space
    pub fn to_module_pc(&self, pc: u64) -> u64 {
        pc.wrapping_add(self.addend)
    }
}

/// Hook attached by the engine to one translated instruction
///
/// The engine calls [`crate::InstructionAnnotation::on_instruction`] with it every time the
/// instruction executes.
#[derive(Debug, Clone)]
pub struct InstructionHook {
    module: String,
    table: Arc<ModuleAnnotationTable>,
    module_pc: u64,
}

impl InstructionHook {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn module_pc(&self) -> u64 {
        self.module_pc
    }

    pub fn table(&self) -> &ModuleAnnotationTable {
        &self.table
    }
}

/// Counters of armed and disarmed scopes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstallerStats {
    pub armed: u64,
    pub disarmed: u64,
    /// Instruction hooks handed out to the engine
    pub hooks: u64,
}

/// Arms and disarms the per-block instruction hook
#[derive(Debug)]
pub struct HookInstaller {
    registry: Arc<AnnotationRegistry>,
    subscribed: bool,
    scope: Option<HookScope>,
    stats: InstallerStats,
}

impl HookInstaller {
    pub fn new(registry: Arc<AnnotationRegistry>) -> Self {
        Self {
            registry,
            subscribed: false,
            scope: None,
            stats: InstallerStats::default(),
        }
    }

    /// Start listening to translation events; called when the monitored process loads
    pub fn subscribe(&mut self) {
        if !self.subscribed {
            log::debug!("subscribing to translation events");
            self.subscribed = true;
        }
    }

    /// The currently armed scope, if any
    pub fn scope(&self) -> Option<&HookScope> {
        self.scope.as_ref()
    }

    pub fn stats(&self) -> InstallerStats {
        self.stats
    }

    /// A block starting at runtime `pc` is about to be translated
    // TODO: a block interrupted mid-translation leaves its scope armed until the next block starts
    pub fn on_block_start<S>(&mut self, modules: &dyn ModuleMap<S>, state: &S, pc: u64) {
        if !self.subscribed {
            return;
        }

        // Blocks do not nest, so at most one scope is ever armed
        self.disarm();

        let Some(module) = modules.resolve(state, pc) else {
            return;
        };

        let Some(table) = self.registry.lookup(&module.name) else {
            return;
        };

        log::trace!("arming instruction hook for {} block at 0x{:x}", module.name, pc);
        self.scope = Some(HookScope {
            module: module.name.clone(),
            table: Arc::clone(table),
            addend: module.addend(),
        });
        self.stats.armed += 1;
    }

    /// An instruction at runtime `pc` of the current block is being translated
    ///
    /// Returns a hook only if the instruction is annotated.
    pub fn on_instruction_start(&mut self, pc: u64) -> Option<InstructionHook> {
        let scope = self.scope.as_ref()?;
        let module_pc = scope.to_module_pc(pc);

        if !scope.table.contains_pc(module_pc) {
            return None;
        }

        self.stats.hooks += 1;
        Some(InstructionHook {
            module: scope.module.clone(),
            table: Arc::clone(&scope.table),
            module_pc,
        })
    }

    /// The current block finished translating
    pub fn on_block_complete(&mut self) {
        self.disarm();
    }

    fn disarm(&mut self) {
        if let Some(scope) = self.scope.take() {
            log::trace!("disarming instruction hook for {}", scope.module);
            self.stats.disarmed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ModuleDescriptor;
    use crate::registry::AnnotationDescriptor;

    struct FixedModules(Vec<ModuleDescriptor>);

    impl ModuleMap<()> for FixedModules {
        fn resolve(&self, _state: &(), pc: u64) -> Option<ModuleDescriptor> {
            self.0.iter().find(|m| m.contains(pc)).cloned()
        }
    }

    fn installer() -> (HookInstaller, FixedModules) {
        let mut registry = AnnotationRegistry::new();
        registry
            .register("app", AnnotationDescriptor::new("marker", 0x40_0400))
            .unwrap();

        let modules = FixedModules(vec![
            ModuleDescriptor::new("app", 0x7f00_0000, 0x40_0000, 0x1000),
            ModuleDescriptor::new("libc", 0x7f10_0000, 0x0, 0x1000),
        ]);

        let mut installer = HookInstaller::new(Arc::new(registry));
        installer.subscribe();
        (installer, modules)
    }

    #[test]
    fn test_unsubscribed_stays_unarmed() {
        let mut registry = AnnotationRegistry::new();
        registry
            .register("app", AnnotationDescriptor::new("marker", 0x40_0400))
            .unwrap();
        let modules = FixedModules(vec![ModuleDescriptor::new("app", 0x7f00_0000, 0x40_0000, 0x1000)]);
        let mut installer = HookInstaller::new(Arc::new(registry));

        installer.on_block_start(&modules, &(), 0x7f00_0400);
        assert!(installer.scope().is_none());
        assert_eq!(installer.stats(), InstallerStats::default());
    }

    #[test]
    fn test_arms_only_for_annotated_modules() {
        let (mut installer, modules) = installer();

        // Module without annotations
        installer.on_block_start(&modules, &(), 0x7f10_0010);
        assert!(installer.scope().is_none());
        // Address outside any module
        installer.on_block_start(&modules, &(), 0x10);
        assert!(installer.scope().is_none());
        assert_eq!(installer.stats().armed, 0);

        installer.on_block_start(&modules, &(), 0x7f00_0400);
        assert_eq!(installer.scope().unwrap().module(), "app");
        assert_eq!(installer.stats().armed, 1);
    }

    #[test]
    fn test_instruction_hook_uses_addend() {
        let (mut installer, modules) = installer();
        installer.on_block_start(&modules, &(), 0x7f00_03f0);

        assert!(installer.on_instruction_start(0x7f00_03f0).is_none());
        let hook = installer.on_instruction_start(0x7f00_0400).unwrap();
        assert_eq!(hook.module(), "app");
        assert_eq!(hook.module_pc(), 0x40_0400);
        assert_eq!(hook.table().find(0x40_0400).unwrap().name, "marker");

        installer.on_block_complete();
        assert!(installer.scope().is_none());
        assert!(installer.on_instruction_start(0x7f00_0400).is_none());
        assert_eq!(installer.stats().hooks, 1);
    }

    #[test]
    fn test_new_block_replaces_stale_scope() {
        let (mut installer, modules) = installer();
        installer.on_block_start(&modules, &(), 0x7f00_0400);
        // No completion event for the previous block
        installer.on_block_start(&modules, &(), 0x7f10_0010);
        assert!(installer.scope().is_none());

        let stats = installer.stats();
        assert_eq!(stats.armed, 1);
        assert_eq!(stats.disarmed, 1);
    }
}
