//! Per-module annotation tables and the registry that owns them
//!
//! The registry is filled once during initialization and only read afterwards. Tables are
//! shared with armed hook scopes through `Arc`, so an armed scope never borrows the registry.

use super::annotation::AnnotationDescriptor;
use crate::types::Result;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Outcome of registering a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// The descriptor was added to the module's table
    Inserted,
    /// An identical (pc, name) pair was already present; nothing changed
    AlreadyPresent,
    /// Another callback already occupies the program counter; the first one is kept
    Shadowed,
}

/// Ordered set of annotations for one module, keyed by module-relative program counter
#[derive(Debug, Clone, Default)]
pub struct ModuleAnnotationTable {
    annotations: BTreeMap<u64, AnnotationDescriptor>,
}

impl ModuleAnnotationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the descriptor registered at a module-relative program counter
    pub fn find(&self, pc: u64) -> Option<&AnnotationDescriptor> {
        self.annotations.get(&pc)
    }

    /// True if some descriptor is registered at `pc`
    pub fn contains_pc(&self, pc: u64) -> bool {
        self.annotations.contains_key(&pc)
    }

    pub fn len(&self) -> usize {
        self.annotations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    /// Iterate over descriptors in program counter order
    pub fn iter(&self) -> impl Iterator<Item = &AnnotationDescriptor> {
        self.annotations.values()
    }

    fn insert(&mut self, module: &str, descriptor: AnnotationDescriptor) -> Registration {
        match self.annotations.get(&descriptor.pc) {
            Some(existing) if *existing == descriptor => Registration::AlreadyPresent,
            Some(existing) => {
                log::warn!(
                    "{}:0x{:x} already runs {}, ignoring {}",
                    module,
                    descriptor.pc,
                    existing.name,
                    descriptor.name
                );
                Registration::Shadowed
            }
            None => {
                self.annotations.insert(descriptor.pc, descriptor);
                Registration::Inserted
            }
        }
    }
}

/// Mapping from module name to its annotation table
#[derive(Debug, Clone, Default)]
pub struct AnnotationRegistry {
    modules: HashMap<String, Arc<ModuleAnnotationTable>>,
}

impl AnnotationRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor for a module
    ///
    /// Re-registering an identical (pc, name) pair is a no-op. A different callback at an
    /// occupied program counter leaves the table unchanged and is reported as
    /// [`Registration::Shadowed`].
    pub fn register(&mut self, module: &str, descriptor: AnnotationDescriptor) -> Result<Registration> {
        let table = self.modules.entry(module.to_string()).or_default();
        let summary = descriptor.to_string();
        let registration = Arc::make_mut(table).insert(module, descriptor);

        if registration == Registration::Inserted {
            log::debug!("loaded {} {}", module, summary);
        }

        Ok(registration)
    }

    /// Annotation table of a module; `None` means the module has no annotations
    pub fn lookup(&self, module: &str) -> Option<&Arc<ModuleAnnotationTable>> {
        self.modules.get(module)
    }

    /// Names of all modules with annotations, sorted
    pub fn modules(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// All callback names referenced by registered annotations (hit and return callbacks)
    pub fn callback_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .modules
            .values()
            .flat_map(|table| table.iter())
            .flat_map(|a| std::iter::once(a.name.as_str()).chain(a.return_callback()))
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Total number of registered annotations across all modules
    pub fn len(&self) -> usize {
        self.modules.values().map(|table| table.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
