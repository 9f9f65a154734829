//! Annotation configuration types
//!
//! The configuration declares one entry per annotation under an `annotations` table, keyed by
//! an arbitrary entry name. Every field except `return_name` is required; an unknown calling
//! convention or a missing field fails deserialization, and the caller is expected to abort
//! start-up rather than run with an incomplete hook set.

use crate::registry::{AnnotationDescriptor, AnnotationRegistry, CallingConvention, NO_RETURN_CALLBACK};
use crate::types::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All declared annotations, keyed by entry name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnnotationsConfig {
    #[serde(default)]
    pub annotations: BTreeMap<String, AnnotationEntry>,
}

/// A single annotation entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnotationEntry {
    /// Module the program counter belongs to
    pub module_name: String,
    /// Script callback invoked on hit
    pub name: String,
    /// Script callback invoked on function return
    #[serde(default = "default_return_name")]
    pub return_name: String,
    /// Module-relative program counter
    pub pc: u64,
    pub param_count: u64,
    pub fork: bool,
    pub convention: CallingConvention,
}

fn default_return_name() -> String {
    NO_RETURN_CALLBACK.to_string()
}

impl AnnotationEntry {
    /// Convert this entry into a descriptor
    pub fn to_descriptor(&self) -> AnnotationDescriptor {
        AnnotationDescriptor::new(self.name.clone(), self.pc)
            .with_return(self.return_name.clone())
            .with_params(self.param_count, self.convention)
            .with_fork(self.fork)
    }
}

impl AnnotationsConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: add an entry
    pub fn add_entry(mut self, key: impl Into<String>, entry: AnnotationEntry) -> Self {
        self.annotations.insert(key.into(), entry);
        self
    }

    /// Build the registry from every declared entry
    ///
    /// Fails on the first entry the registry rejects.
    pub fn build_registry(&self) -> Result<AnnotationRegistry> {
        let mut registry = AnnotationRegistry::new();
        for (key, entry) in &self.annotations {
            log::trace!("registering annotation entry {}", key);
            registry.register(&entry.module_name, entry.to_descriptor())?;
        }
        Ok(registry)
    }
}
