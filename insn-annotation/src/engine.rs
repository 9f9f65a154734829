//! Interfaces to the exploration engine and its monitoring plugins
//!
//! The dispatcher never owns execution states, the module map or the call/return monitor.
//! It reaches them through the traits below, which an engine implements (see [`crate::sim`]
//! for an in-memory implementation).

use crate::returns::ReturnAnnotation;
use crate::state::PluginStateStore;
use crate::types::{Result, StateId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;

/// One forkable instance of program execution
pub trait ExecutionState: Send + 'static {
    fn id(&self) -> StateId;

    /// Per-state auxiliary records, cloned with the state on fork
    fn plugin_states(&self) -> &PluginStateStore;

    fn plugin_states_mut(&mut self) -> &mut PluginStateStore;

    /// Switch registers and memory to a representation that may hold symbolic values
    fn switch_to_symbolic(&mut self);

    fn stack_pointer(&self) -> u64;

    /// Return from the current function without running the rest of its body, popping
    /// `stack_slots` argument slots in addition to the return address
    fn bypass_function(&mut self, stack_slots: u64);
}

/// A loaded module as seen by the module map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    pub name: String,
    /// Runtime address the module is mapped at
    pub load_base: u64,
    /// Address the module was linked at
    pub native_base: u64,
    pub size: u64,
}

impl ModuleDescriptor {
    pub fn new(name: impl Into<String>, load_base: u64, native_base: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            load_base,
            native_base,
            size,
        }
    }

    /// Value added to a runtime program counter to obtain the module-relative one
    pub fn addend(&self) -> u64 {
        self.native_base.wrapping_sub(self.load_base)
    }

    /// True if the runtime program counter lies inside this module
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.load_base && pc - self.load_base < self.size
    }
}

/// Maps a runtime program counter to the module that owns it
pub trait ModuleMap<S>: Send + Sync {
    fn resolve(&self, state: &S, pc: u64) -> Option<ModuleDescriptor>;
}

/// Decides whether a state belongs to the process under analysis
pub trait ProcessDetector<S>: Send + Sync {
    fn is_tracked(&self, state: &S) -> bool;
}

/// Call/return monitor
pub trait FunctionMonitor<S>: Send + Sync {
    /// Run `annotation` once, when the function executing on `state` returns
    fn register_return(&self, state: &mut S, annotation: ReturnAnnotation<S>);

    /// Forget the call/return bookkeeping recorded for stack pointer `sp`
    fn erase_sp(&self, state: &mut S, sp: u64);
}

/// Key-value store shared by every state of the run
pub trait KeyValueStore: Send + Sync {
    /// Store `value` under `key` unless the key exists; returns whether it already existed.
    /// Must be atomic with respect to concurrent callers.
    fn put_if_absent(&self, key: &str, value: &str) -> bool;
}

/// Process-local key-value store
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, String>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn put_if_absent(&self, key: &str, value: &str) -> bool {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if entries.contains_key(key) {
            true
        } else {
            entries.insert(key.to_string(), value.to_string());
            false
        }
    }
}

/// Condition a fork is performed on: a fresh concolic byte whose concrete value is zero,
/// tested for being zero. The current state keeps the concrete (true) side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForkCondition {
    /// Name of the concolic variable
    pub variable: String,
}

impl ForkCondition {
    pub fn is_zero(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
        }
    }
}

impl fmt::Display for ForkCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} == 0", self.variable)
    }
}

/// The exploration engine
pub trait Executor<S> {
    /// Split `state` on `condition`
    ///
    /// `state` continues the original path; the returned state is the newly created one. It
    /// starts with a clone of `state`'s plugin records and resumes at the forking instruction.
    fn fork(&mut self, state: &mut S, condition: ForkCondition) -> Result<&mut S>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_module_addend() {
        let module = ModuleDescriptor::new("app", 0x7f00_0000, 0x40_0000, 0x1000);
        let runtime_pc = 0x7f00_0400;
        assert!(module.contains(runtime_pc));
        assert!(!module.contains(0x7f00_1000));
        assert!(!module.contains(0x10));
        assert_eq!(runtime_pc.wrapping_add(module.addend()), 0x40_0400);
    }

    #[test]
    fn test_put_if_absent() {
        let kvs = InMemoryKeyValueStore::new();
        assert!(!kvs.put_if_absent("annotation_A_child", "1"));
        assert!(kvs.put_if_absent("annotation_A_child", "2"));
        assert_eq!(kvs.get("annotation_A_child").as_deref(), Some("1"));
        assert_eq!(kvs.len(), 1);
    }

    #[test]
    fn test_put_if_absent_single_winner() {
        let kvs = Arc::new(InMemoryKeyValueStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let kvs = Arc::clone(&kvs);
                thread::spawn(move || kvs.put_if_absent("key", "1"))
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|existed| !existed)
            .count();
        assert_eq!(winners, 1);
    }
}
