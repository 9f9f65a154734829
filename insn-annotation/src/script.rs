//! Script callback interface
//!
//! Callbacks are looked up by name once, at start-up. The dispatcher only sees the
//! [`ScriptCallback`] capability; whatever runtime executes the callback body stays behind it.

use crate::types::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Mutable result object handed to a callback
///
/// A hit callback may request step termination and function skip, and can tell whether it
/// runs on the child branch of an annotation fork. A return callback may only request step
/// termination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnnotationResult {
    exit_cpu_loop: bool,
    skip: bool,
    child: bool,
}

impl AnnotationResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination of the current execution step
    pub fn set_exit_cpu_loop(&mut self, exit: bool) {
        self.exit_cpu_loop = exit;
    }

    pub fn exit_cpu_loop(&self) -> bool {
        self.exit_cpu_loop
    }

    /// Request that the annotated function be bypassed as if it had returned
    pub fn set_skip(&mut self, skip: bool) {
        self.skip = skip;
    }

    pub fn do_skip(&self) -> bool {
        self.skip
    }

    pub fn set_child(&mut self, child: bool) {
        self.child = child;
    }

    /// True if this state is the branch created by the annotation fork
    pub fn is_child(&self) -> bool {
        self.child
    }
}

/// A callback bound to an annotation name
pub trait ScriptCallback<S>: Send + Sync {
    fn invoke(&self, state: &mut S, result: &mut AnnotationResult) -> Result<()>;
}

impl<S, F> ScriptCallback<S> for F
where
    F: Fn(&mut S, &mut AnnotationResult) -> Result<()> + Send + Sync,
{
    fn invoke(&self, state: &mut S, result: &mut AnnotationResult) -> Result<()> {
        self(state, result)
    }
}

/// Resolves callback names to callbacks
pub trait CallbackResolver<S> {
    fn resolve(&self, name: &str) -> Option<Arc<dyn ScriptCallback<S>>>;
}

/// Map-backed resolver
pub struct CallbackTable<S> {
    callbacks: HashMap<String, Arc<dyn ScriptCallback<S>>>,
}

impl<S> CallbackTable<S> {
    pub fn new() -> Self {
        Self {
            callbacks: HashMap::new(),
        }
    }

    /// Bind `callback` to `name`, replacing any previous binding
    pub fn bind(&mut self, name: impl Into<String>, callback: impl ScriptCallback<S> + 'static) {
        self.callbacks.insert(name.into(), Arc::new(callback));
    }

    /// Builder method: bind a callback
    pub fn with(mut self, name: impl Into<String>, callback: impl ScriptCallback<S> + 'static) -> Self {
        self.bind(name, callback);
        self
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl<S> Default for CallbackTable<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> CallbackResolver<S> for CallbackTable<S> {
    fn resolve(&self, name: &str) -> Option<Arc<dyn ScriptCallback<S>>> {
        self.callbacks.get(name).cloned()
    }
}

impl<S> fmt::Debug for CallbackTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.callbacks.keys().collect();
        names.sort();
        f.debug_struct("CallbackTable").field("callbacks", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_bound_closure() {
        let table: CallbackTable<u32> = CallbackTable::new().with(
            "bump",
            |state: &mut u32, result: &mut AnnotationResult| -> Result<()> {
                *state += 1;
                result.set_exit_cpu_loop(true);
                Ok(())
            },
        );

        let callback = table.resolve("bump").unwrap();
        let mut state = 41;
        let mut result = AnnotationResult::new();
        callback.invoke(&mut state, &mut result).unwrap();

        assert_eq!(state, 42);
        assert!(result.exit_cpu_loop());
        assert!(!result.do_skip());
        assert!(table.resolve("missing").is_none());
    }
}
