//! Fork lineage tracking
//!
//! Marks the state created by an annotation fork so that, when it reaches the annotated
//! instruction again, it runs the callback as the child branch instead of forking again.

use crate::engine::ExecutionState;

/// Per-state lineage record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForkLineage {
    child: bool,
}

impl ForkLineage {
    pub fn is_child(&self) -> bool {
        self.child
    }

    pub fn make_child(&mut self, child: bool) {
        self.child = child;
    }
}

/// True if `state` was created by an annotation fork whose child flag was not consumed yet
pub fn is_child<S: ExecutionState>(state: &S) -> bool {
    state
        .plugin_states()
        .get::<ForkLineage>()
        .map(ForkLineage::is_child)
        .unwrap_or(false)
}

pub fn set_child<S: ExecutionState>(state: &mut S, child: bool) {
    state
        .plugin_states_mut()
        .with_default(|lineage: &mut ForkLineage| lineage.make_child(child));
}

/// Read and clear the child flag
pub fn take_child<S: ExecutionState>(state: &mut S) -> bool {
    state.plugin_states_mut().with_default(|lineage: &mut ForkLineage| {
        let child = lineage.is_child();
        lineage.make_child(false);
        child
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PluginStateStore;

    #[derive(Default)]
    struct BareState {
        store: PluginStateStore,
    }

    impl ExecutionState for BareState {
        fn id(&self) -> u64 {
            0
        }
        fn plugin_states(&self) -> &PluginStateStore {
            &self.store
        }
        fn plugin_states_mut(&mut self) -> &mut PluginStateStore {
            &mut self.store
        }
        fn switch_to_symbolic(&mut self) {}
        fn stack_pointer(&self) -> u64 {
            0
        }
        fn bypass_function(&mut self, _stack_slots: u64) {}
    }

    #[test]
    fn test_default_is_not_child() {
        let state = BareState::default();
        assert!(!is_child(&state));
        assert!(state.store.is_empty());
    }

    #[test]
    fn test_take_child_clears_flag() {
        let mut state = BareState::default();
        set_child(&mut state, true);
        assert!(is_child(&state));
        assert!(take_child(&mut state));
        assert!(!is_child(&state));
        assert!(!take_child(&mut state));
    }

    #[test]
    fn test_flag_is_cloned_with_store() {
        let mut parent = BareState::default();
        set_child(&mut parent, true);
        let mut child = BareState {
            store: parent.store.clone(),
        };
        set_child(&mut parent, false);
        assert!(is_child(&child));
        assert!(!is_child(&parent));
        assert!(take_child(&mut child));
    }
}
