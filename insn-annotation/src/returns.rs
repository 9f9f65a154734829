//! Return annotations
//!
//! A hit on an annotation that names a return callback registers a [`ReturnAnnotation`] with
//! the function monitor. The monitor fires it once, when the annotated function returns on
//! the same state.

use crate::engine::ExecutionState;
use crate::script::{AnnotationResult, ScriptCallback};
use crate::stats::DispatchCounters;
use crate::types::{Result, StepOutcome};
use std::fmt;
use std::sync::Arc;

/// One-shot callback bound to an annotation's return callback
pub struct ReturnAnnotation<S> {
    name: String,
    pc: u64,
    callback: Arc<dyn ScriptCallback<S>>,
    counters: Arc<DispatchCounters>,
}

impl<S: ExecutionState> ReturnAnnotation<S> {
    pub(crate) fn new(
        name: impl Into<String>,
        pc: u64,
        callback: Arc<dyn ScriptCallback<S>>,
        counters: Arc<DispatchCounters>,
    ) -> Self {
        Self {
            name: name.into(),
            pc,
            callback,
            counters,
        }
    }

    /// Name of the return callback
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the return callback on `state`
    ///
    /// Only step termination is honored; the function has already returned, so a skip
    /// request is ignored.
    pub fn fire(&self, state: &mut S) -> Result<StepOutcome> {
        log::debug!("Invoking return annotation {}", self.name);
        self.counters.record_return_fired();

        let mut result = AnnotationResult::new();
        state.switch_to_symbolic();
        self.callback.invoke(state, &mut result)?;

        if result.do_skip() {
            log::warn!(
                "return annotation {} requested a skip after the function returned, ignoring",
                self.name
            );
        }

        if result.exit_cpu_loop() {
            self.counters.record_termination();
            return Ok(StepOutcome::Terminate);
        }

        Ok(StepOutcome::Continue)
    }
}

impl<S> Clone for ReturnAnnotation<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            pc: self.pc,
            callback: Arc::clone(&self.callback),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<S> fmt::Debug for ReturnAnnotation<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReturnAnnotation")
            .field("name", &self.name)
            .field("pc", &format_args!("0x{:x}", self.pc))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimState;

    fn annotation(
        callback: impl ScriptCallback<SimState> + 'static,
        counters: &Arc<DispatchCounters>,
    ) -> ReturnAnnotation<SimState> {
        ReturnAnnotation::new("f_ret", 0x400, Arc::new(callback), Arc::clone(counters))
    }

    #[test]
    fn test_return_terminate() {
        let counters = Arc::new(DispatchCounters::default());
        let ret = annotation(
            |_: &mut SimState, result: &mut AnnotationResult| -> Result<()> {
                result.set_exit_cpu_loop(true);
                Ok(())
            },
            &counters,
        );

        let mut state = SimState::new(1, 1, 0x8000);
        assert_eq!(ret.fire(&mut state).unwrap(), StepOutcome::Terminate);
        assert!(state.is_symbolic());

        let stats = counters.snapshot();
        assert_eq!(stats.returns_fired, 1);
        assert_eq!(stats.terminations, 1);
    }

    #[test]
    fn test_return_skip_is_ignored() {
        let counters = Arc::new(DispatchCounters::default());
        let ret = annotation(
            |_: &mut SimState, result: &mut AnnotationResult| -> Result<()> {
                result.set_skip(true);
                Ok(())
            },
            &counters,
        );

        let mut state = SimState::new(1, 1, 0x8000);
        assert_eq!(ret.fire(&mut state).unwrap(), StepOutcome::Continue);
        assert!(state.bypasses().is_empty());
        assert_eq!(counters.snapshot().skips, 0);
    }
}
