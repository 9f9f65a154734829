//! Declarative callbacks
//!
//! Binds each `[[callbacks.simple]]` entry to a script callback of the replay engine and counts
//! how often every callback ran.

use crate::config::{CallbackAction, SimpleCallbackConfig};
use insn_annotation::{AnnotationResult, CallbackTable, ExecutionState, SimState};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Invocation counters, one per declared callback
#[derive(Debug, Default)]
pub struct InvocationCounts {
    counts: BTreeMap<String, AtomicU64>,
}

impl InvocationCounts {
    fn record(&self, name: &str) {
        if let Some(count) = self.counts.get(name) {
            count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn get(&self, name: &str) -> u64 {
        self.counts
            .get(name)
            .map(|count| count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Callback names with their invocation counts, sorted by name
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts
            .iter()
            .map(|(name, count)| (name.as_str(), count.load(Ordering::Relaxed)))
    }
}

/// Build the callback table for the declared callbacks
pub fn build_callbacks(configs: &[SimpleCallbackConfig]) -> (CallbackTable<SimState>, Arc<InvocationCounts>) {
    let counts = Arc::new(InvocationCounts {
        counts: configs
            .iter()
            .map(|c| (c.name.clone(), AtomicU64::new(0)))
            .collect(),
    });

    let mut table = CallbackTable::new();
    for config in configs {
        log::debug!("binding callback {} ({:?})", config.name, config.action);
        let config = config.clone();
        let counts = Arc::clone(&counts);
        let name = config.name.clone();

        table.bind(
            name,
            move |state: &mut SimState, result: &mut AnnotationResult| -> insn_annotation::Result<()> {
                counts.record(&config.name);
                if config.only_child && !result.is_child() {
                    return Ok(());
                }

                if let Some(message) = &config.message {
                    log::info!("[{}] state {}: {}", config.name, state.id(), message);
                }

                match config.action {
                    CallbackAction::Log => {}
                    CallbackAction::Terminate => result.set_exit_cpu_loop(true),
                    CallbackAction::Skip => result.set_skip(true),
                }
                Ok(())
            },
        );
    }

    (table, counts)
}
