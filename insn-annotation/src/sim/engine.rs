//! Round-based trace replay
//!
//! Blocks are translated once, before any state runs. Each round runs the pending states in
//! parallel; states forked during a round are collected and run in the next one.

use super::trace::{InstructionKind, Trace};
use super::{SimFunctionMonitor, SimState, SLOT_SIZE};
use crate::engine::{Executor, ForkCondition};
use crate::hooks::{InstallerStats, InstructionHook};
use crate::plugin::InstructionAnnotation;
use crate::stats::DispatchStats;
use crate::types::{AnnotationError, Result, StateId};
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default limit on the number of states, forks included
pub const DEFAULT_MAX_STATES: u64 = 1024;

/// An instruction of a translated block, with its hook if annotated
#[derive(Debug, Clone)]
struct TranslatedInstruction {
    pc: u64,
    kind: InstructionKind,
    hook: Option<InstructionHook>,
}

/// Outcome of a replay
#[derive(Debug)]
pub struct SimReport {
    /// Final states, ordered by id
    pub states: Vec<SimState>,
    pub stats: DispatchStats,
    pub installer: InstallerStats,
    /// Number of rounds executed
    pub rounds: usize,
}

impl SimReport {
    pub fn state(&self, id: StateId) -> Option<&SimState> {
        self.states.iter().find(|s| s.id == id)
    }
}

/// Executor handed to the plugin while one state runs
struct SimExecutor<'a> {
    next_id: &'a AtomicU64,
    max_states: u64,
    spawned: Vec<SimState>,
}

impl Executor<SimState> for SimExecutor<'_> {
    fn fork(&mut self, state: &mut SimState, condition: ForkCondition) -> Result<&mut SimState> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if id > self.max_states {
            return Err(AnnotationError::Fork(format!(
                "state limit of {} reached while forking state {} on {}",
                self.max_states, state.id, condition
            )));
        }

        self.spawned.push(state.fork_child(id, &condition));
        let index = self.spawned.len() - 1;
        Ok(&mut self.spawned[index])
    }
}

/// Replays a trace through an annotation plugin
#[derive(Debug)]
pub struct Simulator {
    blocks: HashMap<u64, Vec<TranslatedInstruction>>,
    initial: Vec<SimState>,
    max_states: u64,
}

impl Simulator {
    /// Create the initial states and translate every block their paths reach
    pub fn new(trace: &Trace, plugin: &mut InstructionAnnotation<SimState>) -> Result<Self> {
        trace.validate()?;

        let initial: Vec<SimState> = trace
            .states
            .iter()
            .enumerate()
            .map(|(index, s)| SimState::new(index as StateId + 1, s.pid, s.sp).with_path(s.path.clone()))
            .collect();

        let mut blocks = HashMap::new();
        let Some(context) = initial.first() else {
            log::warn!("trace has no states, nothing to replay");
            return Ok(Self {
                blocks,
                initial,
                max_states: DEFAULT_MAX_STATES,
            });
        };

        plugin.on_monitor_load(context);

        let by_start: HashMap<u64, _> = trace
            .blocks
            .iter()
            .filter_map(|block| block.start().map(|start| (start, block)))
            .collect();

        for start in initial.iter().flat_map(|s| s.path.iter().copied()) {
            if blocks.contains_key(&start) {
                continue;
            }
            let block = by_start
                .get(&start)
                .ok_or_else(|| AnnotationError::InvalidTrace(format!("unknown block 0x{:x}", start)))?;

            plugin.on_translate_block_start(context, start);
            let translated = block
                .instructions
                .iter()
                .map(|insn| TranslatedInstruction {
                    pc: insn.pc,
                    kind: insn.kind,
                    hook: plugin.on_translate_instruction_start(insn.pc),
                })
                .collect();
            plugin.on_translate_block_complete();

            blocks.insert(start, translated);
        }

        log::debug!("translated {} block(s) for {} state(s)", blocks.len(), initial.len());

        Ok(Self {
            blocks,
            initial,
            max_states: DEFAULT_MAX_STATES,
        })
    }

    /// Builder method: limit the total number of states, forks included
    pub fn with_max_states(mut self, max_states: u64) -> Self {
        self.max_states = max_states;
        self
    }

    /// Run every state to the end of its path
    pub fn run(mut self, plugin: &InstructionAnnotation<SimState>) -> Result<SimReport> {
        let next_id = AtomicU64::new(self.initial.len() as u64 + 1);
        let mut pending = std::mem::take(&mut self.initial);
        let mut finished = Vec::new();
        let mut rounds = 0;

        while !pending.is_empty() {
            rounds += 1;
            log::debug!("round {}: {} state(s)", rounds, pending.len());

            let results: Vec<Result<(SimState, Vec<SimState>)>> = pending
                .into_par_iter()
                .map(|mut state| {
                    let mut executor = SimExecutor {
                        next_id: &next_id,
                        max_states: self.max_states,
                        spawned: Vec::new(),
                    };
                    self.run_state(plugin, &mut state, &mut executor)?;
                    Ok((state, executor.spawned))
                })
                .collect();

            pending = Vec::new();
            for result in results {
                let (state, spawned) = result?;
                finished.push(state);
                pending.extend(spawned);
            }
        }

        finished.sort_by_key(|s| s.id);
        log::info!("replay finished: {} state(s) in {} round(s)", finished.len(), rounds);

        Ok(SimReport {
            states: finished,
            stats: plugin.stats(),
            installer: plugin.installer_stats(),
            rounds,
        })
    }

    fn run_state(
        &self,
        plugin: &InstructionAnnotation<SimState>,
        state: &mut SimState,
        executor: &mut SimExecutor<'_>,
    ) -> Result<()> {
        while state.current_block().is_some() {
            self.run_step(plugin, state, executor)?;
        }
        Ok(())
    }

    /// Execute the rest of the current block
    fn run_step(
        &self,
        plugin: &InstructionAnnotation<SimState>,
        state: &mut SimState,
        executor: &mut SimExecutor<'_>,
    ) -> Result<()> {
        let Some(start) = state.current_block() else {
            return Ok(());
        };
        let block = self
            .blocks
            .get(&start)
            .ok_or_else(|| AnnotationError::InvalidTrace(format!("block 0x{:x} was never translated", start)))?;

        while let Some(insn) = block.get(state.insn) {
            if let Some(hook) = &insn.hook {
                if plugin.on_instruction(state, executor, hook)?.is_terminate() {
                    self.terminate_step(state);
                    return Ok(());
                }
            }

            state.executed.push(insn.pc);
            state.insn += 1;

            match insn.kind {
                InstructionKind::Plain => {}
                InstructionKind::Call => state.sp = state.sp.wrapping_sub(SLOT_SIZE),
                InstructionKind::Ret => {
                    let sp = state.sp;
                    let returns = SimFunctionMonitor::take_returns(state, sp);
                    state.sp = sp.wrapping_add(SLOT_SIZE);

                    let mut terminate = false;
                    for annotation in returns {
                        terminate |= annotation.fire(state)?.is_terminate();
                    }
                    if terminate {
                        self.terminate_step(state);
                        return Ok(());
                    }
                }
            }
        }

        state.advance_block();
        Ok(())
    }

    fn terminate_step(&self, state: &mut SimState) {
        state.terminated_steps += 1;
        if state.take_pending_bypass() {
            self.skip_to_return(state);
        } else {
            state.advance_block();
        }
    }

    /// Move past the `ret` of the current function without executing anything
    fn skip_to_return(&self, state: &mut SimState) {
        let mut depth = 0u64;
        while let Some(start) = state.current_block() {
            let Some(block) = self.blocks.get(&start) else {
                return;
            };

            while let Some(insn) = block.get(state.insn) {
                state.insn += 1;
                match insn.kind {
                    InstructionKind::Plain => {}
                    InstructionKind::Call => depth += 1,
                    InstructionKind::Ret if depth == 0 => {
                        if state.insn >= block.len() {
                            state.advance_block();
                        }
                        return;
                    }
                    InstructionKind::Ret => depth -= 1,
                }
            }

            state.advance_block();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ExecutionState, InMemoryKeyValueStore, KeyValueStore};
    use crate::registry::{AnnotationDescriptor, AnnotationRegistry, CallingConvention};
    use crate::script::{AnnotationResult, CallbackTable};
    use crate::sim;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    // Module "app" is loaded at 0x1000 and linked at 0x40_0000
    const TRACE: &str = r#"{
        "modules": [{"name": "app", "load_base": 4096, "native_base": 4194304, "size": 4096}],
        "tracked_pids": [1],
        "blocks": [
            {"instructions": [{"pc": 4096}, {"pc": 4100, "kind": "call"}]},
            {"instructions": [{"pc": 4352}, {"pc": 4356}, {"pc": 4360, "kind": "ret"}]},
            {"instructions": [{"pc": 4104}, {"pc": 4108}]}
        ],
        "states": [{"pid": 1, "sp": 32768, "path": [4096, 4352, 4104]}]
    }"#;

    fn plugin(
        registry: AnnotationRegistry,
        callbacks: &CallbackTable<SimState>,
        trace: &Trace,
    ) -> InstructionAnnotation<SimState> {
        let kvs: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
        InstructionAnnotation::new(registry, sim::collaborators(trace, Some(kvs)), callbacks).unwrap()
    }

    fn replay(registry: AnnotationRegistry, callbacks: CallbackTable<SimState>) -> SimReport {
        let trace = Trace::from_json(TRACE).unwrap();
        let mut plugin = plugin(registry, &callbacks, &trace);
        let simulator = Simulator::new(&trace, &mut plugin).unwrap();
        simulator.run(&plugin).unwrap()
    }

    #[test]
    fn test_plain_replay() {
        let report = replay(AnnotationRegistry::new(), CallbackTable::new());
        let state = report.state(1).unwrap();
        assert_eq!(state.executed(), [0x1000, 0x1004, 0x1100, 0x1104, 0x1108, 0x1008, 0x100c]);
        assert_eq!(state.stack_pointer(), 0x8000);
        assert_eq!(report.rounds, 1);
        assert_eq!(report.installer.armed, 0);
    }

    #[test]
    fn test_terminate_ends_block() {
        let mut registry = AnnotationRegistry::new();
        registry
            .register("app", AnnotationDescriptor::new("stop", 0x40_0104))
            .unwrap();
        let callbacks = CallbackTable::new().with(
            "stop",
            |_: &mut SimState, result: &mut AnnotationResult| -> Result<()> {
                result.set_exit_cpu_loop(true);
                Ok(())
            },
        );

        let report = replay(registry, callbacks);
        let state = report.state(1).unwrap();
        // The ret of the callee never runs, so the stack stays one slot lower
        assert_eq!(state.executed(), [0x1000, 0x1004, 0x1100, 0x1008, 0x100c]);
        assert_eq!(state.terminated_steps(), 1);
        assert_eq!(state.stack_pointer(), 0x8000 - SLOT_SIZE);
    }

    #[test]
    fn test_terminate_hides_later_annotations_in_block() {
        let mut registry = AnnotationRegistry::new();
        registry
            .register("app", AnnotationDescriptor::new("stop", 0x40_0100))
            .unwrap();
        registry
            .register("app", AnnotationDescriptor::new("later", 0x40_0104))
            .unwrap();

        let later_hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&later_hits);
        let callbacks = CallbackTable::new()
            .with(
                "stop",
                |_: &mut SimState, result: &mut AnnotationResult| -> Result<()> {
                    result.set_exit_cpu_loop(true);
                    Ok(())
                },
            )
            .with(
                "later",
                move |_: &mut SimState, _: &mut AnnotationResult| -> Result<()> {
                    counter.fetch_add(1, Ordering::Relaxed);
                    Ok(())
                },
            );

        let report = replay(registry, callbacks);
        let state = report.state(1).unwrap();
        assert_eq!(later_hits.load(Ordering::Relaxed), 0);
        assert_eq!(report.stats.hits, 1);
        assert_eq!(state.executed(), [0x1000, 0x1004, 0x1008, 0x100c]);
        assert_eq!(state.terminated_steps(), 1);
    }

    #[test]
    fn test_skip_bypasses_callee() {
        let mut registry = AnnotationRegistry::new();
        registry
            .register(
                "app",
                AnnotationDescriptor::new("skip", 0x40_0100).with_params(2, CallingConvention::Stdcall),
            )
            .unwrap();
        let callbacks = CallbackTable::new().with(
            "skip",
            |_: &mut SimState, result: &mut AnnotationResult| -> Result<()> {
                result.set_skip(true);
                Ok(())
            },
        );

        let report = replay(registry, callbacks);
        let state = report.state(1).unwrap();
        assert_eq!(state.executed(), [0x1000, 0x1004, 0x1008, 0x100c]);
        assert_eq!(state.bypasses().len(), 1);
        // Return address and two stdcall arguments popped
        assert_eq!(state.stack_pointer(), 0x8000 + 2 * SLOT_SIZE);
        assert_eq!(report.stats.skips, 1);
    }

    #[test]
    fn test_return_callback_fires_on_ret() {
        let mut registry = AnnotationRegistry::new();
        registry
            .register("app", AnnotationDescriptor::new("enter", 0x40_0100).with_return("leave"))
            .unwrap();
        let callbacks = CallbackTable::new()
            .with("enter", |_: &mut SimState, _: &mut AnnotationResult| -> Result<()> { Ok(()) })
            .with(
                "leave",
                |_: &mut SimState, result: &mut AnnotationResult| -> Result<()> {
                    result.set_exit_cpu_loop(true);
                    Ok(())
                },
            );

        let report = replay(registry, callbacks);
        let state = report.state(1).unwrap();
        assert_eq!(report.stats.return_registrations, 1);
        assert_eq!(report.stats.returns_fired, 1);
        assert_eq!(SimFunctionMonitor::pending(state), 0);
        // The ret completed before the return callback ended the step
        assert_eq!(state.executed(), [0x1000, 0x1004, 0x1100, 0x1104, 0x1108, 0x1008, 0x100c]);
        assert_eq!(state.terminated_steps(), 1);
    }

    #[test]
    fn test_fork_child_runs_next_round() {
        let mut registry = AnnotationRegistry::new();
        registry
            .register("app", AnnotationDescriptor::new("A", 0x40_0100).with_fork(true))
            .unwrap();
        let callbacks = CallbackTable::new().with(
            "A",
            |_: &mut SimState, result: &mut AnnotationResult| -> Result<()> {
                // The child gives up on the callee
                result.set_exit_cpu_loop(result.is_child());
                Ok(())
            },
        );

        let report = replay(registry, callbacks);
        assert_eq!(report.rounds, 2);
        assert_eq!(report.states.len(), 2);
        assert_eq!(report.stats.forks, 1);
        assert_eq!(report.stats.suppressed_forks, 1);

        let parent = report.state(1).unwrap();
        let child = report.state(2).unwrap();
        assert_eq!(parent.terminated_steps(), 0);
        assert_eq!(child.terminated_steps(), 1);
        assert_eq!(child.constraints(), ["annotation_A_child != 0"]);
        assert_eq!(child.executed(), [0x1000, 0x1004, 0x1008, 0x100c]);
    }

    #[test]
    fn test_state_limit() {
        let mut registry = AnnotationRegistry::new();
        registry
            .register("app", AnnotationDescriptor::new("A", 0x40_0100).with_fork(true))
            .unwrap();
        let callbacks =
            CallbackTable::new().with("A", |_: &mut SimState, _: &mut AnnotationResult| -> Result<()> { Ok(()) });

        let trace = Trace::from_json(TRACE).unwrap();
        let mut plugin = plugin(registry, &callbacks, &trace);
        let simulator = Simulator::new(&trace, &mut plugin).unwrap().with_max_states(1);
        assert!(matches!(simulator.run(&plugin), Err(AnnotationError::Fork(_))));
    }
}
