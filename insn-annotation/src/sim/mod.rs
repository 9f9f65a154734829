//! In-memory exploration engine
//!
//! Replays a recorded [`Trace`] through an [`InstructionAnnotation`] plugin. States run their
//! block paths in rounds, in parallel within a round, and children created by annotation forks
//! run in the following round. This is enough to exercise every engine-facing contract of the
//! plugin without a real emulator.
//!
//! [`InstructionAnnotation`]: crate::InstructionAnnotation

pub mod engine;
pub mod trace;

pub use engine::{SimReport, Simulator};
pub use trace::{InstructionKind, Trace, TraceBlock, TraceInstruction, TraceModule, TraceState};

use crate::engine::{
    ExecutionState, ForkCondition, FunctionMonitor, KeyValueStore, ModuleDescriptor, ModuleMap,
    ProcessDetector,
};
use crate::plugin::Collaborators;
use crate::returns::ReturnAnnotation;
use crate::state::PluginStateStore;
use crate::types::StateId;
use std::collections::HashSet;
use std::sync::Arc;

/// Size of a stack slot in bytes
pub const SLOT_SIZE: u64 = 8;

/// A function bypass performed on a state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bypass {
    /// Stack pointer when the bypass was requested
    pub sp: u64,
    pub stack_slots: u64,
}

/// Execution state of the in-memory engine
#[derive(Debug, Clone)]
pub struct SimState {
    id: StateId,
    pid: u64,
    sp: u64,
    path: Arc<Vec<u64>>,
    block: usize,
    insn: usize,
    store: PluginStateStore,
    symbolic: bool,
    executed: Vec<u64>,
    bypasses: Vec<Bypass>,
    pending_bypass: bool,
    constraints: Vec<String>,
    terminated_steps: u64,
}

impl SimState {
    /// Create a state with an empty path
    pub fn new(id: StateId, pid: u64, sp: u64) -> Self {
        Self {
            id,
            pid,
            sp,
            path: Arc::new(Vec::new()),
            block: 0,
            insn: 0,
            store: PluginStateStore::new(),
            symbolic: false,
            executed: Vec::new(),
            bypasses: Vec::new(),
            pending_bypass: false,
            constraints: Vec::new(),
            terminated_steps: 0,
        }
    }

    /// Builder method: set the block path
    pub fn with_path(mut self, path: Vec<u64>) -> Self {
        self.path = Arc::new(path);
        self
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub fn is_symbolic(&self) -> bool {
        self.symbolic
    }

    /// Runtime program counters executed so far, in order
    pub fn executed(&self) -> &[u64] {
        &self.executed
    }

    pub fn bypasses(&self) -> &[Bypass] {
        &self.bypasses
    }

    /// Path constraints added by forks
    pub fn constraints(&self) -> &[String] {
        &self.constraints
    }

    /// Number of steps aborted by a callback
    pub fn terminated_steps(&self) -> u64 {
        self.terminated_steps
    }

    /// Split off a new state resuming at the current instruction
    ///
    /// `self` takes the concrete side of `condition`, the returned state the other one.
    pub fn fork_child(&mut self, id: StateId, condition: &ForkCondition) -> SimState {
        let mut child = self.clone();
        child.id = id;
        child.constraints.push(format!("{} != 0", condition.variable));
        self.constraints.push(condition.to_string());
        child
    }

    fn current_block(&self) -> Option<u64> {
        self.path.get(self.block).copied()
    }

    fn advance_block(&mut self) {
        self.block += 1;
        self.insn = 0;
    }

    fn take_pending_bypass(&mut self) -> bool {
        std::mem::take(&mut self.pending_bypass)
    }
}

impl ExecutionState for SimState {
    fn id(&self) -> StateId {
        self.id
    }

    fn plugin_states(&self) -> &PluginStateStore {
        &self.store
    }

    fn plugin_states_mut(&mut self) -> &mut PluginStateStore {
        &mut self.store
    }

    fn switch_to_symbolic(&mut self) {
        self.symbolic = true;
    }

    fn stack_pointer(&self) -> u64 {
        self.sp
    }

    fn bypass_function(&mut self, stack_slots: u64) {
        self.bypasses.push(Bypass {
            sp: self.sp,
            stack_slots,
        });
        // Return address plus the callee-popped arguments
        let popped = stack_slots.saturating_add(1).saturating_mul(SLOT_SIZE);
        self.sp = self.sp.wrapping_add(popped);
        self.pending_bypass = true;
    }
}

/// Module map over a fixed module list
#[derive(Debug, Clone, Default)]
pub struct SimModuleMap {
    modules: Vec<ModuleDescriptor>,
}

impl SimModuleMap {
    pub fn new(modules: Vec<ModuleDescriptor>) -> Self {
        Self { modules }
    }
}

impl ModuleMap<SimState> for SimModuleMap {
    fn resolve(&self, _state: &SimState, pc: u64) -> Option<ModuleDescriptor> {
        self.modules.iter().find(|m| m.contains(pc)).cloned()
    }
}

/// Tracks states by process id
#[derive(Debug, Clone, Default)]
pub struct SimProcessDetector {
    pids: HashSet<u64>,
}

impl SimProcessDetector {
    pub fn new(pids: impl IntoIterator<Item = u64>) -> Self {
        Self {
            pids: pids.into_iter().collect(),
        }
    }
}

impl ProcessDetector<SimState> for SimProcessDetector {
    fn is_tracked(&self, state: &SimState) -> bool {
        self.pids.contains(&state.pid)
    }
}

/// Return annotations waiting on a state, keyed by the stack pointer they were registered at
#[derive(Debug, Clone, Default)]
struct PendingReturns {
    entries: Vec<(u64, ReturnAnnotation<SimState>)>,
}

/// Function monitor keeping its bookkeeping in each state's plugin records
#[derive(Debug, Clone, Copy, Default)]
pub struct SimFunctionMonitor;

impl SimFunctionMonitor {
    /// Number of return annotations registered on `state` and not fired yet
    pub fn pending(state: &SimState) -> usize {
        state
            .store
            .get::<PendingReturns>()
            .map(|pending| pending.entries.len())
            .unwrap_or(0)
    }

    fn take_returns(state: &mut SimState, sp: u64) -> Vec<ReturnAnnotation<SimState>> {
        let Some(pending) = state.store.get_mut::<PendingReturns>() else {
            return Vec::new();
        };
        let (fired, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut pending.entries)
            .into_iter()
            .partition(|(registered_sp, _)| *registered_sp == sp);
        pending.entries = kept;
        fired.into_iter().map(|(_, annotation)| annotation).collect()
    }
}

impl FunctionMonitor<SimState> for SimFunctionMonitor {
    fn register_return(&self, state: &mut SimState, annotation: ReturnAnnotation<SimState>) {
        let sp = state.sp;
        state
            .store
            .with_default(|pending: &mut PendingReturns| pending.entries.push((sp, annotation)));
    }

    fn erase_sp(&self, state: &mut SimState, sp: u64) {
        if let Some(pending) = state.store.get_mut::<PendingReturns>() {
            pending.entries.retain(|(registered_sp, _)| *registered_sp != sp);
        }
    }
}

/// Collaborators backed by the in-memory engine for the given trace
pub fn collaborators(trace: &Trace, kvs: Option<Arc<dyn KeyValueStore>>) -> Collaborators<SimState> {
    Collaborators {
        modules: Arc::new(SimModuleMap::new(
            trace.modules.iter().map(TraceModule::to_descriptor).collect(),
        )),
        detector: Arc::new(SimProcessDetector::new(trace.tracked_pids.iter().copied())),
        function_monitor: Arc::new(SimFunctionMonitor),
        kvs,
    }
}
