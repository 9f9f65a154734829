//! Recorded trace format
//!
//! A trace describes the loaded modules, the processes under analysis, the code as a set of
//! translation blocks, and the initial execution states with the sequence of blocks each one
//! runs through.

use crate::engine::ModuleDescriptor;
use crate::types::{AnnotationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Complete trace
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Trace {
    #[serde(default)]
    pub modules: Vec<TraceModule>,
    /// Process ids whose states are analysed
    #[serde(default)]
    pub tracked_pids: Vec<u64>,
    pub blocks: Vec<TraceBlock>,
    pub states: Vec<TraceState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceModule {
    pub name: String,
    pub load_base: u64,
    pub native_base: u64,
    pub size: u64,
}

/// A translation block; its start address is the pc of its first instruction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceBlock {
    pub instructions: Vec<TraceInstruction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceInstruction {
    /// Runtime program counter
    pub pc: u64,
    #[serde(default)]
    pub kind: InstructionKind,
}

/// How an instruction affects the call stack
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionKind {
    #[default]
    Plain,
    /// Pushes a return address
    Call,
    /// Pops a return address, firing return annotations registered at that stack pointer
    Ret,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceState {
    pub pid: u64,
    #[serde(default = "default_stack_pointer")]
    pub sp: u64,
    /// Start addresses of the blocks this state executes, in order
    pub path: Vec<u64>,
}

fn default_stack_pointer() -> u64 {
    0x7ffe_0000
}

impl TraceBlock {
    /// Address of the first instruction
    pub fn start(&self) -> Option<u64> {
        self.instructions.first().map(|insn| insn.pc)
    }
}

impl TraceModule {
    pub fn to_descriptor(&self) -> ModuleDescriptor {
        ModuleDescriptor::new(self.name.clone(), self.load_base, self.native_base, self.size)
    }
}

impl Trace {
    /// Parse and validate a JSON trace
    pub fn from_json(content: &str) -> Result<Self> {
        let trace: Trace = serde_json::from_str(content)?;
        trace.validate()?;
        Ok(trace)
    }

    /// Load a JSON trace from a file
    pub fn load(path: &Path) -> Result<Self> {
        log::info!("Loading trace: {:?}", path);
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Check that blocks are non-empty with unique starts and that every path entry names a block
    pub fn validate(&self) -> Result<()> {
        let mut starts = HashSet::new();
        for (index, block) in self.blocks.iter().enumerate() {
            let start = block
                .start()
                .ok_or_else(|| AnnotationError::InvalidTrace(format!("block #{} is empty", index)))?;
            if !starts.insert(start) {
                return Err(AnnotationError::InvalidTrace(format!(
                    "duplicate block at 0x{:x}",
                    start
                )));
            }
        }

        for (index, state) in self.states.iter().enumerate() {
            if let Some(missing) = state.path.iter().find(|pc| !starts.contains(pc)) {
                return Err(AnnotationError::InvalidTrace(format!(
                    "state #{} runs unknown block 0x{:x}",
                    index, missing
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_deserialization() {
        let json = r#"{
            "modules": [{"name": "app", "load_base": 4096, "native_base": 0, "size": 4096}],
            "tracked_pids": [1],
            "blocks": [
                {"instructions": [{"pc": 4096}, {"pc": 4100, "kind": "call"}]},
                {"instructions": [{"pc": 4200, "kind": "ret"}]}
            ],
            "states": [{"pid": 1, "path": [4096, 4200]}]
        }"#;

        let trace = Trace::from_json(json).unwrap();
        assert_eq!(trace.blocks.len(), 2);
        assert_eq!(trace.blocks[0].instructions[0].kind, InstructionKind::Plain);
        assert_eq!(trace.blocks[0].instructions[1].kind, InstructionKind::Call);
        assert_eq!(trace.states[0].sp, 0x7ffe_0000);
        assert_eq!(trace.modules[0].to_descriptor().addend(), 0u64.wrapping_sub(4096));
    }

    #[test]
    fn test_unknown_block_in_path() {
        let json = r#"{
            "blocks": [{"instructions": [{"pc": 16}]}],
            "states": [{"pid": 1, "path": [16, 32]}]
        }"#;

        assert!(matches!(
            Trace::from_json(json),
            Err(AnnotationError::InvalidTrace(msg)) if msg.contains("0x20")
        ));
    }

    #[test]
    fn test_empty_block() {
        let json = r#"{"blocks": [{"instructions": []}], "states": []}"#;
        assert!(matches!(Trace::from_json(json), Err(AnnotationError::InvalidTrace(_))));
    }
}
