//! Annotation descriptors
//!
//! A descriptor binds a module-relative program counter to the script callback that runs
//! when an execution state reaches it.

use crate::types::AnnotationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Return callback name meaning "no return callback"
pub const NO_RETURN_CALLBACK: &str = "None";

/// Calling convention of the annotated function, governs stack cleanup on skip
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum CallingConvention {
    /// Callee pops its arguments
    Stdcall,
    /// Caller pops the arguments
    Cdecl,
}

impl CallingConvention {
    /// Number of stack slots the callee pops when it returns
    pub fn callee_cleanup_slots(&self, param_count: u64) -> u64 {
        match self {
            CallingConvention::Stdcall => param_count,
            CallingConvention::Cdecl => 0,
        }
    }
}

impl FromStr for CallingConvention {
    type Err = AnnotationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdcall" => Ok(CallingConvention::Stdcall),
            "cdecl" => Ok(CallingConvention::Cdecl),
            other => Err(AnnotationError::UnknownConvention(other.to_string())),
        }
    }
}

impl TryFrom<String> for CallingConvention {
    type Error = AnnotationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallingConvention::Stdcall => write!(f, "stdcall"),
            CallingConvention::Cdecl => write!(f, "cdecl"),
        }
    }
}

/// An immutable annotation descriptor
///
/// Two descriptors are equal iff they share the program counter and the callback name.
/// Tables order and look descriptors up by program counter alone.
#[derive(Debug, Clone, Eq)]
pub struct AnnotationDescriptor {
    /// Script callback invoked when the instruction is reached
    pub name: String,
    /// Script callback invoked when the annotated function returns ([`NO_RETURN_CALLBACK`] if none)
    pub return_name: String,
    /// Module-relative program counter
    pub pc: u64,
    /// Number of parameters, popped on skip for stdcall functions
    pub param_count: u64,
    pub convention: CallingConvention,
    /// Fork the state when the instruction is reached
    pub fork: bool,
}

impl AnnotationDescriptor {
    /// Create a descriptor with no return callback, no parameters and no forking
    pub fn new(name: impl Into<String>, pc: u64) -> Self {
        Self {
            name: name.into(),
            return_name: NO_RETURN_CALLBACK.to_string(),
            pc,
            param_count: 0,
            convention: CallingConvention::Cdecl,
            fork: false,
        }
    }

    /// Builder method: set the return callback
    pub fn with_return(mut self, return_name: impl Into<String>) -> Self {
        self.return_name = return_name.into();
        self
    }

    /// Builder method: set the parameter count and calling convention
    pub fn with_params(mut self, param_count: u64, convention: CallingConvention) -> Self {
        self.param_count = param_count;
        self.convention = convention;
        self
    }

    /// Builder method: fork when the instruction is reached
    pub fn with_fork(mut self, fork: bool) -> Self {
        self.fork = fork;
        self
    }

    /// The return callback name, if any
    pub fn return_callback(&self) -> Option<&str> {
        if self.return_name == NO_RETURN_CALLBACK {
            None
        } else {
            Some(&self.return_name)
        }
    }

    /// Key recorded in the key-value store the first time this annotation forks
    pub fn lineage_key(&self) -> String {
        format!("annotation_{}_child", self.name)
    }

    /// Stack slots to pop when the annotated function is bypassed
    pub fn bypass_slots(&self) -> u64 {
        self.convention.callee_cleanup_slots(self.param_count)
    }
}

impl PartialEq for AnnotationDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.pc == other.pc && self.name == other.name
    }
}

impl fmt::Display for AnnotationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ 0x{:x} ({}, {} params", self.name, self.pc, self.convention, self.param_count)?;
        if self.fork {
            write!(f, ", fork")?;
        }
        if let Some(ret) = self.return_callback() {
            write!(f, ", returns to {}", ret)?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_ignores_everything_but_pc_and_name() {
        let a = AnnotationDescriptor::new("A", 0x1000);
        let b = AnnotationDescriptor::new("A", 0x1000)
            .with_fork(true)
            .with_params(3, CallingConvention::Stdcall);
        assert_eq!(a, b);
        assert_ne!(a, AnnotationDescriptor::new("B", 0x1000));
        assert_ne!(a, AnnotationDescriptor::new("A", 0x1004));
    }

    #[test]
    fn test_bypass_slots() {
        let stdcall = AnnotationDescriptor::new("f", 0).with_params(3, CallingConvention::Stdcall);
        let cdecl = AnnotationDescriptor::new("f", 0).with_params(3, CallingConvention::Cdecl);
        assert_eq!(stdcall.bypass_slots(), 3);
        assert_eq!(cdecl.bypass_slots(), 0);
    }

    #[test]
    fn test_return_callback_sentinel() {
        assert_eq!(AnnotationDescriptor::new("f", 0).return_callback(), None);
        let with_ret = AnnotationDescriptor::new("f", 0).with_return("f_ret");
        assert_eq!(with_ret.return_callback(), Some("f_ret"));
        assert_eq!(with_ret.lineage_key(), "annotation_f_child");
    }

    #[test]
    fn test_convention_parsing() {
        assert_eq!("stdcall".parse::<CallingConvention>().unwrap(), CallingConvention::Stdcall);
        assert_eq!("cdecl".parse::<CallingConvention>().unwrap(), CallingConvention::Cdecl);
        assert!(matches!(
            "fastcall".parse::<CallingConvention>(),
            Err(AnnotationError::UnknownConvention(cc)) if cc == "fastcall"
        ));
    }
}
