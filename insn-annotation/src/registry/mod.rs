//! Annotation registry
//!
//! Holds the static, per-module annotation tables built from configuration at start-up.

pub mod annotation;
pub mod table;

// Re-export key types for convenience
pub use annotation::{AnnotationDescriptor, CallingConvention, NO_RETURN_CALLBACK};
pub use table::{AnnotationRegistry, ModuleAnnotationTable, Registration};
