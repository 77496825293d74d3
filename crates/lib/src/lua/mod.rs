//! The script-to-core boundary: the binding registry, the target method
//! table, the `forge` global, and runtime assembly.

pub mod binding;
pub mod globals;
pub mod runtime;
pub mod target;
