//! forge-lib: the engine behind the `forge` build tool.
//!
//! This crate provides the pieces that a Lua buildfile drives:
//! - `graph`: the dependency graph of targets, owned by a [`graph::Graph`],
//!   bound to file-system state and persisted in a binary cache file
//! - `scheduler`: the concurrent postorder traversal that invokes a Lua
//!   callback per target and runs background commands on worker threads
//! - `lua`: the Lua runtime, the `forge` global, and the binding layer
//!   that pairs native objects with script tables
//! - `context`: the ambient working-directory target stack
//! - `forge`: the facade that wires everything together
//!
//! The script runtime is mlua; all script execution happens on the thread
//! that owns the [`forge::Forge`] value. Worker threads only ever see plain
//! command and completion values.

pub mod context;
pub mod error;
pub mod forge;
pub mod graph;
pub mod lua;
pub mod scheduler;

pub use error::ForgeError;
pub use forge::{Forge, ForgeOptions};
pub use graph::{Graph, TargetId};
