//! Ambient per-run state: the current working-directory target.
//!
//! Relative target ids resolve against the working directory, and each
//! `buildfile` frame pushes the directory of the file it loads. The stack is
//! explicit rather than a singleton so nested loads unwind correctly on
//! every exit path.

use std::path::{Path, PathBuf};

use crate::error::ForgeError;
use crate::graph::{Graph, TargetId};

pub struct Context {
  working_directory: TargetId,
  directory_stack: Vec<TargetId>,
  initial_directory: PathBuf,
}

impl Context {
  pub fn new(working_directory: TargetId, initial_directory: PathBuf) -> Context {
    Context {
      working_directory,
      directory_stack: Vec::new(),
      initial_directory,
    }
  }

  pub fn working_directory(&self) -> TargetId {
    self.working_directory
  }

  /// The OS directory the engine started in; used to absolutize relative
  /// buildfile and cache paths.
  pub fn initial_directory(&self) -> &Path {
    &self.initial_directory
  }

  /// Replace the current working directory without growing the stack.
  pub fn change_directory(&mut self, target: TargetId) {
    self.working_directory = target;
  }

  /// Enter a nested directory scope.
  pub fn push_directory(&mut self, target: TargetId) {
    self.directory_stack.push(self.working_directory);
    self.working_directory = target;
  }

  /// Leave the innermost directory scope. Popping an empty stack leaves the
  /// current directory unchanged.
  pub fn pop_directory(&mut self) {
    if let Some(previous) = self.directory_stack.pop() {
      self.working_directory = previous;
    }
  }

  /// Re-resolve the working directory from a path, creating directory
  /// targets as needed, and drop any nested scopes. Used after operations
  /// that replace the target tree.
  pub fn reset_directory(&mut self, graph: &mut Graph, path: &str) -> Result<TargetId, ForgeError> {
    let root = graph.root();
    let target = graph.target(path, None, root)?;
    self.directory_stack.clear();
    self.working_directory = target;
    Ok(target)
  }
}
