//! A target: one node in the dependency graph.
//!
//! Targets are owned exclusively by the [`Graph`](super::Graph) slab and
//! refer to each other by [`TargetId`]. A target may be bound to zero or
//! more files on disk; most are bound to none or one.

/// Stable index of a target in the graph's slab.
///
/// Ids stay valid for the lifetime of the graph contents; they are only
/// invalidated by `Graph::clear` and `Graph::load_binary`, which replace
/// the whole slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub(crate) u32);

impl TargetId {
  pub const ROOT: TargetId = TargetId(0);

  pub(crate) fn index(self) -> usize {
    self.0 as usize
  }
}

/// A node in the dependency graph.
///
/// The `id` is unique among siblings under one parent; the full path is
/// computed by walking the parent chain (see `Graph::path`).
#[derive(Debug)]
pub struct Target {
  pub(crate) id: String,
  pub(crate) parent: Option<TargetId>,
  /// Children in insertion order, for deterministic traversal.
  pub(crate) children: Vec<TargetId>,
  pub(crate) prototype: Option<super::PrototypeId>,
  pub(crate) working_directory: Option<TargetId>,
  pub(crate) filenames: Vec<String>,
  /// Most recent last-write time across `filenames`, in nanoseconds since
  /// the epoch; 0 when no file exists.
  pub(crate) timestamp: u64,
  /// Same, but as observed by the most recent bind.
  pub(crate) last_write_time: u64,
  pub(crate) explicit_dependencies: Vec<TargetId>,
  pub(crate) implicit_dependencies: Vec<TargetId>,
  pub(crate) required_to_exist: bool,
  pub(crate) always_bind: bool,
  pub(crate) cleanable: bool,
  pub(crate) referenced_by_script: bool,
  pub(crate) bound_to_file: bool,
  /// Cached by the most recent bind; see `Graph::bind`.
  pub(crate) outdated: bool,
  pub(crate) next_anonymous_index: u32,
  pub(crate) visited_revision: u32,
  pub(crate) successful_revision: u32,
}

impl Target {
  pub(crate) fn new(id: String, parent: Option<TargetId>) -> Target {
    Target {
      id,
      parent,
      children: Vec::new(),
      prototype: None,
      working_directory: None,
      filenames: Vec::new(),
      timestamp: 0,
      last_write_time: 0,
      explicit_dependencies: Vec::new(),
      implicit_dependencies: Vec::new(),
      required_to_exist: false,
      always_bind: false,
      cleanable: false,
      referenced_by_script: false,
      bound_to_file: false,
      outdated: false,
      next_anonymous_index: 0,
      visited_revision: 0,
      successful_revision: 0,
    }
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  pub fn parent(&self) -> Option<TargetId> {
    self.parent
  }

  pub fn children(&self) -> &[TargetId] {
    &self.children
  }

  pub fn prototype(&self) -> Option<super::PrototypeId> {
    self.prototype
  }

  pub fn working_directory(&self) -> Option<TargetId> {
    self.working_directory
  }

  pub fn set_working_directory(&mut self, target: Option<TargetId>) {
    self.working_directory = target;
  }

  /// Set the filename at `index`, extending the sequence with empty
  /// strings so that its length is at least `index + 1`.
  pub fn set_filename(&mut self, filename: impl Into<String>, index: usize) {
    if self.filenames.len() <= index {
      self.filenames.resize(index + 1, String::new());
    }
    self.filenames[index] = filename.into();
  }

  pub fn filename(&self, index: usize) -> Option<&str> {
    self.filenames.get(index).map(String::as_str)
  }

  pub fn filenames(&self) -> &[String] {
    &self.filenames
  }

  pub fn timestamp(&self) -> u64 {
    self.timestamp
  }

  pub fn last_write_time(&self) -> u64 {
    self.last_write_time
  }

  pub fn outdated(&self) -> bool {
    self.outdated
  }

  pub fn required_to_exist(&self) -> bool {
    self.required_to_exist
  }

  pub fn set_required_to_exist(&mut self, required: bool) {
    self.required_to_exist = required;
  }

  pub fn always_bind(&self) -> bool {
    self.always_bind
  }

  pub fn set_always_bind(&mut self, always: bool) {
    self.always_bind = always;
  }

  pub fn cleanable(&self) -> bool {
    self.cleanable
  }

  pub fn set_cleanable(&mut self, cleanable: bool) {
    self.cleanable = cleanable;
  }

  pub fn referenced_by_script(&self) -> bool {
    self.referenced_by_script
  }

  pub fn set_referenced_by_script(&mut self, referenced: bool) {
    self.referenced_by_script = referenced;
  }

  pub fn bound_to_file(&self) -> bool {
    self.bound_to_file
  }

  /// Add an explicit dependency edge. Duplicate edges are not added.
  pub fn add_dependency(&mut self, target: TargetId) {
    if !self.explicit_dependencies.contains(&target) {
      self.explicit_dependencies.push(target);
    }
  }

  /// Remove an explicit dependency edge. Implicit edges are untouched.
  pub fn remove_dependency(&mut self, target: TargetId) {
    self.explicit_dependencies.retain(|&dep| dep != target);
  }

  pub fn add_implicit_dependency(&mut self, target: TargetId) {
    if !self.implicit_dependencies.contains(&target) {
      self.implicit_dependencies.push(target);
    }
  }

  pub fn clear_implicit_dependencies(&mut self) {
    self.implicit_dependencies.clear();
  }

  pub fn explicit_dependencies(&self) -> &[TargetId] {
    &self.explicit_dependencies
  }

  pub fn implicit_dependencies(&self) -> &[TargetId] {
    &self.implicit_dependencies
  }

  /// Explicit then implicit dependencies, in declaration order.
  pub fn dependencies(&self) -> impl Iterator<Item = TargetId> + '_ {
    self
      .explicit_dependencies
      .iter()
      .chain(self.implicit_dependencies.iter())
      .copied()
  }

  /// All targets this target depends on. `targets` and `dependencies` are
  /// two accessors over the same concatenated edge list.
  pub fn targets(&self) -> impl Iterator<Item = TargetId> + '_ {
    self.dependencies()
  }

  pub fn dependency(&self, index: usize) -> Option<TargetId> {
    self.dependencies().nth(index)
  }

  /// Take the next anonymous index for this working directory.
  pub fn next_anonymous_index(&mut self) -> u32 {
    let index = self.next_anonymous_index;
    self.next_anonymous_index += 1;
    index
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn set_filename_pads_with_empty_strings() {
    let mut target = Target::new("out".to_string(), Some(TargetId::ROOT));
    target.set_filename("/tmp/out.txt", 2);
    assert_eq!(target.filenames(), &["", "", "/tmp/out.txt"]);
    assert_eq!(target.filename(2), Some("/tmp/out.txt"));
    assert_eq!(target.filename(3), None);
  }

  #[test]
  fn add_dependency_is_idempotent() {
    let mut target = Target::new("a".to_string(), Some(TargetId::ROOT));
    let dep = TargetId(7);
    target.add_dependency(dep);
    target.add_dependency(dep);
    assert_eq!(target.explicit_dependencies(), &[dep]);
  }

  #[test]
  fn remove_dependency_leaves_implicit_edges() {
    let mut target = Target::new("a".to_string(), Some(TargetId::ROOT));
    let dep = TargetId(7);
    target.add_dependency(dep);
    target.add_implicit_dependency(dep);
    target.remove_dependency(dep);
    assert!(target.explicit_dependencies().is_empty());
    assert_eq!(target.implicit_dependencies(), &[dep]);
  }

  #[test]
  fn dependencies_lists_explicit_before_implicit() {
    let mut target = Target::new("a".to_string(), Some(TargetId::ROOT));
    target.add_implicit_dependency(TargetId(9));
    target.add_dependency(TargetId(3));
    let deps: Vec<_> = target.dependencies().collect();
    assert_eq!(deps, vec![TargetId(3), TargetId(9)]);
    assert_eq!(target.dependency(0), Some(TargetId(3)));
    assert_eq!(target.dependency(1), Some(TargetId(9)));
    assert_eq!(target.dependency(2), None);

    // targets() walks the same list.
    let via_targets: Vec<_> = target.targets().collect();
    assert_eq!(via_targets, deps);
  }

  #[test]
  fn anonymous_index_is_monotonic() {
    let mut target = Target::new("dir".to_string(), Some(TargetId::ROOT));
    assert_eq!(target.next_anonymous_index(), 0);
    assert_eq!(target.next_anonymous_index(), 1);
    assert_eq!(target.next_anonymous_index(), 2);
  }
}
