//! The dependency graph.
//!
//! A [`Graph`] exclusively owns every [`Target`] in a slab with stable
//! indices; parents, children, working directories, and dependency edges all
//! refer to targets by [`TargetId`]. The root target has id `""` and lives at
//! index 0. Targets are created lazily on first reference and destroyed only
//! by [`Graph::clear`], [`Graph::load_binary`], or graph destruction.

mod bind;
mod binary;
mod prototype;
mod target;

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::ForgeError;

pub use prototype::{PrototypeId, TargetPrototype};
pub use target::{Target, TargetId};

pub struct Graph {
  targets: Vec<Target>,
  prototypes: Vec<TargetPrototype>,
  prototype_ids: HashMap<String, PrototypeId>,
  traversal_in_progress: bool,
  visited_revision: u32,
  successful_revision: u32,
  /// The distinguished target for the on-disk serialized state.
  cache_target: Option<TargetId>,
  /// Where `save_binary` writes; remembered by `load_binary`.
  cache_filename: Option<PathBuf>,
}

impl Graph {
  pub fn new() -> Graph {
    Graph {
      targets: vec![Target::new(String::new(), None)],
      prototypes: Vec::new(),
      prototype_ids: HashMap::new(),
      traversal_in_progress: false,
      visited_revision: 0,
      successful_revision: 0,
      cache_target: None,
      cache_filename: None,
    }
  }

  pub fn root(&self) -> TargetId {
    TargetId::ROOT
  }

  pub fn get(&self, id: TargetId) -> &Target {
    &self.targets[id.index()]
  }

  pub fn get_mut(&mut self, id: TargetId) -> &mut Target {
    &mut self.targets[id.index()]
  }

  pub fn len(&self) -> usize {
    self.targets.len()
  }

  pub fn is_empty(&self) -> bool {
    self.targets.len() <= 1
  }

  /// All target ids, in creation order.
  pub fn target_ids(&self) -> impl Iterator<Item = TargetId> + '_ {
    (0..self.targets.len() as u32).map(TargetId)
  }

  /// The full path of a target: its ancestors' ids joined with `/`.
  ///
  /// The root's path is `""`; a child `b` of `a` under the root has path
  /// `/a/b`. Working-directory targets mirror file-system paths, so file
  /// targets created beneath them have paths equal to their filenames.
  pub fn path(&self, id: TargetId) -> String {
    let mut elements = Vec::new();
    let mut current = Some(id);
    while let Some(target_id) = current {
      let target = self.get(target_id);
      if target.parent.is_some() {
        elements.push(target.id.as_str());
      }
      current = target.parent;
    }
    let mut path = String::new();
    for element in elements.iter().rev() {
      path.push('/');
      path.push_str(element);
    }
    path
  }

  /// The path of a target's parent, or `""` for the root.
  pub fn branch(&self, id: TargetId) -> String {
    match self.get(id).parent {
      Some(parent) => self.path(parent),
      None => String::new(),
    }
  }

  /// Look up or create the prototype registered under `id`.
  pub fn target_prototype(&mut self, id: &str) -> PrototypeId {
    if let Some(&existing) = self.prototype_ids.get(id) {
      return existing;
    }
    let prototype_id = PrototypeId(self.prototypes.len() as u32);
    self.prototypes.push(TargetPrototype::new(id.to_string()));
    self.prototype_ids.insert(id.to_string(), prototype_id);
    prototype_id
  }

  pub fn prototype(&self, id: PrototypeId) -> &TargetPrototype {
    &self.prototypes[id.index()]
  }

  pub fn find_prototype(&self, id: &str) -> Option<PrototypeId> {
    self.prototype_ids.get(id).copied()
  }

  /// Resolve `id` relative to `working_directory`, creating targets as
  /// needed.
  ///
  /// Absolute ids start with `/` and resolve from the root; relative ids
  /// resolve under the working directory. `.` and `..` elements are honored.
  /// Intermediate targets are created without a prototype. On creation the
  /// leaf is assigned `prototype` and `working_directory`; re-declaring an
  /// existing target with a different non-null prototype fails with
  /// [`ForgeError::PrototypeConflict`].
  pub fn target(
    &mut self,
    id: &str,
    prototype: Option<PrototypeId>,
    working_directory: TargetId,
  ) -> Result<TargetId, ForgeError> {
    let mut current = self.resolve_start(id, working_directory);
    for element in Self::elements(id) {
      current = match element {
        "." => current,
        ".." => self.get(current).parent.unwrap_or(self.root()),
        _ => self.find_or_create_child(current, element, working_directory),
      };
    }

    let target = self.get(current);
    match (target.prototype, prototype) {
      (Some(existing), Some(requested)) if existing != requested => {
        return Err(ForgeError::PrototypeConflict {
          path: self.path(current),
          existing: self.prototype(existing).id.clone(),
          requested: self.prototype(requested).id.clone(),
        });
      }
      (None, Some(requested)) => {
        self.get_mut(current).prototype = Some(requested);
      }
      _ => {}
    }
    Ok(current)
  }

  /// Resolve `path` relative to `working_directory` without creating
  /// anything. Returns `None` when any element is missing.
  pub fn find_target(&self, path: &str, working_directory: TargetId) -> Option<TargetId> {
    let mut current = self.resolve_start(path, working_directory);
    for element in Self::elements(path) {
      current = match element {
        "." => current,
        ".." => self.get(current).parent.unwrap_or(self.root()),
        _ => self.find_child(current, element)?,
      };
    }
    Some(current)
  }

  fn resolve_start(&self, id: &str, working_directory: TargetId) -> TargetId {
    if id.starts_with('/') {
      self.root()
    } else {
      working_directory
    }
  }

  fn elements(id: &str) -> impl Iterator<Item = &str> {
    id.split('/').filter(|element| !element.is_empty())
  }

  pub fn find_child(&self, parent: TargetId, id: &str) -> Option<TargetId> {
    self
      .get(parent)
      .children
      .iter()
      .copied()
      .find(|&child| self.get(child).id == id)
  }

  fn find_or_create_child(
    &mut self,
    parent: TargetId,
    id: &str,
    working_directory: TargetId,
  ) -> TargetId {
    if let Some(child) = self.find_child(parent, id) {
      return child;
    }
    let child = TargetId(self.targets.len() as u32);
    let mut target = Target::new(id.to_string(), Some(parent));
    target.working_directory = Some(working_directory);
    self.targets.push(target);
    self.get_mut(parent).children.push(child);
    child
  }

  /// A fresh anonymous id of the form `$$N`, scoped to the working
  /// directory's monotonic counter.
  pub fn anonymous_id(&mut self, working_directory: TargetId) -> String {
    let index = self.get_mut(working_directory).next_anonymous_index();
    format!("$${index}")
  }

  pub fn traversal_in_progress(&self) -> bool {
    self.traversal_in_progress
  }

  pub fn visited_revision(&self) -> u32 {
    self.visited_revision
  }

  pub fn successful_revision(&self) -> u32 {
    self.successful_revision
  }

  pub(crate) fn begin_traversal(&mut self) {
    debug_assert!(!self.traversal_in_progress);
    self.visited_revision += 1;
    self.successful_revision += 1;
    self.traversal_in_progress = true;
  }

  pub(crate) fn end_traversal(&mut self) {
    self.traversal_in_progress = false;
  }

  /// Stamp a target as visited by the current traversal.
  pub(crate) fn mark_visited(&mut self, id: TargetId) {
    let revision = self.visited_revision;
    self.get_mut(id).visited_revision = revision;
  }

  /// Stamp a target as successfully processed by the current traversal.
  pub(crate) fn mark_successful(&mut self, id: TargetId) {
    let revision = self.successful_revision;
    self.get_mut(id).successful_revision = revision;
  }

  pub fn cache_target(&self) -> Option<TargetId> {
    self.cache_target
  }

  pub fn cache_filename(&self) -> Option<&PathBuf> {
    self.cache_filename.as_ref()
  }

  /// Destroy all targets and reset traversal state.
  ///
  /// The prototype registry survives: prototypes are referenced from script
  /// closures and live as long as the graph. Anonymous indices reset with
  /// the targets that carried them; the remembered cache filename is kept so
  /// a later `save_binary` still knows where to write.
  pub fn clear(&mut self) {
    self.targets.clear();
    self.targets.push(Target::new(String::new(), None));
    self.traversal_in_progress = false;
    self.visited_revision = 0;
    self.successful_revision = 0;
    self.cache_target = None;
  }

  /// Print the dependency tree of `target` to stdout.
  pub fn print_dependencies(&self, target: TargetId) {
    self.print_dependencies_at(target, 0);
  }

  fn print_dependencies_at(&self, target_id: TargetId, depth: usize) {
    let target = self.get(target_id);
    let marker = if target.outdated { "*" } else { " " };
    println!(
      "{}{}{} ({})",
      "  ".repeat(depth),
      marker,
      self.path(target_id),
      target.timestamp,
    );
    for dependency in target.dependencies() {
      self.print_dependencies_at(dependency, depth + 1);
    }
  }

  /// Print the namespace of targets beneath `target` to stdout.
  pub fn print_namespace(&self, target: TargetId) {
    self.print_namespace_at(target, 0);
  }

  fn print_namespace_at(&self, target_id: TargetId, depth: usize) {
    let target = self.get(target_id);
    let id = if target.id.is_empty() { "/" } else { &target.id };
    let prototype = target
      .prototype
      .map(|prototype| self.prototype(prototype).id.as_str())
      .unwrap_or("-");
    println!("{}{} [{}]", "  ".repeat(depth), id, prototype);
    for &child in &target.children {
      self.print_namespace_at(child, depth + 1);
    }
  }
}

impl Default for Graph {
  fn default() -> Self {
    Graph::new()
  }
}
