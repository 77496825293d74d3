//! Binding targets to file-system state.
//!
//! `bind` walks the graph depth-first from a root target, dependencies and
//! children before the target itself, stats every filename, caches the
//! outdated flag, and propagates child timestamps upward. Cycles among
//! dependency edges are detected on the way down.

use std::collections::HashSet;
use std::fs;
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use crate::error::ForgeError;

use super::{Graph, TargetId};

#[derive(Default)]
struct BindState {
  visiting: HashSet<TargetId>,
  done: HashSet<TargetId>,
  stack: Vec<TargetId>,
  failures: usize,
}

impl Graph {
  /// Bind every target reachable from `root` (the graph root when `None`)
  /// to its current file-system state.
  ///
  /// Returns the number of targets that failed to bind: targets whose
  /// required files are missing or turned out to be directories. Fails with
  /// [`ForgeError::CycleDetected`] when the descent re-enters a target that
  /// is still on the visiting stack.
  pub fn bind(&mut self, root: Option<TargetId>) -> Result<usize, ForgeError> {
    let root = root.unwrap_or(self.root());
    self.visited_revision += 1;
    let mut state = BindState::default();
    self.bind_visit(root, &mut state)?;
    debug!(
      bound = state.done.len(),
      failures = state.failures,
      "bind finished"
    );
    Ok(state.failures)
  }

  fn bind_visit(&mut self, id: TargetId, state: &mut BindState) -> Result<(), ForgeError> {
    if state.done.contains(&id) {
      return Ok(());
    }
    if state.visiting.contains(&id) {
      let start = state.stack.iter().position(|&t| t == id).unwrap_or(0);
      let mut path: Vec<String> = state.stack[start..].iter().map(|&t| self.path(t)).collect();
      path.push(self.path(id));
      return Err(ForgeError::CycleDetected { path });
    }

    state.visiting.insert(id);
    state.stack.push(id);

    let dependencies: Vec<TargetId> = self.get(id).dependencies().collect();
    for dependency in dependencies {
      self.bind_visit(dependency, state)?;
    }
    let children = self.get(id).children().to_vec();
    for child in children {
      self.bind_visit(child, state)?;
    }

    self.bind_one(id, state);

    state.stack.pop();
    state.visiting.remove(&id);
    state.done.insert(id);
    Ok(())
  }

  /// Bind a single target whose dependencies and children are already bound.
  fn bind_one(&mut self, id: TargetId, state: &mut BindState) {
    let filenames = self.get(id).filenames.clone();
    let required = self.get(id).required_to_exist;

    let mut newest: u64 = 0;
    let mut bound = false;
    let mut missing = false;
    let mut failed = false;

    for filename in filenames.iter().filter(|f| !f.is_empty()) {
      match fs::metadata(filename) {
        Ok(metadata) if metadata.is_dir() => {
          missing = true;
          if required {
            warn!(target_path = %self.path(id), filename = %filename, "expected a file, found a directory");
            failed = true;
          }
        }
        Ok(metadata) => {
          bound = true;
          newest = newest.max(modified_nanos(&metadata));
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
          missing = true;
          if required {
            warn!(target_path = %self.path(id), filename = %filename, "required file is missing");
            failed = true;
          }
        }
        Err(err) => {
          missing = true;
          warn!(target_path = %self.path(id), filename = %filename, error = %err, "failed to stat");
          failed = true;
        }
      }
    }

    let children_newest = self
      .get(id)
      .children()
      .iter()
      .map(|&child| self.get(child).timestamp)
      .max()
      .unwrap_or(0);
    let dependencies_newest = self
      .get(id)
      .targets()
      .map(|dep| self.get(dep).timestamp)
      .max()
      .unwrap_or(0);

    let own_timestamp = newest.max(children_newest);
    let missing_required = required && missing;
    let stale_dependency = dependencies_newest > own_timestamp;

    let revision = self.visited_revision;
    let target = self.get_mut(id);
    target.bound_to_file = bound;
    target.last_write_time = newest;
    // Staleness propagates: a target older than its dependencies takes
    // their timestamp, so its own dependents come out outdated in turn.
    target.timestamp = own_timestamp.max(dependencies_newest);
    target.outdated = target.always_bind || missing_required || stale_dependency;
    target.visited_revision = revision;

    if failed {
      state.failures += 1;
    }
  }
}

/// Modification time as nanoseconds since the epoch; 0 when unavailable.
fn modified_nanos(metadata: &fs::Metadata) -> u64 {
  metadata
    .modified()
    .ok()
    .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
    .map(|duration| duration.as_nanos() as u64)
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use std::fs::File;
  use std::time::{Duration, SystemTime, UNIX_EPOCH};

  use tempfile::TempDir;

  use super::*;

  fn touch(dir: &TempDir, name: &str, seconds: u64) -> String {
    let path = dir.path().join(name);
    let file = File::create(&path).unwrap();
    file
      .set_modified(UNIX_EPOCH + Duration::from_secs(seconds))
      .unwrap();
    path.to_string_lossy().into_owned()
  }

  #[test]
  fn bind_reads_timestamps_from_disk() {
    let dir = TempDir::new().unwrap();
    let filename = touch(&dir, "input.txt", 1_000);

    let mut graph = Graph::new();
    let root = graph.root();
    let input = graph.target("input.txt", None, root).unwrap();
    graph.get_mut(input).set_filename(filename, 0);

    let failures = graph.bind(None).unwrap();
    assert_eq!(failures, 0);

    let target = graph.get(input);
    assert!(target.bound_to_file());
    assert_eq!(target.timestamp(), Duration::from_secs(1_000).as_nanos() as u64);
    assert_eq!(target.last_write_time(), target.timestamp());
  }

  #[test]
  fn parent_timestamp_is_the_max_over_children() {
    let dir = TempDir::new().unwrap();
    let old = touch(&dir, "old.txt", 100);
    let new = touch(&dir, "new.txt", 200);

    let mut graph = Graph::new();
    let root = graph.root();
    let a = graph.target("pkg/old", None, root).unwrap();
    let b = graph.target("pkg/new", None, root).unwrap();
    graph.get_mut(a).set_filename(old, 0);
    graph.get_mut(b).set_filename(new, 0);

    graph.bind(None).unwrap();

    let pkg = graph.find_target("pkg", root).unwrap();
    let children_max = graph
      .get(pkg)
      .children()
      .iter()
      .map(|&child| graph.get(child).timestamp())
      .max()
      .unwrap();
    assert_eq!(graph.get(pkg).timestamp(), children_max);
    assert_eq!(
      graph.get(pkg).timestamp(),
      Duration::from_secs(200).as_nanos() as u64
    );
  }

  #[test]
  fn newer_dependency_makes_a_target_outdated() {
    let dir = TempDir::new().unwrap();
    let source = touch(&dir, "main.c", 2_000);
    let object = touch(&dir, "main.o", 1_000);

    let mut graph = Graph::new();
    let root = graph.root();
    let source_target = graph.target("main.c", None, root).unwrap();
    let object_target = graph.target("main.o", None, root).unwrap();
    graph.get_mut(source_target).set_filename(source, 0);
    graph.get_mut(object_target).set_filename(object, 0);
    graph.get_mut(object_target).add_dependency(source_target);

    graph.bind(None).unwrap();

    assert!(graph.get(object_target).outdated());
    assert!(!graph.get(source_target).outdated());
  }

  #[test]
  fn up_to_date_target_is_not_outdated() {
    let dir = TempDir::new().unwrap();
    let source = touch(&dir, "main.c", 1_000);
    let object = touch(&dir, "main.o", 2_000);

    let mut graph = Graph::new();
    let root = graph.root();
    let source_target = graph.target("main.c", None, root).unwrap();
    let object_target = graph.target("main.o", None, root).unwrap();
    graph.get_mut(source_target).set_filename(source, 0);
    graph.get_mut(object_target).set_filename(object, 0);
    graph.get_mut(object_target).add_dependency(source_target);

    graph.bind(None).unwrap();
    assert!(!graph.get(object_target).outdated());
  }

  #[test]
  fn staleness_propagates_through_dependency_timestamps() {
    let dir = TempDir::new().unwrap();
    // a (2000) -> b (1000) -> c (3000): b takes c's timestamp, so a is
    // outdated even though its file is newer than b's.
    let a = touch(&dir, "a", 2_000);
    let b = touch(&dir, "b", 1_000);
    let c = touch(&dir, "c", 3_000);

    let mut graph = Graph::new();
    let root = graph.root();
    let a_target = graph.target("a", None, root).unwrap();
    let b_target = graph.target("b", None, root).unwrap();
    let c_target = graph.target("c", None, root).unwrap();
    graph.get_mut(a_target).set_filename(a, 0);
    graph.get_mut(b_target).set_filename(b, 0);
    graph.get_mut(c_target).set_filename(c, 0);
    graph.get_mut(a_target).add_dependency(b_target);
    graph.get_mut(b_target).add_dependency(c_target);

    graph.bind(None).unwrap();

    assert!(graph.get(b_target).outdated());
    assert!(graph.get(a_target).outdated());
    assert_eq!(
      graph.get(b_target).timestamp(),
      Duration::from_secs(3_000).as_nanos() as u64
    );

    // Every bound target covers its dependencies' timestamps.
    for id in graph.target_ids() {
      let dependencies_newest = graph
        .get(id)
        .targets()
        .map(|dep| graph.get(dep).timestamp())
        .max()
        .unwrap_or(0);
      assert!(
        graph.get(id).timestamp() >= dependencies_newest,
        "{} is older than a dependency",
        graph.path(id)
      );
    }
  }

  #[test]
  fn always_bind_forces_outdated() {
    let dir = TempDir::new().unwrap();
    let filename = touch(&dir, "fresh.txt", 5_000);

    let mut graph = Graph::new();
    let root = graph.root();
    let target = graph.target("fresh.txt", None, root).unwrap();
    graph.get_mut(target).set_filename(filename, 0);
    graph.get_mut(target).set_always_bind(true);

    graph.bind(None).unwrap();
    assert!(graph.get(target).outdated());
  }

  #[test]
  fn missing_required_file_counts_as_a_bind_failure() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing.c").to_string_lossy().into_owned();

    let mut graph = Graph::new();
    let root = graph.root();
    let target = graph.target("missing.c", None, root).unwrap();
    graph.get_mut(target).set_filename(missing, 0);
    graph.get_mut(target).set_required_to_exist(true);

    let failures = graph.bind(None).unwrap();
    assert_eq!(failures, 1);
    assert!(graph.get(target).outdated());
    assert!(!graph.get(target).bound_to_file());
  }

  #[test]
  fn missing_optional_file_is_not_a_failure() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("out.txt").to_string_lossy().into_owned();

    let mut graph = Graph::new();
    let root = graph.root();
    let target = graph.target("out.txt", None, root).unwrap();
    graph.get_mut(target).set_filename(missing, 0);

    let failures = graph.bind(None).unwrap();
    assert_eq!(failures, 0);
    assert_eq!(graph.get(target).timestamp(), 0);
  }

  #[test]
  fn required_directory_where_file_expected_fails() {
    let dir = TempDir::new().unwrap();
    let subdir = dir.path().join("actually_a_dir");
    std::fs::create_dir(&subdir).unwrap();

    let mut graph = Graph::new();
    let root = graph.root();
    let target = graph.target("obj", None, root).unwrap();
    graph
      .get_mut(target)
      .set_filename(subdir.to_string_lossy().into_owned(), 0);
    graph.get_mut(target).set_required_to_exist(true);

    let failures = graph.bind(None).unwrap();
    assert_eq!(failures, 1);
  }

  #[test]
  fn dependency_cycle_is_detected_with_its_path() {
    let mut graph = Graph::new();
    let root = graph.root();
    let a = graph.target("a", None, root).unwrap();
    let b = graph.target("b", None, root).unwrap();
    graph.get_mut(a).add_dependency(b);
    graph.get_mut(b).add_dependency(a);

    let err = graph.bind(None).unwrap_err();
    match err {
      ForgeError::CycleDetected { path } => {
        assert!(path.contains(&"/a".to_string()), "path: {path:?}");
        assert!(path.contains(&"/b".to_string()), "path: {path:?}");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn bind_marks_visited_revision() {
    let mut graph = Graph::new();
    let root = graph.root();
    let target = graph.target("t", None, root).unwrap();

    graph.bind(None).unwrap();
    let revision = graph.visited_revision();
    assert_eq!(graph.get(target).visited_revision, revision);
  }

  #[test]
  fn timestamps_are_not_stale_after_rebind() {
    let dir = TempDir::new().unwrap();
    let filename = touch(&dir, "input.txt", 1_000);

    let mut graph = Graph::new();
    let root = graph.root();
    let input = graph.target("input.txt", None, root).unwrap();
    graph.get_mut(input).set_filename(filename.clone(), 0);
    graph.bind(None).unwrap();

    let file = File::options().write(true).open(&filename).unwrap();
    file
      .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(9_000))
      .unwrap();
    drop(file);

    graph.bind(None).unwrap();
    assert_eq!(
      graph.get(input).timestamp(),
      Duration::from_secs(9_000).as_nanos() as u64
    );
  }
}
