//! Binary serialization of the target tree.
//!
//! Wire format: an 8-byte magic, a little-endian u32 format version, a
//! prototype table (count, then length-prefixed UTF-8 ids in first-use
//! order), the target tree in preorder, and a CRC32 trailer over everything
//! before it. Each target record carries its id, prototype index (-1 for
//! none), flags bitset, filenames, last write time, explicit dependencies as
//! preorder indices (forward references allowed), and its child count.
//!
//! Prototypes are stored by id only; they are re-registered on load. The
//! preorder index of a record equals its slab index after load, because the
//! root is both record 0 and slab index 0.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::error::ForgeError;

use super::{Graph, PrototypeId, Target, TargetId};

const MAGIC: &[u8; 8] = b"FORGE\0\0\x01";
const FORMAT_VERSION: u32 = 1;

/// Flags bitset layout; `referenced_by_script` is runtime state and is not
/// serialized.
const FLAG_REQUIRED_TO_EXIST: u64 = 1 << 0;
const FLAG_ALWAYS_BIND: u64 = 1 << 1;
const FLAG_CLEANABLE: u64 = 1 << 2;
const FLAG_BOUND_TO_FILE: u64 = 1 << 3;

impl Graph {
  /// Load the target tree from `path`, replacing the current tree.
  ///
  /// Remembers `path` for [`Graph::save_binary`] and creates the cache
  /// target for it whether or not the file exists. Returns the cache target
  /// when the file was present and loaded, `None` when it was missing.
  /// Later script declarations merge onto the loaded tree through the usual
  /// `target` lookup.
  pub fn load_binary(&mut self, path: &Path) -> Result<Option<TargetId>, ForgeError> {
    self.cache_filename = Some(path.to_path_buf());

    let loaded = match fs::read(path) {
      Ok(bytes) => {
        let (prototype_ids, raw_targets) =
          deserialize(&bytes).map_err(|reason| ForgeError::CorruptGraph {
            path: path.to_path_buf(),
            reason,
          })?;
        self.install(&prototype_ids, raw_targets);
        info!(path = %path.display(), targets = self.len(), "loaded graph cache");
        true
      }
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
        debug!(path = %path.display(), "no graph cache to load");
        false
      }
      Err(err) => {
        return Err(ForgeError::io(
          format!("failed to read graph cache '{}'", path.display()),
          err,
        ));
      }
    };

    let path_id = path.to_string_lossy().into_owned();
    let root = self.root();
    let cache = self.target(&path_id, None, root)?;
    if self.get(cache).filenames().is_empty() {
      self.get_mut(cache).set_filename(path_id, 0);
    }
    self.cache_target = Some(cache);
    Ok(loaded.then_some(cache))
  }

  /// Serialize the target tree to the file remembered by `load_binary`.
  pub fn save_binary(&self) -> Result<(), ForgeError> {
    let Some(path) = self.cache_filename.clone() else {
      return Err(ForgeError::io(
        "save_binary requires a cache file; call load_binary first",
        std::io::Error::from(std::io::ErrorKind::NotFound),
      ));
    };
    let bytes = self.serialize();
    fs::write(&path, &bytes).map_err(|err| {
      ForgeError::io(format!("failed to write graph cache '{}'", path.display()), err)
    })?;
    info!(path = %path.display(), bytes = bytes.len(), "saved graph cache");
    Ok(())
  }

  /// Serialize the target tree to bytes in the wire format.
  pub fn serialize(&self) -> Vec<u8> {
    let mut preorder = Vec::new();
    let mut preorder_index = HashMap::new();
    self.preorder_walk(self.root(), &mut preorder, &mut preorder_index);

    // Prototype table in first-use order over the preorder sequence.
    let mut prototype_table: Vec<PrototypeId> = Vec::new();
    let mut prototype_index: HashMap<PrototypeId, i32> = HashMap::new();
    for &id in &preorder {
      if let Some(prototype) = self.get(id).prototype
        && !prototype_index.contains_key(&prototype)
      {
        prototype_index.insert(prototype, prototype_table.len() as i32);
        prototype_table.push(prototype);
      }
    }

    let mut out = Vec::new();
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());

    out.extend_from_slice(&(prototype_table.len() as u32).to_le_bytes());
    for &prototype in &prototype_table {
      write_string(&mut out, self.prototype(prototype).id());
    }

    for &id in &preorder {
      self.write_target(&mut out, id, &preorder_index, &prototype_index);
    }

    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
  }

  fn preorder_walk(
    &self,
    id: TargetId,
    preorder: &mut Vec<TargetId>,
    preorder_index: &mut HashMap<TargetId, u32>,
  ) {
    preorder_index.insert(id, preorder.len() as u32);
    preorder.push(id);
    for &child in self.get(id).children() {
      self.preorder_walk(child, preorder, preorder_index);
    }
  }

  fn write_target(
    &self,
    out: &mut Vec<u8>,
    id: TargetId,
    preorder_index: &HashMap<TargetId, u32>,
    prototype_index: &HashMap<PrototypeId, i32>,
  ) {
    let target = self.get(id);
    write_string(out, &target.id);

    let prototype = target
      .prototype
      .map(|prototype| prototype_index[&prototype])
      .unwrap_or(-1);
    out.extend_from_slice(&prototype.to_le_bytes());

    let mut flags = 0u64;
    if target.required_to_exist {
      flags |= FLAG_REQUIRED_TO_EXIST;
    }
    if target.always_bind {
      flags |= FLAG_ALWAYS_BIND;
    }
    if target.cleanable {
      flags |= FLAG_CLEANABLE;
    }
    if target.bound_to_file {
      flags |= FLAG_BOUND_TO_FILE;
    }
    out.extend_from_slice(&flags.to_le_bytes());

    out.extend_from_slice(&(target.filenames.len() as u32).to_le_bytes());
    for filename in &target.filenames {
      write_string(out, filename);
    }

    out.extend_from_slice(&target.last_write_time.to_le_bytes());

    out.extend_from_slice(&(target.explicit_dependencies.len() as u32).to_le_bytes());
    for dependency in &target.explicit_dependencies {
      out.extend_from_slice(&preorder_index[dependency].to_le_bytes());
    }

    out.extend_from_slice(&(target.children.len() as u32).to_le_bytes());
  }

  /// Replace the slab with a deserialized tree.
  fn install(&mut self, prototype_ids: &[String], raw_targets: Vec<RawTarget>) {
    let prototypes: Vec<PrototypeId> = prototype_ids
      .iter()
      .map(|id| self.target_prototype(id))
      .collect();

    let mut targets = Vec::with_capacity(raw_targets.len());
    for raw in raw_targets {
      let mut target = Target::new(raw.id, raw.parent.map(TargetId));
      target.prototype = raw.prototype.map(|index| prototypes[index as usize]);
      target.required_to_exist = raw.flags & FLAG_REQUIRED_TO_EXIST != 0;
      target.always_bind = raw.flags & FLAG_ALWAYS_BIND != 0;
      target.cleanable = raw.flags & FLAG_CLEANABLE != 0;
      target.bound_to_file = raw.flags & FLAG_BOUND_TO_FILE != 0;
      target.filenames = raw.filenames;
      target.last_write_time = raw.last_write_time;
      target.timestamp = raw.last_write_time;
      target.explicit_dependencies = raw.dependencies.into_iter().map(TargetId).collect();
      target.children = raw.children.into_iter().map(TargetId).collect();
      targets.push(target);
    }

    self.targets = targets;
    self.traversal_in_progress = false;
    self.visited_revision = 0;
    self.successful_revision = 0;
    self.cache_target = None;
  }
}

struct RawTarget {
  id: String,
  parent: Option<u32>,
  prototype: Option<i32>,
  flags: u64,
  filenames: Vec<String>,
  last_write_time: u64,
  dependencies: Vec<u32>,
  children: Vec<u32>,
}

fn write_string(out: &mut Vec<u8>, value: &str) {
  out.extend_from_slice(&(value.len() as u32).to_le_bytes());
  out.extend_from_slice(value.as_bytes());
}

fn deserialize(bytes: &[u8]) -> Result<(Vec<String>, Vec<RawTarget>), String> {
  if bytes.len() < MAGIC.len() + 4 + 4 {
    return Err("file too short".to_string());
  }

  let payload_len = bytes.len() - 4;
  let stored_crc = u32::from_le_bytes(bytes[payload_len..].try_into().unwrap());
  let computed_crc = crc32fast::hash(&bytes[..payload_len]);
  if stored_crc != computed_crc {
    return Err(format!(
      "checksum mismatch (stored {stored_crc:08x}, computed {computed_crc:08x})"
    ));
  }

  let mut reader = Reader {
    bytes: &bytes[..payload_len],
    pos: 0,
  };

  let magic = reader.take(MAGIC.len())?;
  if magic != MAGIC {
    return Err("bad magic".to_string());
  }
  let version = reader.u32()?;
  if version != FORMAT_VERSION {
    return Err(format!("unsupported format version {version}"));
  }

  let prototype_count = reader.u32()? as usize;
  let mut prototype_ids = Vec::with_capacity(prototype_count);
  for _ in 0..prototype_count {
    prototype_ids.push(reader.string()?);
  }

  let mut raw_targets = Vec::new();
  read_target(&mut reader, None, prototype_count, &mut raw_targets)?;
  if reader.pos != reader.bytes.len() {
    return Err("trailing bytes after target tree".to_string());
  }

  let total = raw_targets.len() as u32;
  for raw in &raw_targets {
    if raw.dependencies.iter().any(|&dep| dep >= total) {
      return Err("dependency index out of range".to_string());
    }
  }
  if !raw_targets[0].id.is_empty() {
    return Err("root target must have an empty id".to_string());
  }

  Ok((prototype_ids, raw_targets))
}

fn read_target(
  reader: &mut Reader<'_>,
  parent: Option<u32>,
  prototype_count: usize,
  raw_targets: &mut Vec<RawTarget>,
) -> Result<u32, String> {
  let index = raw_targets.len() as u32;

  let id = reader.string()?;
  let prototype = match reader.i32()? {
    -1 => None,
    n if n >= 0 && (n as usize) < prototype_count => Some(n),
    n => return Err(format!("prototype index {n} out of range")),
  };
  let flags = reader.u64()?;

  let filename_count = reader.u32()? as usize;
  let mut filenames = Vec::with_capacity(filename_count);
  for _ in 0..filename_count {
    filenames.push(reader.string()?);
  }

  let last_write_time = reader.u64()?;

  let dependency_count = reader.u32()? as usize;
  let mut dependencies = Vec::with_capacity(dependency_count);
  for _ in 0..dependency_count {
    dependencies.push(reader.u32()?);
  }

  let child_count = reader.u32()? as usize;

  raw_targets.push(RawTarget {
    id,
    parent,
    prototype,
    flags,
    filenames,
    last_write_time,
    dependencies,
    children: Vec::with_capacity(child_count),
  });

  for _ in 0..child_count {
    let child = read_target(reader, Some(index), prototype_count, raw_targets)?;
    raw_targets[index as usize].children.push(child);
  }

  Ok(index)
}

struct Reader<'a> {
  bytes: &'a [u8],
  pos: usize,
}

impl<'a> Reader<'a> {
  fn take(&mut self, len: usize) -> Result<&'a [u8], String> {
    if self.pos + len > self.bytes.len() {
      return Err("unexpected end of file".to_string());
    }
    let slice = &self.bytes[self.pos..self.pos + len];
    self.pos += len;
    Ok(slice)
  }

  fn u32(&mut self) -> Result<u32, String> {
    Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
  }

  fn i32(&mut self) -> Result<i32, String> {
    Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
  }

  fn u64(&mut self) -> Result<u64, String> {
    Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
  }

  fn string(&mut self) -> Result<String, String> {
    let len = self.u32()? as usize;
    let bytes = self.take(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| "invalid utf-8 in string".to_string())
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  /// Four targets with mixed flags, filenames, and a forward dependency
  /// reference (`early` depends on `late`, which appears later in preorder).
  fn build_sample_graph() -> Graph {
    let mut graph = Graph::new();
    let root = graph.root();
    let compile = graph.target_prototype("Compile");

    let early = graph.target("early.o", Some(compile), root).unwrap();
    let middle = graph.target("dir/middle.c", None, root).unwrap();
    let late = graph.target("late.c", None, root).unwrap();

    graph.get_mut(early).set_filename("/tmp/early.o", 0);
    graph.get_mut(early).set_always_bind(true);
    graph.get_mut(early).add_dependency(middle);
    graph.get_mut(early).add_dependency(late);

    graph.get_mut(middle).set_filename("/tmp/middle.c", 0);
    graph.get_mut(middle).set_required_to_exist(true);
    graph.get_mut(middle).last_write_time = 123_456_789;

    graph.get_mut(late).set_filename("/tmp/late.c", 0);
    graph.get_mut(late).set_cleanable(true);
    graph.get_mut(late).last_write_time = 42;

    graph
  }

  #[test]
  fn round_trip_preserves_the_tree_byte_for_byte() {
    let dir = TempDir::new().unwrap();
    let cache = dir.path().join(".forge");

    let mut graph = build_sample_graph();
    // Establish the cache target before the first save so both
    // serializations cover the same tree.
    assert!(graph.load_binary(&cache).unwrap().is_none());
    let before = graph.serialize();
    graph.save_binary().unwrap();

    graph.clear();
    assert_eq!(graph.len(), 1);

    let cache_target = graph.load_binary(&cache).unwrap();
    assert!(cache_target.is_some());

    let after = graph.serialize();
    assert_eq!(before, after);
  }

  #[test]
  fn round_trip_preserves_fields() {
    let dir = TempDir::new().unwrap();
    let cache = dir.path().join(".forge");

    let mut graph = build_sample_graph();
    graph.load_binary(&cache).unwrap();
    graph.save_binary().unwrap();
    graph.clear();
    graph.load_binary(&cache).unwrap();

    let root = graph.root();
    let early = graph.find_target("early.o", root).unwrap();
    let middle = graph.find_target("dir/middle.c", root).unwrap();
    let late = graph.find_target("late.c", root).unwrap();

    let early_target = graph.get(early);
    assert!(early_target.always_bind());
    assert_eq!(early_target.filenames(), &["/tmp/early.o"]);
    assert_eq!(early_target.explicit_dependencies(), &[middle, late]);
    assert_eq!(
      graph.get(early).prototype().map(|p| graph.prototype(p).id()),
      Some("Compile")
    );

    assert!(graph.get(middle).required_to_exist());
    assert_eq!(graph.get(middle).last_write_time(), 123_456_789);
    assert_eq!(graph.get(middle).timestamp(), 123_456_789);

    assert!(graph.get(late).cleanable());
    assert_eq!(graph.get(late).last_write_time(), 42);
    assert_eq!(graph.path(middle), "/dir/middle.c");
  }

  #[test]
  fn missing_cache_file_loads_as_none() {
    let dir = TempDir::new().unwrap();
    let cache = dir.path().join(".forge");

    let mut graph = Graph::new();
    let loaded = graph.load_binary(&cache).unwrap();
    assert!(loaded.is_none());
    // The cache target exists and save_binary knows where to write.
    assert!(graph.cache_target().is_some());
    graph.save_binary().unwrap();
    assert!(cache.exists());
  }

  #[test]
  fn corrupt_magic_is_rejected() {
    let dir = TempDir::new().unwrap();
    let cache = dir.path().join(".forge");

    let mut graph = build_sample_graph();
    graph.load_binary(&cache).unwrap();
    graph.save_binary().unwrap();

    let mut bytes = fs::read(&cache).unwrap();
    bytes[0] = b'X';
    fs::write(&cache, &bytes).unwrap();

    let mut fresh = Graph::new();
    let err = fresh.load_binary(&cache).unwrap_err();
    assert!(matches!(err, ForgeError::CorruptGraph { .. }), "{err}");
  }

  #[test]
  fn flipped_payload_byte_fails_the_checksum() {
    let dir = TempDir::new().unwrap();
    let cache = dir.path().join(".forge");

    let mut graph = build_sample_graph();
    graph.load_binary(&cache).unwrap();
    graph.save_binary().unwrap();

    let mut bytes = fs::read(&cache).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xFF;
    fs::write(&cache, &bytes).unwrap();

    let mut fresh = Graph::new();
    let err = fresh.load_binary(&cache).unwrap_err();
    match err {
      ForgeError::CorruptGraph { reason, .. } => {
        assert!(reason.contains("checksum"), "reason: {reason}");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn truncated_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let cache = dir.path().join(".forge");

    let mut graph = build_sample_graph();
    graph.load_binary(&cache).unwrap();
    graph.save_binary().unwrap();

    let bytes = fs::read(&cache).unwrap();
    fs::write(&cache, &bytes[..bytes.len() / 2]).unwrap();

    let mut fresh = Graph::new();
    assert!(fresh.load_binary(&cache).is_err());
  }

  #[test]
  fn save_without_a_cache_file_is_an_error() {
    let graph = Graph::new();
    assert!(graph.save_binary().is_err());
  }
}
