//! The `forge` global and target methods as scripts see them.

use std::fs;
use std::path::Path;

use forge_lib::{Forge, ForgeOptions};
use tempfile::TempDir;

fn forge_in(dir: &Path) -> Forge {
  Forge::new(ForgeOptions {
    jobs: 2,
    keep_going: false,
    root_directory: Some(dir.to_path_buf()),
  })
  .unwrap()
}

#[test]
fn the_same_target_resolves_to_the_same_table() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        local first = forge.target("x")
        local second = forge.target("x")
        local found = forge.find_target("x")
        same = rawequal(first, second) and rawequal(first, found)
      "#,
    )
    .exec()
    .unwrap();
  assert!(forge.lua().globals().get::<bool>("same").unwrap());
}

#[test]
fn file_targets_are_named_by_their_path() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        local out = forge.file("out.txt")
        path = out:path()
        filename = out:filename()
        branch = out:branch()
      "#,
    )
    .exec()
    .unwrap();

  let path: String = forge.lua().globals().get("path").unwrap();
  let filename: String = forge.lua().globals().get("filename").unwrap();
  let branch: String = forge.lua().globals().get("branch").unwrap();
  assert!(path.ends_with("/out.txt"));
  assert_eq!(filename, path);
  assert_eq!(format!("{branch}/out.txt"), path);
}

#[test]
fn empty_id_is_the_working_directory() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        same = rawequal(forge.target(""), forge.working_directory())
      "#,
    )
    .exec()
    .unwrap();
  assert!(forge.lua().globals().get::<bool>("same").unwrap());
}

#[test]
fn nested_ids_create_prototypeless_intermediates() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        forge.target("a/b/c", forge.target_prototype("Leaf"))
        local a = forge.find_target("a")
        local b = forge.find_target("a/b")
        local c = forge.find_target("a/b/c")
        intermediates_plain = a ~= nil and b ~= nil
          and a:prototype() == nil and b:prototype() == nil
        leaf_tagged = c:prototype() ~= nil
      "#,
    )
    .exec()
    .unwrap();
  assert!(forge.lua().globals().get::<bool>("intermediates_plain").unwrap());
  assert!(forge.lua().globals().get::<bool>("leaf_tagged").unwrap());
}

#[test]
fn redeclaring_with_a_different_prototype_fails() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        forge.target("out.o", forge.target_prototype("Compile"))
        ok, err = pcall(function()
          forge.target("out.o", forge.target_prototype("Link"))
        end)
        message = tostring(err)
      "#,
    )
    .exec()
    .unwrap();

  assert!(!forge.lua().globals().get::<bool>("ok").unwrap());
  let message: String = forge.lua().globals().get("message").unwrap();
  assert!(message.contains("already declared"), "message: {message}");
}

#[test]
fn anonymous_ids_are_fresh_each_call() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        names = {}
        seen = {}
        distinct = true
        for i = 1, 5 do
          local name = forge.anonymous()
          names[i] = name
          if seen[name] then distinct = false end
          seen[name] = true
        end
      "#,
    )
    .exec()
    .unwrap();

  assert!(forge.lua().globals().get::<bool>("distinct").unwrap());
  let names: Vec<String> = forge.lua().globals().get("names").unwrap();
  assert_eq!(names.len(), 5);
  for name in &names {
    assert!(name.starts_with("$$"), "name: {name}");
  }
}

#[test]
fn anonymous_targets_can_be_declared_without_an_id() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        local first = forge.target()
        local second = forge.target()
        ids = { first:id(), second:id() }
      "#,
    )
    .exec()
    .unwrap();

  let ids: Vec<String> = forge.lua().globals().get("ids").unwrap();
  assert_ne!(ids[0], ids[1]);
  assert!(ids[0].starts_with("$$"));
}

#[test]
fn dependencies_are_ordered_and_iterable() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        local a = forge.target("a")
        local b = forge.target("b")
        local c = forge.target("c")
        a:add_dependency(b)
        a:add_dependency(b) -- idempotent
        a:add_dependency(c)
        ids = {}
        for dependency in a:dependencies() do
          ids[#ids + 1] = dependency:id()
        end
        first = a:dependency(1):id()
        beyond = a:dependency(3)
      "#,
    )
    .exec()
    .unwrap();

  let ids: Vec<String> = forge.lua().globals().get("ids").unwrap();
  assert_eq!(ids, vec!["b".to_string(), "c".to_string()]);
  assert_eq!(forge.lua().globals().get::<String>("first").unwrap(), "b");
  assert!(forge.lua().globals().get::<mlua::Value>("beyond").unwrap().is_nil());
}

#[test]
fn remove_dependency_leaves_implicit_edges() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        local a = forge.target("a")
        local b = forge.target("b")
        a:add_dependency(b)
        a:add_implicit_dependency(b)
        a:remove_dependency(b)
        after_remove = 0
        for _ in a:dependencies() do after_remove = after_remove + 1 end
        a:clear_implicit_dependencies()
        after_clear = 0
        for _ in a:dependencies() do after_clear = after_clear + 1 end
      "#,
    )
    .exec()
    .unwrap();

  assert_eq!(forge.lua().globals().get::<i64>("after_remove").unwrap(), 1);
  assert_eq!(forge.lua().globals().get::<i64>("after_clear").unwrap(), 0);
}

#[test]
fn set_filename_pads_the_sequence() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        local t = forge.target("t")
        t:set_filename("/tmp/third", 3)
        filenames = t:filenames()
      "#,
    )
    .exec()
    .unwrap();

  let filenames: Vec<String> = forge.lua().globals().get("filenames").unwrap();
  assert_eq!(filenames, vec!["".to_string(), "".to_string(), "/tmp/third".to_string()]);
}

#[test]
fn attribute_tables_become_the_script_table() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        local t = forge.target("cfg", nil, { custom = 5 })
        custom = t.custom
        id = t:id()
        same = rawequal(t, forge.find_target("cfg"))
      "#,
    )
    .exec()
    .unwrap();

  assert_eq!(forge.lua().globals().get::<i64>("custom").unwrap(), 5);
  assert_eq!(forge.lua().globals().get::<String>("id").unwrap(), "cfg");
  assert!(forge.lua().globals().get::<bool>("same").unwrap());
}

#[test]
fn prototype_methods_dispatch_through_the_metatable_chain() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        local Rule = forge.target_prototype("Rule")
        function Rule.describe(target)
          return "rule:" .. target:id()
        end
        local t = forge.target("widget", Rule)
        described = t:describe()
        proto_is_shared = rawequal(t:prototype(), Rule)
      "#,
    )
    .exec()
    .unwrap();

  assert_eq!(
    forge.lua().globals().get::<String>("described").unwrap(),
    "rule:widget"
  );
  assert!(forge.lua().globals().get::<bool>("proto_is_shared").unwrap());
}

#[test]
fn flags_round_trip_through_their_accessors() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        local t = forge.target("t")
        defaults = { t:required_to_exist(), t:always_bind(), t:cleanable() }
        t:set_required_to_exist(true)
        t:set_always_bind(true)
        t:set_cleanable(true)
        set = { t:required_to_exist(), t:always_bind(), t:cleanable() }
      "#,
    )
    .exec()
    .unwrap();

  let defaults: Vec<bool> = forge.lua().globals().get("defaults").unwrap();
  let set: Vec<bool> = forge.lua().globals().get("set").unwrap();
  assert_eq!(defaults, vec![false, false, false]);
  assert_eq!(set, vec![true, true, true]);
}

#[test]
fn parent_walks_the_namespace() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        forge.target("pkg/one")
        parent_id = forge.find_target("pkg/one"):parent():id()
        root_parent = forge.target("/"):parent()
      "#,
    )
    .exec()
    .unwrap();

  assert_eq!(forge.lua().globals().get::<String>("parent_id").unwrap(), "pkg");
  assert!(forge.lua().globals().get::<mlua::Value>("root_parent").unwrap().is_nil());
}

#[test]
fn targets_lists_the_dependency_concatenation() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        local a = forge.target("a")
        local b = forge.target("b")
        local c = forge.target("c")
        local d = forge.target("d")
        a:add_dependency(b)
        a:add_implicit_dependency(c)
        a:add_dependency(d)
        via_targets = {}
        for dependency in a:targets() do
          via_targets[#via_targets + 1] = dependency:id()
        end
        via_dependencies = {}
        for dependency in a:dependencies() do
          via_dependencies[#via_dependencies + 1] = dependency:id()
        end
      "#,
    )
    .exec()
    .unwrap();

  // Explicit edges first, implicit after, and both accessors agree.
  let via_targets: Vec<String> = forge.lua().globals().get("via_targets").unwrap();
  let via_dependencies: Vec<String> = forge.lua().globals().get("via_dependencies").unwrap();
  assert_eq!(via_targets, vec!["b".to_string(), "d".to_string(), "c".to_string()]);
  assert_eq!(via_targets, via_dependencies);
}

#[test]
fn buildfiles_declare_targets_under_their_own_directory() {
  let dir = TempDir::new().unwrap();
  let sub = dir.path().join("sub");
  fs::create_dir(&sub).unwrap();
  fs::write(sub.join("forge.lua"), r#"forge.file("inner.txt")"#).unwrap();

  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        errors = forge.buildfile("sub/forge.lua")
        inner = forge.find_target("sub/inner.txt")
        found = inner ~= nil
        -- The directory scope was popped after the load.
        back = rawequal(forge.target(""), forge.working_directory())
      "#,
    )
    .exec()
    .unwrap();

  assert_eq!(forge.lua().globals().get::<i64>("errors").unwrap(), 0);
  assert!(forge.lua().globals().get::<bool>("found").unwrap());
  assert!(forge.lua().globals().get::<bool>("back").unwrap());
}

#[test]
fn buildfile_script_errors_are_counted_not_raised() {
  let dir = TempDir::new().unwrap();
  fs::write(dir.path().join("broken.lua"), "this is not lua").unwrap();

  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(r#"errors = forge.buildfile("broken.lua")"#)
    .exec()
    .unwrap();
  assert_eq!(forge.lua().globals().get::<i64>("errors").unwrap(), 1);
}

#[test]
fn missing_buildfile_is_an_error() {
  let dir = TempDir::new().unwrap();
  let forge = forge_in(dir.path());
  forge
    .lua()
    .load(
      r#"
        ok, err = pcall(function() return forge.buildfile("nope.lua") end)
        message = tostring(err)
      "#,
    )
    .exec()
    .unwrap();

  assert!(!forge.lua().globals().get::<bool>("ok").unwrap());
  let message: String = forge.lua().globals().get("message").unwrap();
  assert!(message.contains("nope.lua"), "message: {message}");
}
