//! The `forge` global table.
//!
//! Registers the graph operations scripts drive the engine with: target and
//! prototype construction, lookup, buildfile loading, the postorder
//! traversal, background command launching, and cache persistence.
//! `forge.wait` and `forge.build` are defined in the Lua prelude on top of
//! the primitives registered here.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use mlua::prelude::*;

use crate::forge::{run_buildfile, EngineState};
use crate::graph::TargetId;
use crate::scheduler::{self, CommandSpec};

use super::binding::{BindKey, TARGET_TYPE};
use super::target::{push_target, refresh_metatable};

/// Build the `forge` table. The caller installs it as a global.
pub fn register_forge(lua: &Lua, state: &Rc<RefCell<EngineState>>) -> LuaResult<LuaTable> {
  let forge = lua.create_table()?;

  {
    let state = state.clone();
    forge.set(
      "target_prototype",
      lua.create_function(move |lua, id: String| {
        let prototype = state.borrow_mut().graph.target_prototype(&id);
        super::target::push_prototype(lua, &state, prototype)
      })?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "target",
      lua.create_function(
        move |lua, (id, prototype, attributes): (Option<String>, Option<LuaValue>, Option<LuaTable>)| {
          add_target(lua, &state, id, prototype, attributes)
        },
      )?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "file",
      lua.create_function(
        move |lua, (id, prototype, attributes): (Option<String>, Option<LuaValue>, Option<LuaTable>)| {
          let table = add_target(lua, &state, id, prototype, attributes)?;
          let target_id = state.borrow().binding.check_target(&LuaValue::Table(table.clone()))?;
          {
            let mut st = state.borrow_mut();
            let st = &mut *st;
            let path = st.graph.path(target_id);
            st.graph.get_mut(target_id).set_filename(path, 0);
          }
          Ok(table)
        },
      )?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "find_target",
      lua.create_function(move |lua, id: String| {
        let found = {
          let st = state.borrow();
          let working_directory = st.context.working_directory();
          st.graph.find_target(&id, working_directory)
        };
        match found {
          Some(target_id) => Ok(Some(push_target(lua, &state, target_id)?)),
          None => Ok(None),
        }
      })?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "anonymous",
      lua.create_function(move |_, ()| {
        let mut st = state.borrow_mut();
        let st = &mut *st;
        let working_directory = st.context.working_directory();
        Ok(st.graph.anonymous_id(working_directory))
      })?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "working_directory",
      lua.create_function(move |lua, ()| {
        let working_directory = state.borrow().context.working_directory();
        push_target(lua, &state, working_directory)
      })?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "buildfile",
      lua.create_function(move |lua, path: String| {
        let errors = run_buildfile(lua, &state, Path::new(&path))?;
        Ok(errors as i64)
      })?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "postorder",
      lua.create_function(move |lua, (callback, root): (LuaFunction, Option<LuaValue>)| {
        scheduler::postorder(lua, &state, callback, root)
      })?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "execute",
      lua.create_function(move |_, spec: LuaTable| {
        let spec = parse_command_spec(&spec)?;
        scheduler::launch(&mut state.borrow_mut(), spec);
        Ok(())
      })?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "_drain",
      lua.create_function(move |lua, ()| scheduler::drain_ambient(lua, &state))?,
    )?;
  }

  forge.set(
    "interrupted",
    lua.create_function(|_, ()| Ok(scheduler::interrupted()))?,
  )?;

  {
    let state = state.clone();
    forge.set(
      "clear",
      lua.create_function(move |lua, ()| {
        let directory = {
          let st = state.borrow();
          st.graph.path(st.context.working_directory())
        };
        let mut st = state.borrow_mut();
        let st = &mut *st;
        destroy_target_bindings(lua, st)?;
        st.graph.clear();
        st.context.reset_directory(&mut st.graph, &directory)?;
        Ok(())
      })?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "load_binary",
      lua.create_function(move |lua, path: String| {
        let loaded = {
          let mut st = state.borrow_mut();
          let st = &mut *st;
          let absolute = absolutize(st, &path);
          let directory = st.graph.path(st.context.working_directory());
          let loaded = st.graph.load_binary(&absolute)?;
          if loaded.is_some() {
            // The tree was replaced: old script handles are stale and the
            // working directory must be re-resolved in the loaded tree.
            destroy_target_bindings(lua, st)?;
            st.context.reset_directory(&mut st.graph, &directory)?;
          }
          loaded
        };
        match loaded {
          Some(cache) => Ok(Some(push_target(lua, &state, cache)?)),
          None => Ok(None),
        }
      })?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "save_binary",
      lua.create_function(move |lua, ()| {
        let mut st = state.borrow_mut();
        let st = &mut *st;
        st.graph.save_binary()?;
        // The saved state now outlives script interest; let tables the
        // script no longer references be collected. They are recreated on
        // demand.
        for key in st.binding.keys(lua)? {
          if key.target_id().is_some() {
            st.binding.weaken(lua, key)?;
          }
        }
        Ok(())
      })?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "print_dependencies",
      lua.create_function(move |_, target: Option<LuaValue>| {
        let st = state.borrow();
        let target_id = optional_target(&st, target)?;
        st.graph.print_dependencies(target_id);
        Ok(())
      })?,
    )?;
  }

  {
    let state = state.clone();
    forge.set(
      "print_namespace",
      lua.create_function(move |_, target: Option<LuaValue>| {
        let st = state.borrow();
        let target_id = optional_target(&st, target)?;
        st.graph.print_namespace(target_id);
        Ok(())
      })?,
    )?;
  }

  Ok(forge)
}

/// Shared construction path for `forge.target` and `forge.file`.
///
/// An omitted id allocates an anonymous `$$N` id under the working
/// directory. A table literal passed as `attributes` becomes the target's
/// script table.
fn add_target(
  lua: &Lua,
  state: &Rc<RefCell<EngineState>>,
  id: Option<String>,
  prototype: Option<LuaValue>,
  attributes: Option<LuaTable>,
) -> LuaResult<LuaTable> {
  let (target_id, attached) = {
    let mut st = state.borrow_mut();
    let st = &mut *st;
    let working_directory = st.context.working_directory();
    let id = match id {
      Some(id) => id,
      None => st.graph.anonymous_id(working_directory),
    };
    let prototype_id = match &prototype {
      Some(value) if !value.is_nil() => Some(st.binding.check_prototype(value)?),
      _ => None,
    };
    let target_id = st.graph.target(&id, prototype_id, working_directory)?;

    let mut attached = None;
    if !st.graph.get(target_id).referenced_by_script()
      && let Some(attributes) = attributes
    {
      st.binding
        .attach(lua, attributes.clone(), BindKey::target(target_id), TARGET_TYPE)?;
      st.graph.get_mut(target_id).set_referenced_by_script(true);
      st.graph
        .get_mut(target_id)
        .set_working_directory(Some(working_directory));
      attached = Some(attributes);
    }
    (target_id, attached)
  };

  let table = match attached {
    Some(table) => table,
    None => push_target(lua, state, target_id)?,
  };
  // A prototype may have been assigned to an existing target just now;
  // keep the dispatch chain current.
  refresh_metatable(lua, state, target_id, &table)?;
  Ok(table)
}

fn optional_target(st: &EngineState, target: Option<LuaValue>) -> LuaResult<TargetId> {
  match target {
    Some(value) if !value.is_nil() => st.binding.check_target(&value),
    _ => Ok(st.graph.root()),
  }
}

fn destroy_target_bindings(lua: &Lua, st: &mut EngineState) -> LuaResult<()> {
  for key in st.binding.keys(lua)? {
    if key.target_id().is_some() {
      st.binding.destroy(lua, key)?;
    }
  }
  Ok(())
}

fn absolutize(st: &EngineState, path: &str) -> PathBuf {
  let path = Path::new(path);
  if path.is_absolute() {
    path.to_path_buf()
  } else {
    st.context.initial_directory().join(path)
  }
}

/// Parse the table form of `forge.execute{...}` into a [`CommandSpec`].
fn parse_command_spec(spec: &LuaTable) -> LuaResult<CommandSpec> {
  let command: Option<String> = spec.get("command")?;
  let Some(command) = command else {
    return Err(LuaError::external("execute requires a 'command' field"));
  };

  let mut parsed = CommandSpec::new(command);
  if let Some(arguments) = spec.get::<Option<Vec<String>>>("arguments")? {
    parsed.arguments = arguments;
  }
  if let Some(environment) = spec.get::<Option<LuaTable>>("environment")? {
    // Sorted for deterministic spawning.
    let mut variables = BTreeMap::new();
    for pair in environment.pairs::<String, String>() {
      let (key, value) = pair?;
      variables.insert(key, value);
    }
    parsed.environment = variables.into_iter().collect();
  }
  if let Some(directory) = spec.get::<Option<String>>("directory")? {
    parsed.directory = Some(PathBuf::from(directory));
  }
  if let Some(timeout_ms) = spec.get::<Option<u64>>("timeout_ms")? {
    parsed.timeout = Some(Duration::from_millis(timeout_ms));
  }
  Ok(parsed)
}
