//! Target methods exposed to scripts.
//!
//! Every target table's metatable chains through its prototype's script
//! table (when it has one) to the shared method table registered here, so
//! script-defined prototype methods shadow nothing and dispatch stays in
//! the script layer. Indices on the script surface are 1-based, as Lua
//! expects.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use mlua::prelude::*;

use crate::forge::EngineState;
use crate::graph::{PrototypeId, TargetId};

use super::binding::{BindKey, PROTOTYPE_TYPE, TARGET_TYPE};

const TARGET_API_KEY: &str = "forge.target_api";

/// The script table for a target, creating and registering one if the
/// target has none (or its weak table has been collected).
pub fn push_target(lua: &Lua, state: &Rc<RefCell<EngineState>>, id: TargetId) -> LuaResult<LuaTable> {
  {
    let mut st = state.borrow_mut();
    let st = &mut *st;
    // Re-pin a table that was weakened after a save; no-op otherwise.
    st.binding.strengthen(lua, BindKey::target(id))?;
    if let Some(table) = st.binding.push(lua, BindKey::target(id))? {
      return Ok(table);
    }
  }
  let table = {
    let mut st = state.borrow_mut();
    let st = &mut *st;
    let table = st.binding.create(lua, BindKey::target(id), TARGET_TYPE)?;
    st.graph.get_mut(id).set_referenced_by_script(true);
    table
  };
  refresh_metatable(lua, state, id, &table)?;
  Ok(table)
}

/// The script table for a prototype, creating one on first use. Prototype
/// tables are populated by scripts; only the metatable chain to the base
/// method table is preset.
pub fn push_prototype(
  lua: &Lua,
  state: &Rc<RefCell<EngineState>>,
  id: PrototypeId,
) -> LuaResult<LuaTable> {
  {
    let st = state.borrow();
    if let Some(table) = st.binding.push(lua, BindKey::prototype(id))? {
      return Ok(table);
    }
  }
  let table = {
    let mut st = state.borrow_mut();
    st.binding.create(lua, BindKey::prototype(id), PROTOTYPE_TYPE)?
  };
  let api: LuaTable = lua.named_registry_value(TARGET_API_KEY)?;
  let metatable = lua.create_table()?;
  metatable.set("__index", api)?;
  table.set_metatable(Some(metatable))?;
  Ok(table)
}

/// Point a target table's `__index` chain at its current prototype; used on
/// creation and again when a prototype is assigned late.
pub fn refresh_metatable(
  lua: &Lua,
  state: &Rc<RefCell<EngineState>>,
  id: TargetId,
  table: &LuaTable,
) -> LuaResult<()> {
  let prototype = state.borrow().graph.get(id).prototype();
  let index_value = match prototype {
    Some(prototype) => LuaValue::Table(push_prototype(lua, state, prototype)?),
    None => LuaValue::Table(lua.named_registry_value(TARGET_API_KEY)?),
  };
  let metatable = lua.create_table()?;
  metatable.set("__index", index_value)?;
  table.set_metatable(Some(metatable))?;
  Ok(())
}

/// Build the shared method table and stash it in the Lua registry.
pub fn register_target_api(lua: &Lua, state: &Rc<RefCell<EngineState>>) -> LuaResult<()> {
  let api = lua.create_table()?;

  {
    let state = state.clone();
    api.set(
      "id",
      lua.create_function(move |_, this: LuaValue| {
        let st = state.borrow();
        let id = st.binding.check_target(&this)?;
        Ok(st.graph.get(id).id().to_string())
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "path",
      lua.create_function(move |_, this: LuaValue| {
        let st = state.borrow();
        let id = st.binding.check_target(&this)?;
        Ok(st.graph.path(id))
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "branch",
      lua.create_function(move |_, this: LuaValue| {
        let st = state.borrow();
        let id = st.binding.check_target(&this)?;
        Ok(st.graph.branch(id))
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "parent",
      lua.create_function(move |lua, this: LuaValue| {
        let parent = {
          let st = state.borrow();
          let id = st.binding.check_target(&this)?;
          st.graph.get(id).parent()
        };
        match parent {
          Some(parent) => Ok(Some(push_target(lua, &state, parent)?)),
          None => Ok(None),
        }
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "prototype",
      lua.create_function(move |lua, this: LuaValue| {
        let prototype = {
          let st = state.borrow();
          let id = st.binding.check_target(&this)?;
          st.graph.get(id).prototype()
        };
        match prototype {
          Some(prototype) => Ok(Some(push_prototype(lua, &state, prototype)?)),
          None => Ok(None),
        }
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "working_directory",
      lua.create_function(move |lua, this: LuaValue| {
        let directory = {
          let st = state.borrow();
          let id = st.binding.check_target(&this)?;
          st.graph.get(id).working_directory()
        };
        match directory {
          Some(directory) => Ok(Some(push_target(lua, &state, directory)?)),
          None => Ok(None),
        }
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "set_working_directory",
      lua.create_function(move |_, (this, directory): (LuaValue, LuaValue)| {
        let mut st = state.borrow_mut();
        let st = &mut *st;
        let id = st.binding.check_target(&this)?;
        let directory_id = match &directory {
          LuaValue::Nil => None,
          value => Some(st.binding.check_target(value)?),
        };
        st.graph.get_mut(id).set_working_directory(directory_id);
        Ok(())
      })?,
    )?;
  }

  register_flag(lua, &api, state, "required_to_exist", |target| target.required_to_exist(), |target, value| {
    target.set_required_to_exist(value)
  })?;
  register_flag(lua, &api, state, "always_bind", |target| target.always_bind(), |target, value| {
    target.set_always_bind(value)
  })?;
  register_flag(lua, &api, state, "cleanable", |target| target.cleanable(), |target, value| {
    target.set_cleanable(value)
  })?;

  {
    let state = state.clone();
    api.set(
      "set_filename",
      lua.create_function(
        move |_, (this, filename, index): (LuaValue, String, Option<i64>)| {
          let mut st = state.borrow_mut();
          let st = &mut *st;
          let id = st.binding.check_target(&this)?;
          let index = lua_index(index)?;
          st.graph.get_mut(id).set_filename(filename, index);
          Ok(())
        },
      )?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "filename",
      lua.create_function(move |_, (this, index): (LuaValue, Option<i64>)| {
        let st = state.borrow();
        let id = st.binding.check_target(&this)?;
        let index = lua_index(index)?;
        Ok(st.graph.get(id).filename(index).map(str::to_string))
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "filenames",
      lua.create_function(move |_, this: LuaValue| {
        let st = state.borrow();
        let id = st.binding.check_target(&this)?;
        Ok(st.graph.get(id).filenames().to_vec())
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "timestamp",
      lua.create_function(move |_, this: LuaValue| {
        let st = state.borrow();
        let id = st.binding.check_target(&this)?;
        Ok(st.graph.get(id).timestamp() as i64)
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "last_write_time",
      lua.create_function(move |_, this: LuaValue| {
        let st = state.borrow();
        let id = st.binding.check_target(&this)?;
        Ok(st.graph.get(id).last_write_time() as i64)
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "outdated",
      lua.create_function(move |_, this: LuaValue| {
        let st = state.borrow();
        let id = st.binding.check_target(&this)?;
        Ok(st.graph.get(id).outdated())
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "add_dependency",
      lua.create_function(move |_, (this, dependency): (LuaValue, LuaValue)| {
        let mut st = state.borrow_mut();
        let st = &mut *st;
        let id = st.binding.check_target(&this)?;
        let dependency = st.binding.check_target(&dependency)?;
        st.graph.get_mut(id).add_dependency(dependency);
        Ok(())
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "remove_dependency",
      lua.create_function(move |_, (this, dependency): (LuaValue, LuaValue)| {
        let mut st = state.borrow_mut();
        let st = &mut *st;
        let id = st.binding.check_target(&this)?;
        let dependency = st.binding.check_target(&dependency)?;
        st.graph.get_mut(id).remove_dependency(dependency);
        Ok(())
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "add_implicit_dependency",
      lua.create_function(move |_, (this, dependency): (LuaValue, LuaValue)| {
        let mut st = state.borrow_mut();
        let st = &mut *st;
        let id = st.binding.check_target(&this)?;
        let dependency = st.binding.check_target(&dependency)?;
        st.graph.get_mut(id).add_implicit_dependency(dependency);
        Ok(())
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "clear_implicit_dependencies",
      lua.create_function(move |_, this: LuaValue| {
        let mut st = state.borrow_mut();
        let st = &mut *st;
        let id = st.binding.check_target(&this)?;
        st.graph.get_mut(id).clear_implicit_dependencies();
        Ok(())
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "dependency",
      lua.create_function(move |lua, (this, index): (LuaValue, Option<i64>)| {
        let dependency = {
          let st = state.borrow();
          let id = st.binding.check_target(&this)?;
          st.graph.get(id).dependency(lua_index(index)?)
        };
        match dependency {
          Some(dependency) => Ok(Some(push_target(lua, &state, dependency)?)),
          None => Ok(None),
        }
      })?,
    )?;
  }

  {
    let state = state.clone();
    api.set(
      "dependencies",
      lua.create_function(move |lua, this: LuaValue| {
        let ids: Vec<TargetId> = {
          let st = state.borrow();
          let id = st.binding.check_target(&this)?;
          st.graph.get(id).dependencies().collect()
        };
        iterator_over(lua, &state, ids)
      })?,
    )?;
  }

  {
    // `targets` and `dependencies` walk the same concatenated edge list.
    let state = state.clone();
    api.set(
      "targets",
      lua.create_function(move |lua, this: LuaValue| {
        let ids: Vec<TargetId> = {
          let st = state.borrow();
          let id = st.binding.check_target(&this)?;
          st.graph.get(id).targets().collect()
        };
        iterator_over(lua, &state, ids)
      })?,
    )?;
  }

  lua.set_named_registry_value(TARGET_API_KEY, api)
}

/// Register a get/set method pair for a boolean flag.
fn register_flag(
  lua: &Lua,
  api: &LuaTable,
  state: &Rc<RefCell<EngineState>>,
  name: &str,
  get: fn(&crate::graph::Target) -> bool,
  set: fn(&mut crate::graph::Target, bool),
) -> LuaResult<()> {
  {
    let state = state.clone();
    api.set(
      name,
      lua.create_function(move |_, this: LuaValue| {
        let st = state.borrow();
        let id = st.binding.check_target(&this)?;
        Ok(get(st.graph.get(id)))
      })?,
    )?;
  }
  {
    let state = state.clone();
    api.set(
      format!("set_{name}"),
      lua.create_function(move |_, (this, value): (LuaValue, bool)| {
        let mut st = state.borrow_mut();
        let st = &mut *st;
        let id = st.binding.check_target(&this)?;
        set(st.graph.get_mut(id), value);
        Ok(())
      })?,
    )?;
  }
  Ok(())
}

/// A `for`-loop iterator function over a snapshot of target ids.
fn iterator_over(
  lua: &Lua,
  state: &Rc<RefCell<EngineState>>,
  ids: Vec<TargetId>,
) -> LuaResult<LuaFunction> {
  let state = state.clone();
  let position = Cell::new(0usize);
  lua.create_function(move |lua, ()| {
    let index = position.get();
    if index >= ids.len() {
      return Ok(LuaValue::Nil);
    }
    position.set(index + 1);
    Ok(LuaValue::Table(push_target(lua, &state, ids[index])?))
  })
}

/// Convert an optional 1-based Lua index to 0-based.
fn lua_index(index: Option<i64>) -> LuaResult<usize> {
  match index.unwrap_or(1) {
    n if n >= 1 => Ok((n - 1) as usize),
    n => Err(LuaError::external(format!("index {n} out of range (indices start at 1)"))),
  }
}
