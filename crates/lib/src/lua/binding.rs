//! Identity mapping between native graph objects and Lua tables.
//!
//! Each bound object is identified by a [`BindKey`] (an object tag plus its
//! slab index). The association to its Lua table is either strong — held via
//! a registry key, pinning the table against garbage collection — or weak,
//! held in a `__mode = "v"` table so the script side can be collected while
//! the native object persists and the table recreated on demand.
//!
//! Tables are stamped with `__forge_this` (the key) and `__forge_type` (a
//! type name); `to`/`check` reverse the mapping with a type check. All of
//! this runs on the script thread only.

use std::collections::HashMap;

use mlua::prelude::*;
use mlua::RegistryKey;

use crate::graph::{PrototypeId, TargetId};

pub const TARGET_TYPE: &str = "forge.Target";
pub const PROTOTYPE_TYPE: &str = "forge.TargetPrototype";

const THIS_FIELD: &str = "__forge_this";
const TYPE_FIELD: &str = "__forge_type";

const TARGET_TAG: u64 = 1 << 32;
const PROTOTYPE_TAG: u64 = 2 << 32;

/// Identifies a bound native object: an object tag in the high bits and the
/// slab index in the low bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindKey(u64);

impl BindKey {
  pub fn target(id: TargetId) -> BindKey {
    BindKey(TARGET_TAG | id.0 as u64)
  }

  pub fn prototype(id: PrototypeId) -> BindKey {
    BindKey(PROTOTYPE_TAG | id.0 as u64)
  }

  pub fn target_id(self) -> Option<TargetId> {
    (self.0 & !0xFFFF_FFFF == TARGET_TAG).then_some(TargetId(self.0 as u32))
  }

  pub fn prototype_id(self) -> Option<PrototypeId> {
    (self.0 & !0xFFFF_FFFF == PROTOTYPE_TAG).then_some(PrototypeId(self.0 as u32))
  }

  fn as_integer(self) -> i64 {
    self.0 as i64
  }
}

pub struct ScriptBinding {
  strong: HashMap<BindKey, RegistryKey>,
  /// Registry key of the weak-values table.
  weak: RegistryKey,
}

impl ScriptBinding {
  pub fn new(lua: &Lua) -> LuaResult<ScriptBinding> {
    let weak_table = lua.create_table()?;
    let metatable = lua.create_table()?;
    metatable.set("__mode", "v")?;
    weak_table.set_metatable(Some(metatable))?;
    Ok(ScriptBinding {
      strong: HashMap::new(),
      weak: lua.create_registry_value(weak_table)?,
    })
  }

  fn weak_table(&self, lua: &Lua) -> LuaResult<LuaTable> {
    lua.registry_value(&self.weak)
  }

  /// Allocate a fresh table for `key`, stamp it, and register it strongly.
  pub fn create(&mut self, lua: &Lua, key: BindKey, type_name: &str) -> LuaResult<LuaTable> {
    let table = lua.create_table()?;
    self.attach(lua, table.clone(), key, type_name)?;
    Ok(table)
  }

  /// Stamp an existing table — typically a table literal passed by the
  /// script — and register it strongly for `key`.
  pub fn attach(&mut self, lua: &Lua, table: LuaTable, key: BindKey, type_name: &str) -> LuaResult<()> {
    if self.push(lua, key)?.is_some() {
      return Err(LuaError::external(format!(
        "object already bound to a script table ({type_name})"
      )));
    }
    table.raw_set(THIS_FIELD, key.as_integer())?;
    table.raw_set(TYPE_FIELD, type_name)?;
    self.strong.insert(key, lua.create_registry_value(table)?);
    Ok(())
  }

  /// Null the stamps in the associated table and remove it from both
  /// registries. The table itself survives until script garbage collection.
  pub fn destroy(&mut self, lua: &Lua, key: BindKey) -> LuaResult<()> {
    if let Some(table) = self.push(lua, key)? {
      table.raw_set(THIS_FIELD, LuaValue::Nil)?;
      table.raw_set(TYPE_FIELD, LuaValue::Nil)?;
    }
    if let Some(registry_key) = self.strong.remove(&key) {
      lua.remove_registry_value(registry_key)?;
    }
    self.weak_table(lua)?.raw_set(key.as_integer(), LuaValue::Nil)?;
    Ok(())
  }

  /// Move `key`'s table from the strong registry into the weak one; its
  /// table becomes collectable once the script drops its references. A key
  /// that is already weak is left alone.
  pub fn weaken(&mut self, lua: &Lua, key: BindKey) -> LuaResult<()> {
    if let Some(registry_key) = self.strong.remove(&key) {
      let table: LuaTable = lua.registry_value(&registry_key)?;
      self.weak_table(lua)?.raw_set(key.as_integer(), table)?;
      lua.remove_registry_value(registry_key)?;
    }
    Ok(())
  }

  /// Move `key`'s table back into the strong registry, pinning it. A key
  /// whose weak table was already collected quietly stays unbound.
  pub fn strengthen(&mut self, lua: &Lua, key: BindKey) -> LuaResult<()> {
    if self.strong.contains_key(&key) {
      return Ok(());
    }
    let weak_table = self.weak_table(lua)?;
    let value: LuaValue = weak_table.raw_get(key.as_integer())?;
    if let LuaValue::Table(table) = value {
      weak_table.raw_set(key.as_integer(), LuaValue::Nil)?;
      self.strong.insert(key, lua.create_registry_value(table)?);
    }
    Ok(())
  }

  /// Exchange the tables associated with two keys. Each table is restamped
  /// for its new key; the strength of each key's association is preserved
  /// (values swap, strengths do not).
  pub fn swap(&mut self, lua: &Lua, a: BindKey, b: BindKey) -> LuaResult<()> {
    let table_a = self.push(lua, a)?;
    let table_b = self.push(lua, b)?;
    let a_strong = self.strong.contains_key(&a);
    let b_strong = self.strong.contains_key(&b);

    self.remove(lua, a)?;
    self.remove(lua, b)?;

    self.reinsert(lua, a, table_b, a_strong)?;
    self.reinsert(lua, b, table_a, b_strong)?;
    Ok(())
  }

  /// Drop `key`'s registry entries without touching the table's stamps.
  fn remove(&mut self, lua: &Lua, key: BindKey) -> LuaResult<()> {
    if let Some(registry_key) = self.strong.remove(&key) {
      lua.remove_registry_value(registry_key)?;
    }
    self.weak_table(lua)?.raw_set(key.as_integer(), LuaValue::Nil)?;
    Ok(())
  }

  fn reinsert(&mut self, lua: &Lua, key: BindKey, table: Option<LuaTable>, strong: bool) -> LuaResult<()> {
    let Some(table) = table else {
      return Ok(());
    };
    table.raw_set(THIS_FIELD, key.as_integer())?;
    if strong {
      self.strong.insert(key, lua.create_registry_value(table)?);
    } else {
      self.weak_table(lua)?.raw_set(key.as_integer(), table)?;
    }
    Ok(())
  }

  /// The table associated with `key`, or `None` when there is none (or the
  /// weak entry has been collected).
  pub fn push(&self, lua: &Lua, key: BindKey) -> LuaResult<Option<LuaTable>> {
    if let Some(registry_key) = self.strong.get(&key) {
      return Ok(Some(lua.registry_value(registry_key)?));
    }
    let value: LuaValue = self.weak_table(lua)?.raw_get(key.as_integer())?;
    match value {
      LuaValue::Table(table) => Ok(Some(table)),
      _ => Ok(None),
    }
  }

  /// Extract the key stamped into a script value, verifying the type stamp.
  /// Returns `None` on any mismatch.
  pub fn to(&self, value: &LuaValue, type_name: &str) -> Option<BindKey> {
    let LuaValue::Table(table) = value else {
      return None;
    };
    let stamped: Option<String> = table.raw_get(TYPE_FIELD).ok()?;
    if stamped.as_deref() != Some(type_name) {
      return None;
    }
    let this: Option<i64> = table.raw_get(THIS_FIELD).ok()?;
    this.map(|key| BindKey(key as u64))
  }

  /// Like [`ScriptBinding::to`], but raises a script error on mismatch.
  pub fn check(&self, value: &LuaValue, type_name: &str) -> LuaResult<BindKey> {
    self.to(value, type_name).ok_or_else(|| {
      LuaError::external(format!("{type_name} expected, got {}", value.type_name()))
    })
  }

  pub fn to_target(&self, value: &LuaValue) -> Option<TargetId> {
    self.to(value, TARGET_TYPE).and_then(BindKey::target_id)
  }

  pub fn check_target(&self, value: &LuaValue) -> LuaResult<TargetId> {
    self
      .check(value, TARGET_TYPE)?
      .target_id()
      .ok_or_else(|| LuaError::external("target expected"))
  }

  pub fn check_prototype(&self, value: &LuaValue) -> LuaResult<PrototypeId> {
    self
      .check(value, PROTOTYPE_TYPE)?
      .prototype_id()
      .ok_or_else(|| LuaError::external("target prototype expected"))
  }

  /// Every key currently known to either registry.
  pub fn keys(&self, lua: &Lua) -> LuaResult<Vec<BindKey>> {
    let mut keys: Vec<BindKey> = self.strong.keys().copied().collect();
    for pair in self.weak_table(lua)?.pairs::<i64, LuaValue>() {
      let (key, _) = pair?;
      keys.push(BindKey(key as u64));
    }
    Ok(keys)
  }

  /// Destroy every binding; used when the target tree is replaced.
  pub fn drain(&mut self, lua: &Lua) -> LuaResult<()> {
    for key in self.keys(lua)? {
      self.destroy(lua, key)?;
    }
    Ok(())
  }
}
