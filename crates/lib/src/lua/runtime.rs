//! Lua runtime assembly.
//!
//! Registers the target method table and the `forge` global, then loads the
//! prelude: the Lua-side pieces (`forge.wait`, `forge.build`) that are more
//! naturally expressed as script than as bindings.

use std::cell::RefCell;
use std::rc::Rc;

use mlua::prelude::*;

use crate::forge::EngineState;

use super::{globals, target};

/// `forge.wait` yields when called from a traversal callback (the scheduler
/// resumes it with the callback's own completions); outside a coroutine it
/// pumps the completion queue directly. `forge.build` is the standard
/// per-goal dispatcher used by the CLI: a postorder traversal invoking each
/// target's prototype `build` method.
const PRELUDE: &str = r#"
function forge.wait()
  if coroutine.isyieldable() then
    return coroutine.yield("wait")
  end
  return forge._drain()
end

function forge.build(goal)
  local root = nil
  if goal and goal ~= "" then
    root = forge.find_target(goal)
    if not root then
      error(string.format("unknown goal '%s'", goal))
    end
  end
  return forge.postorder(function(target)
    local prototype = target:prototype()
    if prototype and prototype.build then
      return prototype.build(target)
    end
    return 0
  end, root)
end
"#;

pub fn install(lua: &Lua, state: &Rc<RefCell<EngineState>>) -> LuaResult<()> {
  target::register_target_api(lua, state)?;
  let forge = globals::register_forge(lua, state)?;
  lua.globals().set("forge", forge)?;
  lua.load(PRELUDE).set_name("@[forge prelude]").exec()?;
  Ok(())
}
