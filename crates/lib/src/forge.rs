//! The facade that wires the engine together.
//!
//! A [`Forge`] owns the Lua runtime and the shared [`EngineState`] — graph,
//! context, script binding, and scheduler plumbing. The state is shared with
//! the Lua-side closures through `Rc<RefCell<_>>`; nothing in it ever leaves
//! the script thread.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;

use mlua::prelude::*;
use tracing::{error, info};

use crate::context::Context;
use crate::error::ForgeError;
use crate::graph::Graph;
use crate::lua::binding::ScriptBinding;
use crate::lua::runtime;
use crate::scheduler::{JobToken, WorkerPool};

#[derive(Debug, Clone)]
pub struct ForgeOptions {
  /// Worker thread count for background commands.
  pub jobs: usize,
  /// Keep dispatching independent branches after a failure.
  pub keep_going: bool,
  /// The directory the initial working-directory target mirrors; defaults
  /// to the process working directory.
  pub root_directory: Option<PathBuf>,
}

impl Default for ForgeOptions {
  fn default() -> Self {
    ForgeOptions {
      jobs: std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4),
      keep_going: false,
      root_directory: None,
    }
  }
}

/// The job whose callback is currently running on the script thread; set
/// around every coroutine resume so launched commands attach to it.
pub struct ActiveJob {
  pub token: JobToken,
  pub outstanding: Arc<AtomicU32>,
  /// Commands launched during the current resume; folded back into the
  /// job's bookkeeping when the resume returns.
  pub launched: u32,
}

pub struct EngineState {
  pub graph: Graph,
  pub context: Context,
  pub binding: ScriptBinding,
  pub jobs: usize,
  pub keep_going: bool,
  pub pool: Option<WorkerPool>,
  pub current_job: Option<ActiveJob>,
  /// Outstanding-work counter for commands launched outside any traversal.
  pub ambient_outstanding: Arc<AtomicU32>,
  /// How many ambient commands have been launched but not yet drained.
  pub ambient_launched: u32,
  /// Ambient completions received but not yet handed back to the script.
  pub ambient_pending: Vec<crate::scheduler::CommandOutcome>,
}

pub struct Forge {
  lua: Lua,
  state: Rc<RefCell<EngineState>>,
}

impl Forge {
  pub fn new(options: ForgeOptions) -> Result<Forge, ForgeError> {
    let root_directory = match options.root_directory {
      Some(directory) => directory,
      None => std::env::current_dir()
        .map_err(|err| ForgeError::io("failed to determine the working directory", err))?,
    };

    let mut graph = Graph::new();
    let root = graph.root();
    let directory_id = root_directory.to_string_lossy().into_owned();
    let working_directory = graph.target(&directory_id, None, root)?;
    let context = Context::new(working_directory, root_directory);

    let lua = Lua::new();
    let binding = ScriptBinding::new(&lua).map_err(script_error)?;

    let state = Rc::new(RefCell::new(EngineState {
      graph,
      context,
      binding,
      jobs: options.jobs.max(1),
      keep_going: options.keep_going,
      pool: None,
      current_job: None,
      ambient_outstanding: Arc::new(AtomicU32::new(0)),
      ambient_launched: 0,
      ambient_pending: Vec::new(),
    }));

    runtime::install(&lua, &state).map_err(script_error)?;
    Ok(Forge { lua, state })
  }

  /// The Lua runtime; scripts loaded through it see the `forge` global.
  pub fn lua(&self) -> &Lua {
    &self.lua
  }

  pub fn state(&self) -> &Rc<RefCell<EngineState>> {
    &self.state
  }

  /// Load and execute a buildfile; returns the error count.
  pub fn buildfile(&self, path: &Path) -> Result<usize, ForgeError> {
    run_buildfile(&self.lua, &self.state, path).map_err(script_error)
  }

  /// Run the prelude's `forge.build` dispatcher: a postorder traversal that
  /// invokes each target's prototype `build` method. `goal` is a target
  /// path; `None` traverses the whole graph.
  pub fn build(&self, goal: Option<&str>) -> Result<i64, ForgeError> {
    let function: LuaFunction = self.forge_function("build")?;
    let failures = match goal {
      Some(goal) => function.call(goal),
      None => function.call(()),
    };
    failures.map_err(script_error)
  }

  /// Load the graph cache, replacing the current tree; remembers the path
  /// for [`Forge::save_cache`].
  pub fn load_cache(&self, path: &Path) -> Result<(), ForgeError> {
    let function: LuaFunction = self.forge_function("load_binary")?;
    function
      .call::<LuaValue>(path.to_string_lossy().into_owned())
      .map_err(script_error)?;
    Ok(())
  }

  pub fn save_cache(&self) -> Result<(), ForgeError> {
    let function: LuaFunction = self.forge_function("save_binary")?;
    function.call::<()>(()).map_err(script_error)
  }

  fn forge_function(&self, name: &str) -> Result<LuaFunction, ForgeError> {
    let forge: LuaTable = self.lua.globals().get("forge").map_err(script_error)?;
    forge.get(name).map_err(script_error)
  }
}

impl Drop for Forge {
  fn drop(&mut self) {
    // Release every script table association before the runtime goes away.
    if let Ok(mut state) = self.state.try_borrow_mut() {
      let _ = state.binding.drain(&self.lua);
    }
  }
}

fn script_error(err: LuaError) -> ForgeError {
  ForgeError::Script(err.to_string())
}

/// Execute a buildfile inside a directory scope.
///
/// The directory of the buildfile is resolved to a target and pushed for
/// the duration of the load, so relative target ids declared by the script
/// land under it. Script errors are counted, not propagated; a missing
/// buildfile is an error.
pub(crate) fn run_buildfile(
  lua: &Lua,
  state: &Rc<RefCell<EngineState>>,
  path: &Path,
) -> LuaResult<usize> {
  let absolute = {
    let st = state.borrow();
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      st.context.initial_directory().join(path)
    }
  };

  let source = std::fs::read_to_string(&absolute).map_err(|err| {
    LuaError::external(ForgeError::io(
      format!("failed to read buildfile '{}'", absolute.display()),
      err,
    ))
  })?;

  {
    let mut st = state.borrow_mut();
    let st = &mut *st;
    let directory = absolute
      .parent()
      .unwrap_or(Path::new("/"))
      .to_string_lossy()
      .into_owned();
    let root = st.graph.root();
    let directory_target = st.graph.target(&directory, None, root)?;
    st.context.push_directory(directory_target);
  }

  info!(buildfile = %absolute.display(), "loading buildfile");
  let result = lua
    .load(&source)
    .set_name(format!("@{}", absolute.display()))
    .exec();
  state.borrow_mut().context.pop_directory();

  match result {
    Ok(()) => Ok(0),
    Err(err) => {
      error!(buildfile = %absolute.display(), error = %err, "buildfile failed");
      Ok(1)
    }
  }
}
