//! The concurrent postorder traversal.
//!
//! `postorder` drives a topological walk over the dependency graph and
//! invokes a Lua callback for each target on the script thread, as a
//! coroutine. Callbacks may launch background commands onto the worker pool
//! and suspend in `wait` until their own commands complete. A target's
//! callback never starts before every dependency's callback has returned
//! and every command it launched has completed; dependents of a failed
//! target are skipped.
//!
//! Script-side bookkeeping (launched/received counts per job) is exact
//! because it only changes on the script thread; the atomic outstanding
//! counters are the cross-thread contract with the worker pool.

mod command;
mod pool;

pub use command::{CommandOutcome, CommandSpec};
pub use pool::{Completion, JobToken, WorkItem, WorkerPool};

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use mlua::prelude::*;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use tracing::{debug, error, warn};

use crate::error::ForgeError;
use crate::forge::{ActiveJob, EngineState};
use crate::graph::{Graph, TargetId};
use crate::lua::target::push_target;

/// Set when the user asks the build to stop. Traversals poll it before
/// dispatching each job: nothing new starts, in-flight commands run to
/// completion, and the failure count comes back non-zero so the build
/// exits failed. Scripts can poll it through `forge.interrupted()`.
static ABORT_REQUESTED: AtomicBool = AtomicBool::new(false);

pub fn interrupted() -> bool {
  ABORT_REQUESTED.load(Ordering::Relaxed)
}

/// Route Ctrl-C into a graceful abort of the current traversal.
#[cfg(unix)]
pub fn register_sigint() {
  // Safety: installs a handler that only stores to an atomic and
  // re-registers a disposition.
  unsafe {
    libc::signal(libc::SIGINT, request_abort as libc::sighandler_t);
  }
}

#[cfg(not(unix))]
pub fn register_sigint() {}

#[cfg(unix)]
extern "C" fn request_abort(_signal: libc::c_int) {
  ABORT_REQUESTED.store(true, Ordering::Relaxed);
  // Hand the signal back to its default disposition so a second interrupt
  // terminates the build outright instead of asking again.
  unsafe {
    libc::signal(libc::SIGINT, libc::SIG_DFL);
  }
}

/// Launch a background command on the worker pool, attached to the job
/// whose callback is currently running (or the ambient scope outside any
/// traversal).
pub fn launch(state: &mut EngineState, spec: CommandSpec) {
  let jobs = state.jobs;
  let (token, outstanding) = match state.current_job.as_mut() {
    Some(active) => {
      active.launched += 1;
      (active.token, active.outstanding.clone())
    }
    None => {
      state.ambient_launched += 1;
      (JobToken::Ambient, state.ambient_outstanding.clone())
    }
  };
  outstanding.fetch_add(1, Ordering::AcqRel);
  debug!(command = %spec.command, ?token, "launching command");
  let pool = state.pool.get_or_insert_with(|| WorkerPool::new(jobs));
  pool.submit(WorkItem {
    token,
    outstanding,
    spec,
  });
}

/// Block until every ambient command has completed and return their
/// completions as a Lua array. This is `forge.wait()` outside a traversal.
pub fn drain_ambient(lua: &Lua, state: &Rc<RefCell<EngineState>>) -> LuaResult<LuaTable> {
  loop {
    let done = {
      let st = state.borrow();
      st.ambient_pending.len() as u32 >= st.ambient_launched
    };
    if done {
      break;
    }
    let completion = {
      let st = state.borrow();
      let Some(pool) = st.pool.as_ref() else {
        break;
      };
      pool.recv()
    };
    let Some(completion) = completion else {
      return Err(LuaError::external("worker pool disconnected"));
    };
    match completion.token {
      JobToken::Ambient => {
        if !completion.outcome.ok {
          error!(command = %completion.outcome.command, code = ?completion.outcome.exit_code, "command failed");
        }
        state.borrow_mut().ambient_pending.push(completion.outcome);
      }
      JobToken::Node(index) => {
        warn!(index, "dropping stray traversal completion outside a traversal");
      }
    }
  }

  let mut st = state.borrow_mut();
  st.ambient_launched = 0;
  let pending = std::mem::take(&mut st.ambient_pending);
  drop(st);

  let results = lua.create_table()?;
  for (index, outcome) in pending.iter().enumerate() {
    results.raw_set(index + 1, completion_table(lua, outcome)?)?;
  }
  Ok(results)
}

/// Convert a command outcome into the table handed back to scripts.
pub(crate) fn completion_table(lua: &Lua, outcome: &CommandOutcome) -> LuaResult<LuaTable> {
  let table = lua.create_table()?;
  table.set("command", outcome.command.as_str())?;
  table.set("ok", outcome.ok)?;
  table.set("exit_code", outcome.exit_code)?;
  table.set("stdout", outcome.stdout.as_str())?;
  table.set("stderr", outcome.stderr.as_str())?;
  table.set("timed_out", outcome.timed_out)?;
  table.set("elapsed_ms", outcome.elapsed.as_millis() as i64)?;
  Ok(table)
}

/// The central operation: traverse from `root` (the whole graph when nil)
/// and invoke `callback` for every target after its dependencies. Returns
/// the aggregate failure count.
pub fn postorder(
  lua: &Lua,
  state: &Rc<RefCell<EngineState>>,
  callback: LuaFunction,
  root: Option<LuaValue>,
) -> LuaResult<i64> {
  let (root_id, invoke_root) = {
    let st = state.borrow();
    if st.graph.traversal_in_progress() {
      return Err(ForgeError::NestedTraversal.into());
    }
    match root {
      Some(value) if !value.is_nil() => (st.binding.check_target(&value)?, true),
      _ => (st.graph.root(), false),
    }
  };

  match state.borrow_mut().graph.bind(Some(root_id)) {
    Err(ForgeError::CycleDetected { path }) => {
      error!(cycle = %path.join(" -> "), "dependency cycle detected");
      return Ok(1);
    }
    Err(other) => return Err(other.into()),
    Ok(failures) if failures > 0 => {
      warn!(failures, "targets failed to bind; traversal skipped");
      return Ok(failures as i64);
    }
    Ok(_) => {}
  }

  let schedule = match Schedule::new(&state.borrow().graph, root_id, invoke_root) {
    Ok(schedule) => schedule,
    Err(cycle_at) => {
      error!(target = %cycle_at, "dependency cycle detected");
      return Ok(1);
    }
  };

  state.borrow_mut().graph.begin_traversal();
  let keep_going = state.borrow().keep_going;
  let traversal = Traversal {
    lua,
    state,
    callback,
    jobs: (0..schedule.order.len()).map(|_| Job::new()).collect(),
    ready: schedule
      .in_degree
      .iter()
      .enumerate()
      .filter(|&(_, &degree)| degree == 0)
      .map(|(index, _)| index)
      .collect(),
    schedule,
    finalized: 0,
    failures: 0,
    stop_dispatch: false,
    interrupt_counted: false,
    keep_going,
  };
  let result = traversal.run();

  {
    let mut st = state.borrow_mut();
    st.graph.end_traversal();
    st.current_job = None;
  }
  result
}

/// The immutable shape of one traversal: targets in topological order with
/// dependency/dependent adjacency by schedule index.
struct Schedule {
  order: Vec<TargetId>,
  dependencies: Vec<Vec<usize>>,
  dependents: Vec<Vec<usize>>,
  in_degree: Vec<usize>,
  /// Whether the callback runs for this node. Namespace intermediates that
  /// no script ever referenced are traversed for ordering only, and the
  /// graph root is not invoked when `postorder` was called without an
  /// explicit root.
  invoke: Vec<bool>,
}

impl Schedule {
  fn new(graph: &Graph, root: TargetId, invoke_root: bool) -> Result<Schedule, String> {
    // Reachable set over dependency and namespace (child) edges.
    let mut dag: DiGraph<TargetId, ()> = DiGraph::new();
    let mut node_of: HashMap<TargetId, NodeIndex> = HashMap::new();
    let mut stack = vec![root];
    while let Some(target_id) = stack.pop() {
      if node_of.contains_key(&target_id) {
        continue;
      }
      node_of.insert(target_id, dag.add_node(target_id));
      let target = graph.get(target_id);
      stack.extend(target.dependencies());
      stack.extend(target.children().iter().copied());
    }

    // Edges point from prerequisite to dependent: dependencies and children
    // complete before the target itself.
    for (&target_id, &node) in &node_of {
      let target = graph.get(target_id);
      let mut seen = HashSet::new();
      for prerequisite in target
        .dependencies()
        .chain(target.children().iter().copied())
      {
        if seen.insert(prerequisite) {
          dag.add_edge(node_of[&prerequisite], node, ());
        }
      }
    }

    let sorted = toposort(&dag, None).map_err(|cycle| graph.path(dag[cycle.node_id()]))?;
    let order: Vec<TargetId> = sorted.iter().map(|&node| dag[node]).collect();
    let index_of: HashMap<TargetId, usize> = order
      .iter()
      .enumerate()
      .map(|(index, &target_id)| (target_id, index))
      .collect();

    let mut dependencies = vec![Vec::new(); order.len()];
    let mut dependents = vec![Vec::new(); order.len()];
    let mut in_degree = vec![0usize; order.len()];
    for (index, &node) in sorted.iter().enumerate() {
      for prerequisite in dag.neighbors_directed(node, Direction::Incoming) {
        dependencies[index].push(index_of[&dag[prerequisite]]);
      }
      for dependent in dag.neighbors_directed(node, Direction::Outgoing) {
        dependents[index].push(index_of[&dag[dependent]]);
      }
      in_degree[index] = dependencies[index].len();
    }

    let invoke = order
      .iter()
      .map(|&target_id| {
        graph.get(target_id).referenced_by_script() && (invoke_root || target_id != root)
      })
      .collect();

    Ok(Schedule {
      order,
      dependencies,
      dependents,
      in_degree,
      invoke,
    })
  }
}

struct Job {
  thread: Option<LuaThread>,
  outstanding: std::sync::Arc<std::sync::atomic::AtomicU32>,
  /// Completions received but not yet handed to the coroutine.
  pending: Vec<CommandOutcome>,
  launched: u32,
  received: u32,
  command_failures: i64,
  waiting: bool,
  thread_finished: bool,
  script_failed: bool,
  started: bool,
  finalized: bool,
  failed: bool,
  skipped: bool,
}

impl Job {
  fn new() -> Job {
    Job {
      thread: None,
      outstanding: std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0)),
      pending: Vec::new(),
      launched: 0,
      received: 0,
      command_failures: 0,
      waiting: false,
      thread_finished: false,
      script_failed: false,
      started: false,
      finalized: false,
      failed: false,
      skipped: false,
    }
  }

  fn all_commands_received(&self) -> bool {
    self.received >= self.launched
  }

  fn complete(&self) -> bool {
    self.thread_finished && self.all_commands_received()
  }
}

struct Traversal<'a> {
  lua: &'a Lua,
  state: &'a Rc<RefCell<EngineState>>,
  callback: LuaFunction,
  schedule: Schedule,
  jobs: Vec<Job>,
  /// Ready schedule indices; a BTreeSet keeps dispatch in topological
  /// order among independents, which keeps runs deterministic.
  ready: BTreeSet<usize>,
  finalized: usize,
  failures: i64,
  stop_dispatch: bool,
  interrupt_counted: bool,
  keep_going: bool,
}

impl<'a> Traversal<'a> {
  fn run(mut self) -> LuaResult<i64> {
    let total = self.schedule.order.len();
    while self.finalized < total {
      self.dispatch_ready()?;
      if self.finalized >= total {
        break;
      }

      let awaiting = self
        .jobs
        .iter()
        .any(|job| job.started && !job.finalized && !job.all_commands_received());
      if !awaiting {
        return Err(LuaError::external(
          "scheduler stalled: no runnable work but the traversal is unfinished",
        ));
      }

      let completion = {
        let st = self.state.borrow();
        let Some(pool) = st.pool.as_ref() else {
          return Err(LuaError::external("scheduler stalled: commands pending without a pool"));
        };
        pool.recv()
      };
      let Some(completion) = completion else {
        return Err(LuaError::external("worker pool disconnected"));
      };
      self.handle_completion(completion);
      loop {
        let next = {
          let st = self.state.borrow();
          st.pool.as_ref().and_then(|pool| pool.try_recv())
        };
        match next {
          Some(completion) => self.handle_completion(completion),
          None => break,
        }
      }

      self.resume_and_finalize()?;
    }
    Ok(self.failures)
  }

  fn dispatch_ready(&mut self) -> LuaResult<()> {
    while let Some(&index) = self.ready.iter().next() {
      self.ready.remove(&index);
      self.note_abort_request();

      let blocked = self.schedule.dependencies[index]
        .iter()
        .any(|&dep| self.jobs[dep].failed || self.jobs[dep].skipped);
      if blocked || self.stop_dispatch {
        if blocked {
          debug!(target = %self.target_path(index), "skipped: a dependency failed");
        }
        self.jobs[index].skipped = true;
        self.finalize(index);
        continue;
      }

      self.mark_visited(index);
      if !self.schedule.invoke[index] {
        self.finalize(index);
        continue;
      }

      self.start_job(index)?;
      if self.jobs[index].complete() {
        self.finalize(index);
      }
    }
    Ok(())
  }

  fn start_job(&mut self, index: usize) -> LuaResult<()> {
    let target_id = self.schedule.order[index];
    debug!(target = %self.target_path(index), "visiting target");

    let table = push_target(self.lua, self.state, target_id)?;
    let thread = self.lua.create_thread(self.callback.clone())?;
    self.jobs[index].thread = Some(thread);
    self.jobs[index].started = true;
    self.pump_job(index, LuaMultiValue::from_iter([LuaValue::Table(table)]))
  }

  /// Resume a job's coroutine until it suspends on outstanding work or
  /// finishes.
  fn pump_job(&mut self, index: usize, mut args: LuaMultiValue) -> LuaResult<()> {
    let thread = self.jobs[index]
      .thread
      .clone()
      .expect("pumped job has a coroutine");
    loop {
      {
        let mut st = self.state.borrow_mut();
        st.current_job = Some(ActiveJob {
          token: JobToken::Node(index as u32),
          outstanding: self.jobs[index].outstanding.clone(),
          launched: 0,
        });
      }
      let result = thread.resume::<LuaMultiValue>(args);
      {
        let mut st = self.state.borrow_mut();
        if let Some(active) = st.current_job.take() {
          self.jobs[index].launched += active.launched;
        }
      }

      match result {
        Err(err) => {
          error!(target = %self.target_path(index), error = %err, "build callback failed");
          let job = &mut self.jobs[index];
          job.thread_finished = true;
          job.script_failed = true;
          return Ok(());
        }
        Ok(values) => {
          if thread.status() == LuaThreadStatus::Resumable {
            // The callback yielded; every yield is a wait for its own
            // outstanding commands.
            if self.jobs[index].all_commands_received() {
              args = self.take_pending_as_args(index)?;
              continue;
            }
            self.jobs[index].waiting = true;
            return Ok(());
          }
          let job = &mut self.jobs[index];
          job.thread_finished = true;
          job.script_failed = script_failure(&values);
          return Ok(());
        }
      }
    }
  }

  fn take_pending_as_args(&mut self, index: usize) -> LuaResult<LuaMultiValue> {
    let pending = std::mem::take(&mut self.jobs[index].pending);
    let results = self.lua.create_table()?;
    for (position, outcome) in pending.iter().enumerate() {
      results.raw_set(position + 1, completion_table(self.lua, outcome)?)?;
    }
    Ok(LuaMultiValue::from_iter([LuaValue::Table(results)]))
  }

  fn handle_completion(&mut self, completion: Completion) {
    match completion.token {
      JobToken::Node(index) => {
        let index = index as usize;
        if !completion.outcome.ok {
          error!(
            target = %self.target_path(index),
            command = %completion.outcome.command,
            code = ?completion.outcome.exit_code,
            timed_out = completion.outcome.timed_out,
            "command failed"
          );
          self.jobs[index].command_failures += 1;
        }
        self.jobs[index].received += 1;
        self.jobs[index].pending.push(completion.outcome);
      }
      JobToken::Ambient => {
        if !completion.outcome.ok {
          error!(command = %completion.outcome.command, "ambient command failed");
        }
        self.state.borrow_mut().ambient_pending.push(completion.outcome);
      }
    }
  }

  fn resume_and_finalize(&mut self) -> LuaResult<()> {
    for index in 0..self.jobs.len() {
      if !self.jobs[index].started || self.jobs[index].finalized {
        continue;
      }
      if self.jobs[index].waiting && self.jobs[index].all_commands_received() {
        self.jobs[index].waiting = false;
        let args = self.take_pending_as_args(index)?;
        self.pump_job(index, args)?;
      }
      if self.jobs[index].complete() {
        self.finalize(index);
      }
    }
    Ok(())
  }

  fn finalize(&mut self, index: usize) {
    let job = &mut self.jobs[index];
    debug_assert!(!job.finalized);
    job.finalized = true;
    if job.started {
      job.failed = job.script_failed || job.command_failures > 0;
      self.failures += job.command_failures + i64::from(job.script_failed);
    }
    if job.failed && !self.keep_going {
      self.stop_dispatch = true;
    }

    let succeeded = !job.failed && !job.skipped;
    let target_id = self.schedule.order[index];
    if succeeded {
      self.state.borrow_mut().graph.mark_successful(target_id);
    }

    self.finalized += 1;
    for position in 0..self.schedule.dependents[index].len() {
      let dependent = self.schedule.dependents[index][position];
      self.schedule.in_degree[dependent] -= 1;
      if self.schedule.in_degree[dependent] == 0 {
        self.ready.insert(dependent);
      }
    }
  }

  /// Fold a pending abort request into this traversal's accounting: one
  /// failure, counted once, and no further dispatch. In-flight commands
  /// still drain through the normal completion path.
  fn note_abort_request(&mut self) {
    if self.interrupt_counted || !interrupted() {
      return;
    }
    self.interrupt_counted = true;
    self.failures += 1;
    self.stop_dispatch = true;
    warn!("interrupt requested; dispatch stopped, awaiting in-flight work");
  }

  fn mark_visited(&mut self, index: usize) {
    let target_id = self.schedule.order[index];
    self.state.borrow_mut().graph.mark_visited(target_id);
  }

  fn target_path(&self, index: usize) -> String {
    self.state.borrow().graph.path(self.schedule.order[index])
  }
}

/// A callback fails by returning a non-zero integer, a non-true boolean, or
/// raising an error; returning nothing or nil is success.
fn script_failure(values: &LuaMultiValue) -> bool {
  match values.iter().next() {
    Some(LuaValue::Integer(n)) => *n != 0,
    Some(LuaValue::Number(n)) => *n != 0.0,
    Some(LuaValue::Boolean(ok)) => !ok,
    _ => false,
  }
}
