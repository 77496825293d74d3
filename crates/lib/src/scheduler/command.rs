//! Background command execution on worker threads.
//!
//! Commands inherit the parent environment with the spec's variables
//! overlaid, capture stdout and stderr, and may carry a timeout. On expiry a
//! watchdog thread kills the child (unix: SIGKILL) and the completion is
//! marked timed out. Failures never cross the thread boundary as panics;
//! everything travels in the returned [`CommandOutcome`].

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandSpec {
  pub command: String,
  pub arguments: Vec<String>,
  pub environment: Vec<(String, String)>,
  pub directory: Option<PathBuf>,
  pub timeout: Option<Duration>,
}

impl CommandSpec {
  pub fn new(command: impl Into<String>) -> CommandSpec {
    CommandSpec {
      command: command.into(),
      arguments: Vec::new(),
      environment: Vec::new(),
      directory: None,
      timeout: None,
    }
  }
}

#[derive(Debug, Clone)]
pub struct CommandOutcome {
  pub command: String,
  pub ok: bool,
  pub exit_code: Option<i32>,
  pub stdout: String,
  pub stderr: String,
  pub timed_out: bool,
  pub elapsed: Duration,
}

/// Run a command to completion and describe what happened.
pub fn run(spec: &CommandSpec) -> CommandOutcome {
  let start = Instant::now();
  debug!(command = %spec.command, "spawning command");

  let mut command = Command::new(&spec.command);
  command
    .args(&spec.arguments)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());
  for (key, value) in &spec.environment {
    command.env(key, value);
  }
  if let Some(directory) = &spec.directory {
    command.current_dir(directory);
  }

  let child = match command.spawn() {
    Ok(child) => child,
    Err(err) => {
      return CommandOutcome {
        command: spec.command.clone(),
        ok: false,
        exit_code: None,
        stdout: String::new(),
        stderr: format!("failed to spawn '{}': {err}", spec.command),
        timed_out: false,
        elapsed: start.elapsed(),
      };
    }
  };

  let finished = Arc::new(AtomicBool::new(false));
  let timed_out = Arc::new(AtomicBool::new(false));
  let watchdog = spec.timeout.map(|timeout| {
    let pid = child.id();
    let finished = finished.clone();
    let timed_out = timed_out.clone();
    std::thread::spawn(move || {
      let deadline = Instant::now() + timeout;
      while !finished.load(Ordering::Acquire) {
        if Instant::now() >= deadline {
          timed_out.store(true, Ordering::Release);
          kill(pid);
          return;
        }
        std::thread::sleep(Duration::from_millis(10));
      }
    })
  });

  let output = child.wait_with_output();
  finished.store(true, Ordering::Release);
  if let Some(watchdog) = watchdog {
    let _ = watchdog.join();
  }

  let timed_out = timed_out.load(Ordering::Acquire);
  match output {
    Ok(output) => CommandOutcome {
      command: spec.command.clone(),
      ok: output.status.success() && !timed_out,
      exit_code: output.status.code(),
      stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
      stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
      timed_out,
      elapsed: start.elapsed(),
    },
    Err(err) => CommandOutcome {
      command: spec.command.clone(),
      ok: false,
      exit_code: None,
      stdout: String::new(),
      stderr: format!("failed to wait for '{}': {err}", spec.command),
      timed_out,
      elapsed: start.elapsed(),
    },
  }
}

#[cfg(unix)]
fn kill(pid: u32) {
  // Safety: sending a signal to a process id we spawned.
  unsafe {
    libc::kill(pid as libc::pid_t, libc::SIGKILL);
  }
}

#[cfg(not(unix))]
fn kill(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
  use super::*;

  #[test]
  fn successful_command_captures_stdout() {
    let mut spec = CommandSpec::new("/bin/sh");
    spec.arguments = vec!["-c".to_string(), "echo hello".to_string()];
    let outcome = run(&spec);
    assert!(outcome.ok);
    assert_eq!(outcome.exit_code, Some(0));
    assert_eq!(outcome.stdout.trim(), "hello");
  }

  #[test]
  fn failing_command_reports_exit_code_and_stderr() {
    let mut spec = CommandSpec::new("/bin/sh");
    spec.arguments = vec!["-c".to_string(), "echo oops >&2; exit 3".to_string()];
    let outcome = run(&spec);
    assert!(!outcome.ok);
    assert_eq!(outcome.exit_code, Some(3));
    assert_eq!(outcome.stderr.trim(), "oops");
  }

  #[test]
  fn unknown_program_fails_to_spawn() {
    let spec = CommandSpec::new("/definitely/not/a/program");
    let outcome = run(&spec);
    assert!(!outcome.ok);
    assert!(outcome.stderr.contains("failed to spawn"));
  }

  #[test]
  fn environment_variables_are_overlaid() {
    let mut spec = CommandSpec::new("/bin/sh");
    spec.arguments = vec!["-c".to_string(), "echo $FORGE_TEST_VAR".to_string()];
    spec.environment = vec![("FORGE_TEST_VAR".to_string(), "value".to_string())];
    let outcome = run(&spec);
    assert_eq!(outcome.stdout.trim(), "value");
  }

  #[test]
  fn timeout_kills_the_command() {
    let mut spec = CommandSpec::new("/bin/sh");
    spec.arguments = vec!["-c".to_string(), "sleep 5".to_string()];
    spec.timeout = Some(Duration::from_millis(100));
    let outcome = run(&spec);
    assert!(!outcome.ok);
    assert!(outcome.timed_out);
    assert!(outcome.elapsed < Duration::from_secs(4));
  }
}
