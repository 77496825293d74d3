//! forge: a build engine driven by Lua buildfiles.
//!
//! The buildfile declares targets and their dependencies; `forge` binds
//! them to the file system, traverses the graph in dependency order, and
//! dispatches build actions to worker threads. Goals are target paths; with
//! no goals the whole graph is built.

mod output;

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::Parser;
use tracing::{warn, Level};
use tracing_subscriber::FmtSubscriber;

use forge_lib::scheduler::register_sigint;
use forge_lib::{Forge, ForgeOptions};

/// Name of the serialized graph cache in the root working directory.
const CACHE_FILENAME: &str = ".forge";

#[derive(Parser)]
#[command(name = "forge")]
#[command(version, about = "A build engine driven by Lua buildfiles")]
struct Cli {
  /// Buildfile to load
  #[arg(short, long, env = "FORGE_BUILDFILE", default_value = "forge.lua")]
  file: PathBuf,

  /// Worker threads for build commands (default: hardware cores)
  #[arg(short, long, env = "FORGE_JOBS")]
  jobs: Option<usize>,

  /// Keep building independent targets after a failure
  #[arg(short = 'k', long)]
  keep_going: bool,

  /// Enable verbose output
  #[arg(short, long)]
  verbose: bool,

  /// Target paths to build; the whole graph when omitted
  goals: Vec<String>,
}

fn main() {
  let cli = Cli::parse();

  let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
  FmtSubscriber::builder()
    .with_max_level(level)
    .with_target(false)
    .without_time()
    .init();

  register_sigint();

  match run(&cli) {
    Ok(0) => {
      output::print_success("build succeeded");
      std::process::exit(0);
    }
    Ok(failures) => {
      output::print_error(&format!("build failed with {failures} failure(s)"));
      std::process::exit(failures.min(255) as i32);
    }
    Err(err) => {
      output::print_error(&format!("{err:#}"));
      std::process::exit(1);
    }
  }
}

fn run(cli: &Cli) -> Result<i64> {
  let mut options = ForgeOptions::default();
  if let Some(jobs) = cli.jobs {
    options.jobs = jobs;
  }
  options.keep_going = cli.keep_going;

  let forge = Forge::new(options).context("failed to start the engine")?;

  // A corrupt or unreadable cache is rebuilt, not fatal.
  if let Err(err) = forge.load_cache(Path::new(CACHE_FILENAME)) {
    warn!(error = %err, "ignoring unusable graph cache");
  }

  output::print_status(&format!("loading {}", cli.file.display()));
  let errors = forge
    .buildfile(&cli.file)
    .with_context(|| format!("failed to load '{}'", cli.file.display()))?;
  if errors > 0 {
    return Ok(errors as i64);
  }

  let mut failures = 0i64;
  if cli.goals.is_empty() {
    failures += forge.build(None)?;
  } else {
    for goal in &cli.goals {
      output::print_status(&format!("building {goal}"));
      failures += forge.build(Some(goal))?;
    }
  }

  if let Err(err) = forge.save_cache() {
    warn!(error = %err, "failed to save the graph cache");
  }

  Ok(failures)
}
