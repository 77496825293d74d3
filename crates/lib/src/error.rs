//! Error taxonomy for the engine.
//!
//! Two failure kinds never appear here by design: bind failures and command
//! failures are counted and returned to the script as integers (commands
//! travel as completion values across the worker boundary, never as
//! errors). The variants below cover everything that aborts an operation
//! outright. Errors that cross into the Lua runtime are converted with
//! [`mlua::Error::external`] so scripts see the display message.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForgeError {
  /// An error raised by the script runtime.
  #[error("script error: {0}")]
  Script(String),

  /// The dependency graph contains a cycle.
  #[error("dependency cycle detected: {}", path.join(" -> "))]
  CycleDetected { path: Vec<String> },

  /// A target was re-declared with a different prototype.
  #[error("target '{path}' already declared with prototype '{existing}' (requested '{requested}')")]
  PrototypeConflict {
    path: String,
    existing: String,
    requested: String,
  },

  /// `postorder` was invoked while a traversal was already running.
  #[error("postorder called from within another bind or postorder traversal")]
  NestedTraversal,

  /// An operating-system error, with the operation that hit it.
  #[error("{message}: {source}")]
  Io {
    message: String,
    #[source]
    source: std::io::Error,
  },

  /// A saved graph file failed validation.
  #[error("graph file '{}' is corrupt: {reason}", path.display())]
  CorruptGraph { path: PathBuf, reason: String },
}

impl ForgeError {
  pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
    ForgeError::Io {
      message: message.into(),
      source,
    }
  }
}

impl From<ForgeError> for mlua::Error {
  fn from(err: ForgeError) -> Self {
    mlua::Error::external(err)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cycle_messages_name_the_path() {
    let err = ForgeError::CycleDetected {
      path: vec!["/a".to_string(), "/b".to_string(), "/a".to_string()],
    };
    assert_eq!(err.to_string(), "dependency cycle detected: /a -> /b -> /a");
  }

  #[test]
  fn script_errors_carry_the_message_through_mlua() {
    let err: mlua::Error = ForgeError::NestedTraversal.into();
    assert!(err.to_string().contains("within another"));
  }
}
