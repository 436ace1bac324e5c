//! Sandbox runtime invocation contract

use crate::error::{AgentError, AgentResult};
use std::path::PathBuf;

/// External executable that runs job images
///
/// Invoked as `<binary> exec [--bind src:dst[,src:dst...]] <image> <command...>`.
#[derive(Debug, Clone)]
pub struct SandboxRuntime {
    binary: String,
}

impl SandboxRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Resolve the executable, searching `PATH` for bare names
    ///
    /// Resolved on every call so a runtime installed after start-up is found.
    pub fn locate(&self) -> AgentResult<PathBuf> {
        which::which(&self.binary).map_err(|_| AgentError::RuntimeNotFound {
            name: self.binary.clone(),
        })
    }

    /// Arguments for running `command` inside `image`
    pub fn exec_args(bind: Option<&str>, image: &str, command: &[String]) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(bind) = bind {
            args.push("--bind".to_string());
            args.push(bind.to_string());
        }
        args.push(image.to_string());
        args.extend(command.iter().cloned());
        args
    }
}
