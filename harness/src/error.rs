//! Harness-specific error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Command '{command}' failed: ret = {code:?}, stdout = {stdout}, stderr = {stderr}")]
    Run {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("Container provisioning failed after {attempts} attempt(s): {message}")]
    ContainerProvisioning { attempts: u32, message: String },

    #[error("Container operation not valid in state {state}: {operation}")]
    ContainerState { state: String, operation: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Worker spawn failed: {message}")]
    WorkerSpawn { message: String },

    #[error("Worker PID handoff failed for token '{token}': {message}")]
    PidHandoff { token: String, message: String },

    #[error("Test unit failed: {cause}")]
    UnitFailure { cause: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HarnessError {
    pub fn config(message: impl Into<String>) -> Self {
        HarnessError::Config {
            message: message.into(),
        }
    }

    /// Exit code the failed command reported, if it ran at all.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            HarnessError::Run { code, .. } => *code,
            _ => None,
        }
    }

    /// Stderr of the failed command, for units that pattern-match on an
    /// expected failure mode.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            HarnessError::Run { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
