//! External data-cleaning step run before each panel update.

use std::path::PathBuf;
use std::process::Command;

use tracing::{debug, error, info};

use crate::config::CleaningConfig;
use crate::{BirdcastError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleaningOutcome {
    Succeeded,
    /// Exited unsuccessfully; `code` is `None` when killed by a signal.
    Failed { code: Option<i32> },
}

impl CleaningOutcome {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

/// The cleaning script invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CleaningStep {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl CleaningStep {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
        }
    }

    pub fn from_config(config: &CleaningConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            working_dir: config.working_dir.clone(),
        }
    }

    /// Run to completion, logging captured output.
    ///
    /// A non-zero exit is an outcome, not an error; only a failure to start
    /// the process is.
    pub fn run(&self) -> Result<CleaningOutcome> {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(ref dir) = self.working_dir {
            command.current_dir(dir);
        }

        info!(program = %self.program, args = ?self.args, "running cleaning step");
        let output = command.output().map_err(|e| {
            BirdcastError::Cleaning(format!("failed to run {}: {}", self.program, e))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stdout.lines().filter(|l| !l.trim().is_empty()) {
            debug!(target: "birdcast::cleaning::stdout", "{}", line);
        }

        if output.status.success() {
            for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
                debug!(target: "birdcast::cleaning::stderr", "{}", line);
            }
            info!("cleaning step succeeded");
            Ok(CleaningOutcome::Succeeded)
        } else {
            let code = output.status.code();
            error!(?code, stderr = %stderr.trim(), "cleaning step failed");
            Ok(CleaningOutcome::Failed { code })
        }
    }
}
