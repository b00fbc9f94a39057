//! Bounded subprocess driver shared by the resolvers and the source fetcher.
//!
//! Native tooling (`go`, `git`) is driven through a current-thread tokio
//! runtime so every invocation carries a hard timeout; a child that outlives
//! its budget is killed rather than left to hang a worker.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tracing::trace;

/// One subprocess invocation with an explicit time budget.
pub struct Invocation {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            timeout,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Runs to completion, enforcing the timeout. The caller inspects the
    /// exit status; a non-zero exit is not an error at this layer.
    pub fn run(self) -> Result<Output> {
        let program = self.program.clone();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to build subprocess runtime")?;

        trace!(program = %program.display(), args = ?self.args, "running subprocess");
        let mut command = tokio::process::Command::new(&self.program);
        command.args(&self.args).kill_on_drop(true);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let output = runtime
            .block_on(async { tokio::time::timeout(self.timeout, command.output()).await })
            .map_err(|_| {
                anyhow!(
                    "`{}` timed out after {}s",
                    program.display(),
                    self.timeout.as_secs()
                )
            })?
            .with_context(|| format!("failed to invoke `{}`", program.display()))?;
        Ok(output)
    }
}

/// Lossy stderr of a finished subprocess, trimmed for error messages.
#[must_use]
pub fn stderr_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Whether a subprocess error message came from the timeout bound.
#[must_use]
pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.to_string().contains("timed out after")
}

/// Copies a directory tree, preserving relative layout.
pub fn copy_tree(source: &Path, dest: &Path) -> Result<u64> {
    let mut copied = 0u64;
    for entry in walkdir::WalkDir::new(source).sort_by_file_name() {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .context("walked entry escaped its root")?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("failed to copy {}", entry.path().display()))?;
            copied += 1;
        }
    }
    Ok(copied)
}
