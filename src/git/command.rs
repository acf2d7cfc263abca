//! The `git` executable as a subprocess
//!
//! Each invocation is bounded by a timeout; the child is killed when the
//! timeout fires (the future is dropped and the child was spawned with
//! `kill_on_drop`).

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use super::GitError;

/// Captured result of one git invocation
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Non-empty stdout lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Runs git commands in a fixed directory
#[derive(Debug, Clone)]
pub struct GitCli {
    dir: PathBuf,
    timeout: Duration,
}

impl GitCli {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Same timeout, different working directory
    pub fn with_dir(&self, dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            timeout: self.timeout,
        }
    }

    /// Run git and capture its output. A non-zero exit is not an error here;
    /// callers that care use [`GitCli::run`].
    pub async fn output<I, S>(&self, args: I) -> Result<GitOutput, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let command = describe(&args);
        log::debug!("[Git] git {} (in {})", command, self.dir.display());

        let mut cmd = Command::new("git");
        cmd.args(&args)
            .current_dir(&self.dir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("GIT_MERGE_AUTOEDIT", "no")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(GitError::Spawn(e)),
            Err(_) => {
                log::warn!(
                    "[Git] git {} timed out after {:?} (in {})",
                    command,
                    self.timeout,
                    self.dir.display()
                );
                return Err(GitError::Timeout {
                    command,
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        Ok(GitOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run git and fail on a non-zero exit. Returns stdout.
    pub async fn run<I, S>(&self, args: I) -> Result<String, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        let output = self.output(&args).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(GitError::CommandFailed {
                command: describe(&args),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Whether a revision resolves (`git rev-parse -q --verify`)
    pub async fn rev_parse(&self, rev: &str) -> Result<Option<String>, GitError> {
        let output = self.output(["rev-parse", "-q", "--verify", rev]).await?;
        if output.success() {
            Ok(Some(output.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    pub async fn current_branch(&self) -> Result<String, GitError> {
        let out = self.run(["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }
}

fn describe(args: &[OsString]) -> String {
    args.iter()
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}
