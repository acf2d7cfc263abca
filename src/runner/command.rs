// Shell command task runner

use super::{RunContext, RunOutput, RunnerError, TaskRunner};
use crate::utils::tail_lines;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Marker a runner prints to ask for its task to be closed
pub const DEFAULT_CLOSE_MARKER: &str = "<verdict>CLOSE</verdict>";

/// Lines of stdout/stderr kept for diagnostics
const OUTPUT_TAIL_LINES: usize = 50;

/// Runs an external program in the task's workspace.
///
/// Arguments may contain `{task_id}`, `{workspace}` and `{branch}`
/// placeholders. The same values are exported as `RALPH_TASK_ID`,
/// `RALPH_WORKSPACE` and `RALPH_BRANCH`.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    close_marker: String,
    env: Vec<(String, String)>,
}

impl CommandRunner {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            close_marker: DEFAULT_CLOSE_MARKER.to_string(),
            env: Vec::new(),
        }
    }

    pub fn with_close_marker(mut self, marker: impl Into<String>) -> Self {
        self.close_marker = marker.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Resolve the program: paths are made absolute against the current
    /// directory (the child runs in the workspace), bare names go through PATH
    pub fn resolve_program(&self) -> Result<PathBuf, RunnerError> {
        let path = Path::new(&self.program);
        if path.is_absolute() {
            return Ok(path.to_path_buf());
        }
        if path.components().count() > 1 {
            let cwd = std::env::current_dir()?;
            return Ok(cwd.join(path));
        }
        which::which(&self.program).map_err(|_| RunnerError::NotFound(self.program.clone()))
    }

    fn expand(template: &str, ctx: &RunContext) -> String {
        template
            .replace("{task_id}", &ctx.task.id)
            .replace("{workspace}", &ctx.workspace.path.to_string_lossy())
            .replace("{branch}", &ctx.workspace.branch)
    }

    async fn execute(&self, ctx: RunContext) -> Result<RunOutput, RunnerError> {
        let program = self.resolve_program()?;
        let args: Vec<String> = self.args.iter().map(|a| Self::expand(a, &ctx)).collect();

        log::debug!(
            "[CommandRunner] Running {:?} {:?} for task {}",
            program,
            args,
            ctx.task.id
        );

        let mut cmd = Command::new(&program);
        cmd.args(&args)
            .current_dir(&ctx.workspace.path)
            .env("RALPH_TASK_ID", &ctx.task.id)
            .env("RALPH_WORKSPACE", &ctx.workspace.path)
            .env("RALPH_BRANCH", &ctx.workspace.branch)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| RunnerError::Spawn {
            program: program.clone(),
            source,
        })?;

        let task_id = ctx.task.id.clone();
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                if let Err(e) = stderr.read_to_end(&mut buf).await {
                    log::debug!("[CommandRunner] Reading stderr of task {} failed: {}", task_id, e);
                }
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        // Runner output is arbitrary bytes; split on newlines and decode lossily
        let mut stdout_lines = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            let mut segments = BufReader::new(stdout).split(b'\n');
            loop {
                tokio::select! {
                    _ = ctx.cancel.cancelled() => {
                        if let Err(e) = child.kill().await {
                            log::debug!("[CommandRunner] Kill of task {} failed: {}", ctx.task.id, e);
                        }
                        return Err(RunnerError::Cancelled);
                    }
                    segment = segments.next_segment() => match segment? {
                        Some(bytes) => {
                            let line = decode_line(&bytes);
                            if line.contains(&self.close_marker) && !ctx.verdict.is_raised() {
                                log::info!("[CommandRunner] Task {} asked to be closed", ctx.task.id);
                                ctx.verdict.raise();
                            }
                            stdout_lines.push(line);
                            if stdout_lines.len() > OUTPUT_TAIL_LINES * 2 {
                                stdout_lines.drain(..OUTPUT_TAIL_LINES);
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        let status = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    log::debug!("[CommandRunner] Kill of task {} failed: {}", ctx.task.id, e);
                }
                return Err(RunnerError::Cancelled);
            }
            status = child.wait() => status?,
        };

        let stderr = match stderr_task {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };
        let stdout = tail_lines(&stdout_lines.join("\n"), OUTPUT_TAIL_LINES);
        let stderr_tail = tail_lines(&stderr, OUTPUT_TAIL_LINES);

        if status.success() {
            return Ok(RunOutput::succeeded(stdout));
        }

        let reason = format!(
            "{} exited with {}: {}",
            program.display(),
            status,
            tail_lines(stderr.trim(), 5)
        );
        let output = if stderr_tail.is_empty() {
            stdout
        } else {
            format!("{}\n{}", stdout, stderr_tail)
        };
        Ok(RunOutput {
            exit_code: status.code(),
            ..RunOutput::failed(reason, output)
        })
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

impl TaskRunner for CommandRunner {
    fn run(&self, ctx: RunContext) -> BoxFuture<'_, Result<RunOutput, RunnerError>> {
        self.execute(ctx).boxed()
    }
}
