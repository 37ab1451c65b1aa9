// src/dispatch.rs
//! Downstream pipeline invocation.
//!
//! `Dispatcher::dispatch` runs the pipeline once under a hard timeout and maps the
//! result onto `completed` / `failed`. It never retries.

use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::counter;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::config::app::DispatchConfig;
use crate::ingest::types::Item;
use crate::ledger::DispatchStatus;

/// Characters of stderr kept for the log.
const STDERR_TAIL_CHARS: usize = 500;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub timed_out: bool,
    pub elapsed: Duration,
    pub stderr_tail: String,
}

/// Opaque, possibly slow and costly downstream process.
#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(&self, item: &Item, score: f32, timeout: Duration) -> Result<ExitInfo>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub status: DispatchStatus,
    pub exit: ExitInfo,
}

impl DispatchOutcome {
    pub fn success(&self) -> bool {
        self.status == DispatchStatus::Completed
    }
}

pub struct Dispatcher {
    runner: Arc<dyn PipelineRunner>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(runner: Arc<dyn PipelineRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Run the pipeline for one item. Timeouts, non-zero exits and runner errors
    /// all come back as `Failed`.
    pub async fn dispatch(&self, item: &Item, score: f32) -> DispatchOutcome {
        let t0 = Instant::now();
        let run = self.runner.run(item, score, self.timeout);
        let exit = match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(exit)) => exit,
            Ok(Err(e)) => ExitInfo {
                code: None,
                timed_out: false,
                elapsed: t0.elapsed(),
                stderr_tail: format!("{e:#}"),
            },
            // dropping the runner future kills a spawned child (kill_on_drop)
            Err(_) => ExitInfo {
                code: None,
                timed_out: true,
                elapsed: t0.elapsed(),
                stderr_tail: String::new(),
            },
        };

        let status = if !exit.timed_out && exit.code == Some(0) {
            DispatchStatus::Completed
        } else {
            DispatchStatus::Failed
        };
        counter!("dispatch_total", "status" => status.as_str()).increment(1);
        DispatchOutcome { status, exit }
    }
}

/// Spawns the configured program with a rendered argument template.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    budget_usd: f64,
}

impl CommandRunner {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        working_dir: Option<PathBuf>,
        budget_usd: f64,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir,
            budget_usd,
        }
    }

    pub fn from_config(cfg: &DispatchConfig, per_item_usd: f64) -> Self {
        Self::new(cfg.command.clone(), cfg.args.clone(), cfg.working_dir.clone(), per_item_usd)
    }
}

/// Substitute `{id}`, `{url}`, `{title}`, `{score}` and `{budget}` in each argument.
pub fn render_args(template: &[String], item: &Item, score: f32, budget_usd: f64) -> Vec<String> {
    let score = format!("{score:.1}");
    let budget = format!("{budget_usd:.2}");
    template
        .iter()
        .map(|a| {
            a.replace("{id}", &item.id)
                .replace("{url}", &item.url)
                .replace("{title}", &item.title)
                .replace("{score}", &score)
                .replace("{budget}", &budget)
        })
        .collect()
}

fn tail_chars(s: &str, n: usize) -> String {
    let s = s.trim_end();
    let count = s.chars().count();
    s.chars().skip(count.saturating_sub(n)).collect()
}

/// Kills the child's process group on drop unless disarmed. Covers both our own
/// timeout and the dispatcher dropping the run future.
struct GroupKill(Option<u32>);

impl GroupKill {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for GroupKill {
    fn drop(&mut self) {
        if let Some(pgid) = self.0.take() {
            if let Err(e) = kill_process_group(pgid) {
                tracing::warn!(pgid, error = %e, "failed to kill pipeline process group");
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) -> std::io::Result<()> {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return Ok(());
    };
    // SAFETY: killpg only sends a signal; the group was created for this child.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl PipelineRunner for CommandRunner {
    async fn run(&self, item: &Item, score: f32, timeout: Duration) -> Result<ExitInfo> {
        let t0 = Instant::now();
        let mut cmd = Command::new(&self.program);
        cmd.args(render_args(&self.args, item, score, self.budget_usd))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // own process group, so a timeout takes the pipeline's children down too
        #[cfg(unix)]
        cmd.process_group(0);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().with_context(|| format!("spawning {}", self.program))?;
        // declared after `child`: dropped first, while the leader is not yet reaped
        let mut group = GroupKill(child.id());
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = stderr.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                group.disarm();
                let status = status.with_context(|| format!("waiting for {}", self.program))?;
                // a grandchild may still hold the pipe; don't block on it
                let stderr = match stderr_task {
                    Some(task) => tokio::time::timeout(Duration::from_secs(1), task)
                        .await
                        .ok()
                        .and_then(|r| r.ok())
                        .unwrap_or_default(),
                    None => String::new(),
                };
                Ok(ExitInfo {
                    code: status.code(),
                    timed_out: false,
                    elapsed: t0.elapsed(),
                    stderr_tail: tail_chars(&stderr, STDERR_TAIL_CHARS),
                })
            }
            Err(_) => {
                drop(group);
                let _ = child.kill().await;
                if let Some(task) = stderr_task {
                    task.abort();
                }
                Ok(ExitInfo {
                    code: None,
                    timed_out: true,
                    elapsed: t0.elapsed(),
                    stderr_tail: String::new(),
                })
            }
        }
    }
}
