//! Command execution seam

use std::process::Stdio;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use super::CommandLine;
use crate::error::{Error, Result};

/// Combined stdout and stderr of every stage
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub output: String,
}

/// Runs built command lines
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandLine) -> Result<CommandOutput>;
}

/// Spawns each stage as a child process and pipes stdout of one stage
/// into stdin of the next
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    fn spawn(program: &str, args: &[String], piped_stdin: bool) -> Result<Child> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if piped_stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(cmd.spawn()?)
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &CommandLine) -> Result<CommandOutput> {
        let stages = command.stages();
        let mut children = Vec::with_capacity(stages.len());
        let mut copiers = Vec::new();

        for (i, stage) in stages.iter().enumerate() {
            let mut child = Self::spawn(&stage.program, &stage.args, i > 0)?;

            if i > 0 {
                let upstream: &mut Child = children
                    .last_mut()
                    .ok_or_else(|| Error::config("pipeline stage has no upstream"))?;
                let (Some(mut from), Some(mut to)) = (upstream.stdout.take(), child.stdin.take()) else {
                    return Err(Error::config("pipeline stage pipes are not available"));
                };
                copiers.push(tokio::spawn(async move {
                    // stdin closes on drop so the downstream stage sees EOF
                    tokio::io::copy(&mut from, &mut to).await
                }));
            }
            children.push(child);
        }

        let results = join_all(children.into_iter().map(Child::wait_with_output)).await;
        for copier in copiers {
            match copier.await {
                Ok(Ok(bytes)) => debug!(bytes, "Pipe drained"),
                Ok(Err(e)) => debug!(error = %e, "Pipe closed early"),
                Err(e) => warn!(error = %e, "Pipe task failed"),
            }
        }

        let mut output = String::new();
        let mut failed_status = None;
        for result in results {
            let out = result?;
            output.push_str(&String::from_utf8_lossy(&out.stdout));
            output.push_str(&String::from_utf8_lossy(&out.stderr));
            if !out.status.success() && failed_status.is_none() {
                failed_status = Some(out.status.code());
            }
        }

        match failed_status {
            None => Ok(CommandOutput { output }),
            Some(status) => Err(Error::CommandFailed {
                command: command.pipeline(),
                status,
                output: output.trim().to_string(),
            }),
        }
    }
}
