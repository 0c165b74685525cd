use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;

/// Seam between the orchestrator and its subprocess-composed steps (Gate,
/// glossary sync, publish, summary). Production spawns the current binary
/// with a subcommand; tests substitute a recording stub.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `args` to completion and return the exit code. Stdio is
    /// inherited so the child's progress stays visible.
    async fn run(&self, args: &[String]) -> Result<i32>;
}

/// Spawns the running executable itself with a subcommand, keeping the
/// steps language-neutral at the process boundary but shipped as one
/// binary.
pub struct SelfInvoker {
    program: PathBuf,
    timeout: Duration,
}

impl SelfInvoker {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to resolve current executable")?;
        Ok(Self {
            program,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    pub fn with_program(program: PathBuf, timeout_secs: u64) -> Self {
        Self {
            program,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl CommandRunner for SelfInvoker {
    async fn run(&self, args: &[String]) -> Result<i32> {
        let printable = format!("{} {}", self.program.display(), args.join(" "));
        tracing::debug!(command = %printable, "Spawning step subprocess");

        let mut child = Command::new(&self.program)
            .args(args)
            .spawn()
            .with_context(|| format!("Failed to spawn: {printable}"))?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => status.with_context(|| format!("Failed to wait on: {printable}"))?,
            Err(_) => {
                let _ = child.kill().await;
                bail!(
                    "Step timed out after {}s: {printable}",
                    self.timeout.as_secs()
                );
            }
        };

        match status.code() {
            Some(code) => Ok(code),
            None => bail!("Step killed by signal: {printable}"),
        }
    }
}
