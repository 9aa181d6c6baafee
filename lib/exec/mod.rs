//! Remote execution inside a booted guest.
//!
//! The bridge polls for SSH readiness, uploads the task payload byte-safe
//! over a dedicated copy channel (never inline shell interpolation), runs the
//! fixed in-guest entry script under the execution budget, and copies mutated
//! mounts back to the host afterwards.

use std::{net::Ipv4Addr, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::{
    fs,
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    process::Command,
    time,
};

use crate::{
    config::{Mount, OrchestratorConfig},
    stage::HostKeypair,
    utils::{poll_until, GUEST_ENTRY_PATH, GUEST_PAYLOAD_PATH, GUEST_STAGE_STAMP, GUEST_WORKSPACE_DIR},
    WarrenError, WarrenResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The captured outcome of one in-guest task execution.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    /// The captured standard output of the task.
    pub stdout: String,

    /// The exit code the task returned.
    pub exit_code: i32,
}

/// Executes tasks inside a booted guest and moves results back out.
#[async_trait]
pub trait GuestExecutor: Send + Sync {
    /// Waits until the guest answers a trivial authenticated command.
    async fn await_ready(&self, ip: Ipv4Addr) -> WarrenResult<()>;

    /// Uploads the task payload and runs it under the given budget.
    async fn execute(
        &self,
        sandbox_id: u32,
        ip: Ipv4Addr,
        task: &str,
        timeout: Duration,
    ) -> WarrenResult<ExecOutcome>;

    /// Best-effort list of guest paths the task modified; never fails.
    async fn collect_changed_paths(&self, ip: Ipv4Addr) -> Vec<String>;

    /// Copies every non-read-only mount's guest tree back over its host path.
    ///
    /// A failure on one mount is logged and does not abort the others; the
    /// sandbox is about to be destroyed regardless.
    async fn write_back(&self, ip: Ipv4Addr, mounts: &[Mount]);
}

/// Guest executor backed by the host `ssh`/`scp` tools.
#[derive(Debug)]
pub struct SshExecutor {
    /// The orchestrator configuration.
    config: Arc<OrchestratorConfig>,

    /// The host keypair authorized inside every guest.
    keypair: Arc<HostKeypair>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SshExecutor {
    /// Creates a new executor.
    pub fn new(config: Arc<OrchestratorConfig>, keypair: Arc<HostKeypair>) -> Self {
        Self { config, keypair }
    }

    /// Common options for non-interactive ssh/scp against an ephemeral guest.
    async fn transport_args(&self) -> WarrenResult<Vec<String>> {
        let material = self.keypair.material().await?;
        Ok(vec![
            "-i".to_string(),
            material.get_private_key_path().display().to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=2".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
        ])
    }

    fn remote(&self, ip: Ipv4Addr) -> String {
        format!("{}@{}", self.config.get_ssh_user(), ip)
    }

    /// Runs a remote command to completion, returning `(stdout, exit_code)`.
    async fn ssh_output(&self, ip: Ipv4Addr, command: &str) -> WarrenResult<(String, i32)> {
        let mut args = self.transport_args().await?;
        args.push(self.remote(ip));
        args.push(command.to_string());

        let output = Command::new("ssh").args(&args).output().await?;
        Ok((
            String::from_utf8_lossy(&output.stdout).to_string(),
            output.status.code().unwrap_or(-1),
        ))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads at most `limit` bytes from `reader`.
///
/// Stops reading the moment the budget is exceeded and reports it as an
/// error, without waiting for the writer to finish or exit.
async fn read_bounded<R>(reader: R, limit: usize) -> WarrenResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut bounded = reader.take(limit as u64 + 1);
    bounded.read_to_end(&mut buf).await?;

    if buf.len() > limit {
        return Err(WarrenError::OutputBudgetExceeded { limit });
    }

    Ok(buf)
}

/// Extracts paths from `git status --porcelain` output.
pub fn parse_porcelain(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| line[3..].trim().to_string())
        .filter(|path| !path.is_empty())
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl GuestExecutor for SshExecutor {
    async fn await_ready(&self, ip: Ipv4Addr) -> WarrenResult<()> {
        let deadline = *self.config.get_boot_timeout();
        let transport = self.transport_args().await?;
        let remote = self.remote(ip);

        let ready = poll_until(deadline, *self.config.get_ready_poll_interval(), move || {
            let transport = transport.clone();
            let remote = remote.clone();
            async move {
                Command::new("ssh")
                    .args(&transport)
                    .arg(&remote)
                    .arg("true")
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .map(|status| status.success())
                    .unwrap_or(false)
            }
        })
        .await;

        if !ready {
            return Err(WarrenError::ReadinessTimeout {
                ip,
                waited: deadline,
            });
        }

        Ok(())
    }

    async fn execute(
        &self,
        sandbox_id: u32,
        ip: Ipv4Addr,
        task: &str,
        timeout: Duration,
    ) -> WarrenResult<ExecOutcome> {
        // Spool the payload to disk and upload it whole; the task text never
        // touches a shell command line, so metacharacters survive intact.
        fs::create_dir_all(self.config.spool_dir()).await?;
        let payload = self
            .config
            .spool_dir()
            .join(format!("task-{}.payload", sandbox_id));
        fs::write(&payload, task).await?;

        let mut scp_args = self.transport_args().await?;
        scp_args.push(payload.display().to_string());
        scp_args.push(format!("{}:{}", self.remote(ip), GUEST_PAYLOAD_PATH));

        let upload = Command::new("scp").args(&scp_args).output().await?;
        let _ = fs::remove_file(&payload).await;
        if !upload.status.success() {
            return Err(WarrenError::CommandFailed {
                command: "scp task payload".to_string(),
                stderr: String::from_utf8_lossy(&upload.stderr).trim().to_string(),
            });
        }

        let mut args = self.transport_args().await?;
        args.push(self.remote(ip));
        args.push(format!("{} {}", GUEST_ENTRY_PATH, GUEST_PAYLOAD_PATH));

        let mut child = Command::new("ssh")
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Forward guest stderr into the tracing stream as it arrives.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut reader = BufReader::new(stderr).lines();
                while let Result::Ok(Some(line)) = reader.next_line().await {
                    tracing::debug!("[guest-{}/stderr] {}", sandbox_id, line);
                }
            });
        }

        let stdout = child.stdout.take().unwrap();
        let limit = *self.config.get_max_output_bytes();

        // The budget check sits before the wait: a guest that keeps writing
        // past the limit never exits on its own, so the overflow must fail
        // the run immediately rather than ride out the execution timeout.
        let capture = async {
            let buf = read_bounded(stdout, limit).await?;
            let status = child.wait().await?;
            crate::Ok((buf, status))
        };

        match time::timeout(timeout, capture).await {
            Err(_) => {
                let _ = child.kill().await;
                Err(WarrenError::ExecutionTimeout { limit: timeout })
            }
            Result::Ok(Err(e)) => {
                // The guest side may still be running and writing.
                let _ = child.kill().await;
                Err(e)
            }
            Result::Ok(Result::Ok((buf, status))) => Ok(ExecOutcome {
                stdout: String::from_utf8_lossy(&buf).to_string(),
                exit_code: status.code().unwrap_or(-1),
            }),
        }
    }

    async fn collect_changed_paths(&self, ip: Ipv4Addr) -> Vec<String> {
        // Version control first, mtime scan second; both are telemetry only.
        let porcelain = format!("cd {} && git status --porcelain", GUEST_WORKSPACE_DIR);
        match self.ssh_output(ip, &porcelain).await {
            Result::Ok((output, 0)) => return parse_porcelain(&output),
            Result::Ok(_) | Err(_) => {}
        }

        let scan = format!(
            "find {} -newer /{} -type f 2>/dev/null",
            GUEST_WORKSPACE_DIR, GUEST_STAGE_STAMP
        );
        match self.ssh_output(ip, &scan).await {
            Result::Ok((output, 0)) => output
                .lines()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect(),
            Result::Ok(_) | Err(_) => Vec::new(),
        }
    }

    async fn write_back(&self, ip: Ipv4Addr, mounts: &[Mount]) {
        for mount in mounts.iter().filter(|mount| !mount.is_read_only()) {
            let transport = match self.transport_args().await {
                Result::Ok(args) => args,
                Err(e) => {
                    tracing::error!("write-back skipped, keypair unavailable: {}", e);
                    return;
                }
            };

            let mut args = transport;
            args.push("-r".to_string());
            args.push(format!("{}:{}/.", self.remote(ip), mount.get_guest()));
            args.push(mount.get_host().display().to_string());

            let copy = Command::new("scp").args(&args).output();
            match time::timeout(*self.config.get_writeback_timeout(), copy).await {
                Result::Ok(Result::Ok(output)) if output.status.success() => {
                    tracing::info!("wrote back mount {}", mount);
                }
                Result::Ok(Result::Ok(output)) => {
                    tracing::warn!(
                        "write-back of {} failed: {}",
                        mount,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                Result::Ok(Err(e)) => {
                    tracing::warn!("write-back of {} failed: {}", mount, e);
                }
                Err(_) => {
                    tracing::warn!("write-back of {} timed out", mount);
                }
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_porcelain_parsing() {
        let output = " M src/main.rs\n?? notes.txt\nA  added.rs\n";
        assert_eq!(
            parse_porcelain(output),
            vec!["src/main.rs", "notes.txt", "added.rs"]
        );
    }

    #[test]
    fn test_exec_porcelain_empty_output() {
        assert!(parse_porcelain("").is_empty());
        assert!(parse_porcelain("\n\n").is_empty());
    }

    #[tokio::test]
    async fn test_exec_bounded_read_accepts_output_within_budget() -> anyhow::Result<()> {
        let data = vec![7u8; 64];
        assert_eq!(read_bounded(&data[..], 64).await?.len(), 64);
        assert_eq!(read_bounded(&data[..], 65).await?.len(), 64);

        let err = read_bounded(&data[..], 63).await.unwrap_err();
        assert!(matches!(err, WarrenError::OutputBudgetExceeded { limit: 63 }));
        Ok(())
    }

    #[tokio::test]
    async fn test_exec_output_budget_trips_promptly_for_unbounded_writer() -> anyhow::Result<()> {
        // A writer that never stops and never exits; the budget must trip
        // as soon as it is exceeded, not after an execution timeout.
        let mut child = Command::new("yes")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child.stdout.take().unwrap();

        let result = time::timeout(Duration::from_secs(5), read_bounded(stdout, 1024)).await?;
        assert!(matches!(
            result.unwrap_err(),
            WarrenError::OutputBudgetExceeded { limit: 1024 }
        ));

        let _ = child.kill().await;
        Ok(())
    }
}
