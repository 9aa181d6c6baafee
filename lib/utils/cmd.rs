use std::process::Output;

use tokio::process::Command;

use crate::{WarrenError, WarrenResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs a host command to completion, capturing its output.
///
/// A non-zero exit status is mapped to [`WarrenError::CommandFailed`] carrying
/// the command line and captured stderr, so callers can surface the failing
/// step directly.
pub async fn run_command(program: &str, args: &[&str]) -> WarrenResult<Output> {
    let output = Command::new(program).args(args).output().await?;

    if !output.status.success() {
        return Err(WarrenError::CommandFailed {
            command: format!("{} {}", program, args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(output)
}

/// Like [`run_command`] but only reports whether the command succeeded.
pub async fn command_succeeds(program: &str, args: &[&str]) -> bool {
    Command::new(program)
        .args(args)
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cmd_run_command_captures_stdout() -> anyhow::Result<()> {
        let output = run_command("echo", &["hello"]).await?;
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
        Ok(())
    }

    #[tokio::test]
    async fn test_cmd_run_command_surfaces_failure() {
        let err = run_command("false", &[]).await.unwrap_err();
        assert!(matches!(err, WarrenError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_cmd_command_succeeds() {
        assert!(command_succeeds("true", &[]).await);
        assert!(!command_succeeds("false", &[]).await);
    }
}
