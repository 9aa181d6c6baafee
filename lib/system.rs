//! Host infrastructure requirements.
//!
//! Checked once at startup; a missing binary, image or bridge is fatal to
//! starting the service at all rather than a per-task error.

use tokio::fs;

use crate::{config::OrchestratorConfig, utils::command_succeeds, WarrenError, WarrenResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Host binaries every sandbox run shells out to.
const REQUIRED_BINARIES: &[&str] = &["ip", "mount", "umount", "curl", "ssh", "scp", "ssh-keygen"];

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Verifies every host prerequisite the orchestrator depends on.
pub async fn check_host_requirements(config: &OrchestratorConfig) -> WarrenResult<()> {
    for binary in REQUIRED_BINARIES {
        which::which(binary).map_err(|_| {
            WarrenError::InfrastructureMissing(format!("required binary `{}` not on PATH", binary))
        })?;
    }

    for (what, path) in [
        ("hypervisor binary", config.get_hypervisor_path()),
        ("guest kernel", config.get_kernel_path()),
        ("base disk image", config.get_base_image_path()),
    ] {
        if !fs::try_exists(path).await? {
            return Err(WarrenError::InfrastructureMissing(format!(
                "{} not found at {}",
                what,
                path.display()
            )));
        }
    }

    if !command_succeeds("ip", &["link", "show", config.get_bridge_name()]).await {
        return Err(WarrenError::InfrastructureMissing(format!(
            "bridge device {} does not exist",
            config.get_bridge_name()
        )));
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
