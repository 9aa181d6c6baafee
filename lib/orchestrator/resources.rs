use std::path::PathBuf;

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tokio::{fs, process::Child};

use crate::net::NetworkDeviceManager;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The host resources acquired for one sandbox, released exactly once.
///
/// Each field is populated the moment its resource is allocated, so however
/// far provisioning got before failing, [`SandboxResources::release`] knows
/// exactly what to undo. Every release step tolerates the resource already
/// being gone and never raises; failures are logged and the remaining steps
/// still run.
#[derive(Debug, Default)]
pub(crate) struct SandboxResources {
    /// The owned hypervisor subprocess, when this side spawned it.
    pub(crate) child: Option<Child>,

    /// The hypervisor pid, when only the registry entry is known.
    pub(crate) pid: Option<u32>,

    /// The host-side network device name.
    pub(crate) device: Option<String>,

    /// The private disk image path.
    pub(crate) disk_image: Option<PathBuf>,

    /// The hypervisor control socket path.
    pub(crate) control_socket: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SandboxResources {
    /// Releases every acquired resource: process, device, disk, socket.
    pub(crate) async fn release(&mut self, devices: &dyn NetworkDeviceManager) {
        if let Some(mut child) = self.child.take() {
            match child.kill().await {
                Ok(()) => tracing::info!("hypervisor process terminated"),
                Err(e) => tracing::warn!("hypervisor process already gone: {}", e),
            }
        }

        if let Some(pid) = self.pid.take() {
            match signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => tracing::warn!("failed to signal hypervisor pid {}: {}", pid, e),
            }
        }

        if let Some(device) = self.device.take() {
            devices.destroy_device(&device).await;
        }

        if let Some(disk) = self.disk_image.take() {
            if let Err(e) = fs::remove_file(&disk).await {
                tracing::warn!("disk image {} already gone: {}", disk.display(), e);
            }
        }

        if let Some(socket) = self.control_socket.take() {
            if let Err(e) = fs::remove_file(&socket).await {
                tracing::warn!("control socket {} already gone: {}", socket.display(), e);
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use crate::WarrenResult;

    use super::*;

    #[derive(Debug, Default)]
    struct NullDeviceManager;

    #[async_trait]
    impl NetworkDeviceManager for NullDeviceManager {
        async fn create_device(&self, sandbox_id: u32) -> WarrenResult<String> {
            Ok(format!("null{}", sandbox_id))
        }

        async fn destroy_device(&self, _device: &str) {}
    }

    #[tokio::test]
    async fn test_resources_release_is_idempotent_and_tolerant() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let disk = dir.path().join("disk.ext4");
        tokio::fs::write(&disk, b"image").await?;

        let mut resources = SandboxResources {
            child: None,
            // A pid that certainly refers to no live process.
            pid: Some(i32::MAX as u32 - 1),
            device: Some("null7".to_string()),
            disk_image: Some(disk.clone()),
            // Never created; removal must tolerate its absence.
            control_socket: Some(dir.path().join("missing.sock")),
        };

        let devices = NullDeviceManager;
        resources.release(&devices).await;
        assert!(!disk.exists());

        // A second release is a no-op; everything was taken the first time.
        resources.release(&devices).await;
        assert!(resources.disk_image.is_none());
        assert!(resources.device.is_none());

        Ok(())
    }
}
