//! Per-sandbox hypervisor subprocess control.
//!
//! One hypervisor process is spawned per sandbox, pointed at a unique
//! control socket. Once the socket appears, a fixed sequence of control-plane
//! calls configures the kernel, root disk, network interface and resource
//! budget, then starts the guest. Any call failing aborts the boot.

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::{
    fs,
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
};

use crate::{
    config::OrchestratorConfig,
    utils::poll_until,
    WarrenError, WarrenResult,
};

mod mac;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use mac::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A booted sandbox hypervisor: the owned subprocess and its control socket.
#[derive(Debug)]
pub struct BootedVm {
    /// The hypervisor subprocess; must be signaled to terminate at teardown.
    pub child: Child,

    /// The control socket path; deleted at teardown.
    pub control_socket_path: PathBuf,
}

/// Boots the per-sandbox hypervisor subprocess.
#[async_trait]
pub trait HypervisorLauncher: Send + Sync {
    /// Spawns and configures a hypervisor for the sandbox, returning the
    /// running process and its control socket.
    async fn boot(
        &self,
        sandbox_id: u32,
        disk_image: &Path,
        device: &str,
        ip: Ipv4Addr,
    ) -> WarrenResult<BootedVm>;
}

/// Hypervisor launcher driving a firecracker-style control API over a UNIX socket.
#[derive(Debug)]
pub struct FirecrackerLauncher {
    /// The orchestrator configuration.
    config: Arc<OrchestratorConfig>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FirecrackerLauncher {
    /// Creates a new launcher.
    pub fn new(config: Arc<OrchestratorConfig>) -> Self {
        Self { config }
    }

    /// Issues one PUT against the control socket, failing on any non-2xx response.
    async fn api_put(&self, socket: &Path, endpoint: &str, body: Value) -> WarrenResult<()> {
        let output = Command::new("curl")
            .args([
                "--unix-socket",
                &socket.display().to_string(),
                "-s",
                "-o",
                "/dev/null",
                "-w",
                "%{http_code}",
                "-X",
                "PUT",
                "-H",
                "Content-Type: application/json",
                "--data",
                &body.to_string(),
                &format!("http://localhost/{}", endpoint),
            ])
            .output()
            .await?;

        if !output.status.success() {
            return Err(WarrenError::BootFailed(format!(
                "control call to {} failed: {}",
                endpoint,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let code = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !code.starts_with('2') {
            return Err(WarrenError::BootFailed(format!(
                "control call to {} returned HTTP {}",
                endpoint, code
            )));
        }

        Ok(())
    }

    /// Drives the fixed configuration sequence against a live control socket.
    async fn configure(
        &self,
        socket: &Path,
        sandbox_id: u32,
        disk_image: &Path,
        device: &str,
        ip: Ipv4Addr,
    ) -> WarrenResult<()> {
        let gateway = self.config.bridge_ip()?;
        let netmask = self.config.get_subnet().mask();

        // Static IP on the kernel command line; one reserved console, panic
        // reboots immediately, no PCI bus to probe.
        let boot_args = format!(
            "console=ttyS0 reboot=k panic=1 pci=off ip={}::{}:{}::eth0:off",
            ip, gateway, netmask
        );

        self.api_put(
            socket,
            "boot-source",
            json!({
                "kernel_image_path": self.config.get_kernel_path(),
                "boot_args": boot_args,
            }),
        )
        .await?;

        self.api_put(
            socket,
            "drives/rootfs",
            json!({
                "drive_id": "rootfs",
                "path_on_host": disk_image,
                "is_root_device": true,
                "is_read_only": false,
            }),
        )
        .await?;

        self.api_put(
            socket,
            "network-interfaces/eth0",
            json!({
                "iface_id": "eth0",
                "host_dev_name": device,
                "guest_mac": guest_mac(sandbox_id),
            }),
        )
        .await?;

        self.api_put(
            socket,
            "machine-config",
            json!({
                "vcpu_count": self.config.get_num_vcpus(),
                "mem_size_mib": self.config.get_ram_mib(),
            }),
        )
        .await?;

        self.api_put(socket, "actions", json!({ "action_type": "InstanceStart" }))
            .await?;

        Ok(())
    }
}

/// Forwards a child's stdout and stderr lines into the tracing stream.
fn forward_output(child: &mut Child, sandbox_id: u32) {
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Result::Ok(Some(line)) = reader.next_line().await {
                tracing::debug!("[vmm-{}/stdout] {}", sandbox_id, line);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Result::Ok(Some(line)) = reader.next_line().await {
                tracing::warn!("[vmm-{}/stderr] {}", sandbox_id, line);
            }
        });
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl HypervisorLauncher for FirecrackerLauncher {
    async fn boot(
        &self,
        sandbox_id: u32,
        disk_image: &Path,
        device: &str,
        ip: Ipv4Addr,
    ) -> WarrenResult<BootedVm> {
        let socket = self.config.socket_path(sandbox_id);
        fs::create_dir_all(self.config.sockets_dir()).await?;
        if fs::try_exists(&socket).await? {
            fs::remove_file(&socket).await?;
        }

        let mut child = Command::new(self.config.get_hypervisor_path())
            .args(["--api-sock", &socket.display().to_string()])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        forward_output(&mut child, sandbox_id);

        let socket_probe = socket.clone();
        let appeared = poll_until(
            *self.config.get_socket_timeout(),
            *self.config.get_socket_poll_interval(),
            move || {
                let socket = socket_probe.clone();
                async move { fs::try_exists(&socket).await.unwrap_or(false) }
            },
        )
        .await;

        if !appeared {
            let _ = child.kill().await;
            let _ = fs::remove_file(&socket).await;
            return Err(WarrenError::AllocationFailed(format!(
                "control socket {} never appeared",
                socket.display()
            )));
        }

        // Once the socket exists, a failed boot must delete it here: the
        // caller only learns the socket path from a successful return.
        if let Err(e) = self
            .configure(&socket, sandbox_id, disk_image, device, ip)
            .await
        {
            let _ = child.kill().await;
            let _ = fs::remove_file(&socket).await;
            return Err(e);
        }

        tracing::info!(
            "booted sandbox {} (pid {})",
            sandbox_id,
            child.id().unwrap_or(0)
        );

        Ok(BootedVm {
            child,
            control_socket_path: socket,
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
