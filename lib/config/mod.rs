//! Configuration types for the sandbox orchestrator.

use std::{net::Ipv4Addr, path::PathBuf, time::Duration};

use getset::Getters;
use ipnetwork::Ipv4Network;
use typed_builder::TypedBuilder;

use crate::{
    utils::{
        get_warren_home_path, IMAGES_SUBDIR, KEYS_SUBDIR, LOG_SUBDIR, SOCKETS_SUBDIR, SPOOL_SUBDIR,
        STAGING_SUBDIR,
    },
    WarrenError, WarrenResult,
};

mod defaults;
mod mount;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use mount::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Configuration for the sandbox orchestrator.
///
/// Everything here is fixed for the lifetime of the orchestrator. Per-task
/// tuning is limited to the execution timeout passed with each task; resource
/// budgets and network layout are deliberately not caller-tunable.
///
/// ## Examples
///
/// ```
/// use warren::config::OrchestratorConfig;
///
/// let config = OrchestratorConfig::builder()
///     .hypervisor_path("/usr/bin/firecracker")
///     .kernel_path("/var/lib/warren/vmlinux")
///     .base_image_path("/var/lib/warren/base.ext4")
///     .build();
///
/// assert_eq!(config.get_bridge_name(), "warren0");
/// ```
#[derive(Debug, Clone, Getters, TypedBuilder)]
#[getset(get = "pub with_prefix")]
pub struct OrchestratorConfig {
    /// The path to the hypervisor binary spawned once per sandbox.
    #[builder(setter(into))]
    hypervisor_path: PathBuf,

    /// The path to the guest kernel image.
    #[builder(setter(into))]
    kernel_path: PathBuf,

    /// The path to the shared, read-only base disk image.
    #[builder(setter(into))]
    base_image_path: PathBuf,

    /// The directory all warren state lives under.
    #[builder(default = get_warren_home_path(), setter(into))]
    home_dir: PathBuf,

    /// The bridge device sandbox interfaces are enslaved to.
    #[builder(default = DEFAULT_BRIDGE_NAME.to_string(), setter(into))]
    bridge_name: String,

    /// The private subnet sandbox addresses are derived from.
    #[builder(default = default_subnet())]
    subnet: Ipv4Network,

    /// The DNS resolver written into guest network configuration.
    #[builder(default = DEFAULT_GUEST_DNS.parse().expect("default dns is valid"))]
    guest_dns: Ipv4Addr,

    /// The user remote commands run as inside the guest.
    #[builder(default = DEFAULT_SSH_USER.to_string(), setter(into))]
    ssh_user: String,

    /// The number of vCPUs given to every sandbox.
    #[builder(default = DEFAULT_NUM_VCPUS)]
    num_vcpus: u8,

    /// The amount of RAM in MiB given to every sandbox.
    #[builder(default = DEFAULT_RAM_MIB)]
    ram_mib: u32,

    /// How long to wait for the hypervisor control socket to appear.
    #[builder(default = DEFAULT_SOCKET_TIMEOUT)]
    socket_timeout: Duration,

    /// The interval at which the control socket is polled for.
    #[builder(default = DEFAULT_SOCKET_POLL_INTERVAL)]
    socket_poll_interval: Duration,

    /// How long to wait for the guest to become reachable after boot.
    #[builder(default = DEFAULT_BOOT_TIMEOUT)]
    boot_timeout: Duration,

    /// The interval at which guest readiness is probed.
    #[builder(default = DEFAULT_READY_POLL_INTERVAL)]
    ready_poll_interval: Duration,

    /// The default per-task execution budget.
    #[builder(default = DEFAULT_EXEC_TIMEOUT)]
    exec_timeout: Duration,

    /// How long a single mount write-back is allowed to take.
    #[builder(default = DEFAULT_WRITEBACK_TIMEOUT)]
    writeback_timeout: Duration,

    /// The interval at which a waiting request re-checks owner admission.
    #[builder(default = DEFAULT_ADMISSION_POLL_INTERVAL)]
    admission_poll_interval: Duration,

    /// The maximum number of captured output bytes before the run is failed.
    #[builder(default = DEFAULT_MAX_OUTPUT_BYTES)]
    max_output_bytes: usize,

    /// The number of output bytes preserved in the per-run log artifact.
    #[builder(default = DEFAULT_LOG_TAIL_BYTES)]
    log_tail_bytes: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl OrchestratorConfig {
    /// Returns the bridge address, the first usable host of the subnet.
    pub fn bridge_ip(&self) -> WarrenResult<Ipv4Addr> {
        self.subnet.nth(1).ok_or_else(|| {
            WarrenError::InfrastructureMissing(format!(
                "subnet {} has no usable host addresses",
                self.subnet
            ))
        })
    }

    /// The directory private sandbox disk images are created in.
    pub fn images_dir(&self) -> PathBuf {
        self.home_dir.join(IMAGES_SUBDIR)
    }

    /// The directory disk images are loop-mounted in while being staged.
    pub fn staging_dir(&self) -> PathBuf {
        self.home_dir.join(STAGING_SUBDIR)
    }

    /// The directory hypervisor control sockets are created in.
    pub fn sockets_dir(&self) -> PathBuf {
        self.home_dir.join(SOCKETS_SUBDIR)
    }

    /// The directory per-run log artifacts are written to.
    pub fn log_dir(&self) -> PathBuf {
        self.home_dir.join(LOG_SUBDIR)
    }

    /// The directory the host SSH keypair is kept in.
    pub fn keys_dir(&self) -> PathBuf {
        self.home_dir.join(KEYS_SUBDIR)
    }

    /// The directory task payloads are spooled in before upload.
    pub fn spool_dir(&self) -> PathBuf {
        self.home_dir.join(SPOOL_SUBDIR)
    }

    /// The private disk image path for a sandbox.
    pub fn image_path(&self, sandbox_id: u32) -> PathBuf {
        self.images_dir().join(format!("sandbox-{}.ext4", sandbox_id))
    }

    /// The control socket path for a sandbox.
    pub fn socket_path(&self, sandbox_id: u32) -> PathBuf {
        self.sockets_dir().join(format!("sandbox-{}.sock", sandbox_id))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig::builder()
            .hypervisor_path("/usr/bin/firecracker")
            .kernel_path("/vmlinux")
            .base_image_path("/base.ext4")
            .home_dir("/tmp/warren-test")
            .build()
    }

    #[test]
    fn test_config_bridge_ip_is_first_usable_host() -> anyhow::Result<()> {
        let config = test_config();
        assert_eq!(config.bridge_ip()?, "172.30.0.1".parse::<Ipv4Addr>()?);
        Ok(())
    }

    #[test]
    fn test_config_per_sandbox_paths_are_distinct() {
        let config = test_config();
        assert_ne!(config.image_path(1), config.image_path(2));
        assert_ne!(config.socket_path(1), config.socket_path(2));
        assert!(config.image_path(7).starts_with(config.images_dir()));
    }
}
