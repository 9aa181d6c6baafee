use std::time::Duration;

use ipnetwork::Ipv4Network;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of vCPUs given to every sandbox.
pub const DEFAULT_NUM_VCPUS: u8 = 1;

/// The default amount of RAM in MiB given to every sandbox.
pub const DEFAULT_RAM_MIB: u32 = 512;

/// The default bridge device sandbox network interfaces are enslaved to.
pub const DEFAULT_BRIDGE_NAME: &str = "warren0";

/// The default private subnet sandbox addresses are derived from.
pub const DEFAULT_SUBNET: &str = "172.30.0.0/24";

/// The default DNS resolver written into guest network configuration.
pub const DEFAULT_GUEST_DNS: &str = "1.1.1.1";

/// The default user remote commands run as inside the guest.
pub const DEFAULT_SSH_USER: &str = "root";

/// How long to wait for the hypervisor control socket to appear.
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_secs(3);

/// The interval at which the control socket is polled for.
pub const DEFAULT_SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long to wait for the guest to answer its first remote command.
pub const DEFAULT_BOOT_TIMEOUT: Duration = Duration::from_secs(30);

/// The interval at which guest readiness is probed.
pub const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The default per-task execution budget, caller-overridable per invocation.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

/// How long a single mount write-back is allowed to take.
pub const DEFAULT_WRITEBACK_TIMEOUT: Duration = Duration::from_secs(60);

/// The interval at which a waiting request re-checks owner admission.
pub const DEFAULT_ADMISSION_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The maximum number of captured output bytes before the run is failed.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// The number of output bytes preserved in the per-run log artifact.
pub const DEFAULT_LOG_TAIL_BYTES: usize = 4096;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the default sandbox subnet.
pub fn default_subnet() -> Ipv4Network {
    DEFAULT_SUBNET.parse().expect("default subnet is valid")
}
