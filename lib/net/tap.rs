use async_trait::async_trait;

use crate::{
    utils::{command_succeeds, run_command},
    WarrenResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The prefix of host-side sandbox network devices.
pub const TAP_DEVICE_PREFIX: &str = "wtap";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Creates and destroys the per-sandbox virtual network device.
///
/// Implementations must create the device, bring it up and enslave it to the
/// shared bridge, in that order; any step failing is fatal to the sandbox
/// request. Destruction must tolerate the device already being gone, since
/// teardown can run after a partial failure.
#[async_trait]
pub trait NetworkDeviceManager: Send + Sync {
    /// Creates the network device for a sandbox and returns its name.
    async fn create_device(&self, sandbox_id: u32) -> WarrenResult<String>;

    /// Destroys a sandbox network device, tolerating its absence.
    async fn destroy_device(&self, device: &str);
}

/// Network device manager backed by the host `ip` tool.
#[derive(Debug)]
pub struct IpCommandDeviceManager {
    /// The bridge device created devices are enslaved to.
    bridge: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl IpCommandDeviceManager {
    /// Creates a new manager attaching devices to the given bridge.
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
        }
    }
}

/// Returns the device name for a sandbox id.
///
/// Naming is derived rather than random so a retried creation targets the
/// same device instead of leaking a second one.
pub fn device_name(sandbox_id: u32) -> String {
    format!("{}{}", TAP_DEVICE_PREFIX, sandbox_id)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl NetworkDeviceManager for IpCommandDeviceManager {
    async fn create_device(&self, sandbox_id: u32) -> WarrenResult<String> {
        let device = device_name(sandbox_id);

        run_command("ip", &["tuntap", "add", &device, "mode", "tap"]).await?;
        run_command("ip", &["link", "set", &device, "up"]).await?;
        run_command("ip", &["link", "set", &device, "master", &self.bridge]).await?;

        tracing::info!("created network device {} on bridge {}", device, self.bridge);
        Ok(device)
    }

    async fn destroy_device(&self, device: &str) {
        if command_succeeds("ip", &["link", "del", device]).await {
            tracing::info!("destroyed network device {}", device);
        } else {
            tracing::warn!("network device {} already gone", device);
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
    fn test_tap_device_names_are_derived_from_id() {
        assert_eq!(device_name(1), "wtap1");
        assert_eq!(device_name(253), "wtap253");
        assert_ne!(device_name(1), device_name(2));
    }
}
