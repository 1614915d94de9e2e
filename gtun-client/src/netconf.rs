//! Local network configuration of the TUN device.

use async_trait::async_trait;
use gtun_core::ConfigError;
use std::net::Ipv4Addr;
use tokio::process::Command;
use tracing::{debug, info};

/// Applies link state and addresses to the local virtual interface.
#[async_trait]
pub trait NetConfigurator: Send + Sync + 'static {
    /// Set the device administratively up.
    async fn bring_up(&self, device: &str) -> Result<(), ConfigError>;

    /// Make `address/prefix_len` the only address on the device.
    async fn assign_address(
        &self,
        device: &str,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), ConfigError>;
}

/// Configures the device through the iproute2 `ip` tool.
#[derive(Debug, Clone, Default)]
pub struct IpCommand;

impl IpCommand {
    async fn run(args: &[&str]) -> Result<(), String> {
        debug!("ip {}", args.join(" "));
        let output = Command::new("ip")
            .args(args)
            .output()
            .await
            .map_err(|e| format!("failed to run ip: {}", e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "ip {} exited with {}: {}",
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}

#[async_trait]
impl NetConfigurator for IpCommand {
    async fn bring_up(&self, device: &str) -> Result<(), ConfigError> {
        Self::run(&["link", "set", "dev", device, "up"])
            .await
            .map_err(|reason| ConfigError::InterfaceUp {
                device: device.to_string(),
                reason,
            })?;
        info!("Interface {} is up", device);
        Ok(())
    }

    async fn assign_address(
        &self,
        device: &str,
        address: Ipv4Addr,
        prefix_len: u8,
    ) -> Result<(), ConfigError> {
        let cidr = format!("{}/{}", address, prefix_len);
        let to_error = |reason| ConfigError::AddressAssign {
            device: device.to_string(),
            address: cidr.clone(),
            reason,
        };

        // Drop whatever the previous session left behind.
        Self::run(&["addr", "flush", "dev", device])
            .await
            .map_err(to_error)?;
        Self::run(&["addr", "add", &cidr, "dev", device])
            .await
            .map_err(to_error)?;

        info!("Assigned {} to {}", cidr, device);
        Ok(())
    }
}
