//! TUN device provider.
//!
//! The device is created without an address and left down; the network
//! configurator takes care of both once the server has assigned an address.

use std::io;
use tokio::io::{ReadHalf, WriteHalf};
use tracing::info;
use tun::{AsyncDevice, Configuration};

/// Read side of the device, consumed by the uplink pump.
pub type DeviceReader = ReadHalf<AsyncDevice>;

/// Write side of the device, consumed by the downlink pump.
pub type DeviceWriter = WriteHalf<AsyncDevice>;

/// An open TUN device carrying raw IP packets.
pub struct TunDevice {
    name: String,
    inner: AsyncDevice,
}

impl TunDevice {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Split into independently usable read and write halves.
    ///
    /// Dropping both halves closes the device.
    pub fn split(self) -> (DeviceReader, DeviceWriter) {
        tokio::io::split(self.inner)
    }
}

/// Open (creating if needed) the TUN device called `name`.
pub fn open(name: &str) -> io::Result<TunDevice> {
    let mut config = Configuration::default();
    config.name(name);

    let inner = tun::create_as_async(&config).map_err(|e| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("failed to create TUN device {}: {} (are you root?)", name, e),
        )
    })?;

    info!("TUN device {} opened", name);
    Ok(TunDevice {
        name: name.to_string(),
        inner,
    })
}
