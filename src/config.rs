use crate::{Kind, Result, VirtualInterface};
use log::*;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

pub const DEFAULT_INTERFACE1: &str = "sdr_tap0";
pub const DEFAULT_INTERFACE2: &str = "sdr_tap1";
pub const DEFAULT_IP1: Ipv4Addr = Ipv4Addr::new(192, 168, 10, 1);
pub const DEFAULT_IP2: Ipv4Addr = Ipv4Addr::new(192, 168, 20, 1);
pub const DEFAULT_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// How often the bridge binary prints interface statistics.
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Everything needed to bring one interface up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub kind: Kind,
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl InterfaceConfig {
    pub fn new(name: impl Into<String>, kind: Kind, address: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            kind,
            address,
            netmask: DEFAULT_NETMASK,
        }
    }

    pub fn with_netmask(mut self, netmask: Ipv4Addr) -> Self {
        self.netmask = netmask;
        self
    }

    /// Create, initialize and configure the interface.
    ///
    /// The device is closed again if configuration fails.
    pub fn open(&self) -> Result<VirtualInterface> {
        debug!(config:serde = self; "Opening interface");

        let mut iface = VirtualInterface::new(self.name.as_str(), self.kind);
        iface.initialize()?;
        iface.configure(self.address, self.netmask)?;

        Ok(iface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netmask_defaults_to_class_c() {
        let config = InterfaceConfig::new(DEFAULT_INTERFACE1, Kind::Tap, DEFAULT_IP1);
        assert_eq!(config.netmask, Ipv4Addr::new(255, 255, 255, 0));

        let config = config.with_netmask(Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(config.netmask, Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(config.address, DEFAULT_IP1);
    }

    #[test]
    fn open_reports_invalid_names() {
        let config = InterfaceConfig::new("bad name", Kind::Tun, DEFAULT_IP2);
        assert!(matches!(
            config.open(),
            Err(crate::Error::DeviceCreation { .. })
        ));
    }
}
