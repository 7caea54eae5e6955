#[macro_use]
extern crate nix;

#[cfg(not(target_os = "linux"))]
compile_error!("tunbridge drives /dev/net/tun and only builds on Linux");

use nix::libc;
use serde::{Deserialize, Serialize};
use std::fmt;

pub mod capture;
pub mod config;
pub mod error;
pub mod iface;
pub mod stats;
pub mod util;

pub use config::InterfaceConfig;
pub use error::{BoxError, ConfigStep, Error, Result};
pub use iface::{PacketWriter, VirtualInterface};
pub use stats::Stats;

/// Layer at which a virtual device exchanges packets with the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// Raw IP packets.
    Tun,
    /// Raw Ethernet frames.
    Tap,
}

impl Kind {
    /// `TUNSETIFF` flags requesting this kind without the packet-info prefix.
    pub fn flags(self) -> i16 {
        let kind = match self {
            Kind::Tun => libc::IFF_TUN,
            Kind::Tap => libc::IFF_TAP,
        };
        (kind | libc::IFF_NO_PI) as i16
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Kind::Tun => "TUN",
            Kind::Tap => "TAP",
        })
    }
}
