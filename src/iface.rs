use crate::capture::CaptureLoop;
use crate::error::{BoxError, ConfigStep, Error, Result};
use crate::stats::{Counters, Stats};
use crate::{util, Kind};
use log::*;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::{
    ioctl::ioctl_param_type,
    socket::{AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrLike},
    stat::Mode,
};
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;

const CLONE_DEVICE: &str = "/dev/net/tun";

ioctl_write_int!(tunsetiff, b'T', 202);
ioctl_read_bad!(siocgifflags, libc::SIOCGIFFLAGS, libc::ifreq);
ioctl_write_ptr_bad!(siocsifflags, libc::SIOCSIFFLAGS, libc::ifreq);
ioctl_write_ptr_bad!(siocsifaddr, libc::SIOCSIFADDR, libc::ifreq);
ioctl_write_ptr_bad!(siocsifnetmask, libc::SIOCSIFNETMASK, libc::ifreq);

/// A kernel TUN/TAP device together with its capture thread and counters.
///
/// Dropping the interface stops the capture (joining the thread) and closes
/// the device.
pub struct VirtualInterface {
    name: String,
    kind: Kind,
    device: Option<Arc<File>>,
    running: Arc<AtomicBool>,
    capture: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl VirtualInterface {
    /// An interface that has not touched the kernel yet. An empty `name`
    /// lets the kernel pick one on [`initialize`](Self::initialize).
    pub fn new(name: impl Into<String>, kind: Kind) -> Self {
        Self {
            name: name.into(),
            kind,
            device: None,
            running: Arc::new(AtomicBool::new(false)),
            capture: None,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Adopt an already open duplex descriptor as the device, e.g. one
    /// created by a privileged parent process.
    pub fn from_fd(name: impl Into<String>, kind: Kind, fd: OwnedFd) -> Result<Self> {
        let mut iface = Self::new(name, kind);

        util::create_ifreq(&iface.name, 0).map_err(|e| iface.creation_error(e))?;
        util::set_nonblocking(&fd).map_err(|e| iface.creation_error(e.into()))?;
        iface.device = Some(Arc::new(File::from(fd)));

        Ok(iface)
    }

    /// Create the kernel device and switch it to non-blocking mode.
    ///
    /// On success the name becomes the one the kernel confirmed, which differs
    /// from the requested one when that contained a `%d` pattern or was empty.
    pub fn initialize(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Err(Error::AlreadyInitialized(self.name.clone()));
        }

        let mut ifreq =
            util::create_ifreq(&self.name, self.kind.flags()).map_err(|e| self.creation_error(e))?;

        let tap_fd = unsafe {
            OwnedFd::from_raw_fd(
                nix::fcntl::open(CLONE_DEVICE, OFlag::O_RDWR | OFlag::O_CLOEXEC, Mode::empty())
                    .map_err(|e| self.creation_error(e.into()))?,
            )
        };

        // The kernel writes the final name back into ifreq
        unsafe {
            tunsetiff(
                tap_fd.as_raw_fd(),
                &mut ifreq as *mut libc::ifreq as ioctl_param_type,
            )
        }
        .map_err(|e| self.creation_error(e.into()))?;

        util::set_nonblocking(&tap_fd).map_err(|e| self.creation_error(e.into()))?;

        self.name = util::ifreq_name(&ifreq);
        self.device = Some(Arc::new(File::from(tap_fd)));

        info!("Created {} interface: {}", self.kind, self.name);
        Ok(())
    }

    /// Bring the interface up and assign `address`/`netmask`.
    ///
    /// Steps already applied are left in place when a later one fails.
    pub fn configure(&self, address: Ipv4Addr, netmask: Ipv4Addr) -> Result<()> {
        if self.device.is_none() {
            return Err(Error::NotInitialized);
        }

        let sockfd = nix::sys::socket::socket(
            AddressFamily::Inet,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            None,
        )
        .map_err(|e| Error::configuration(ConfigStep::Socket, e))?;

        let mut ifreq = util::create_ifreq(&self.name, 0)
            .map_err(|e| Error::configuration(ConfigStep::FlagsGet, e))?;

        unsafe { siocgifflags(sockfd.as_raw_fd(), &mut ifreq) }
            .map_err(|e| Error::configuration(ConfigStep::FlagsGet, e))?;

        unsafe {
            ifreq.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as i16;
            siocsifflags(sockfd.as_raw_fd(), &ifreq)
        }
        .map_err(|e| Error::configuration(ConfigStep::FlagsSet, e))?;

        let ifreq = self.sockaddr_ifreq(address, ConfigStep::AddressSet)?;
        unsafe { siocsifaddr(sockfd.as_raw_fd(), &ifreq) }
            .map_err(|e| Error::configuration(ConfigStep::AddressSet, e))?;

        // ifru_netmask overlays ifru_addr in the union
        let ifreq = self.sockaddr_ifreq(netmask, ConfigStep::NetmaskSet)?;
        unsafe { siocsifnetmask(sockfd.as_raw_fd(), &ifreq) }
            .map_err(|e| Error::configuration(ConfigStep::NetmaskSet, e))?;

        info!("Configured interface {} with IP {address} and netmask {netmask}", self.name);
        Ok(())
    }

    /// `ifreq` for this interface carrying `ip` in `ifru_addr`.
    fn sockaddr_ifreq(&self, ip: Ipv4Addr, step: ConfigStep) -> Result<libc::ifreq> {
        let sockaddr = SockaddrIn::from(SocketAddrV4::new(ip, 0));
        let mut ifreq =
            util::create_ifreq(&self.name, 0).map_err(|e| Error::configuration(step, e))?;

        unsafe {
            ifreq.ifr_ifru.ifru_addr = *sockaddr.as_ptr();
        }

        Ok(ifreq)
    }

    /// Spawn the capture thread. `handler` runs on that thread once per
    /// received packet; its errors and panics are logged and swallowed.
    pub fn start_capture<F>(&mut self, handler: F) -> Result<()>
    where
        F: FnMut(Vec<u8>) -> Result<(), BoxError> + Send + 'static,
    {
        let device = self.device.as_ref().ok_or(Error::NotInitialized)?;

        if self.running.load(Ordering::Acquire) {
            return Err(Error::AlreadyRunning(self.name.clone()));
        }

        let capture = CaptureLoop {
            name: self.name.clone(),
            device: Arc::clone(device),
            running: Arc::clone(&self.running),
            counters: Arc::clone(&self.counters),
            handler,
        };

        self.running.store(true, Ordering::Release);
        let spawned = std::thread::Builder::new()
            .name(format!("capture-{}", self.name))
            .spawn(move || capture.run());

        match spawned {
            Ok(handle) => {
                self.capture = Some(handle);
                info!("Started packet capture on interface {}", self.name);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::Release);
                Err(Error::Spawn(e))
            }
        }
    }

    /// Stop the capture thread and wait for it to exit. Does nothing when
    /// capture is not running.
    pub fn stop_capture(&mut self) {
        let Some(handle) = self.capture.take() else {
            return;
        };

        self.running.store(false, Ordering::Release);
        if handle.join().is_err() {
            error!("Capture thread of {} panicked", self.name);
        }

        info!(stats:serde = self.stats(); "Stopped packet capture on interface {}", self.name);
    }

    /// Write one packet to the device without blocking.
    ///
    /// Refused with [`Error::NotRunning`] while capture is stopped.
    pub fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        let device = self.device.as_ref().ok_or(Error::NotInitialized)?;
        write_to(&self.name, device, &self.running, &self.counters, packet)
    }

    /// A clonable handle writing into this interface's device, usable from
    /// another interface's packet handler.
    pub fn writer(&self) -> Result<PacketWriter> {
        let device = self.device.as_ref().ok_or(Error::NotInitialized)?;

        Ok(PacketWriter {
            name: self.name.clone(),
            device: Arc::downgrade(device),
            running: Arc::clone(&self.running),
            counters: Arc::clone(&self.counters),
        })
    }

    /// Move everything out of `self`, leaving a never-initialized interface
    /// with the same name and kind behind.
    pub fn take(&mut self) -> Self {
        let inert = Self::new(self.name.clone(), self.kind);
        std::mem::replace(self, inert)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_initialized(&self) -> bool {
        self.device.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Stats {
        self.counters.snapshot()
    }

    pub fn packets_received(&self) -> u64 {
        self.stats().packets_received
    }

    pub fn packets_sent(&self) -> u64 {
        self.stats().packets_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.stats().bytes_received
    }

    pub fn bytes_sent(&self) -> u64 {
        self.stats().bytes_sent
    }

    fn creation_error(&self, source: io::Error) -> Error {
        Error::DeviceCreation {
            name: self.name.clone(),
            source,
        }
    }
}

impl Drop for VirtualInterface {
    fn drop(&mut self) {
        self.stop_capture();

        if self.device.take().is_some() {
            debug!("Closed interface {}", self.name);
        }
    }
}

impl fmt::Debug for VirtualInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualInterface")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("initialized", &self.is_initialized())
            .field("running", &self.is_running())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Write side of a [`VirtualInterface`], sharing its device and counters.
///
/// The device is held weakly: once the interface is dropped every write
/// fails with [`Error::NotInitialized`].
#[derive(Clone)]
pub struct PacketWriter {
    name: String,
    device: Weak<File>,
    running: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl PacketWriter {
    pub fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        let device = self.device.upgrade().ok_or(Error::NotInitialized)?;
        write_to(&self.name, &device, &self.running, &self.counters, packet)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for PacketWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketWriter")
            .field("name", &self.name)
            .field("open", &(self.device.strong_count() > 0))
            .finish()
    }
}

fn write_to(
    name: &str,
    device: &File,
    running: &AtomicBool,
    counters: &Counters,
    packet: &[u8],
) -> Result<usize> {
    if !running.load(Ordering::Acquire) {
        return Err(Error::NotRunning);
    }

    let written = match (&*device).write(packet) {
        Ok(written) => written,
        Err(e) => {
            if e.kind() != io::ErrorKind::WouldBlock {
                error!("Failed to write packet to {name}: {e}");
            }
            return Err(Error::Write(e));
        }
    };

    counters.record_sent(written);

    if written < packet.len() {
        warn!("Short write on {name}: {written} of {} bytes", packet.len());
        return Err(Error::PartialWrite {
            written,
            expected: packet.len(),
        });
    }

    Ok(written)
}
