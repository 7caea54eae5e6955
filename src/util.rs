use crate::Kind;
use etherparse::{NetSlice, SlicedPacket};
use nix::fcntl::{FcntlArg, OFlag};
use nix::libc;
use std::fmt::Write;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

/// Build an `ifreq` for `devname` with `ifru_flags` set to `flags`.
///
/// The kernel silently truncates names, so anything that would not survive
/// the round trip is rejected here instead.
pub fn create_ifreq(devname: &str, flags: i16) -> io::Result<libc::ifreq> {
    if devname.len() >= libc::IFNAMSIZ
        || devname
            .bytes()
            .any(|b| b == 0 || b == b'/' || b.is_ascii_whitespace())
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid interface name: {devname:?}"),
        ));
    }

    let mut ifreq: libc::ifreq = unsafe { std::mem::zeroed() };
    for (left, right) in ifreq.ifr_name.iter_mut().zip(devname.bytes()) {
        *left = right as libc::c_char;
    }
    ifreq.ifr_ifru.ifru_flags = flags;

    Ok(ifreq)
}

/// Name stored in `ifreq.ifr_name`, up to the first NUL.
pub fn ifreq_name(ifreq: &libc::ifreq) -> String {
    let bytes: Vec<u8> = ifreq
        .ifr_name
        .iter()
        .map(|c| *c as u8)
        .take_while(|b| *b != 0)
        .collect();

    String::from_utf8_lossy(&bytes).into_owned()
}

pub fn set_nonblocking(fd: &OwnedFd) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(nix::fcntl::fcntl(
        fd.as_raw_fd(),
        FcntlArg::F_GETFL,
    )?);
    nix::fcntl::fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;

    Ok(())
}

/// Space separated hex of the first `limit` bytes, with a trailing `...` when cut.
pub fn hex_preview(bytes: &[u8], limit: usize) -> String {
    let mut out = String::new();
    out.reserve(limit * 3 + 3);

    for byte in bytes.iter().take(limit) {
        write!(out, "{:02x} ", byte).expect("failed to write!");
    }

    if bytes.len() > limit {
        out.push_str("...");
    } else {
        // Trailing ' '
        out.pop();
    }
    out
}

/// One line summary of a packet read from a device of the given kind.
pub fn describe_packet(kind: Kind, packet: &[u8]) -> String {
    let sliced = match kind {
        Kind::Tun => SlicedPacket::from_ip(packet),
        Kind::Tap => SlicedPacket::from_ethernet(packet),
    };

    match sliced {
        Ok(sliced) => match sliced.net {
            Some(NetSlice::Ipv4(ipv4)) => {
                let header = ipv4.header();
                format!(
                    "IPv4 {} -> {} ({:?})",
                    header.source_addr(),
                    header.destination_addr(),
                    header.protocol()
                )
            }
            Some(_) => String::from("non-IPv4 packet"),
            None => String::from("no network layer"),
        },
        Err(e) => format!("unparsed packet: {e}"),
    }
}
