//! Capture engine tests that run without privileges.
//!
//! Each interface adopts one end of a Unix socket pair through
//! `VirtualInterface::from_fd`; the other end plays the kernel side.

use std::io::{ErrorKind, Read};
use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tunbridge::capture::MAX_PACKET_SIZE;
use tunbridge::{ConfigStep, Error, Kind, Stats, VirtualInterface};

const TIMEOUT: Duration = Duration::from_secs(5);

fn socket_interface(name: &str, kind: Kind) -> (VirtualInterface, UnixDatagram) {
    let (ours, peer) = UnixDatagram::pair().unwrap();
    peer.set_read_timeout(Some(TIMEOUT)).unwrap();
    let iface = VirtualInterface::from_fd(name, kind, OwnedFd::from(ours)).unwrap();
    (iface, peer)
}

fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }
}

fn frame(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

#[test]
fn received_packet_reaches_handler_once() {
    let (mut iface, peer) = socket_interface("test0", Kind::Tap);
    let (tx, rx) = mpsc::channel();
    iface
        .start_capture(move |packet| {
            tx.send(packet)?;
            Ok(())
        })
        .unwrap();

    let sent = frame(64);
    peer.send(&sent).unwrap();

    let received = rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(received, sent);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

    assert_eq!(iface.packets_received(), 1);
    assert_eq!(iface.bytes_received(), 64);
    assert_eq!(iface.packets_sent(), 0);
}

#[test]
fn accepted_writes_count_exact_lengths() {
    let (mut iface, peer) = socket_interface("test0", Kind::Tun);
    iface.start_capture(|_| Ok(())).unwrap();

    let mut buf = [0_u8; MAX_PACKET_SIZE];
    let mut expected = Stats::default();

    for _ in 0..64 {
        let packet = frame(rand::random_range(1..=MAX_PACKET_SIZE));

        assert_eq!(iface.write_packet(&packet).unwrap(), packet.len());
        expected.packets_sent += 1;
        expected.bytes_sent += packet.len() as u64;
        assert_eq!(iface.stats(), expected);

        let size = peer.recv(&mut buf).unwrap();
        assert_eq!(&buf[..size], &packet[..]);
    }
}

#[test]
fn writes_are_refused_unless_running() {
    let (mut iface, _peer) = socket_interface("test0", Kind::Tap);

    assert!(matches!(iface.write_packet(&[0; 64]), Err(Error::NotRunning)));

    iface.start_capture(|_| Ok(())).unwrap();
    iface.write_packet(&[0; 64]).unwrap();
    iface.stop_capture();

    assert!(matches!(iface.write_packet(&[0; 64]), Err(Error::NotRunning)));
    assert_eq!(iface.packets_sent(), 1);
    assert_eq!(iface.bytes_sent(), 64);
}

#[test]
fn second_start_fails_without_spawning() {
    let (mut iface, peer) = socket_interface("test0", Kind::Tap);
    let (tx, rx) = mpsc::channel();

    let first = tx.clone();
    iface
        .start_capture(move |packet| {
            first.send(("first", packet))?;
            Ok(())
        })
        .unwrap();

    let second = iface.start_capture(move |packet| {
        tx.send(("second", packet))?;
        Ok(())
    });
    assert!(matches!(second, Err(Error::AlreadyRunning(name)) if name == "test0"));
    assert!(iface.is_running());

    for _ in 0..10 {
        peer.send(&[7; 32]).unwrap();
    }
    for _ in 0..10 {
        let (which, packet) = rx.recv_timeout(TIMEOUT).unwrap();
        assert_eq!(which, "first");
        assert_eq!(packet, vec![7; 32]);
    }
    assert_eq!(iface.packets_received(), 10);
}

#[test]
fn stop_is_idempotent_and_restart_works() {
    let (mut iface, peer) = socket_interface("test0", Kind::Tun);

    iface.stop_capture();
    iface.start_capture(|_| Ok(())).unwrap();
    iface.stop_capture();
    assert!(!iface.is_running());
    iface.stop_capture();
    iface.stop_capture();
    assert!(!iface.is_running());

    let (tx, rx) = mpsc::channel();
    iface
        .start_capture(move |packet| {
            tx.send(packet)?;
            Ok(())
        })
        .unwrap();
    peer.send(&[1, 2, 3, 4]).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), vec![1, 2, 3, 4]);
}

#[test]
fn take_transfers_state_and_leaves_source_inert() {
    let (mut source, peer) = socket_interface("test0", Kind::Tap);
    let (tx, rx) = mpsc::channel();
    source
        .start_capture(move |packet| {
            tx.send(packet)?;
            Ok(())
        })
        .unwrap();

    peer.send(&[0xaa; 100]).unwrap();
    rx.recv_timeout(TIMEOUT).unwrap();
    source.write_packet(&[0xbb; 40]).unwrap();
    let before = source.stats();

    let mut moved = source.take();

    assert!(moved.is_running());
    assert!(moved.is_initialized());
    assert_eq!(moved.stats(), before);

    assert!(!source.is_running());
    assert!(!source.is_initialized());
    assert_eq!(source.stats(), Stats::default());
    assert!(matches!(source.write_packet(&[0; 8]), Err(Error::NotInitialized)));
    assert!(matches!(source.start_capture(|_| Ok(())), Err(Error::NotInitialized)));
    source.stop_capture();
    drop(source);

    // The capture thread went along with the device
    peer.send(&[0xcc; 10]).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), vec![0xcc; 10]);
    assert_eq!(moved.packets_received(), before.packets_received + 1);

    moved.stop_capture();
}

#[test]
fn rust_move_keeps_capture_alive() {
    let (mut iface, peer) = socket_interface("test0", Kind::Tun);
    let (tx, rx) = mpsc::channel();
    iface
        .start_capture(move |packet| {
            tx.send(packet)?;
            Ok(())
        })
        .unwrap();

    let moved = thread::spawn(move || iface).join().unwrap();

    peer.send(&[9; 16]).unwrap();
    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), vec![9; 16]);
    assert!(moved.is_running());
    assert_eq!(moved.stats().bytes_received, 16);
}

#[test]
fn handler_errors_and_panics_are_absorbed() {
    let (mut iface, peer) = socket_interface("test0", Kind::Tap);
    let (tx, rx) = mpsc::channel();
    iface
        .start_capture(move |packet| match packet[0] {
            0 => Err("rejected".into()),
            1 => panic!("handler blew up"),
            _ => {
                tx.send(packet)?;
                Ok(())
            }
        })
        .unwrap();

    peer.send(&[0]).unwrap();
    peer.send(&[1]).unwrap();
    peer.send(&[2, 2]).unwrap();

    assert_eq!(rx.recv_timeout(TIMEOUT).unwrap(), vec![2, 2]);
    assert!(iface.is_running());
    assert_eq!(iface.packets_received(), 3);
    assert_eq!(iface.bytes_received(), 4);
}

#[test]
fn two_interfaces_forward_both_ways() {
    let (mut a, peer_a) = socket_interface("sdr_tap0", Kind::Tap);
    let (mut b, peer_b) = socket_interface("sdr_tap1", Kind::Tap);

    let to_b = b.writer().unwrap();
    let to_a = a.writer().unwrap();
    a.start_capture(move |packet| {
        to_b.write_packet(&packet)?;
        Ok(())
    })
    .unwrap();
    b.start_capture(move |packet| {
        to_a.write_packet(&packet)?;
        Ok(())
    })
    .unwrap();

    let mut buf = [0_u8; MAX_PACKET_SIZE];

    let into_a = frame(98);
    peer_a.send(&into_a).unwrap();
    let size = peer_b.recv(&mut buf).unwrap();
    assert_eq!(&buf[..size], &into_a[..]);

    let into_b = frame(1500);
    peer_b.send(&into_b).unwrap();
    let size = peer_a.recv(&mut buf).unwrap();
    assert_eq!(&buf[..size], &into_b[..]);

    // Counters are bumped right after the write the peer already observed
    wait_until(|| a.packets_sent() == 1 && b.packets_sent() == 1);

    assert_eq!(
        a.stats(),
        Stats {
            packets_received: 1,
            packets_sent: 1,
            bytes_received: 98,
            bytes_sent: 1500,
        }
    );
    assert_eq!(
        b.stats(),
        Stats {
            packets_received: 1,
            packets_sent: 1,
            bytes_received: 1500,
            bytes_sent: 98,
        }
    );
}

#[test]
fn writer_outliving_interface_fails_cleanly() {
    let (mut iface, _peer) = socket_interface("test0", Kind::Tun);
    iface.start_capture(|_| Ok(())).unwrap();
    let writer = iface.writer().unwrap();

    writer.write_packet(&[1; 10]).unwrap();
    assert_eq!(iface.packets_sent(), 1);

    drop(iface);
    assert!(matches!(writer.write_packet(&[1; 10]), Err(Error::NotInitialized)));
}

#[test]
fn drop_while_running_joins_and_closes() {
    let (ours, mut peer) = UnixStream::pair().unwrap();
    peer.set_read_timeout(Some(TIMEOUT)).unwrap();

    let mut iface = VirtualInterface::from_fd("test0", Kind::Tun, OwnedFd::from(ours)).unwrap();
    iface.start_capture(|_| Ok(())).unwrap();
    thread::sleep(Duration::from_millis(20));

    let start = Instant::now();
    drop(iface);
    assert!(start.elapsed() < Duration::from_secs(1));

    // Every descriptor of our end is gone, so the peer sees EOF
    let mut buf = [0_u8; 16];
    assert_eq!(peer.read(&mut buf).unwrap(), 0);
}

#[test]
fn full_device_reports_would_block_without_counting() {
    let (mut iface, _peer) = socket_interface("test0", Kind::Tun);
    iface.start_capture(|_| Ok(())).unwrap();

    // Nobody drains the peer, so its receive queue eventually fills up
    let packet = [0x11_u8; 1024];
    let mut accepted = 0_u64;
    let err = loop {
        match iface.write_packet(&packet) {
            Ok(written) => {
                assert_eq!(written, packet.len());
                accepted += 1;
            }
            Err(e) => break e,
        }
        assert!(accepted < 100_000, "socket queue never filled");
    };

    assert!(err.is_would_block(), "{err:?}");
    assert!(accepted > 0);
    assert_eq!(iface.packets_sent(), accepted);
    assert_eq!(iface.bytes_sent(), accepted * packet.len() as u64);
}

#[test]
fn short_write_counts_taken_bytes_and_reports_partial() {
    let (ours, _peer) = UnixStream::pair().unwrap();
    let mut iface = VirtualInterface::from_fd("test0", Kind::Tun, OwnedFd::from(ours)).unwrap();
    iface.start_capture(|_| Ok(())).unwrap();

    let packet = vec![0x22_u8; 8 * 1024 * 1024];
    match iface.write_packet(&packet) {
        Err(Error::PartialWrite { written, expected }) => {
            assert_eq!(expected, packet.len());
            assert!(written > 0 && written < expected);
            assert_eq!(iface.packets_sent(), 1);
            assert_eq!(iface.bytes_sent(), written as u64);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn configure_names_the_failing_step() {
    let (iface, _peer) = socket_interface("nosuchif9", Kind::Tap);

    match iface.configure(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 255, 255, 0)) {
        Err(Error::Configuration { step, .. }) => assert_eq!(step, ConfigStep::FlagsGet),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn adopting_with_bad_name_is_a_creation_error() {
    let (ours, _peer) = UnixDatagram::pair().unwrap();

    match VirtualInterface::from_fd("bad name", Kind::Tun, OwnedFd::from(ours)) {
        Err(Error::DeviceCreation { name, source }) => {
            assert_eq!(name, "bad name");
            assert_eq!(source.kind(), ErrorKind::InvalidInput);
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
