//! Background loop draining a device into a packet handler.

use crate::error::BoxError;
use crate::stats::Counters;
use log::*;
use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags};
use std::any::Any;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Largest packet read in one go. Anything longer is truncated by the kernel.
pub const MAX_PACKET_SIZE: usize = 2048;

/// Upper bound on how long the loop waits for data before re-checking `running`.
pub const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Delay after a read error that is neither would-block nor an interrupt.
pub const ERROR_BACKOFF: Duration = Duration::from_millis(10);

pub(crate) struct CaptureLoop<F> {
    pub name: String,
    pub device: Arc<File>,
    pub running: Arc<AtomicBool>,
    pub counters: Arc<Counters>,
    pub handler: F,
}

impl<F> CaptureLoop<F>
where
    F: FnMut(Vec<u8>) -> Result<(), BoxError>,
{
    pub fn run(mut self) {
        let mut buf = [0_u8; MAX_PACKET_SIZE];

        debug!("Capture loop on {} started", self.name);
        while self.running.load(Ordering::Acquire) {
            match (&*self.device).read(&mut buf) {
                Ok(0) => std::thread::sleep(POLL_INTERVAL),
                Ok(size) => {
                    self.counters.record_received(size);
                    self.dispatch(buf[..size].to_vec());
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => self.wait_readable(),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("Error reading from {}: {e}", self.name);
                    std::thread::sleep(ERROR_BACKOFF);
                }
            }
        }
        debug!("Capture loop on {} exited", self.name);
    }

    fn wait_readable(&self) {
        let timeout = POLL_INTERVAL.as_millis() as libc::c_int;
        let mut fds = [PollFd::new(&*self.device, PollFlags::POLLIN)];

        match nix::poll::poll(&mut fds, timeout) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => {
                debug!("poll() on {} failed: {e}", self.name);
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    fn dispatch(&mut self, packet: Vec<u8>) {
        let len = packet.len();
        let handler = &mut self.handler;

        match panic::catch_unwind(AssertUnwindSafe(|| handler(packet))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Packet handler on {} failed for {len} byte packet: {e}", self.name),
            Err(payload) => error!(
                "Packet handler on {} panicked: {}",
                self.name,
                panic_message(payload.as_ref())
            ),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
