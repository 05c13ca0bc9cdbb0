//! Unix byte-stream device backend.
//!
//! Real kernel TUN devices on Unix hand us a file descriptor, not shared
//! memory. [`FdDriver`] bridges the gap: a pump task reads packets off the
//! fd into the endpoint's Send ring and drains the Receive ring back into
//! the fd, so an fd-backed endpoint satisfies the exact same ring contract
//! as a shared-memory one. Use [`RingBackend::Channel`] for these
//! endpoints; there is no driver to share the binary layout with.
//!
//! [`RingBackend::Channel`]: super::endpoint::RingBackend

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, TunError};
use crate::ring::MAX_PACKET_SIZE;

use super::endpoint::{DeviceHandle, DeviceProvisioner, EndpointOptions, RingPair};

struct FdDevice {
    fd: RawFd,
    pump: Option<(CancellationToken, JoinHandle<()>)>,
}

/// [`DeviceProvisioner`] over kernel TUN file descriptors.
#[derive(Default)]
pub struct FdDriver {
    devices: Mutex<HashMap<u64, FdDevice>>,
    next_id: AtomicU64,
}

impl FdDriver {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(target_os = "linux")]
    fn open_tun(name: &str) -> Result<(RawFd, String)> {
        use std::os::unix::io::IntoRawFd;

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")
            .map_err(|e| {
                Error::Tun(TunError::CreateFailed {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            })?;
        let fd = file.into_raw_fd();

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        let name_bytes = name.as_bytes();
        let name_len = name_bytes.len().min(15);
        unsafe {
            std::ptr::copy_nonoverlapping(
                name_bytes.as_ptr(),
                ifr.ifr_name.as_mut_ptr().cast::<u8>(),
                name_len,
            );
        }
        // IFF_TUN with IFF_NO_PI: raw IP packets, no prepended header.
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as i16;

        const TUNSETIFF: libc::c_ulong = 0x400454ca;
        let ret = unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::Tun(TunError::CreateFailed {
                name: name.to_string(),
                reason: err.to_string(),
            }));
        }

        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };

        let actual = unsafe {
            std::ffi::CStr::from_ptr(ifr.ifr_name.as_ptr())
                .to_string_lossy()
                .into_owned()
        };
        Ok((fd, actual))
    }

    #[cfg(not(target_os = "linux"))]
    fn open_tun(_name: &str) -> Result<(RawFd, String)> {
        Err(Error::Tun(TunError::Unsupported))
    }
}

impl DeviceProvisioner for FdDriver {
    fn create_device(&self, options: &EndpointOptions) -> Result<DeviceHandle> {
        let (fd, actual_name) = Self::open_tun(&options.name)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.devices.lock().insert(id, FdDevice { fd, pump: None });
        info!(requested = %options.name, actual = %actual_name, "opened TUN fd");
        Ok(DeviceHandle {
            id,
            name: actual_name,
        })
    }

    fn register_rings(&self, device: &DeviceHandle, rings: RingPair) -> Result<()> {
        // The pump is a tokio task; without a runtime the registration
        // fails and any previous pump keeps running.
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            Error::Tun(TunError::RegisterRings(
                "fd pump requires a tokio runtime".into(),
            ))
        })?;

        let mut devices = self.devices.lock();
        let entry = devices
            .get_mut(&device.id)
            .ok_or_else(|| Error::Tun(TunError::Closed(device.name.clone())))?;

        // A restart replaces the pump along with the rings.
        if let Some((token, _)) = entry.pump.take() {
            token.cancel();
        }
        let token = CancellationToken::new();
        let handle = runtime.spawn(pump(entry.fd, device.name.clone(), rings, token.clone()));
        entry.pump = Some((token, handle));
        Ok(())
    }

    fn destroy_device(&self, device: &DeviceHandle) {
        if let Some(entry) = self.devices.lock().remove(&device.id) {
            if let Some((token, _)) = entry.pump {
                token.cancel();
            }
            unsafe { libc::close(entry.fd) };
            debug!(device = %device.name, "closed TUN fd");
        }
    }
}

/// Bridge one fd to one ring pair until cancelled.
///
/// TUN fds are packet-oriented: one read returns one packet. Ring-full on
/// the Send side drops the packet, same policy as the inbound router path.
async fn pump(fd: RawFd, name: String, rings: RingPair, token: CancellationToken) {
    let async_fd = match AsyncFd::new(fd) {
        Ok(async_fd) => async_fd,
        Err(e) => {
            warn!(device = %name, error = %e, "cannot register TUN fd with the reactor");
            return;
        }
    };
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            guard = async_fd.readable() => {
                let mut guard = match guard {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!(device = %name, error = %e, "TUN fd read poll failed");
                        break;
                    }
                };
                match guard.try_io(|inner| read_fd(*inner.get_ref(), &mut buf)) {
                    Ok(Ok(len)) => {
                        if let Err(e) = rings.send.write(&buf[..len]) {
                            debug!(device = %name, error = %e, "send ring rejected packet, dropping");
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(device = %name, error = %e, "TUN fd read failed");
                        break;
                    }
                    Err(_would_block) => {}
                }
            }
            packet = recv_next(&rings) => {
                let Some(packet) = packet else { break };
                if let Err(e) = write_fd(&async_fd, &packet).await {
                    warn!(device = %name, error = %e, "TUN fd write failed");
                    break;
                }
            }
        }
    }
    debug!(device = %name, "fd pump stopped");
}

/// Pop the next injected packet, waiting with the alertable protocol.
/// `None` means the ring is no longer readable.
async fn recv_next(rings: &RingPair) -> Option<Vec<u8>> {
    loop {
        match rings.recv.read() {
            Ok(Some(packet)) => return Some(packet),
            Ok(None) => {}
            Err(_) => return None,
        }
        rings.recv.set_alertable(true);
        match rings.recv.read() {
            Ok(Some(packet)) => {
                rings.recv.set_alertable(false);
                return Some(packet);
            }
            Ok(None) => {}
            Err(_) => {
                rings.recv.set_alertable(false);
                return None;
            }
        }
        rings.recv.ready().wait().await;
        rings.recv.set_alertable(false);
    }
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let ret = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

async fn write_fd(async_fd: &AsyncFd<RawFd>, packet: &[u8]) -> io::Result<()> {
    loop {
        let mut guard = async_fd.writable().await?;
        match guard.try_io(|inner| {
            let ret = unsafe { libc::write(*inner.get_ref(), packet.as_ptr().cast(), packet.len()) };
            if ret < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }) {
            Ok(result) => return result,
            Err(_would_block) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{ChannelRing, PacketRing, Signal, MIN_RING_CAPACITY};
    use std::sync::Arc;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        for fd in fds {
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }
        }
        (fds[0], fds[1])
    }

    fn rings() -> RingPair {
        RingPair {
            send: Arc::new(ChannelRing::new(MIN_RING_CAPACITY, Signal::new())),
            recv: Arc::new(ChannelRing::new(MIN_RING_CAPACITY, Signal::new())),
        }
    }

    #[test]
    fn register_rings_outside_a_runtime_fails_cleanly() {
        let (ours, theirs) = pipe_pair();
        let driver = FdDriver::new();
        driver
            .devices
            .lock()
            .insert(0, FdDevice { fd: ours, pump: None });
        let device = DeviceHandle {
            id: 0,
            name: "test".into(),
        };

        let err = driver.register_rings(&device, rings()).unwrap_err();
        assert!(matches!(err, Error::Tun(TunError::RegisterRings(_))));

        driver.destroy_device(&device);
        unsafe { libc::close(theirs) };
    }

    #[tokio::test]
    async fn pump_moves_packets_both_ways() {
        let (ours, theirs) = pipe_pair();
        let pair = rings();
        let token = CancellationToken::new();
        let task = tokio::spawn(pump(ours, "test".into(), pair.clone(), token.clone()));

        // Kernel side writes a packet; it lands on the Send ring.
        let sent = unsafe { libc::write(theirs, b"abcd".as_ptr().cast(), 4) };
        assert_eq!(sent, 4);
        let mut got = None;
        for _ in 0..200 {
            if let Some(packet) = pair.send.read().unwrap() {
                got = Some(packet);
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(got.unwrap(), b"abcd".to_vec());

        // Process side injects a packet; it comes out of the fd.
        pair.recv.write(b"wxyz").unwrap();
        let mut buf = [0u8; 16];
        let mut read = -1;
        for _ in 0..200 {
            read = unsafe { libc::read(theirs, buf.as_mut_ptr().cast(), buf.len()) };
            if read > 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(&buf[..read as usize], b"wxyz");

        token.cancel();
        task.await.unwrap();
        unsafe {
            libc::close(ours);
            libc::close(theirs);
        }
    }
}
