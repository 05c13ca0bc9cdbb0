//! In-process driver emulation.
//!
//! [`LoopbackDriver`] plays the kernel side of the ring contract: `inject`
//! is the driver writing an arriving packet into a device's Send ring,
//! `collect` is the driver draining packets the process pushed onto the
//! Receive ring. Tests and the demo binary use it to run the whole data
//! path without a platform driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{Error, Result, TunError};
use super::endpoint::{DeviceHandle, DeviceProvisioner, EndpointOptions, RingPair};

#[derive(Default)]
pub struct LoopbackDriver {
    devices: Mutex<HashMap<u64, Option<RingPair>>>,
    next_id: AtomicU64,
    fail_next_registration: AtomicBool,
}

impl LoopbackDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `register_rings` call fail, for teardown-path tests.
    pub fn fail_next_registration(&self) {
        self.fail_next_registration.store(true, Ordering::Relaxed);
    }

    pub fn device_exists(&self, device: &DeviceHandle) -> bool {
        self.devices.lock().contains_key(&device.id)
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }

    fn rings(&self, device: &DeviceHandle) -> Result<RingPair> {
        self.devices
            .lock()
            .get(&device.id)
            .and_then(Clone::clone)
            .ok_or_else(|| Error::Tun(TunError::Closed(device.name.clone())))
    }

    /// Driver side: deliver a packet arriving "from the network" into the
    /// device's Send ring.
    pub fn inject(&self, device: &DeviceHandle, packet: &[u8]) -> Result<()> {
        Ok(self.rings(device)?.send.write(packet)?)
    }

    /// Driver side: pop one packet the process injected toward the device,
    /// without blocking.
    pub fn collect(&self, device: &DeviceHandle) -> Result<Option<Vec<u8>>> {
        Ok(self.rings(device)?.recv.read()?)
    }

    /// Driver side: pop one injected packet, waiting for one if none is
    /// queued. Same alertable protocol a real consumer uses.
    pub async fn collect_blocking(&self, device: &DeviceHandle) -> Result<Vec<u8>> {
        loop {
            let rings = self.rings(device)?;
            if let Some(packet) = rings.recv.read()? {
                return Ok(packet);
            }
            rings.recv.set_alertable(true);
            match rings.recv.read() {
                Ok(Some(packet)) => {
                    rings.recv.set_alertable(false);
                    return Ok(packet);
                }
                Ok(None) => {}
                Err(e) => {
                    rings.recv.set_alertable(false);
                    return Err(e.into());
                }
            }
            rings.recv.ready().wait().await;
            rings.recv.set_alertable(false);
        }
    }
}

impl DeviceProvisioner for LoopbackDriver {
    fn create_device(&self, options: &EndpointOptions) -> Result<DeviceHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.devices.lock().insert(id, None);
        Ok(DeviceHandle {
            id,
            name: options.name.clone(),
        })
    }

    fn register_rings(&self, device: &DeviceHandle, rings: RingPair) -> Result<()> {
        if self.fail_next_registration.swap(false, Ordering::Relaxed) {
            return Err(Error::Tun(TunError::RegisterRings(
                "injected registration failure".into(),
            )));
        }
        match self.devices.lock().get_mut(&device.id) {
            Some(slot) => {
                // A restart replaces the previous pair; the old rings die
                // with the last Arc.
                *slot = Some(rings);
                Ok(())
            }
            None => Err(Error::Tun(TunError::Closed(device.name.clone()))),
        }
    }

    fn destroy_device(&self, device: &DeviceHandle) {
        self.devices.lock().remove(&device.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{ChannelRing, Signal, MIN_RING_CAPACITY};
    use std::sync::Arc;

    fn pair() -> RingPair {
        RingPair {
            send: Arc::new(ChannelRing::new(MIN_RING_CAPACITY, Signal::new())),
            recv: Arc::new(ChannelRing::new(MIN_RING_CAPACITY, Signal::new())),
        }
    }

    #[test]
    fn inject_before_registration_fails() {
        let driver = LoopbackDriver::new();
        let device = driver
            .create_device(&EndpointOptions::default())
            .unwrap();
        assert!(driver.inject(&device, &[1]).is_err());
        driver.register_rings(&device, pair()).unwrap();
        driver.inject(&device, &[1]).unwrap();
    }

    #[test]
    fn destroy_forgets_the_device() {
        let driver = LoopbackDriver::new();
        let device = driver
            .create_device(&EndpointOptions::default())
            .unwrap();
        driver.register_rings(&device, pair()).unwrap();
        driver.destroy_device(&device);
        assert!(!driver.device_exists(&device));
        assert!(driver.register_rings(&device, pair()).is_err());
    }

    #[tokio::test]
    async fn collect_blocking_wakes_on_write() {
        let driver = Arc::new(LoopbackDriver::new());
        let device = driver
            .create_device(&EndpointOptions::default())
            .unwrap();
        let rings = pair();
        driver.register_rings(&device, rings.clone()).unwrap();

        let collector = {
            let driver = driver.clone();
            let device = device.clone();
            tokio::spawn(async move { driver.collect_blocking(&device).await })
        };
        tokio::task::yield_now().await;

        rings.recv.write(&[5, 6]).unwrap();
        let packet = tokio::time::timeout(std::time::Duration::from_secs(1), collector)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(packet, vec![5, 6]);
    }
}
