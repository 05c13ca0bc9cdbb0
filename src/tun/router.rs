//! Multi-endpoint packet router.
//!
//! One long-lived task multiplexes every registered endpoint. The loop
//! alternates between two states: rebuild (snapshot the registry, mark every
//! Send ring alertable, drain each once so nothing written before the
//! snapshot is missed) and wait (sleep until the shutdown token, the
//! registry's membership signal, or any endpoint's data-ready signal fires).
//! Inbound delivery is a direct call path and never goes through the loop.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::tun::packet::IpPacket;

use super::endpoint::TunEndpoint;
use super::registry::TunRegistry;

/// A plaintext IP packet handed to the encryption pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainPacket {
    pub data: Vec<u8>,
    pub src: IpAddr,
    pub dst: IpAddr,
}

/// Collaborator boundary toward the IPsec side. Outbound plaintext packets
/// read from any endpoint are queued here for encryption.
pub trait EspPipeline: Send + Sync {
    fn queue_outbound(&self, packet: PlainPacket) -> Result<()>;
}

/// Router counters. All relaxed; read via [`RouterStats::snapshot`].
#[derive(Default)]
pub struct RouterStats {
    outbound_packets: AtomicU64,
    outbound_errors: AtomicU64,
    inbound_packets: AtomicU64,
    inbound_dropped: AtomicU64,
    inbound_no_route: AtomicU64,
    parse_errors: AtomicU64,
    endpoint_restarts: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub outbound_packets: u64,
    pub outbound_errors: u64,
    pub inbound_packets: u64,
    pub inbound_dropped: u64,
    pub inbound_no_route: u64,
    pub parse_errors: u64,
    pub endpoint_restarts: u64,
}

impl RouterStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            outbound_packets: self.outbound_packets.load(Ordering::Relaxed),
            outbound_errors: self.outbound_errors.load(Ordering::Relaxed),
            inbound_packets: self.inbound_packets.load(Ordering::Relaxed),
            inbound_dropped: self.inbound_dropped.load(Ordering::Relaxed),
            inbound_no_route: self.inbound_no_route.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            endpoint_restarts: self.endpoint_restarts.load(Ordering::Relaxed),
        }
    }
}

/// What fired in the wait state.
enum Wake {
    Shutdown,
    Membership,
    Endpoint(usize),
}

/// What a drain pass concluded.
enum Drained {
    Idle,
    NeedsRebuild,
}

pub struct PacketRouter {
    registry: Arc<TunRegistry>,
    pipeline: Arc<dyn EspPipeline>,
    stats: Arc<RouterStats>,
    shutdown: CancellationToken,
}

impl PacketRouter {
    pub fn new(registry: Arc<TunRegistry>, pipeline: Arc<dyn EspPipeline>) -> Self {
        Self {
            registry,
            pipeline,
            stats: Arc::new(RouterStats::default()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn stats(&self) -> Arc<RouterStats> {
        self.stats.clone()
    }

    /// Token that stops the loop. After cancellation the router touches no
    /// ring again.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    /// The event loop. Returns after the shutdown token is cancelled.
    pub async fn run(&self) {
        info!("packet router started");
        'rebuild: loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            let membership = self.registry.changed();
            let endpoints: Vec<Arc<TunEndpoint>> = self
                .registry
                .snapshot()
                .into_iter()
                .filter(|ep| ep.set_alertable(true).is_ok())
                .collect();

            // Drain once before sleeping; a packet written before the
            // alertable store raised no signal.
            for endpoint in &endpoints {
                if matches!(self.drain_endpoint(endpoint), Drained::NeedsRebuild) {
                    continue 'rebuild;
                }
            }

            loop {
                match self.wait(&membership, &endpoints).await {
                    Wake::Shutdown => break 'rebuild,
                    Wake::Membership => continue 'rebuild,
                    Wake::Endpoint(i) => {
                        if matches!(self.drain_endpoint(&endpoints[i]), Drained::NeedsRebuild) {
                            continue 'rebuild;
                        }
                    }
                }
            }
        }
        // Best effort: stop asking drivers for wakeups we will not consume.
        for endpoint in self.registry.snapshot() {
            let _ = endpoint.set_alertable(false);
        }
        info!("packet router stopped");
    }

    async fn wait(&self, membership: &crate::ring::Signal, endpoints: &[Arc<TunEndpoint>]) -> Wake {
        let mut waits: Vec<Pin<Box<dyn Future<Output = Wake> + Send>>> =
            Vec::with_capacity(endpoints.len() + 2);
        let shutdown = self.shutdown.clone();
        waits.push(Box::pin(async move {
            shutdown.cancelled().await;
            Wake::Shutdown
        }));
        let membership = membership.clone();
        waits.push(Box::pin(async move {
            membership.wait().await;
            Wake::Membership
        }));
        for (i, endpoint) in endpoints.iter().enumerate() {
            let signal = endpoint.send_ready();
            waits.push(Box::pin(async move {
                signal.wait().await;
                Wake::Endpoint(i)
            }));
        }
        let (wake, _, _) = futures::future::select_all(waits).await;
        wake
    }

    /// Read an endpoint's Send ring until empty, queueing every parsed
    /// packet outbound. Corruption triggers the restart path; no single
    /// endpoint failure stops the loop.
    fn drain_endpoint(&self, endpoint: &TunEndpoint) -> Drained {
        loop {
            match endpoint.read_packet() {
                Ok(Some(packet)) => self.process_outbound(endpoint, packet),
                Ok(None) => return Drained::Idle,
                Err(e) if e.needs_restart() => {
                    warn!(device = %endpoint.name(), error = %e, "ring unusable, restarting endpoint");
                    self.stats.endpoint_restarts.fetch_add(1, Ordering::Relaxed);
                    if endpoint.restart().is_err() {
                        // restart() already closed the endpoint; drop it
                        // from the registry so the loop stops waiting on it.
                        if let Some(address) = endpoint.address() {
                            self.registry.unregister(&address);
                        }
                    }
                    return Drained::NeedsRebuild;
                }
                Err(e) => {
                    debug!(device = %endpoint.name(), error = %e, "endpoint gone, rebuilding");
                    return Drained::NeedsRebuild;
                }
            }
        }
    }

    fn process_outbound(&self, endpoint: &TunEndpoint, data: Vec<u8>) {
        let (src, dst) = match IpPacket::parse(&data) {
            Ok(packet) => (packet.src_addr, packet.dst_addr),
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(device = %endpoint.name(), error = %e, len = data.len(), "discarding unparseable outbound packet");
                return;
            }
        };
        match self.pipeline.queue_outbound(PlainPacket { data, src, dst }) {
            Ok(()) => {
                self.stats.outbound_packets.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.outbound_errors.fetch_add(1, Ordering::Relaxed);
                warn!(device = %endpoint.name(), error = %e, "pipeline rejected outbound packet");
            }
        }
    }

    /// Deliver a decrypted plaintext packet to the endpoint owning its
    /// destination address.
    ///
    /// A full Receive ring drops the packet with a warning; there is no
    /// retry queue at this boundary. Unparseable packets and unroutable
    /// destinations are counted and discarded, not surfaced as errors; a
    /// discarded packet is not a delivery failure for the caller.
    pub fn deliver_plain(&self, packet: &[u8]) -> Result<()> {
        let parsed = match IpPacket::parse(packet) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.stats.parse_errors.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, len = packet.len(), "discarding unparseable inbound packet");
                return Ok(());
            }
        };
        let Some(endpoint) = self.registry.lookup(&parsed.dst_addr) else {
            self.stats.inbound_no_route.fetch_add(1, Ordering::Relaxed);
            debug!(dst = %parsed.dst_addr, "no endpoint for inbound packet");
            return Ok(());
        };
        match endpoint.write_packet(packet) {
            Ok(()) => {
                self.stats.inbound_packets.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) if e.is_backpressure() => {
                self.stats.inbound_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(device = %endpoint.name(), dst = %parsed.dst_addr, "receive ring full, dropping inbound packet");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl std::fmt::Debug for PacketRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketRouter")
            .field("registry", &self.registry)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::endpoint::EndpointOptions;
    use super::super::loopback::LoopbackDriver;
    use super::super::packet::build_ipv4_udp;
    use super::*;
    use crate::ring::MIN_RING_CAPACITY;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct CapturePipeline {
        queued: Mutex<Vec<PlainPacket>>,
    }

    impl EspPipeline for CapturePipeline {
        fn queue_outbound(&self, packet: PlainPacket) -> Result<()> {
            self.queued.lock().push(packet);
            Ok(())
        }
    }

    fn endpoint(driver: &Arc<LoopbackDriver>, name: &str, address: &str) -> Arc<TunEndpoint> {
        TunEndpoint::create(
            driver.clone(),
            EndpointOptions {
                name: name.to_string(),
                address: Some(address.parse().unwrap()),
                ring_capacity: MIN_RING_CAPACITY,
                ..EndpointOptions::default()
            },
        )
        .unwrap()
    }

    async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn outbound_packet_reaches_pipeline() {
        let driver = Arc::new(LoopbackDriver::new());
        let registry = Arc::new(TunRegistry::new());
        let pipeline = Arc::new(CapturePipeline::default());
        let router = Arc::new(PacketRouter::new(registry.clone(), pipeline.clone()));
        let token = router.shutdown_token();
        let handle = router.clone().spawn();

        let ep = endpoint(&driver, "tun-out", "10.0.0.1");
        registry.register(ep.clone()).unwrap();

        let packet = build_ipv4_udp(
            "10.0.0.1".parse().unwrap(),
            "192.0.2.50".parse().unwrap(),
            b"hello",
        );
        driver.inject(ep.device(), &packet).unwrap();

        eventually("pipeline to receive the packet", || {
            !pipeline.queued.lock().is_empty()
        })
        .await;
        {
            let queued = pipeline.queued.lock();
            assert_eq!(queued.len(), 1);
            assert_eq!(queued[0].data, packet);
            assert_eq!(queued[0].dst, "192.0.2.50".parse::<IpAddr>().unwrap());
        }
        assert_eq!(router.stats().snapshot().outbound_packets, 1);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unparseable_outbound_is_discarded() {
        let driver = Arc::new(LoopbackDriver::new());
        let registry = Arc::new(TunRegistry::new());
        let pipeline = Arc::new(CapturePipeline::default());
        let router = Arc::new(PacketRouter::new(registry.clone(), pipeline.clone()));
        let token = router.shutdown_token();
        let handle = router.clone().spawn();

        let ep = endpoint(&driver, "tun-bad", "10.0.0.2");
        registry.register(ep.clone()).unwrap();
        driver.inject(ep.device(), &[0xFF, 0xFF, 0xFF]).unwrap();

        let stats = router.stats();
        eventually("parse error to be counted", || {
            stats.snapshot().parse_errors == 1
        })
        .await;
        assert!(pipeline.queued.lock().is_empty());

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn membership_change_picks_up_new_endpoint() {
        let driver = Arc::new(LoopbackDriver::new());
        let registry = Arc::new(TunRegistry::new());
        let pipeline = Arc::new(CapturePipeline::default());
        let router = Arc::new(PacketRouter::new(registry.clone(), pipeline.clone()));
        let token = router.shutdown_token();
        let handle = router.clone().spawn();
        tokio::task::yield_now().await;

        // Registered after the router is already waiting.
        let ep = endpoint(&driver, "tun-late", "10.0.0.3");
        registry.register(ep.clone()).unwrap();

        let packet = build_ipv4_udp(
            "10.0.0.3".parse().unwrap(),
            "198.51.100.1".parse().unwrap(),
            b"late",
        );
        driver.inject(ep.device(), &packet).unwrap();

        eventually("late endpoint's packet to arrive", || {
            !pipeline.queued.lock().is_empty()
        })
        .await;

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn corruption_restarts_endpoint_and_traffic_resumes() {
        let driver = Arc::new(LoopbackDriver::new());
        let registry = Arc::new(TunRegistry::new());
        let pipeline = Arc::new(CapturePipeline::default());
        let router = Arc::new(PacketRouter::new(registry.clone(), pipeline.clone()));
        let token = router.shutdown_token();

        let ep = endpoint(&driver, "tun-corrupt", "10.0.0.4");
        registry.register(ep.clone()).unwrap();

        // Poison the ring before the router ever reads it.
        driver.inject(ep.device(), &[1, 2, 3, 4]).unwrap();
        ep.corrupt_send_ring();

        let handle = router.clone().spawn();

        eventually("endpoint to be restarted", || ep.restart_count() == 1).await;
        assert_eq!(router.stats().snapshot().endpoint_restarts, 1);

        // The rebuilt rings carry traffic again.
        let packet = build_ipv4_udp(
            "10.0.0.4".parse().unwrap(),
            "203.0.113.9".parse().unwrap(),
            b"back",
        );
        driver.inject(ep.device(), &packet).unwrap();
        eventually("traffic to resume after restart", || {
            !pipeline.queued.lock().is_empty()
        })
        .await;

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn deliver_plain_routes_by_destination() {
        let driver = Arc::new(LoopbackDriver::new());
        let registry = Arc::new(TunRegistry::new());
        let router = PacketRouter::new(registry.clone(), Arc::new(CapturePipeline::default()));

        let a = endpoint(&driver, "tun-a", "10.0.0.10");
        let b = endpoint(&driver, "tun-b", "10.0.0.11");
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        let to_b = build_ipv4_udp(
            "192.0.2.1".parse().unwrap(),
            "10.0.0.11".parse().unwrap(),
            b"for b",
        );
        router.deliver_plain(&to_b).unwrap();

        assert!(driver.collect(a.device()).unwrap().is_none());
        assert_eq!(driver.collect(b.device()).unwrap().unwrap(), to_b);
        assert_eq!(router.stats().snapshot().inbound_packets, 1);
    }

    #[tokio::test]
    async fn deliver_plain_falls_back_to_default() {
        let driver = Arc::new(LoopbackDriver::new());
        let registry = Arc::new(TunRegistry::new());
        let router = PacketRouter::new(registry.clone(), Arc::new(CapturePipeline::default()));

        let default = endpoint(&driver, "tun-default", "10.0.0.20");
        registry.set_default(default.clone());

        let stray = build_ipv4_udp(
            "192.0.2.1".parse().unwrap(),
            "172.16.5.5".parse().unwrap(),
            b"stray",
        );
        router.deliver_plain(&stray).unwrap();
        assert_eq!(driver.collect(default.device()).unwrap().unwrap(), stray);
    }

    #[tokio::test]
    async fn deliver_plain_drops_on_full_ring() {
        let driver = Arc::new(LoopbackDriver::new());
        let registry = Arc::new(TunRegistry::new());
        let router = PacketRouter::new(registry.clone(), Arc::new(CapturePipeline::default()));

        let ep = endpoint(&driver, "tun-full", "10.0.0.30");
        registry.register(ep.clone()).unwrap();

        let packet = build_ipv4_udp(
            "192.0.2.1".parse().unwrap(),
            "10.0.0.30".parse().unwrap(),
            &[0u8; 60_000],
        );
        // Fill the Receive ring; nobody is collecting on the driver side.
        while ep.write_packet(&packet).is_ok() {}

        router.deliver_plain(&packet).unwrap();
        let snapshot = router.stats().snapshot();
        assert_eq!(snapshot.inbound_dropped, 1);
        assert_eq!(snapshot.inbound_packets, 0);
    }

    #[tokio::test]
    async fn deliver_plain_discards_unparseable_without_error() {
        let driver = Arc::new(LoopbackDriver::new());
        let registry = Arc::new(TunRegistry::new());
        let router = PacketRouter::new(registry.clone(), Arc::new(CapturePipeline::default()));

        let ep = endpoint(&driver, "tun-junk", "10.0.0.40");
        registry.register(ep.clone()).unwrap();

        router.deliver_plain(&[0xFF, 0x00, 0x01]).unwrap();
        let snapshot = router.stats().snapshot();
        assert_eq!(snapshot.parse_errors, 1);
        assert_eq!(snapshot.inbound_packets, 0);
        assert!(driver.collect(ep.device()).unwrap().is_none());
    }

    #[tokio::test]
    async fn deliver_plain_without_route_counts() {
        let registry = Arc::new(TunRegistry::new());
        let router = PacketRouter::new(registry, Arc::new(CapturePipeline::default()));

        let packet = build_ipv4_udp(
            "192.0.2.1".parse().unwrap(),
            "10.99.99.99".parse().unwrap(),
            b"nowhere",
        );
        router.deliver_plain(&packet).unwrap();
        assert_eq!(router.stats().snapshot().inbound_no_route, 1);
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let registry = Arc::new(TunRegistry::new());
        let router = Arc::new(PacketRouter::new(
            registry,
            Arc::new(CapturePipeline::default()),
        ));
        let token = router.shutdown_token();
        let handle = router.spawn();
        tokio::task::yield_now().await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
