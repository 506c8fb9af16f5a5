//! On-Node Discovery
//!
//! Periodically inventories the node's block devices, classifies their
//! availability, and publishes the list to the node's
//! LocalVolumeDiscoveryResult whenever it changes. Probes run on a timer
//! and on coalesced kernel uevents.

use crate::crd::DiscoveredDevice;
use crate::diskmaker::metrics::DiskmakerMetrics;
use crate::domain::events;
use crate::domain::ports::{
    BlockListerRef, DeviceInspector, DeviceInspectorRef, DiscoveryResultsRef, EventSinkRef, OwnerEvent,
};
use crate::error::Result;
use crate::hardware::blockdev::BlockListing;
use crate::hardware::filter;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between timer-driven probes
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(300);

/// Window over which uevents collapse into one probe
pub const DEFAULT_UEVENT_WINDOW: Duration = Duration::from_secs(5);

// =============================================================================
// Inventory
// =============================================================================

/// Build the discovered-device list for a listing
///
/// Devices are deduplicated by device id (by path when they have none);
/// a later entry replaces an earlier one but keeps its position.
pub fn inventory(listing: &BlockListing, inspector: &dyn DeviceInspector) -> Vec<DiscoveredDevice> {
    let mut by_id: IndexMap<String, DiscoveredDevice> = IndexMap::new();

    for device in listing.devices.iter().filter(|d| filter::discoverable(d)) {
        let device_id = inspector
            .path_by_id(device)
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let discovered = DiscoveredDevice {
            device_id: device_id.clone(),
            path: device.dev_path().display().to_string(),
            model: device.model.clone(),
            r#type: device.device_type.clone(),
            vendor: device.vendor.clone(),
            serial: device.serial.clone(),
            size: device.size as i64,
            property: device.mechanical_property(),
            fstype: device.fstype.clone(),
            status: filter::classify(device, inspector),
        };
        let key = if device_id.is_empty() {
            discovered.path.clone()
        } else {
            device_id
        };
        by_id.insert(key, discovered);
    }

    by_id.into_values().collect()
}

// =============================================================================
// Discovery Agent
// =============================================================================

pub struct DiscoveryAgent {
    node_name: String,
    lister: BlockListerRef,
    inspector: DeviceInspectorRef,
    results: DiscoveryResultsRef,
    events: EventSinkRef,
    metrics: Arc<DiskmakerMetrics>,
    last_published: Mutex<Option<Vec<DiscoveredDevice>>>,
}

impl DiscoveryAgent {
    pub fn new(
        node_name: impl Into<String>,
        lister: BlockListerRef,
        inspector: DeviceInspectorRef,
        results: DiscoveryResultsRef,
        events: EventSinkRef,
        metrics: Arc<DiskmakerMetrics>,
    ) -> Self {
        Self {
            node_name: node_name.into(),
            lister,
            inspector,
            results,
            events,
            metrics,
            last_published: Mutex::new(None),
        }
    }

    /// Probe once; returns whether the result object was written
    pub async fn probe(&self) -> Result<bool> {
        let listing = self.lister.list().await?;
        let devices = inventory(&listing, self.inspector.as_ref());
        self.metrics
            .discovery_disk_count
            .with_label_values(&[self.node_name.as_str()])
            .set(devices.len() as i64);

        let previous = self.last_published.lock().clone();
        if previous.as_ref() == Some(&devices) {
            debug!("Device list unchanged ({} devices)", devices.len());
            return Ok(false);
        }

        let regarding = self.results.upsert(&self.node_name, &devices, Utc::now()).await?;
        info!("Published {} discovered devices", devices.len());

        let known: Vec<&str> = previous
            .iter()
            .flatten()
            .map(|d| d.path.as_str())
            .collect();
        for device in devices.iter().filter(|d| !known.contains(&d.path.as_str())) {
            self.events
                .publish(
                    &regarding,
                    OwnerEvent::normal(
                        events::DISCOVERED_NEW_DEVICE,
                        format!("found new device {} on {}", device.path, self.node_name),
                    ),
                )
                .await;
        }
        self.events
            .publish(
                &regarding,
                OwnerEvent::normal(
                    events::UPDATED_DISCOVERED_DEVICE_LIST,
                    format!("updated discovered device list on {}", self.node_name),
                ),
            )
            .await;

        *self.last_published.lock() = Some(devices);
        Ok(true)
    }

    /// Probe on every tick and uevent signal until cancelled
    pub async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut uevents: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        let mut uevents_open = true;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Discovery loop shutting down");
                    return;
                }
                _ = ticker.tick() => {}
                signal = uevents.recv(), if uevents_open => {
                    if signal.is_none() {
                        warn!("uevent monitor stopped; continuing on timer only");
                        uevents_open = false;
                        continue;
                    }
                    debug!("Probing after uevent");
                }
            }

            if let Err(e) = self.probe().await {
                error!("Discovery probe failed: {}", e);
            }
        }
    }
}

// =============================================================================
// uevent Monitor
// =============================================================================

/// Collapse bursts of lines into single signals
///
/// After the first line of a burst, further lines are absorbed until the
/// window elapses, then one signal is sent.
pub async fn coalesce(mut lines: mpsc::Receiver<String>, window: Duration, signals: mpsc::Sender<()>) {
    while lines.recv().await.is_some() {
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                line = lines.recv() => {
                    if line.is_none() {
                        break;
                    }
                }
            }
        }
        if signals.send(()).await.is_err() {
            return;
        }
    }
}

/// Spawn `udevadm monitor` for block devices and return coalesced signals
pub fn spawn_uevent_monitor(window: Duration, shutdown: CancellationToken) -> mpsc::Receiver<()> {
    let (signal_tx, signal_rx) = mpsc::channel(1);
    let (line_tx, line_rx) = mpsc::channel(64);

    tokio::spawn(coalesce(line_rx, window, signal_tx));
    tokio::spawn(async move {
        let child = Command::new("udevadm")
            .args(["monitor", "--kernel", "--subsystem-match=block"])
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Could not start udevadm monitor: {}", e);
                return;
            }
        };
        let Some(stdout) = child.stdout.take() else {
            return;
        };
        let mut reader = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                line = reader.next_line() => match line {
                    Ok(Some(line)) if line.contains("add") || line.contains("remove") || line.contains("change") => {
                        if line_tx.send(line).await.is_err() {
                            return;
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => return,
                },
            }
        }
    });

    signal_rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::DeviceAvailability;
    use crate::hardware::blockdev::BlockDevice;
    use crate::testing::{FakeInspector, FakeLister, RecordingEvents, RecordingResults};
    use std::path::PathBuf;

    fn disk(kname: &str, fstype: &str) -> BlockDevice {
        BlockDevice {
            name: kname.into(),
            kname: kname.into(),
            device_type: "disk".into(),
            size: 10 * 1024 * 1024 * 1024,
            state: "running".into(),
            fstype: fstype.into(),
            ..Default::default()
        }
    }

    struct Node {
        agent: DiscoveryAgent,
        lister: Arc<FakeLister>,
        results: Arc<RecordingResults>,
        events: Arc<RecordingEvents>,
        metrics: Arc<DiskmakerMetrics>,
    }

    fn node(name: &str, devices: Vec<BlockDevice>, inspector: FakeInspector) -> Node {
        let lister = Arc::new(FakeLister::new(devices));
        let results = Arc::new(RecordingResults::default());
        let events = Arc::new(RecordingEvents::default());
        let metrics = Arc::new(DiskmakerMetrics::new().unwrap());
        let agent = DiscoveryAgent::new(
            name,
            lister.clone(),
            Arc::new(inspector),
            results.clone(),
            events.clone(),
            metrics.clone(),
        );
        Node {
            agent,
            lister,
            results,
            events,
            metrics,
        }
    }

    #[tokio::test]
    async fn test_per_node_results() {
        let n2 = node("n2", vec![disk("sdb", "ext4"), disk("sdc", "")], FakeInspector::default());
        let n3 = node("n3", vec![], FakeInspector::default());

        assert!(n2.agent.probe().await.unwrap());
        assert!(n3.agent.probe().await.unwrap());

        let listed = n2.results.for_node("n2").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].path, "/dev/sdb");
        assert_eq!(listed[0].status, DeviceAvailability::NotAvailable);
        assert_eq!(listed[1].status, DeviceAvailability::Available);
        assert_eq!(n3.results.for_node("n3"), Some(vec![]));
        assert_eq!(
            n2.metrics.discovery_disk_count.with_label_values(&["n2"]).get(),
            2
        );
        assert!(n2
            .events
            .reasons()
            .contains(&events::UPDATED_DISCOVERED_DEVICE_LIST));
    }

    #[tokio::test]
    async fn test_unchanged_list_is_not_republished() {
        let n = node("n1", vec![disk("sdb", "")], FakeInspector::default());
        assert!(n.agent.probe().await.unwrap());
        assert!(!n.agent.probe().await.unwrap());
        assert_eq!(n.results.writes(), 1);

        n.lister.set_devices(vec![disk("sdb", ""), disk("sdc", "")]);
        assert!(n.agent.probe().await.unwrap());
        assert_eq!(n.results.writes(), 2);

        let new_devices = n
            .events
            .reasons()
            .iter()
            .filter(|r| **r == events::DISCOVERED_NEW_DEVICE)
            .count();
        assert_eq!(new_devices, 2);
    }

    #[test]
    fn test_inventory_dedupes_by_device_id() {
        let mut inspector = FakeInspector::default();
        inspector.by_id.insert("sdb".into(), PathBuf::from("/dev/disk/by-id/wwn-1"));
        inspector.by_id.insert("dm-0".into(), PathBuf::from("/dev/disk/by-id/wwn-1"));

        let mut mpath = disk("dm-0", "");
        mpath.device_type = "mpath".into();
        let mut rom = disk("sr0", "");
        rom.device_type = "rom".into();
        let listing = BlockListing {
            devices: vec![disk("sdb", ""), disk("sdc", ""), mpath, rom],
            bad_rows: vec![],
        };

        let devices = inventory(&listing, &inspector);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_id, "/dev/disk/by-id/wwn-1");
        assert_eq!(devices[0].path, "/dev/dm-0");
        assert_eq!(devices[1].path, "/dev/sdc");
        assert_eq!(devices[1].device_id, "");
    }

    #[tokio::test]
    async fn test_coalesce_bursts() {
        let (line_tx, line_rx) = mpsc::channel(16);
        let (signal_tx, mut signal_rx) = mpsc::channel(4);
        tokio::spawn(coalesce(line_rx, Duration::from_millis(50), signal_tx));

        for _ in 0..5 {
            line_tx.send("KERNEL add /devices/sdb".to_string()).await.unwrap();
        }
        assert_eq!(signal_rx.recv().await, Some(()));

        drop(line_tx);
        assert_eq!(signal_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let n = node("n1", vec![disk("sdb", "")], FakeInspector::default());
        let results = n.results.clone();
        let agent = Arc::new(n.agent);
        let (_tx, rx) = mpsc::channel(1);
        let token = CancellationToken::new();

        let handle = tokio::spawn(agent.run(Duration::from_millis(10), rx, token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        handle.await.unwrap();

        assert_eq!(results.writes(), 1);
    }
}
