//! The `Bus`: the per-connection poll loop.
//!
//! This is the part everything else in this crate exists to support: one
//! cooperative loop that, each cycle, picks a device, sends its next frame,
//! waits out a reply window, and updates that device's state before handing
//! the result to the `ReplyDispatcher`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, trace_span, warn};

use crate::command::Command;
use crate::config::BusConfig;
use crate::connection::{Connection, ConnectionId, ReadOutcome};
use crate::device::{AcceptOutcome, Address, DeviceProxy};
use crate::dispatcher::BusEvent;
use crate::error::{Error, Result};
use crate::frame::FrameReader;

type Roster = Arc<Mutex<BTreeMap<Address, DeviceProxy>>>;

/// Owns one `Connection` and the `DeviceProxy` roster for it. Spawned by
/// `ControlPanel::start_connection`; driven entirely by its own background
/// task. The roster is reachable from the facade (`add_device`,
/// `enqueue`, ...) concurrently with the poll loop, serialised by this
/// mutex rather than by single-task exclusivity, via the shared `Roster`.
pub struct Bus {
    id: ConnectionId,
    devices: Roster,
    config: BusConfig,
    running: Arc<AtomicBool>,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Bus {
    pub(crate) fn spawn(
        id: ConnectionId,
        connection: Box<dyn Connection>,
        config: BusConfig,
        reply_tx: mpsc::UnboundedSender<BusEvent>,
    ) -> Self {
        let devices: Roster = Arc::new(Mutex::new(BTreeMap::new()));
        let running = Arc::new(AtomicBool::new(true));
        let cursor = Arc::new(Mutex::new(None::<Address>));

        let handle = tokio::spawn(Self::run_loop(
            id,
            connection,
            Arc::clone(&devices),
            cursor,
            config,
            Arc::clone(&running),
            reply_tx,
        ));

        Self {
            id,
            devices,
            config,
            running,
            join_handle: Mutex::new(Some(handle)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn add_device(
        &self,
        address: Address,
        use_crc: bool,
        use_secure_channel: bool,
        key: Option<[u8; 16]>,
    ) {
        let device = DeviceProxy::with_offline_threshold(
            address,
            use_crc,
            use_secure_channel,
            key,
            self.config.offline_threshold,
        );
        self.devices.lock().await.insert(address, device);
        debug!(connection_id = %self.id, %address, "device added");
    }

    pub async fn remove_device(&self, address: Address) {
        self.devices.lock().await.remove(&address);
        debug!(connection_id = %self.id, %address, "device removed");
    }

    pub async fn has_device(&self, address: Address) -> bool {
        self.devices.lock().await.contains_key(&address)
    }

    pub async fn is_online(&self, address: Address) -> Option<bool> {
        self.devices.lock().await.get(&address).map(DeviceProxy::online)
    }

    pub async fn reset_device(&self, address: Address) -> bool {
        let mut guard = self.devices.lock().await;
        match guard.get_mut(&address) {
            Some(device) => {
                device.reset();
                true
            }
            None => false,
        }
    }

    /// Queue `command` for transmission. Fails with `UnknownDevice` if
    /// `address` isn't registered on this bus, rejecting the command rather
    /// than silently dropping it.
    pub async fn enqueue(&self, address: Address, command: Command) -> Result<()> {
        let mut guard = self.devices.lock().await;
        match guard.get_mut(&address) {
            Some(device) => {
                device.enqueue(command);
                Ok(())
            }
            None => Err(Error::UnknownDevice(address)),
        }
    }

    /// Stop the poll loop after its current cycle and close the
    /// connection. Idempotent.
    pub async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.join_handle.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run_loop(
        id: ConnectionId,
        mut connection: Box<dyn Connection>,
        devices: Roster,
        cursor: Arc<Mutex<Option<Address>>>,
        config: BusConfig,
        running: Arc<AtomicBool>,
        reply_tx: mpsc::UnboundedSender<BusEvent>,
    ) {
        if let Err(e) = connection.open().await {
            error!(connection_id = %id, error = %e, "initial connection open failed");
        }

        while running.load(Ordering::Relaxed) {
            let cycle_start = Instant::now();

            if !connection.is_open() {
                match connection.open().await {
                    Ok(()) => {
                        // Every device's prior sequence and secure session
                        // are stale the moment the link dropped, since a PD
                        // resets its own expected sequence on reconnection
                        // too. Same "reconnection invalidates prior state"
                        // logic `ControlPanel::reset_device` uses.
                        let mut guard = devices.lock().await;
                        for device in guard.values_mut() {
                            device.reset();
                        }
                        debug!(connection_id = %id, "connection reopened, device state reset");
                    }
                    Err(e) => {
                        error!(connection_id = %id, error = %e, "reconnect failed, retrying next cycle");
                        tokio::time::sleep(config.poll_interval).await;
                        continue;
                    }
                }
            }

            let next_addr = {
                let guard = devices.lock().await;
                let cur = *cursor.lock().await;
                pick_next(&guard, cur)
            };

            if let Some(addr) = next_addr {
                *cursor.lock().await = Some(addr);
                Self::poll_one(id, addr, connection.as_mut(), &devices, &config, &reply_tx).await;
            }

            let elapsed = cycle_start.elapsed();
            if elapsed < config.poll_interval {
                tokio::time::sleep(config.poll_interval - elapsed).await;
            }
        }

        let _ = connection.close().await;
    }

    async fn poll_one(
        id: ConnectionId,
        addr: Address,
        connection: &mut dyn Connection,
        devices: &Roster,
        config: &BusConfig,
        reply_tx: &mpsc::UnboundedSender<BusEvent>,
    ) {
        let span = trace_span!("poll_cycle", connection_id = %id, address = %addr);
        let _enter = span.enter();

        let outbound = {
            let mut guard = devices.lock().await;
            match guard.get_mut(&addr) {
                Some(device) => device.next_outbound(),
                None => return,
            }
        };

        if let Err(e) = connection.write(&outbound).await {
            warn!(error = %e, "write failed");
            Self::record_miss(id, addr, devices, reply_tx).await;
            return;
        }

        let mut reader = FrameReader::new();
        match Self::read_one_frame(connection, &mut reader, config.reply_window).await {
            Some(bytes) => Self::handle_candidate(id, addr, &bytes, devices, reply_tx).await,
            None => {
                trace!("no reply within window");
                Self::record_miss(id, addr, devices, reply_tx).await;
            }
        }
    }

    async fn handle_candidate(
        id: ConnectionId,
        addr: Address,
        bytes: &[u8],
        devices: &Roster,
        reply_tx: &mpsc::UnboundedSender<BusEvent>,
    ) {
        let outcome = {
            let mut guard = devices.lock().await;
            match guard.get_mut(&addr) {
                Some(device) => device.accept_reply(bytes),
                None => return,
            }
        };

        match outcome {
            Ok(accept_outcome) => {
                let became_online = {
                    let mut guard = devices.lock().await;
                    guard.get_mut(&addr).map(DeviceProxy::mark_alive).unwrap_or(false)
                };
                if became_online {
                    debug!(connection_id = %id, %addr, "device online");
                    let _ = reply_tx.send(BusEvent::ConnectionStatusChanged {
                        connection_id: id,
                        address: addr,
                        online: true,
                    });
                }
                let reply = match accept_outcome {
                    AcceptOutcome::Delivered(r) => r,
                    AcceptOutcome::Unsolicited(r) => r,
                }
                .with_connection_id(id);
                let _ = reply_tx.send(BusEvent::Reply(reply));
            }
            Err(e) => {
                warn!(error = %e, "frame rejected, counted as a miss");
                {
                    let mut guard = devices.lock().await;
                    if let Some(device) = guard.get_mut(&addr) {
                        device.set_last_error(e);
                    }
                }
                Self::record_miss(id, addr, devices, reply_tx).await;
            }
        }
    }

    async fn record_miss(
        id: ConnectionId,
        addr: Address,
        devices: &Roster,
        reply_tx: &mpsc::UnboundedSender<BusEvent>,
    ) {
        let became_offline = {
            let mut guard = devices.lock().await;
            guard.get_mut(&addr).map(DeviceProxy::on_timeout).unwrap_or(false)
        };
        if became_offline {
            warn!(connection_id = %id, %addr, "device offline");
            let _ = reply_tx.send(BusEvent::ConnectionStatusChanged {
                connection_id: id,
                address: addr,
                online: false,
            });
        }
    }

    /// Read until `reader` yields a length-complete candidate frame or
    /// `window` elapses. Checksum/CRC/MAC validation happens later, inside
    /// `DeviceProxy::accept_reply` — this only buffers and resynchronises.
    async fn read_one_frame(
        connection: &mut dyn Connection,
        reader: &mut FrameReader,
        window: Duration,
    ) -> Option<Vec<u8>> {
        let deadline = Instant::now() + window;
        let mut buf = [0u8; 512];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match connection.read(&mut buf, remaining).await {
                Ok(ReadOutcome::Read(0)) => continue,
                Ok(ReadOutcome::Read(n)) => {
                    reader.feed(&buf[..n]);
                    if let Some(candidate) = reader.try_take_frame() {
                        return Some(candidate);
                    }
                }
                Ok(ReadOutcome::Timeout) => return None,
                Err(e) => {
                    error!(error = %e, "connection read error");
                    return None;
                }
            }
        }
    }
}

/// Round-robin over `devices` by address, with a stable ordering so every
/// registered device gets an even share of poll cycles. `cursor` is the
/// last address polled; the next one is the
/// smallest address strictly greater than it, wrapping to the smallest
/// address overall once the end of the roster is reached.
fn pick_next(devices: &BTreeMap<Address, DeviceProxy>, cursor: Option<Address>) -> Option<Address> {
    if devices.is_empty() {
        return None;
    }
    if let Some(cur) = cursor {
        let after = devices
            .range((std::ops::Bound::Excluded(cur), std::ops::Bound::Unbounded))
            .next();
        if let Some((&addr, _)) = after {
            return Some(addr);
        }
    }
    devices.keys().next().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u8) -> Address {
        Address::new(n).unwrap()
    }

    fn roster(addrs: &[u8]) -> BTreeMap<Address, DeviceProxy> {
        addrs
            .iter()
            .map(|&a| (addr(a), DeviceProxy::new(addr(a), false, false, None)))
            .collect()
    }

    #[test]
    fn round_robin_wraps_in_address_order() {
        let devices = roster(&[1, 5, 9]);
        let mut cursor = None;
        let mut order = Vec::new();
        for _ in 0..6 {
            let next = pick_next(&devices, cursor).unwrap();
            order.push(next.raw());
            cursor = Some(next);
        }
        assert_eq!(order, vec![1, 5, 9, 1, 5, 9]);
    }

    #[test]
    fn round_robin_skips_removed_addresses() {
        let mut devices = roster(&[1, 5, 9]);
        let cursor = Some(addr(1));
        devices.remove(&addr(5));
        let next = pick_next(&devices, cursor).unwrap();
        assert_eq!(next.raw(), 9);
    }

    #[test]
    fn empty_roster_has_no_next() {
        let devices = BTreeMap::new();
        assert!(pick_next(&devices, None).is_none());
    }
}
