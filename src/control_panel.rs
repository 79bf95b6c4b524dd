//! `ControlPanel`: the façade a caller actually holds.
//!
//! Owns every `Bus` this process drives plus the single `ReplyDispatcher`
//! they all report to, and adds the two things that don't belong inside a
//! `Bus`: per-device PIV serialisation and multi-part reassembly. Command
//! correlation itself is just `ReplyDispatcher::register_pending` followed
//! by `Bus::enqueue`, in that order — the ordering that removes the
//! source's post-send handler registration race (see `crate::dispatcher`).

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::warn;

use crate::bus::Bus;
use crate::command::{Command, CommandCode, Reply, ReplyKind};
use crate::config::BusConfig;
use crate::connection::{allocate_connection_id, Connection, ConnectionId};
use crate::device::Address;
use crate::dispatcher::{BusEvent, ReplyDispatcher};
use crate::error::{Error, Result};
use crate::piv::{parse_piv_fragment, ReassemblyBuffer};

/// A one-shot cancellation signal for `send_command`/`get_piv_data`. The
/// caller keeps the paired `oneshot::Sender<()>` and sends on it to cancel;
/// dropping the sender without sending is equivalent to never cancelling.
pub type CancelSignal = oneshot::Receiver<()>;

struct PivState {
    buffer: Option<ReassemblyBuffer>,
    waiter: Option<oneshot::Sender<Vec<u8>>>,
}

struct Inner {
    dispatcher: Arc<ReplyDispatcher>,
    bus_event_tx: mpsc::UnboundedSender<BusEvent>,
    buses: StdMutex<HashMap<ConnectionId, Arc<Bus>>>,
    piv_locks: StdMutex<HashMap<(ConnectionId, Address), Arc<Semaphore>>>,
    piv_state: StdMutex<HashMap<(ConnectionId, Address), PivState>>,
    default_config: BusConfig,
}

impl Inner {
    /// Feed one `PIVData` reply into whatever reassembly buffer is waiting
    /// for `(reply.connection_id, reply.address)`, and complete that PIV
    /// caller's waiter if this fragment finishes the buffer. Called from the
    /// dispatcher's `PivData` listener for *every* such reply — first
    /// fragment included, since the listener fires for delivered replies
    /// too — so there is exactly one reassembly code path, not
    /// one for the first fragment and another for the rest.
    fn feed_piv_fragment(inner: &Arc<Inner>, reply: &Reply) {
        let key = (reply.connection_id, reply.address);
        let fragment = match parse_piv_fragment(&reply.payload) {
            Ok(f) => f,
            Err(e) => {
                warn!(address = %reply.address, error = %e, "piv fragment malformed, discarding buffer");
                inner.piv_state.lock().unwrap().remove(&key);
                return;
            }
        };

        let mut state_map = inner.piv_state.lock().unwrap();
        let Some(state) = state_map.get_mut(&key) else {
            // No in-flight get_piv_data for this device: a stray fragment,
            // most likely from a transaction that already timed out.
            return;
        };

        let needs_restart = state
            .buffer
            .as_ref()
            .map(|b| b.whole_length != fragment.whole_length)
            .unwrap_or(false);
        if state.buffer.is_none() || needs_restart {
            state.buffer = Some(ReassemblyBuffer::new(fragment.whole_length));
        }
        let buffer = state.buffer.as_mut().unwrap();

        if let Err(e) = buffer.write_fragment(fragment.offset, &fragment.bytes) {
            warn!(address = %reply.address, error = %e, "piv fragment out of range, discarding buffer");
            state.buffer = None;
            return;
        }

        if buffer.is_complete() {
            let bytes = state.buffer.take().unwrap().into_bytes();
            if let Some(waiter) = state.waiter.take() {
                let _ = waiter.send(bytes);
            }
        }
    }
}

/// Waits on `cancel` if present, otherwise never resolves. Consumed by
/// value so a single `tokio::select!` can race it against one transaction
/// future without needing to keep the receiver alive afterwards.
async fn wait_cancel(cancel: Option<CancelSignal>) {
    match cancel {
        Some(rx) => {
            let _ = rx.await;
        }
        None => std::future::pending::<()>().await,
    }
}

/// The top-level handle a caller constructs once per process (or once per
/// set of buses it wants correlated through one dispatcher). Cheaply
/// cloneable — everything lives behind `Arc`.
#[derive(Clone)]
pub struct ControlPanel {
    inner: Arc<Inner>,
}

impl Default for ControlPanel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlPanel {
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    pub fn with_config(default_config: BusConfig) -> Self {
        let (dispatcher, bus_event_tx) = ReplyDispatcher::spawn();
        let inner = Arc::new(Inner {
            dispatcher,
            bus_event_tx,
            buses: StdMutex::new(HashMap::new()),
            piv_locks: StdMutex::new(HashMap::new()),
            piv_state: StdMutex::new(HashMap::new()),
            default_config,
        });

        let weak: Weak<Inner> = Arc::downgrade(&inner);
        inner.dispatcher.register_listener(ReplyKind::PivData, move |reply| {
            if let Some(inner) = weak.upgrade() {
                Inner::feed_piv_fragment(&inner, reply);
            }
        });

        Self { inner }
    }

    fn bus(&self, connection_id: ConnectionId) -> Result<Arc<Bus>> {
        self.inner
            .buses
            .lock()
            .unwrap()
            .get(&connection_id)
            .cloned()
            .ok_or(Error::UnknownConnection(connection_id))
    }

    /// Start driving `connection` with a new `Bus`, using `config` or the
    /// panel's default. Returns the `ConnectionId` callers use to address
    /// this bus from every other method.
    pub fn start_connection(&self, connection: Box<dyn Connection>, config: Option<BusConfig>) -> ConnectionId {
        let id = allocate_connection_id();
        let cfg = config.unwrap_or(self.inner.default_config);
        let bus = Bus::spawn(id, connection, cfg, self.inner.bus_event_tx.clone());
        self.inner.buses.lock().unwrap().insert(id, Arc::new(bus));
        id
    }

    pub async fn add_device(
        &self,
        connection_id: ConnectionId,
        address: Address,
        use_crc: bool,
        use_secure_channel: bool,
        key: Option<[u8; 16]>,
    ) -> Result<()> {
        let bus = self.bus(connection_id)?;
        bus.add_device(address, use_crc, use_secure_channel, key).await;
        Ok(())
    }

    pub async fn remove_device(&self, connection_id: ConnectionId, address: Address) -> Result<()> {
        let bus = self.bus(connection_id)?;
        bus.remove_device(address).await;
        self.inner.piv_locks.lock().unwrap().remove(&(connection_id, address));
        self.inner.piv_state.lock().unwrap().remove(&(connection_id, address));
        Ok(())
    }

    pub async fn is_online(&self, connection_id: ConnectionId, address: Address) -> Result<bool> {
        let bus = self.bus(connection_id)?;
        bus.is_online(address).await.ok_or(Error::UnknownDevice(address))
    }

    pub async fn reset_device(&self, connection_id: ConnectionId, address: Address) -> Result<()> {
        let bus = self.bus(connection_id)?;
        if bus.reset_device(address).await {
            Ok(())
        } else {
            Err(Error::UnknownDevice(address))
        }
    }

    /// Register a listener invoked for every reply of `kind`, delivered or
    /// unsolicited. Listener panics are caught and logged, never propagated
    ///.
    pub fn on_reply<F>(&self, kind: ReplyKind, listener: F)
    where
        F: Fn(&Reply) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_listener(kind, listener);
    }

    pub fn on_connection_status_changed<F>(&self, listener: F)
    where
        F: Fn(ConnectionId, Address, bool) + Send + Sync + 'static,
    {
        self.inner.dispatcher.register_status_listener(listener);
    }

    /// Issue `command` and wait for a matching reply. The
    /// pending request is registered with the dispatcher before the command
    /// ever reaches the `Bus`, so a reply cannot race ahead of its own
    /// correlation entry. Defaults to `BusConfig::command_timeout` when
    /// `timeout` is `None`.
    pub async fn send_command(
        &self,
        connection_id: ConnectionId,
        command: Command,
        timeout: Option<std::time::Duration>,
        cancel: Option<CancelSignal>,
    ) -> Result<Reply> {
        let bus = self.bus(connection_id)?;
        let address = command.address();
        if !bus.has_device(address).await {
            return Err(Error::UnknownDevice(address));
        }

        let transaction_id = command.transaction_id();
        let deadline = timeout.unwrap_or(self.inner.default_config.command_timeout);
        let reply_rx = self.inner.dispatcher.register_pending(connection_id, address, transaction_id);

        if let Err(e) = bus.enqueue(address, command).await {
            self.inner.dispatcher.cancel_pending(connection_id, address, transaction_id);
            return Err(e);
        }

        let result = tokio::select! {
            reply = reply_rx => reply.map_err(|_| Error::Timeout),
            _ = tokio::time::sleep(deadline) => Err(Error::Timeout),
            _ = wait_cancel(cancel) => Err(Error::Cancelled),
        };

        if result.is_err() {
            self.inner.dispatcher.cancel_pending(connection_id, address, transaction_id);
        }
        result
    }

    /// Fetch the full, reassembled PIV data object for `address`. Each
    /// round trip nets one fragment, so this re-issues
    /// `GetPivData` until the reassembly buffer reports complete, a `Nak`
    /// arrives, or the deadline elapses. At most one `get_piv_data`
    /// transaction runs per device at a time — concurrent callers queue on a
    /// per-device semaphore and are served one after another; a cancelled or
    /// timed-out caller releases that semaphore immediately via the
    /// transaction future's own drop.
    pub async fn get_piv_data(
        &self,
        connection_id: ConnectionId,
        address: Address,
        selector: Vec<u8>,
        timeout: Option<std::time::Duration>,
        cancel: Option<CancelSignal>,
    ) -> Result<Vec<u8>> {
        let bus = self.bus(connection_id)?;
        if !bus.has_device(address).await {
            return Err(Error::UnknownDevice(address));
        }

        let deadline = timeout.unwrap_or(self.inner.default_config.piv_timeout);
        let key = (connection_id, address);
        let inner = Arc::clone(&self.inner);

        let semaphore = {
            let mut locks = inner.piv_locks.lock().unwrap();
            Arc::clone(locks.entry(key).or_insert_with(|| Arc::new(Semaphore::new(1))))
        };

        let transaction = async move {
            let _permit = semaphore.acquire_owned().await.map_err(|_| Error::ShuttingDown)?;

            // The waiter is registered before the first command is sent,
            // exactly like `send_command`'s pending-request registration: the
            // dispatcher's PivData listener can otherwise complete and
            // discard a single-fragment reply before this task gets back
            // around to waiting for it. It stays registered across every
            // round below, since a partial fragment never resolves it.
            let (waiter_tx, mut waiter_rx) = oneshot::channel();
            inner.piv_state.lock().unwrap().insert(
                key,
                PivState {
                    buffer: None,
                    waiter: Some(waiter_tx),
                },
            );

            // Large PIV objects arrive one fragment per `GetPivData`
            // exchange; the PD has no way to push a fragment the
            // ACU didn't ask for, so this re-issues the command, round after
            // round, until the reassembly buffer the dispatcher's PivData
            // listener is filling reports complete.
            loop {
                let command = Command::new(address, CommandCode::GetPivData, selector.clone());
                let transaction_id = command.transaction_id();
                let reply_rx = inner.dispatcher.register_pending(connection_id, address, transaction_id);

                if let Err(e) = bus.enqueue(address, command).await {
                    inner.dispatcher.cancel_pending(connection_id, address, transaction_id);
                    inner.piv_state.lock().unwrap().remove(&key);
                    return Err(e);
                }

                let reply = reply_rx.await.map_err(|_| Error::Timeout)?;
                match reply.kind {
                    ReplyKind::Nak => {
                        inner.piv_state.lock().unwrap().remove(&key);
                        return Ok(Vec::new());
                    }
                    ReplyKind::PivData => {
                        // The dispatcher completes pending requests before
                        // notifying listeners (`ReplyDispatcher::handle_reply`),
                        // so the PivData listener has already fed this
                        // fragment into the buffer by the time this task
                        // resumes. `try_recv` peeks without consuming the
                        // channel so a not-yet-complete buffer can be
                        // rechecked next round.
                        match waiter_rx.try_recv() {
                            Ok(bytes) => return Ok(bytes),
                            Err(oneshot::error::TryRecvError::Empty) => continue,
                            Err(oneshot::error::TryRecvError::Closed) => return Err(Error::Timeout),
                        }
                    }
                    _ => {
                        inner.piv_state.lock().unwrap().remove(&key);
                        return Err(Error::Timeout);
                    }
                }
            }
        };

        let result = tokio::select! {
            result = transaction => result,
            _ = tokio::time::sleep(deadline) => Err(Error::Timeout),
            _ = wait_cancel(cancel) => Err(Error::Cancelled),
        };

        self.inner.piv_state.lock().unwrap().remove(&key);
        result
    }

    /// Stop every `Bus`, closing its connection, and drop all PIV state.
    /// Each `DeviceProxy` (and its `SecureChannelSession`) is dropped as
    /// part of tearing down its `Bus`, zeroising key material via
    /// `crate::secure_channel`'s `Zeroize` impl.
    pub async fn shutdown(&self) {
        let buses: Vec<Arc<Bus>> = {
            let mut guard = self.inner.buses.lock().unwrap();
            guard.drain().map(|(_, bus)| bus).collect()
        };
        for bus in buses {
            bus.close().await;
        }
        self.inner.piv_locks.lock().unwrap().clear();
        self.inner.piv_state.lock().unwrap().clear();
    }
}
