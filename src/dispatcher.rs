//! `ReplyDispatcher`: correlates replies to pending command futures and
//! fans out typed notifications.
//!
//! A dedicated mapping from transaction id to completion handle, registered
//! *before* transmission, with a strict complete-then-notify order per
//! reply: `ControlPanel::send_command` registers the pending request before
//! the command ever reaches a `Bus`, so a reply can never arrive before the
//! handler meant to catch it exists.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{mpsc, oneshot};
use tracing::{error, trace};

use crate::command::{Reply, ReplyKind, TransactionId};
use crate::connection::ConnectionId;
use crate::device::Address;

/// Emitted by a `Bus` for its `ReplyDispatcher` to drain. `Reply` carries
/// both delivered (queue-matched) and unsolicited replies; the dispatcher
/// tells them apart via `Reply::issuing_command_code`.
#[derive(Debug)]
pub enum BusEvent {
    Reply(Reply),
    ConnectionStatusChanged {
        connection_id: ConnectionId,
        address: Address,
        online: bool,
    },
}

type ReplyListener = Arc<dyn Fn(&Reply) + Send + Sync>;
type StatusListener = Arc<dyn Fn(ConnectionId, Address, bool) + Send + Sync>;

struct PendingRequest {
    transaction_id: TransactionId,
    completion: oneshot::Sender<Reply>,
}

/// Process-wide single consumer draining every `Bus`'s `reply_sink` as one
/// cooperative task. Cheaply cloned: all state lives behind `Arc`, so a
/// `ControlPanel` can hand `Arc<ReplyDispatcher>` to every `Bus` it owns.
pub struct ReplyDispatcher {
    pending: Mutex<HashMap<(ConnectionId, Address), VecDeque<PendingRequest>>>,
    listeners: RwLock<HashMap<ReplyKind, Vec<ReplyListener>>>,
    status_listeners: RwLock<Vec<StatusListener>>,
}

impl ReplyDispatcher {
    /// Spawns the dispatcher's drain loop and returns the dispatcher handle
    /// plus the sender every `Bus` should clone into its `reply_sink`.
    pub fn spawn() -> (Arc<Self>, mpsc::UnboundedSender<BusEvent>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            status_listeners: RwLock::new(Vec::new()),
        });

        let worker = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                worker.handle_event(event);
            }
        });

        (dispatcher, tx)
    }

    /// Register a pending request *before* the issuing command is hand off
    /// to the `Bus`, so a reply can never race ahead of its own correlation
    /// entry by arriving before the handler that's meant to catch it exists.
    pub fn register_pending(
        &self,
        connection_id: ConnectionId,
        address: Address,
        transaction_id: TransactionId,
    ) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap();
        pending
            .entry((connection_id, address))
            .or_default()
            .push_back(PendingRequest {
                transaction_id,
                completion: tx,
            });
        rx
    }

    /// Remove a pending request without completing it — used on
    /// cancellation and on timeout, so a reply that eventually does arrive
    /// for a cancelled transaction finds "no matching pending request" and
    /// is treated as unsolicited.
    pub fn cancel_pending(
        &self,
        connection_id: ConnectionId,
        address: Address,
        transaction_id: TransactionId,
    ) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(queue) = pending.get_mut(&(connection_id, address)) {
            queue.retain(|p| p.transaction_id != transaction_id);
            if queue.is_empty() {
                pending.remove(&(connection_id, address));
            }
        }
    }

    pub fn register_listener<F>(&self, kind: ReplyKind, listener: F)
    where
        F: Fn(&Reply) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    pub fn register_status_listener<F>(&self, listener: F)
    where
        F: Fn(ConnectionId, Address, bool) + Send + Sync + 'static,
    {
        self.status_listeners.write().unwrap().push(Arc::new(listener));
    }

    fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::Reply(reply) => self.handle_reply(reply),
            BusEvent::ConnectionStatusChanged {
                connection_id,
                address,
                online,
            } => self.handle_status(connection_id, address, online),
        }
    }

    /// Complete the matching pending request (if any) *then* fan out to
    /// typed listeners — never the reverse, so a listener can never observe
    /// a reply before the caller that was waiting on it resumes.
    fn handle_reply(&self, reply: Reply) {
        if reply.issuing_transaction_id.is_some() {
            self.complete_pending(&reply);
        }
        self.notify_listeners(&reply);
    }

    /// Matches by `issuing_transaction_id`, never by queue position:
    /// `register_pending` (a synchronous call) and `Bus::enqueue` (which
    /// suspends on the device-roster mutex) are two separate steps, so two
    /// concurrent callers targeting the same device can have their pending
    /// requests registered in a different order than their commands reach
    /// the device's own `command_queue`. Popping the dispatcher's queue
    /// front would then hand caller A's future the reply to caller B's
    /// command; matching on the id the reply actually carries is immune to
    /// that race regardless of which order either queue ends up in.
    fn complete_pending(&self, reply: &Reply) {
        let Some(transaction_id) = reply.issuing_transaction_id else {
            return;
        };
        let matched = {
            let mut pending = self.pending.lock().unwrap();
            let key = (reply.connection_id, reply.address);
            let matched = pending.get_mut(&key).and_then(|queue| {
                let pos = queue.iter().position(|p| p.transaction_id == transaction_id)?;
                queue.remove(pos)
            });
            if let Some(queue) = pending.get(&key) {
                if queue.is_empty() {
                    pending.remove(&key);
                }
            }
            matched
        };

        if let Some(pending) = matched {
            trace!(
                address = %reply.address,
                transaction_id = ?pending.transaction_id,
                "completing pending request"
            );
            // The awaiting caller may have already dropped its receiver
            // (e.g. after giving up itself via a race with the timeout
            // path); that's not an error, just a reply nobody is left to see.
            let _ = pending.completion.send(reply.clone());
        }
    }

    fn notify_listeners(&self, reply: &Reply) {
        let listeners = self.listeners.read().unwrap();
        if let Some(for_kind) = listeners.get(&reply.kind) {
            for listener in for_kind {
                let listener = Arc::clone(listener);
                let reply_ref = reply;
                if let Err(payload) =
                    std::panic::catch_unwind(AssertUnwindSafe(|| listener(reply_ref)))
                {
                    error!(?payload, address = %reply.address, "reply listener panicked");
                }
            }
        }
    }

    fn handle_status(&self, connection_id: ConnectionId, address: Address, online: bool) {
        let listeners = self.status_listeners.read().unwrap();
        for listener in listeners.iter() {
            let listener = Arc::clone(listener);
            if let Err(payload) =
                std::panic::catch_unwind(AssertUnwindSafe(|| listener(connection_id, address, online)))
            {
                error!(?payload, "connection status listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandCode;
    use crate::device::Address;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn reply(
        connection_id: ConnectionId,
        address: Address,
        kind: ReplyKind,
        code: Option<CommandCode>,
        transaction_id: Option<TransactionId>,
    ) -> Reply {
        Reply {
            connection_id,
            address,
            sequence: 0,
            kind,
            issuing_command_code: code,
            issuing_transaction_id: transaction_id,
            payload: vec![],
        }
    }

    #[tokio::test]
    async fn delivered_reply_completes_pending_fifo() {
        let (dispatcher, tx) = ReplyDispatcher::spawn();
        let conn = crate::connection::testing::id(1);
        let addr = Address::new(1).unwrap();

        let t1 = TransactionId::next();
        let t2 = TransactionId::next();
        let rx1 = dispatcher.register_pending(conn, addr, t1);
        let rx2 = dispatcher.register_pending(conn, addr, t2);

        tx.send(BusEvent::Reply(reply(
            conn,
            addr,
            ReplyKind::IdReport,
            Some(CommandCode::IdReport),
            Some(t1),
        )))
        .unwrap();
        tx.send(BusEvent::Reply(reply(
            conn,
            addr,
            ReplyKind::Ack,
            Some(CommandCode::OutputControl),
            Some(t2),
        )))
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx1).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx2).await.unwrap().unwrap();
        assert_eq!(first.kind, ReplyKind::IdReport);
        assert_eq!(second.kind, ReplyKind::Ack);
    }

    #[tokio::test]
    async fn delivered_reply_matches_by_transaction_id_not_registration_order() {
        // Registration order (t1 then t2) can race ahead of the order each
        // caller's command actually reaches the device queue; replies must
        // still route to the right waiter by id, not by arrival order.
        let (dispatcher, tx) = ReplyDispatcher::spawn();
        let conn = crate::connection::testing::id(10);
        let addr = Address::new(2).unwrap();

        let t1 = TransactionId::next();
        let t2 = TransactionId::next();
        let rx1 = dispatcher.register_pending(conn, addr, t1);
        let rx2 = dispatcher.register_pending(conn, addr, t2);

        // t2's reply arrives first even though t1 was registered first.
        tx.send(BusEvent::Reply(reply(
            conn,
            addr,
            ReplyKind::Ack,
            Some(CommandCode::OutputControl),
            Some(t2),
        )))
        .unwrap();
        tx.send(BusEvent::Reply(reply(
            conn,
            addr,
            ReplyKind::IdReport,
            Some(CommandCode::IdReport),
            Some(t1),
        )))
        .unwrap();

        let first = tokio::time::timeout(Duration::from_secs(1), rx1).await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), rx2).await.unwrap().unwrap();
        assert_eq!(first.kind, ReplyKind::IdReport, "rx1 must get t1's reply regardless of arrival order");
        assert_eq!(second.kind, ReplyKind::Ack, "rx2 must get t2's reply regardless of arrival order");
    }

    #[tokio::test]
    async fn unsolicited_reply_notifies_listener_without_completing_anything() {
        let (dispatcher, tx) = ReplyDispatcher::spawn();
        let conn = crate::connection::testing::id(2);
        let addr = Address::new(5).unwrap();

        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        dispatcher.register_listener(ReplyKind::RawCardData, move |_r| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(BusEvent::Reply(reply(conn, addr, ReplyKind::RawCardData, None, None)))
            .unwrap();

        // give the background task a chance to run
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_pending_is_not_completed_by_a_late_reply() {
        let (dispatcher, tx) = ReplyDispatcher::spawn();
        let conn = crate::connection::testing::id(3);
        let addr = Address::new(7).unwrap();
        let t1 = TransactionId::next();
        let rx1 = dispatcher.register_pending(conn, addr, t1);
        dispatcher.cancel_pending(conn, addr, t1);

        tx.send(BusEvent::Reply(reply(
            conn,
            addr,
            ReplyKind::IdReport,
            Some(CommandCode::IdReport),
            Some(t1),
        )))
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx1.await.is_err());
    }

    #[tokio::test]
    async fn listener_panic_does_not_crash_dispatcher() {
        let (dispatcher, tx) = ReplyDispatcher::spawn();
        let conn = crate::connection::testing::id(4);
        let addr = Address::new(9).unwrap();

        dispatcher.register_listener(ReplyKind::Ack, |_r| panic!("boom"));
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        dispatcher.register_listener(ReplyKind::Ack, move |_r| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(BusEvent::Reply(reply(conn, addr, ReplyKind::Ack, None, None))).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
