//! Request/response correlation engine (C2).
//!
//! Pairs a sender and receiver link against a named node, stamps outgoing
//! requests with `message-id` / `reply-to`, and resolves a future per
//! request when a reply with a matching `correlation-id` arrives. All link
//! (re)attachment, correlation-map mutation, and slot terminal transitions
//! happen on the [`WorkQueue`] serializer (C1) so that two concurrently
//! submitted requests can race in send order but never race on map state.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::amqp::{AttachedLinks, CbsMessage, DeliveryOutcome, LinkFactory};
use crate::error::CbsError;
use crate::queue::WorkQueue;

const PENDING: u8 = 0;
const CANCELLED: u8 = 1;
const FAILED: u8 = 2;
const COMPLETED: u8 = 3;

/// One outstanding request. Lives in the correlation map from the moment
/// `send` enqueues its `Start` item until the CAS winner drives it to a
/// terminal state and removes it.
struct RequestSlot {
    state: AtomicU8,
    completion: Mutex<Option<oneshot::Sender<Result<CbsMessage, CbsError>>>>,
    /// Fired once the slot reaches any terminal state, so that
    /// `spawn_cancellation_watcher`'s parked task can stop waiting on the
    /// cancellation token alone and let go of its slot/map references.
    terminal: tokio::sync::Notify,
}

impl RequestSlot {
    fn new(tx: oneshot::Sender<Result<CbsMessage, CbsError>>) -> Arc<Self> {
        Arc::new(RequestSlot {
            state: AtomicU8::new(PENDING),
            completion: Mutex::new(Some(tx)),
            terminal: tokio::sync::Notify::new(),
        })
    }

    /// The sole state-changing operation. Only the caller that wins the CAS
    /// may remove the slot from the map and resolve its completion sink.
    fn try_transition(&self, target: u8) -> bool {
        self.state
            .compare_exchange(PENDING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn resolve(&self, result: Result<CbsMessage, CbsError>) {
        if let Some(tx) = self
            .completion
            .lock()
            .expect("state lock poisoned")
            .take()
        {
            let _ = tx.send(result);
        }
        // `notify_one` (not `notify_waiters`): the watcher task may not have
        // reached its `.notified()` await yet, and a stored permit is the
        // only way to guarantee it still observes this transition.
        self.terminal.notify_one();
    }
}

struct ClientInner {
    node_name: String,
    factory: Arc<dyn LinkFactory>,
    queue: WorkQueue,
    links: Mutex<Option<AttachedLinks>>,
    slots: Arc<DashMap<String, Arc<RequestSlot>>>,
    sequence: AtomicU64,
    closed: AtomicBool,
}

/// A cheaply-cloneable handle onto the request/response engine for one CBS
/// node (e.g. `$cbs`).
#[derive(Clone)]
pub struct RequestResponseClient {
    inner: Arc<ClientInner>,
}

impl RequestResponseClient {
    pub fn new(node_name: impl Into<String>, factory: Arc<dyn LinkFactory>) -> Self {
        RequestResponseClient {
            inner: Arc::new(ClientInner {
                node_name: node_name.into(),
                factory,
                queue: WorkQueue::new(),
                links: Mutex::new(None),
                slots: Arc::new(DashMap::new()),
                sequence: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Number of requests currently tracked in the correlation map. Exposed
    /// for the invariant in §8 #1; not part of the wire protocol.
    pub fn pending_count(&self) -> usize {
        self.inner.slots.len()
    }

    /// Sends `request` and resolves when a correlated reply arrives, the
    /// request is cancelled, or the link setup fails.
    ///
    /// Fails synchronously with [`CbsError::Disposed`] if the client is
    /// closed, [`CbsError::InvalidOperation`] if the underlying connection
    /// is closed or the caller already populated `message_id`/`reply_to`.
    pub async fn send(
        &self,
        mut request: CbsMessage,
        cancellation: CancellationToken,
    ) -> Result<CbsMessage, CbsError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CbsError::Disposed);
        }
        if self.inner.factory.is_connection_closed() {
            return Err(CbsError::invalid_operation(
                "underlying AMQP connection is closed",
            ));
        }
        if request.message_id.is_some() {
            return Err(CbsError::invalid_operation(
                "request.message-id is already set",
            ));
        }
        if request.reply_to.is_some() {
            return Err(CbsError::invalid_operation(
                "request.reply-to is already set",
            ));
        }

        let seq = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
        let message_id = format!("{}-{}", self.inner.node_name, seq);
        request.message_id = Some(message_id.clone());
        request.reply_to = Some(format!("{}.reply-to", self.inner.node_name));

        let (tx, rx) = oneshot::channel();
        let slot = RequestSlot::new(tx);
        self.inner.slots.insert(message_id.clone(), slot.clone());

        self.spawn_cancellation_watcher(message_id.clone(), slot.clone(), cancellation);

        let this = self.clone();
        let start_id = message_id.clone();
        let start_slot = slot.clone();
        self.inner.queue.enqueue(async move {
            this.run_start(start_id, start_slot, request).await;
        });

        match rx.await {
            Ok(result) => result,
            // The sender was dropped without resolving — can only happen if
            // a terminal transition path forgot to call `resolve`.
            Err(_) => Err(CbsError::Cancelled),
        }
    }

    /// Closes the engine: every outstanding slot is cancelled and the
    /// correlation map is cleared. Enqueued so it never races a concurrent
    /// `Complete`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let this = self.clone();
        self.inner.queue.enqueue(async move {
            let ids: Vec<String> = this
                .inner
                .slots
                .iter()
                .map(|entry| entry.key().clone())
                .collect();
            for id in ids {
                if let Some((_, slot)) = this.inner.slots.remove(&id) {
                    if slot.try_transition(CANCELLED) {
                        slot.resolve(Err(CbsError::Cancelled));
                    }
                }
            }
        });
    }

    /// Parks a task that cancels the slot if `cancellation` fires first, but
    /// races that wait against the slot's own terminal-transition signal so
    /// that a request which completes or fails through any other path
    /// (`run_start`, `complete`) doesn't leave this task parked forever —
    /// `CancellationToken::cancelled()` only resolves on an explicit
    /// `.cancel()`, never on drop.
    fn spawn_cancellation_watcher(
        &self,
        message_id: String,
        slot: Arc<RequestSlot>,
        cancellation: CancellationToken,
    ) {
        let slots = self.inner.slots.clone();
        let queue = self.inner.queue.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    queue.enqueue(async move {
                        if slot.try_transition(CANCELLED) {
                            slots.remove(&message_id);
                            slot.resolve(Err(CbsError::Cancelled));
                        }
                    });
                }
                _ = slot.terminal.notified() => {
                    // Already resolved through another path; nothing left
                    // to do but let this task and its references drop.
                }
            }
        });
    }

    /// The `Start` work body (§4.2): rebuild links if needed, send the
    /// request, and react to the immediate delivery outcome. The eventual
    /// reply, if any, resolves the slot from the receiver's `Complete`
    /// path instead.
    async fn run_start(&self, message_id: String, slot: Arc<RequestSlot>, request: CbsMessage) {
        if slot.state.load(Ordering::Acquire) != PENDING {
            // Raced with cancellation before this item got its turn.
            return;
        }

        if !self.setup().await {
            if slot.try_transition(CANCELLED) {
                self.inner.slots.remove(&message_id);
                slot.resolve(Err(CbsError::Cancelled));
            }
            return;
        }

        let sender = {
            let guard = self.inner.links.lock().expect("state lock poisoned");
            guard.as_ref().expect("setup succeeded").sender.clone()
        };

        match sender.send(request).await {
            Ok(DeliveryOutcome::Accepted) => {
                // Response, if any, arrives on the receiver path and
                // resolves the slot there.
            }
            Ok(DeliveryOutcome::Rejected { description }) => {
                if slot.try_transition(FAILED) {
                    self.inner.slots.remove(&message_id);
                    slot.resolve(Err(CbsError::amqp("rejected", description)));
                }
            }
            Ok(DeliveryOutcome::Released) => {
                if slot.try_transition(FAILED) {
                    self.inner.slots.remove(&message_id);
                    slot.resolve(Err(CbsError::amqp(
                        "released",
                        "peer released the delivery without accepting it",
                    )));
                }
            }
            Err(err) => {
                if slot.try_transition(FAILED) {
                    self.inner.slots.remove(&message_id);
                    slot.resolve(Err(CbsError::amqp("send-failed", err.to_string())));
                }
            }
        }
    }

    /// `Setup`: rebuilds the session/sender/receiver trio if any member is
    /// absent or closed. Returns `false` if the client or connection is
    /// closed — the caller must treat that as *Cancelled*, not *Failed*.
    async fn setup(&self) -> bool {
        if self.inner.factory.is_connection_closed() {
            return false;
        }

        let needs_rebuild = {
            let guard = self.inner.links.lock().expect("state lock poisoned");
            match guard.as_ref() {
                None => true,
                Some(links) => links.is_closed(),
            }
        };
        if !needs_rebuild {
            return true;
        }

        debug!(node = %self.inner.node_name, "rebuilding request/response link pair");
        match self
            .inner
            .factory
            .attach(&self.inner.node_name, crate::amqp::RECEIVER_CREDIT)
            .await
        {
            None => false,
            Some(attached) => {
                self.install_receiver_handler(&attached);
                *self.inner.links.lock().expect("state lock poisoned") = Some(attached);
                true
            }
        }
    }

    /// Wires the receiver's delivery callback to correlate responses. The
    /// AMQP `Accept` is the `LinkReceiver` implementation's job (§4.2); this
    /// handler only does correlation-map lookup and slot resolution, both
    /// deferred to the serializer via `Complete`.
    fn install_receiver_handler(&self, attached: &AttachedLinks) {
        let slots = self.inner.slots.clone();
        let queue = self.inner.queue.clone();
        attached.receiver.set_handler(Box::new(move |response| {
            let slots = slots.clone();
            queue.enqueue(async move {
                complete(&slots, response);
            });
        }));
    }
}

/// The `Complete` work body (§4.2): look up the slot by `correlation-id`;
/// resolve it if present, silently drop the response if not.
fn complete(slots: &DashMap<String, Arc<RequestSlot>>, response: CbsMessage) {
    let Some(correlation_id) = response.correlation_id.clone() else {
        warn!("dropping CBS response with no correlation-id");
        return;
    };
    let Some(slot) = slots.get(&correlation_id).map(|entry| entry.clone()) else {
        // Late or spurious reply — the slot already terminated (or never
        // existed). Silently dispose, per §4.2.
        return;
    };
    if slot.try_transition(COMPLETED) {
        slots.remove(&correlation_id);
        slot.resolve(Ok(response));
    }
    // CAS loss means another path (cancellation, close) already claimed the
    // slot and removed it from the map; this response is simply dropped.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amqp::{AmqpLinkError, LinkReceiver, LinkSender};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FakeSender {
        closed: AtomicBool,
        sent: std::sync::Mutex<Vec<CbsMessage>>,
    }

    #[async_trait::async_trait]
    impl LinkSender for FakeSender {
        async fn send(&self, message: CbsMessage) -> Result<DeliveryOutcome, AmqpLinkError> {
            self.sent.lock().unwrap().push(message);
            Ok(DeliveryOutcome::Accepted)
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    struct FakeReceiver {
        handler: Mutex<Option<Box<dyn Fn(CbsMessage) + Send + Sync>>>,
    }

    impl LinkReceiver for FakeReceiver {
        fn set_handler(&self, handler: Box<dyn Fn(CbsMessage) + Send + Sync>) {
            *self.handler.lock().unwrap() = Some(handler);
        }
    }

    struct FakeFactory {
        attach_calls: AtomicUsize,
        last_credit: AtomicUsize,
        connection_closed: AtomicBool,
        sender: Arc<FakeSender>,
        receiver: Arc<FakeReceiver>,
    }

    #[async_trait::async_trait]
    impl LinkFactory for FakeFactory {
        async fn attach(&self, _node_name: &str, receiver_credit: u32) -> Option<AttachedLinks> {
            if self.connection_closed.load(Ordering::Acquire) {
                return None;
            }
            self.attach_calls.fetch_add(1, Ordering::SeqCst);
            self.last_credit
                .store(receiver_credit as usize, Ordering::SeqCst);
            Some(AttachedLinks {
                sender: self.sender.clone(),
                receiver: self.receiver.clone(),
            })
        }
        async fn attach_sender_only(&self, _node_name: &str) -> Option<Arc<dyn LinkSender>> {
            Some(self.sender.clone())
        }
        fn is_connection_closed(&self) -> bool {
            self.connection_closed.load(Ordering::Acquire)
        }
    }

    fn harness() -> (RequestResponseClient, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory {
            attach_calls: AtomicUsize::new(0),
            last_credit: AtomicUsize::new(0),
            connection_closed: AtomicBool::new(false),
            sender: Arc::new(FakeSender {
                closed: AtomicBool::new(false),
                sent: std::sync::Mutex::new(Vec::new()),
            }),
            receiver: Arc::new(FakeReceiver {
                handler: Mutex::new(None),
            }),
        });
        let client = RequestResponseClient::new("$cbs", factory.clone());
        (client, factory)
    }

    #[tokio::test]
    async fn round_trip_resolves_matching_request() {
        crate::test_support::init_tracing();
        let (client, factory) = harness();
        let request = CbsMessage {
            body: b"test".to_vec(),
            ..Default::default()
        };

        let client2 = client.clone();
        let send_fut = tokio::spawn(async move {
            client2.send(request, CancellationToken::new()).await
        });

        // Wait for the Start item to run and register the receiver handler.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            factory.last_credit.load(Ordering::SeqCst),
            crate::amqp::RECEIVER_CREDIT as usize
        );
        let sent_id = factory.sender.sent.lock().unwrap()[0]
            .message_id
            .clone()
            .unwrap();

        let handler_guard = factory.receiver.handler.lock().unwrap();
        let handler = handler_guard.as_ref().unwrap();
        handler(CbsMessage {
            correlation_id: Some(sent_id),
            body: b"test".to_vec(),
            ..Default::default()
        });
        drop(handler_guard);

        let result = send_fut.await.unwrap().unwrap();
        assert_eq!(result.body, b"test");
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn unknown_correlation_id_is_dropped_silently() {
        let (client, factory) = harness();
        let request = CbsMessage::default();
        let cancel = CancellationToken::new();
        let client2 = client.clone();
        let cancel2 = cancel.clone();
        let send_fut = tokio::spawn(async move { client2.send(request, cancel2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        {
            let handler_guard = factory.receiver.handler.lock().unwrap();
            let handler = handler_guard.as_ref().unwrap();
            handler(CbsMessage {
                correlation_id: Some("not-a-real-id".into()),
                ..Default::default()
            });
        }

        // The real request is still pending; only cancelling it resolves it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_count(), 1);
        cancel.cancel();
        let result = send_fut.await.unwrap();
        assert!(matches!(result, Err(CbsError::Cancelled)));
    }

    #[tokio::test]
    async fn preset_message_id_is_rejected() {
        let (client, _factory) = harness();
        let request = CbsMessage {
            message_id: Some("already-set".into()),
            ..Default::default()
        };
        let result = client.send(request, CancellationToken::new()).await;
        assert!(matches!(result, Err(CbsError::InvalidOperation(_))));
    }

    #[tokio::test]
    async fn already_cancelled_token_cancels_the_slot() {
        let (client, _factory) = harness();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client.send(CbsMessage::default(), cancel).await;
        assert!(matches!(result, Err(CbsError::Cancelled)));
    }

    #[tokio::test]
    async fn setup_failure_when_connection_closed_cancels_not_fails() {
        let (client, factory) = harness();
        factory.connection_closed.store(true, Ordering::Release);
        let result = client.send(CbsMessage::default(), CancellationToken::new()).await;
        assert!(matches!(result, Err(CbsError::Cancelled)));
    }

    #[tokio::test]
    async fn closed_client_rejects_new_sends() {
        let (client, _factory) = harness();
        client.close();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = client.send(CbsMessage::default(), CancellationToken::new()).await;
        assert!(matches!(result, Err(CbsError::Disposed)));
    }
}
