//! Priority message bus: dispatch loop and request/response correlation

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use super::envelope::{
    BroadcastData, Envelope, EnvelopeDraft, MessageId, MessageType, ResponseData,
    BROADCAST_TARGET,
};
use super::events::BusEvent;
use super::health::BusStats;
use super::history::{HistoryBuffer, HistoryQuery, HistorySnapshot, HistoryStore, JsonFileStore};
use super::queue::PriorityQueue;
use super::subscription::{
    DeliveryCallback, MessageFilter, Subscription, SubscriptionId, SubscriptionInfo,
    SubscriptionRegistry,
};
use crate::config::BusConfig;
use crate::error::{Error, Result};

struct BusState {
    queue: PriorityQueue,
    registry: SubscriptionRegistry,
    history: HistoryBuffer,
    /// Request id -> completion handle of the caller awaiting the response
    pending: HashMap<MessageId, oneshot::Sender<Envelope>>,
    draining: bool,
    paused: bool,
}

struct BusInner {
    config: BusConfig,
    state: Mutex<BusState>,
    store: Option<Arc<dyn HistoryStore>>,
    events: RwLock<Option<broadcast::Sender<BusEvent>>>,
}

/// In-process message bus connecting agents.
///
/// Every `send` validates and queues the envelope, then drains the queue
/// synchronously: each live envelope goes to every matching subscription
/// in priority order and is appended to history. The handle is cheap to
/// clone; clones share the same bus.
///
/// Callbacks run with no internal lock held and may publish again. Such
/// envelopes join the running drain instead of starting a nested one, and
/// a single drain delivers at most `max_drain_per_cycle` envelopes; the
/// rest wait for the next `send` or `resume_dispatch`.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a bus; persists to `message_persist_path` when enabled
    pub fn new(config: BusConfig) -> Self {
        let store: Option<Arc<dyn HistoryStore>> = if config.persist_messages {
            Some(Arc::new(JsonFileStore::new(&config.message_persist_path)))
        } else {
            None
        };
        Self::build(config, store)
    }

    /// Create a bus that persists history through `store`
    pub fn with_store(config: BusConfig, store: Arc<dyn HistoryStore>) -> Self {
        Self::build(config, Some(store))
    }

    fn build(config: BusConfig, store: Option<Arc<dyn HistoryStore>>) -> Self {
        let history = match store.as_ref().map(|s| s.load()) {
            Some(Ok(Some(snapshot))) => {
                info!("Loaded {} persisted messages", snapshot.history.len());
                HistoryBuffer::with_entries(config.max_history_size, snapshot.history)
            }
            Some(Err(e)) => {
                warn!("Could not load persisted messages: {}", e);
                HistoryBuffer::new(config.max_history_size)
            }
            _ => HistoryBuffer::new(config.max_history_size),
        };

        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let state = BusState {
            queue: PriorityQueue::new(config.max_queue_size),
            registry: SubscriptionRegistry::new(),
            history,
            pending: HashMap::new(),
            draining: false,
            paused: false,
        };

        info!(
            max_queue_size = config.max_queue_size,
            persist = store.is_some(),
            "Message bus initialized"
        );

        Self {
            inner: Arc::new(BusInner {
                config,
                state: Mutex::new(state),
                store,
                events: RwLock::new(Some(events_tx)),
            }),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    /// Validate, queue and dispatch an envelope
    pub fn send(&self, draft: EnvelopeDraft) -> Result<MessageId> {
        let envelope = draft.enrich(self.inner.config.message_timeout())?;
        let id = envelope.id.clone();
        self.submit(envelope);
        Ok(id)
    }

    /// Send a `broadcast` envelope addressed to every agent
    pub fn broadcast(&self, data: BroadcastData) -> Result<MessageId> {
        let draft = EnvelopeDraft {
            from: data.from.unwrap_or_else(|| "system".to_string()),
            to: BROADCAST_TARGET.to_string(),
            message_type: Some(MessageType::Broadcast),
            priority: data.priority,
            payload: data.payload,
            ..EnvelopeDraft::default()
        };
        self.send(draft)
    }

    /// Receive every envelope addressed to `agent_name` or `all`
    pub fn subscribe<F>(&self, agent_name: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_with_filter(agent_name, MessageFilter::default(), callback)
    }

    /// Receive envelopes addressed to `agent_name` or `all` that pass `filter`
    pub fn subscribe_with_filter<F>(
        &self,
        agent_name: impl Into<String>,
        filter: MessageFilter,
        callback: F,
    ) -> SubscriptionId
    where
        F: Fn(&Envelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: DeliveryCallback = Arc::new(callback);
        let subscription = Subscription::new(agent_name, callback, filter);
        self.inner.state.lock().registry.insert(subscription)
    }

    /// Remove a subscription; false if the id is unknown
    pub fn unsubscribe(&self, id: &str) -> bool {
        self.inner.state.lock().registry.remove(id)
    }

    pub fn subscription(&self, id: &str) -> Option<SubscriptionInfo> {
        self.inner.state.lock().registry.get(id).map(|s| s.info())
    }

    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner
            .state
            .lock()
            .registry
            .iter()
            .map(|s| s.info())
            .collect()
    }

    /// Send a request and wait for the correlated response.
    ///
    /// Fails with [`Error::Timeout`] when no response arrives within
    /// `timeout` (absent or zero: the bus message timeout). The waiter is removed
    /// on every exit path, including when this future is dropped.
    pub async fn send_request(
        &self,
        draft: EnvelopeDraft,
        timeout: Option<Duration>,
    ) -> Result<Envelope> {
        let timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or_else(|| self.inner.config.message_timeout());
        let envelope = draft
            .with_type(MessageType::Request)
            .enrich(self.inner.config.message_timeout())?;
        let request_id = envelope.id.clone();

        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if state.pending.contains_key(&request_id) {
                return Err(Error::Validation(format!(
                    "request {} is already pending",
                    request_id
                )));
            }
            state.pending.insert(request_id.clone(), tx);
        }
        let _waiter = WaiterGuard {
            inner: &self.inner,
            request_id: &request_id,
        };

        // Registered before dispatch so synchronous responders are not missed
        self.submit(envelope);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::Shutdown(request_id.clone())),
            Err(_) => {
                warn!("Request timeout: {}", request_id);
                Err(Error::Timeout {
                    request_id: request_id.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Answer `original` and wake whoever awaits it
    pub fn send_response(&self, original: &Envelope, data: ResponseData) -> Result<()> {
        let draft = EnvelopeDraft {
            from: data.from.unwrap_or_else(|| "unknown".to_string()),
            to: original.from.clone(),
            message_type: Some(MessageType::Response),
            priority: Some(data.priority.unwrap_or(original.priority)),
            request_id: Some(original.id.clone()),
            payload: data.payload,
            ..EnvelopeDraft::default()
        };
        let response = draft.enrich(self.inner.config.message_timeout())?;

        self.submit(response.clone());

        let waiter = self.inner.state.lock().pending.remove(&original.id);
        match waiter {
            Some(tx) => {
                if tx.send(response).is_err() {
                    debug!("Requester for {} stopped waiting", original.id);
                }
            }
            None => debug!("No pending request for {}", original.id),
        }
        Ok(())
    }

    /// History entries addressed to `agent_name` or `all` that pass `query`
    pub fn messages_for_agent(&self, agent_name: &str, query: &HistoryQuery) -> Vec<Envelope> {
        self.inner.state.lock().history.for_agent(agent_name, query)
    }

    pub fn stats(&self) -> BusStats {
        let state = self.inner.state.lock();
        BusStats::collect(
            &state.history,
            &state.queue,
            state.registry.len(),
            Utc::now(),
        )
    }

    pub fn queue_len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Requests still awaiting a response
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Listen for bus events; closed once the bus shuts down
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        match self.inner.events.read().as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                let (tx, rx) = broadcast::channel(1);
                drop(tx);
                rx
            }
        }
    }

    /// Keep queueing but stop delivering until `resume_dispatch`
    pub fn pause_dispatch(&self) {
        self.inner.state.lock().paused = true;
        debug!("Dispatch paused");
    }

    /// Resume delivery and drain whatever queued up meanwhile
    pub fn resume_dispatch(&self) {
        self.inner.state.lock().paused = false;
        debug!("Dispatch resumed");
        self.drain();
    }

    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }

    /// Flush history, drop subscriptions, queued envelopes and pending
    /// requests, and close the event channel.
    pub fn shutdown(&self) {
        info!("Shutting down message bus");

        let snapshot = {
            let mut state = self.inner.state.lock();
            state.registry.clear();
            state.queue.clear();
            // Dropping the senders fails every waiting request with Shutdown
            state.pending.clear();
            self.inner
                .store
                .as_ref()
                .map(|_| HistorySnapshot::new(state.history.tail(self.inner.config.persist_tail)))
        };
        if let Some(snapshot) = snapshot {
            self.persist(&snapshot);
        }

        self.inner.events.write().take();
        info!("Message bus shutdown complete");
    }

    fn submit(&self, envelope: Envelope) {
        let outcome = self.inner.state.lock().queue.enqueue(envelope.clone());
        for stale in outcome.expired {
            self.emit(|| BusEvent::Expired(stale.id));
        }
        for evicted in outcome.evicted {
            self.emit(|| BusEvent::Shed(evicted));
        }
        if outcome.queued {
            self.emit(|| BusEvent::Queued(envelope));
        } else {
            self.emit(|| BusEvent::Shed(envelope));
        }
        self.drain();
    }

    fn drain(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.draining || state.paused {
                return;
            }
            state.draining = true;
        }
        let mut guard = DrainGuard {
            inner: &self.inner,
            armed: true,
        };

        let limit = self.inner.config.max_drain_per_cycle;
        let mut processed = 0;
        loop {
            let next = {
                let mut state = self.inner.state.lock();
                if processed >= limit || state.paused {
                    if processed >= limit && !state.queue.is_empty() {
                        warn!(
                            "Drain limit of {} reached, {} messages left queued",
                            limit,
                            state.queue.len()
                        );
                    }
                    state.draining = false;
                    guard.armed = false;
                    None
                } else if let Some(envelope) = state.queue.pop() {
                    let subscribers = state.registry.matching(&envelope);
                    Some((envelope, subscribers))
                } else {
                    state.draining = false;
                    guard.armed = false;
                    None
                }
            };

            let Some((envelope, subscribers)) = next else {
                break;
            };
            processed += 1;
            self.dispatch(envelope, subscribers);
        }
    }

    fn dispatch(&self, envelope: Envelope, subscribers: Vec<Arc<Subscription>>) {
        if envelope.is_expired_at(Utc::now()) {
            warn!("Message expired: {}", envelope.id);
            self.emit(|| BusEvent::Expired(envelope.id.clone()));
            return;
        }

        let delivered = subscribers.iter().filter(|s| s.deliver(&envelope)).count();
        debug!(
            message_id = %envelope.id,
            message_type = %envelope.message_type,
            to = %envelope.to,
            delivered,
            "Dispatched message"
        );

        let snapshot = {
            let mut state = self.inner.state.lock();
            state.history.push(envelope.clone());
            self.inner
                .store
                .as_ref()
                .map(|_| HistorySnapshot::new(state.history.tail(self.inner.config.persist_tail)))
        };
        if let Some(snapshot) = snapshot {
            self.persist(&snapshot);
        }

        let is_broadcast = envelope.message_type == MessageType::Broadcast;
        if is_broadcast {
            self.emit(|| BusEvent::Delivered(envelope.clone()));
            self.emit(|| BusEvent::Broadcast(envelope));
        } else {
            self.emit(|| BusEvent::Delivered(envelope));
        }
    }

    fn persist(&self, snapshot: &HistorySnapshot) {
        let Some(store) = &self.inner.store else {
            return;
        };
        match catch_unwind(AssertUnwindSafe(|| store.save(snapshot))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to persist messages: {}", e),
            Err(_) => error!("History store panicked while persisting messages"),
        }
    }

    fn emit(&self, event: impl FnOnce() -> BusEvent) {
        let events = self.inner.events.read();
        if let Some(tx) = events.as_ref() {
            if tx.receiver_count() > 0 {
                let _ = tx.send(event());
            }
        }
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MessageBus")
            .field("queued", &state.queue.len())
            .field("subscriptions", &state.registry.len())
            .field("history", &state.history.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

/// Clears the draining flag if a drain cycle unwinds before finishing
struct DrainGuard<'a> {
    inner: &'a BusInner,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.state.lock().draining = false;
        }
    }
}

/// Removes a request's waiter when the awaiting future finishes or is dropped
struct WaiterGuard<'a> {
    inner: &'a BusInner,
    request_id: &'a str,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().pending.remove(self.request_id);
    }
}
