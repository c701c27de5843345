//! Per-request streaming channels.
//!
//! Backends publish token deltas keyed by request id; the controller
//! subscribes before invoking the backend and drops its subscriptions when the
//! turn ends. Each request id has two channels: the normalized channel
//! carries structured [`NormalizedEvent`]s, the raw channel carries
//! provider-native SSE text for older backends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum NormalizedEvent {
    Delta { text: String },
    Error { message: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChannelKind {
    Normalized,
    Raw,
}

#[derive(Default)]
struct BusInner {
    normalized: HashMap<String, Vec<(u64, mpsc::UnboundedSender<NormalizedEvent>)>>,
    raw: HashMap<String, Vec<(u64, mpsc::UnboundedSender<String>)>>,
    next_token: u64,
}

impl BusInner {
    fn remove(&mut self, kind: ChannelKind, request_id: &str, token: u64) {
        match kind {
            ChannelKind::Normalized => remove_sender(&mut self.normalized, request_id, token),
            ChannelKind::Raw => remove_sender(&mut self.raw, request_id, token),
        }
    }
}

fn remove_sender<T>(
    map: &mut HashMap<String, Vec<(u64, mpsc::UnboundedSender<T>)>>,
    request_id: &str,
    token: u64,
) {
    if let Some(senders) = map.get_mut(request_id) {
        senders.retain(|(existing, _)| *existing != token);
        if senders.is_empty() {
            map.remove(request_id);
        }
    }
}

fn publish<T: Clone>(
    map: &mut HashMap<String, Vec<(u64, mpsc::UnboundedSender<T>)>>,
    request_id: &str,
    value: T,
) -> usize {
    let Some(senders) = map.get_mut(request_id) else {
        return 0;
    };
    senders.retain(|(_, tx)| !tx.is_closed());
    let mut delivered = 0;
    for (_, tx) in senders.iter() {
        if tx.send(value.clone()).is_ok() {
            delivered += 1;
        }
    }
    delivered
}

#[derive(Clone, Default)]
pub struct StreamEventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl StreamEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe_normalized(&self, request_id: &str) -> Subscription<NormalizedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = {
            let mut inner = self.lock();
            inner.next_token += 1;
            let token = inner.next_token;
            inner
                .normalized
                .entry(request_id.to_string())
                .or_default()
                .push((token, tx));
            token
        };
        self.subscription(ChannelKind::Normalized, request_id, token, rx)
    }

    pub fn subscribe_raw(&self, request_id: &str) -> Subscription<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = {
            let mut inner = self.lock();
            inner.next_token += 1;
            let token = inner.next_token;
            inner
                .raw
                .entry(request_id.to_string())
                .or_default()
                .push((token, tx));
            token
        };
        self.subscription(ChannelKind::Raw, request_id, token, rx)
    }

    fn subscription<T>(
        &self,
        kind: ChannelKind,
        request_id: &str,
        token: u64,
        receiver: mpsc::UnboundedReceiver<T>,
    ) -> Subscription<T> {
        Subscription {
            receiver,
            _guard: SubscriptionGuard {
                bus: Arc::downgrade(&self.inner),
                kind,
                request_id: request_id.to_string(),
                token,
            },
        }
    }

    /// Returns the number of live subscribers the event reached.
    pub fn publish_normalized(&self, request_id: &str, event: NormalizedEvent) -> usize {
        publish(&mut self.lock().normalized, request_id, event)
    }

    pub fn publish_raw(&self, request_id: &str, chunk: impl Into<String>) -> usize {
        publish(&mut self.lock().raw, request_id, chunk.into())
    }

    pub fn subscriber_count(&self, request_id: &str) -> usize {
        let inner = self.lock();
        inner.normalized.get(request_id).map_or(0, Vec::len)
            + inner.raw.get(request_id).map_or(0, Vec::len)
    }
}

struct SubscriptionGuard {
    bus: Weak<Mutex<BusInner>>,
    kind: ChannelKind,
    request_id: String,
    token: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            let mut inner = bus.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.remove(self.kind, &self.request_id, self.token);
        }
    }
}

/// A live subscription to one request's channel. Dropping it (or calling
/// [`Subscription::unsubscribe`]) detaches it from the bus.
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<T>,
    _guard: SubscriptionGuard,
}

impl<T> Subscription<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {}
}
