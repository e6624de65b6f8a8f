//! Event bus - two independent broadcast streams from the venue
//!
//! Session-status transitions and response/table-update messages are
//! published by the transport's notifier context and fanned out to every
//! subscriber through unbounded `flume` channels. Publishing never blocks,
//! so a slow consumer can never stall the notifier.
//!
//! Consumers own a [`Subscription`] (a receiver plus a cancellable
//! [`SubscriptionHandle`]) and usually drain it on a dedicated
//! [`EventPump`] thread.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::{Error, RequestId, Result, SessionStatus};
use crate::tables::TableUpdate;

/// Session-status stream message
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEvent {
    Changed(SessionStatus),
    /// Reason reported by the venue before it drops to `Disconnected`
    LoginFailed(String),
}

/// Response stream message
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    /// Execution report / acceptance for a request id
    RequestCompleted { request_id: RequestId },
    /// Explicit rejection of a request id
    RequestFailed { request_id: RequestId, error: String },
    /// One batch of streamed table mutations
    TablesUpdates(Vec<TableUpdate>),
}

// ─────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────

/// Id-keyed list of subscribers shared by the bus and the table cache.
pub(crate) struct Registry<T> {
    entries: Mutex<Vec<(u64, T)>>,
    next_id: AtomicU64,
}

impl<T> Registry<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn add(&self, item: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, item));
        id
    }

    pub(crate) fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.entries.lock().iter().any(|(entry_id, _)| *entry_id == id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Visit entries under the lock, dropping those for which `keep` is false.
    pub(crate) fn retain(&self, mut keep: impl FnMut(&T) -> bool) {
        self.entries.lock().retain(|(_, item)| keep(item));
    }
}

impl<T: Clone> Registry<T> {
    pub(crate) fn snapshot(&self) -> Vec<T> {
        self.entries.lock().iter().map(|(_, item)| item.clone()).collect()
    }
}

pub(crate) trait Unregister: Send + Sync {
    fn unregister(&self, id: u64) -> bool;
    fn is_registered(&self, id: u64) -> bool;
}

impl<T: Send> Unregister for Registry<T> {
    fn unregister(&self, id: u64) -> bool {
        self.remove(id)
    }

    fn is_registered(&self, id: u64) -> bool {
        self.contains(id)
    }
}

/// Cancellable handle for a registered subscriber. Dropping it cancels.
pub struct SubscriptionHandle {
    id: u64,
    registry: Weak<dyn Unregister>,
}

impl SubscriptionHandle {
    pub(crate) fn new<T: Send + 'static>(id: u64, registry: &Arc<Registry<T>>) -> Self {
        let registry: Weak<dyn Unregister> = Arc::downgrade(registry) as Weak<dyn Unregister>;
        Self { id, registry }
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .map(|r| r.is_registered(self.id))
            .unwrap_or(false)
    }

    pub fn cancel(self) {
        // Drop does the work.
    }

    fn unregister(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unregister();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").field("id", &self.id).finish()
    }
}

/// Receiving end of one bus stream.
pub struct Subscription<T> {
    rx: flume::Receiver<T>,
    handle: SubscriptionHandle,
}

impl<T> Subscription<T> {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Drain everything queued right now without blocking.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    pub fn is_active(&self) -> bool {
        self.handle.is_active()
    }

    pub fn cancel(self) {
        self.handle.cancel();
    }

    pub fn into_parts(self) -> (flume::Receiver<T>, SubscriptionHandle) {
        (self.rx, self.handle)
    }
}

// ─────────────────────────────────────────────────────────────
// Bus
// ─────────────────────────────────────────────────────────────

/// Fan-out of the venue's two notification streams.
pub struct EventBus {
    status: Arc<Registry<flume::Sender<StatusEvent>>>,
    responses: Arc<Registry<flume::Sender<ResponseEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            status: Arc::new(Registry::new()),
            responses: Arc::new(Registry::new()),
        }
    }

    pub fn subscribe_status(&self) -> Subscription<StatusEvent> {
        subscribe(&self.status)
    }

    pub fn subscribe_responses(&self) -> Subscription<ResponseEvent> {
        subscribe(&self.responses)
    }

    /// Deliver a status event to every subscriber. Never blocks.
    pub fn publish_status(&self, event: StatusEvent) {
        debug!("status event: {:?}", event);
        publish(&self.status, event);
    }

    /// Deliver a response event to every subscriber. Never blocks.
    pub fn publish_response(&self, event: ResponseEvent) {
        publish(&self.responses, event);
    }

    pub fn status_subscribers(&self) -> usize {
        self.status.len()
    }

    pub fn response_subscribers(&self) -> usize {
        self.responses.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn subscribe<T: Send + 'static>(registry: &Arc<Registry<flume::Sender<T>>>) -> Subscription<T> {
    let (tx, rx) = flume::unbounded();
    let id = registry.add(tx);
    Subscription {
        rx,
        handle: SubscriptionHandle::new(id, registry),
    }
}

// Sending under the registry lock keeps every subscriber's view in publish order.
fn publish<T: Clone>(registry: &Registry<flume::Sender<T>>, event: T) {
    registry.retain(|tx| tx.send(event.clone()).is_ok());
}

// ─────────────────────────────────────────────────────────────
// Pump
// ─────────────────────────────────────────────────────────────

/// Dedicated thread draining one subscription into a handler.
///
/// Decouples the venue's notifier context from consumer logic: the
/// notifier only enqueues, the pump thread does the work.
pub struct EventPump {
    name: String,
    handle: Option<SubscriptionHandle>,
    thread: Option<JoinHandle<()>>,
}

impl EventPump {
    pub fn spawn<T, F>(name: impl Into<String>, subscription: Subscription<T>, mut handler: F) -> Result<Self>
    where
        T: Send + 'static,
        F: FnMut(T) + Send + 'static,
    {
        let name = name.into();
        let (rx, handle) = subscription.into_parts();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                // Ends once the subscription is cancelled or the bus is gone.
                while let Ok(event) = rx.recv() {
                    handler(event);
                }
            })
            .map_err(|e| Error::InvalidState(format!("failed to spawn {}: {}", name, e)))?;

        debug!("event pump {} started", name);
        Ok(Self {
            name,
            handle: Some(handle),
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the subscription and wait for in-flight handling to finish.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.handle.take());
        if let Some(thread) = self.thread.take() {
            if thread.thread().id() == std::thread::current().id() {
                return;
            }
            if thread.join().is_err() {
                warn!("event pump {} panicked", self.name);
            }
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fan_out_preserves_order() {
        let bus = EventBus::new();
        let a = bus.subscribe_status();
        let b = bus.subscribe_status();

        bus.publish_status(StatusEvent::Changed(SessionStatus::Connecting));
        bus.publish_status(StatusEvent::Changed(SessionStatus::Connected));

        for sub in [&a, &b] {
            assert_eq!(sub.drain(), vec![
                StatusEvent::Changed(SessionStatus::Connecting),
                StatusEvent::Changed(SessionStatus::Connected),
            ]);
        }
    }

    #[test]
    fn test_streams_are_independent() {
        let bus = EventBus::new();
        let status = bus.subscribe_status();
        let responses = bus.subscribe_responses();

        bus.publish_response(ResponseEvent::RequestCompleted {
            request_id: RequestId::new("R1"),
        });

        assert!(status.try_recv().is_none());
        assert!(responses.try_recv().is_some());
    }

    #[test]
    fn test_cancel_unsubscribes() {
        let bus = EventBus::new();
        let sub = bus.subscribe_status();
        assert_eq!(bus.status_subscribers(), 1);
        assert!(sub.is_active());

        sub.cancel();
        assert_eq!(bus.status_subscribers(), 0);
        bus.publish_status(StatusEvent::Changed(SessionStatus::Connecting));
    }

    #[test]
    fn test_pump_runs_handler_and_stops() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = flume::unbounded();

        let counter = seen.clone();
        let pump = EventPump::spawn("test-pump", bus.subscribe_responses(), move |_event| {
            if counter.fetch_add(1, Ordering::SeqCst) == 2 {
                let _ = done_tx.send(());
            }
        })
        .unwrap();

        for i in 0..3 {
            bus.publish_response(ResponseEvent::RequestCompleted {
                request_id: RequestId::new(format!("R{}", i)),
            });
        }

        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        pump.stop();
        assert_eq!(bus.response_subscribers(), 0);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
