//! In-process message bus
//!
//! [`MemoryBus`] is a broker that lives inside the process. Every
//! [`MemoryTransport`] created from it is an independent client. It backs the
//! `memory://` broker URL and the integration tests, and it can simulate an
//! unreachable broker or a dropped link.

use super::{InboundMessage, Transport, TransportEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::debug;

#[derive(Debug, Error, PartialEq)]
pub enum MemoryBusError {
    #[error("Memory bus is unreachable")]
    Unreachable,
    #[error("Client is not connected to the memory bus")]
    NotConnected,
}

struct BusSubscription {
    client: u64,
    sid: u64,
    subject: String,
    queue_group: Option<String>,
}

struct BusState {
    reachable: bool,
    connect_attempts: u32,
    clients: HashMap<u64, mpsc::UnboundedSender<TransportEvent>>,
    subscriptions: Vec<BusSubscription>,
    group_cursors: HashMap<(String, String), usize>,
    published: Vec<(String, Bytes)>,
}

/// Shared in-memory broker. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    published_notify: Arc<Notify>,
    next_client: Arc<AtomicU64>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                reachable: true,
                connect_attempts: 0,
                clients: HashMap::new(),
                subscriptions: Vec::new(),
                group_cursors: HashMap::new(),
                published: Vec::new(),
            })),
            published_notify: Arc::new(Notify::new()),
            next_client: Arc::new(AtomicU64::new(1)),
        }
    }

    /// A new client of this bus
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            bus: self.clone(),
            client: self.next_client.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Make subsequent connection attempts fail (or succeed again)
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Total connection attempts made by all clients
    pub fn connect_attempts(&self) -> u32 {
        self.lock().connect_attempts
    }

    /// Every message published through the bus, in order
    pub fn published(&self) -> Vec<(String, Bytes)> {
        self.lock().published.clone()
    }

    pub fn published_on(&self, subject: &str) -> Vec<Bytes> {
        self.lock()
            .published
            .iter()
            .filter(|(s, _)| s == subject)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Publish from outside any client. Returns the number of deliveries.
    pub fn inject(&self, subject: &str, payload: Bytes) -> usize {
        let deliveries = {
            let mut state = self.lock();
            state.published.push((subject.to_string(), payload.clone()));
            route(&mut state, subject, &payload)
        };
        self.published_notify.notify_waiters();
        deliveries
    }

    /// Drop every client's link. Subscriptions are forgotten, as a broker
    /// without persistent sessions would.
    pub fn interrupt(&self) {
        let mut state = self.lock();
        state.subscriptions.clear();
        state.group_cursors.clear();
        for events in state.clients.values() {
            let _ = events.send(TransportEvent::Disconnected("link interrupted".to_string()));
        }
    }

    /// Restore the link for connected clients
    pub fn resume(&self) {
        let state = self.lock();
        for events in state.clients.values() {
            let _ = events.send(TransportEvent::Reconnected);
        }
    }

    /// Wait until at least `count` messages have been published on `subject`.
    /// Returns what was published there, or `None` on timeout.
    pub async fn wait_for_messages(
        &self,
        subject: &str,
        count: usize,
        timeout: Duration,
    ) -> Option<Vec<Bytes>> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.published_notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let messages = self.published_on(subject);
                if messages.len() >= count {
                    return messages;
                }
                notified.await;
            }
        })
        .await
        .ok()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Deliver to every plain subscription on `subject` and to one member of
/// each queue group, rotating through members
fn route(state: &mut BusState, subject: &str, payload: &Bytes) -> usize {
    let mut plain = Vec::new();
    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();

    for (index, sub) in state.subscriptions.iter().enumerate() {
        if sub.subject != subject {
            continue;
        }
        match &sub.queue_group {
            Some(group) => groups.entry(group.clone()).or_default().push(index),
            None => plain.push(index),
        }
    }

    let mut chosen = plain;
    let mut group_names: Vec<String> = groups.keys().cloned().collect();
    group_names.sort();
    for group in group_names {
        let members = &groups[&group];
        let cursor = state
            .group_cursors
            .entry((subject.to_string(), group))
            .or_insert(0);
        chosen.push(members[*cursor % members.len()]);
        *cursor = cursor.wrapping_add(1);
    }

    let mut deliveries = 0;
    for index in chosen {
        let sub = &state.subscriptions[index];
        if let Some(events) = state.clients.get(&sub.client) {
            let message = InboundMessage {
                subject: subject.to_string(),
                payload: payload.clone(),
                subscription_ids: vec![sub.sid],
            };
            if events.send(TransportEvent::Message(message)).is_ok() {
                deliveries += 1;
            }
        }
    }
    deliveries
}

/// One client of a [`MemoryBus`]
pub struct MemoryTransport {
    bus: MemoryBus,
    client: u64,
}

impl MemoryTransport {
    pub fn bus(&self) -> &MemoryBus {
        &self.bus
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Error = MemoryBusError;

    async fn connect(
        &self,
        url: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), Self::Error> {
        let mut state = self.bus.lock();
        state.connect_attempts += 1;
        if !state.reachable {
            return Err(MemoryBusError::Unreachable);
        }
        state.clients.insert(self.client, events);
        debug!(target: "bus_transport", "Memory client {} connected to {}", self.client, url);
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Bytes) -> Result<(), Self::Error> {
        {
            let mut state = self.bus.lock();
            if !state.clients.contains_key(&self.client) {
                return Err(MemoryBusError::NotConnected);
            }
            state.published.push((subject.to_string(), payload.clone()));
            route(&mut state, subject, &payload);
        }
        self.bus.published_notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        sid: u64,
        subject: &str,
        queue_group: Option<&str>,
    ) -> Result<(), Self::Error> {
        let mut state = self.bus.lock();
        if !state.clients.contains_key(&self.client) {
            return Err(MemoryBusError::NotConnected);
        }
        let client = self.client;
        state
            .subscriptions
            .retain(|s| !(s.client == client && s.sid == sid));
        state.subscriptions.push(BusSubscription {
            client,
            sid,
            subject: subject.to_string(),
            queue_group: queue_group.map(str::to_string),
        });
        Ok(())
    }

    async fn unsubscribe(
        &self,
        sid: u64,
        _subject: &str,
        _queue_group: Option<&str>,
    ) -> Result<(), Self::Error> {
        let client = self.client;
        self.bus
            .lock()
            .subscriptions
            .retain(|s| !(s.client == client && s.sid == sid));
        Ok(())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        let mut state = self.bus.lock();
        let client = self.client;
        state.subscriptions.retain(|s| s.client != client);
        if let Some(events) = state.clients.remove(&client) {
            let _ = events.send(TransportEvent::Closed);
        }
        Ok(())
    }
}
