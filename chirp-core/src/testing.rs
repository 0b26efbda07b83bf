// ABOUTME: Scripted in-memory ChatTransport for tests and dry runs
// ABOUTME: Records sends, pings and acks; connect results are queued ahead of time

use crate::error::ConnectionError;
use crate::events::EventBus;
use crate::traits::{ChatMessage, ChatTransport, OutboundMessage, TransportEvent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Transport double. Connects successfully unless a result was queued with
/// [`MockTransport::push_connect_result`].
pub struct MockTransport {
    events: EventBus<TransportEvent>,
    open: AtomicBool,
    connect_results: Mutex<VecDeque<Result<(), ConnectionError>>>,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    fail_disconnects: AtomicBool,
    pings: AtomicUsize,
    acks: Mutex<Vec<String>>,
    sent: Mutex<Vec<OutboundMessage>>,
    sent_notify: Notify,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            events: EventBus::new(),
            open: AtomicBool::new(false),
            connect_results: Mutex::new(VecDeque::new()),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            fail_disconnects: AtomicBool::new(false),
            pings: AtomicUsize::new(0),
            acks: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            sent_notify: Notify::new(),
        }
    }

    /// Queue the result of a future `connect` call
    pub fn push_connect_result(&self, result: Result<(), ConnectionError>) {
        lock(&self.connect_results).push_back(result);
    }

    pub fn fail_disconnects(&self, fail: bool) {
        self.fail_disconnects.store(fail, Ordering::SeqCst);
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Simulate the socket dropping
    pub fn drop_connection(&self, reason: &str) {
        self.set_open(false);
        self.events.publish(TransportEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Deliver an inbound chat message
    pub fn inject(&self, message: ChatMessage) {
        self.events.publish(TransportEvent::Message(message));
    }

    pub fn emit(&self, event: TransportEvent) {
        self.events.publish(event);
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn pings_sent(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn acks(&self) -> Vec<String> {
        lock(&self.acks).clone()
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        lock(&self.sent).clone()
    }

    pub fn sent_texts(&self) -> Vec<String> {
        lock(&self.sent).iter().map(|m| m.text.clone()).collect()
    }

    /// Wait until at least `count` messages have been sent
    pub async fn wait_for_sent(&self, count: usize) -> Vec<OutboundMessage> {
        loop {
            let notified = self.sent_notify.notified();
            {
                let sent = lock(&self.sent);
                if sent.len() >= count {
                    return sent.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn connect(&self) -> Result<(), ConnectionError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.events.publish(TransportEvent::Connecting);
        let result = lock(&self.connect_results).pop_front().unwrap_or(Ok(()));
        match &result {
            Ok(()) => {
                self.set_open(true);
                self.events.publish(TransportEvent::Connected {
                    address: "mock.invalid".to_string(),
                    port: 0,
                });
            }
            Err(_) => self.set_open(false),
        }
        result
    }

    async fn disconnect(&self) -> Result<(), ConnectionError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.set_open(false);
        if self.fail_disconnects.load(Ordering::SeqCst) {
            return Err(ConnectionError::transient("socket already torn down"));
        }
        Ok(())
    }

    async fn send(&self, target: &str, text: &str) -> Result<(), ConnectionError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ConnectionError::transient("not connected"));
        }
        lock(&self.sent).push(OutboundMessage::new(target, text));
        self.sent_notify.notify_waiters();
        Ok(())
    }

    async fn send_liveness_ping(&self) -> Result<(), ConnectionError> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_liveness_ack(&self, payload: &str) -> Result<(), ConnectionError> {
        lock(&self.acks).push(payload.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn events(&self) -> &EventBus<TransportEvent> {
        &self.events
    }

    fn endpoint(&self) -> String {
        "mock.invalid:0".to_string()
    }
}
