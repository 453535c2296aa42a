//! ---
//! rl_section: "02-bus-protocol"
//! rl_subsection: "module"
//! rl_type: "source"
//! rl_scope: "code"
//! rl_description: "Wire codec, opcode table and bus transport primitives."
//! rl_version: "v0.0.0-prealpha"
//! rl_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::Result;

/// Half-duplex bus seen from the master's poll loop.
pub trait BusTransport: Send {
    /// Transmit one encoded frame; direction control is the backend's concern.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;
    /// Bytes received and not yet taken.
    fn bytes_available(&self) -> usize;
    /// Hand over every byte received so far and clear the receive buffer.
    fn take_received(&mut self) -> Vec<u8>;
    /// Drop stale bytes before a new request goes out.
    fn discard_received(&mut self) {
        let _ = self.take_received();
    }
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct RxInner {
    bytes: Mutex<Vec<u8>>,
    arrived: AtomicUsize,
}

/// Receive buffer shared between the byte reader and the poll loop.
///
/// The reader only appends bytes and bumps the arrival counter; it never interprets them.
#[derive(Debug, Clone, Default)]
pub struct RxBuffer {
    inner: Arc<RxInner>,
}

impl RxBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one received byte.
    pub fn push(&self, byte: u8) {
        self.inner.bytes.lock().push(byte);
        self.inner.arrived.fetch_add(1, Ordering::Release);
    }

    /// Append a burst of received bytes.
    pub fn extend(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.inner.bytes.lock().extend_from_slice(bytes);
        self.inner.arrived.fetch_add(bytes.len(), Ordering::Release);
    }

    /// Total bytes ever received; only ever grows.
    pub fn arrived(&self) -> usize {
        self.inner.arrived.load(Ordering::Acquire)
    }

    /// Bytes currently buffered.
    pub fn pending(&self) -> usize {
        self.inner.bytes.lock().len()
    }

    /// Take the buffered bytes.
    pub fn drain(&self) -> Vec<u8> {
        std::mem::take(&mut *self.inner.bytes.lock())
    }
}

/// Scripted loopback bus for unit tests.
///
/// Every `send` is recorded; the next scripted reply, if any, lands in the receive buffer.
#[derive(Debug, Default)]
pub struct InMemoryBus {
    sent: Vec<Vec<u8>>,
    replies: VecDeque<Option<Vec<u8>>>,
    rx: RxBuffer,
}

impl InMemoryBus {
    /// Create an idle bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the bytes delivered after the next send.
    pub fn script_reply(&mut self, bytes: impl Into<Vec<u8>>) {
        self.replies.push_back(Some(bytes.into()));
    }

    /// Queue silence for the next send.
    pub fn script_silence(&mut self) {
        self.replies.push_back(None);
    }

    /// Frames sent so far.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.sent
    }

    /// Receive side handle.
    pub fn rx(&self) -> &RxBuffer {
        &self.rx
    }
}

impl BusTransport for InMemoryBus {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.sent.push(bytes.to_vec());
        if let Some(Some(reply)) = self.replies.pop_front() {
            self.rx.extend(&reply);
        }
        Ok(())
    }

    fn bytes_available(&self) -> usize {
        self.rx.pending()
    }

    fn take_received(&mut self) -> Vec<u8> {
        self.rx.drain()
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
